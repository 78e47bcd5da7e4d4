//! H.264/H.265 bitstream decode to NV12 frames. Unlike the compute
//! kernels, the codec session is a stream: it is opened on `start`,
//! fed access units in order, and flushed on `stop` so queued frames
//! drain before the handle is destroyed.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{DecodeJob, DecodeParams, ImageRef, TensorRef};
use argus_core::backend::KernelHandle;
use argus_core::buffer::SharedBuffer;
use argus_core::capability::{self, Component};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, ImageFormat};

use crate::common::BufferTracker;
use crate::dispatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDecodeConfig {
    pub backend: BackendClass,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Bitstream codec, `H264` or `H265`.
    pub format: ImageFormat,
    pub input_queue_depth: u32,
    pub output_queue_depth: u32,
}

impl VideoDecodeConfig {
    fn validate(&self) -> ArgusResult<()> {
        capability::ensure_supported(self.backend, Component::VideoDecode)?;
        if !self.format.is_bitstream() {
            return Err(ArgusError::bad_args(format!(
                "{:?} is not a codec bitstream format",
                self.format
            )));
        }
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ArgusError::bad_args(format!(
                "decode size {}x{} must be even and nonzero",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(ArgusError::bad_args("zero frame rate"));
        }
        if self.input_queue_depth == 0 || self.output_queue_depth == 0 {
            return Err(ArgusError::bad_args("zero codec queue depth"));
        }
        Ok(())
    }

    fn decode_params(&self) -> DecodeParams {
        DecodeParams {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            bitstream: match self.format {
                ImageFormat::H265 => 2,
                _ => 1,
            },
            input_queue_depth: self.input_queue_depth,
            output_queue_depth: self.output_queue_depth,
        }
    }
}

struct Active {
    config: VideoDecodeConfig,
    session: BackendSession,
    /// Present only while Running.
    stream: Option<KernelHandle>,
}

pub struct VideoDecode {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for VideoDecode {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecode {
    pub fn new() -> Self {
        VideoDecode {
            core: ComponentCore::new("video-decode"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: VideoDecodeConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        config.validate()?;
        let session = BackendSession::acquire(config.backend)?;
        self.active = Some(Active {
            config,
            session,
            stream: None,
        });
        self.core.set_state(ComponentState::Ready);
        Ok(())
    }

    pub fn start(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Ready])?;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| ArgusError::bad_state("video-decode: not configured"))?;
        let binding = session::binding(active.config.backend)?;
        let stream = dispatch::decode_create(&binding, &active.config.decode_params())?;
        active.stream = Some(stream);
        self.core.set_state(ComponentState::Running);
        Ok(())
    }

    /// Drain the codec queues and close the stream.
    pub fn stop(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| ArgusError::bad_state("video-decode: not configured"))?;
        let mut first_err = None;
        if let Some(stream) = active.stream.take() {
            match session::binding(active.config.backend) {
                Ok(binding) => {
                    if let Err(e) = dispatch::decode_flush(&binding, stream) {
                        warn!("video-decode: flush failed: {e}");
                        first_err.get_or_insert(e);
                    }
                    if let Err(e) = dispatch::decode_destroy(&binding, stream) {
                        warn!("video-decode: stream destroy failed: {e}");
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.core.set_state(ComponentState::Ready);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Submit one access unit. Decoded frames come back through `frame`
    /// in decode order with `mark` copied through.
    pub fn execute(
        &mut self,
        bitstream: &SharedBuffer,
        frame: &SharedBuffer,
        timestamp_ns: u64,
        mark: u64,
    ) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("video-decode: not configured"))?;
        let stream = active
            .stream
            .ok_or_else(|| ArgusError::bad_state("video-decode: stream not open"))?;
        let config = &active.config;

        bitstream.validate()?;
        if let Ok(props) = bitstream.image_props() {
            if props.format != config.format {
                return Err(ArgusError::invalid_buffer(format!(
                    "bitstream tagged {:?}, stream decodes {:?}",
                    props.format, config.format
                )));
            }
        }
        frame
            .image_props()?
            .require_shape(ImageFormat::Nv12, config.width, config.height)?;

        self.buffers
            .ensure_registered(config.backend, bitstream, BufferRole::Input)?;
        self.buffers
            .ensure_registered(config.backend, frame, BufferRole::Output)?;

        let binding = session::binding(config.backend)?;
        dispatch::decode_run(
            &binding,
            stream,
            &DecodeJob {
                bitstream: TensorRef::from_buffer(bitstream),
                frame: ImageRef::from_buffer(frame, 0)?,
                timestamp_ns,
                mark,
            },
        )
    }

    pub fn register_buffers(&mut self, bufs: &[(SharedBuffer, BufferRole)]) -> ArgusResult<()> {
        self.core
            .ensure(&[ComponentState::Ready, ComponentState::Running])?;
        let class = self.class()?;
        for (buf, role) in bufs {
            self.buffers.ensure_registered(class, buf, *role)?;
        }
        Ok(())
    }

    pub fn deregister_buffers(&mut self, addrs: &[usize]) -> ArgusResult<()> {
        self.core
            .ensure(&[ComponentState::Ready, ComponentState::Running])?;
        let class = self.class()?;
        for &addr in addrs {
            self.buffers.deregister(class, addr)?;
        }
        Ok(())
    }

    pub fn deinit(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Ready])?;
        let active = self
            .active
            .take()
            .ok_or_else(|| ArgusError::bad_state("video-decode: not configured"))?;
        self.buffers.deregister_all(active.config.backend);
        let result = active.session.shutdown();
        if let Err(e) = &result {
            warn!("video-decode: session shutdown failed: {e}");
        }
        self.core.set_state(ComponentState::Initial);
        result
    }

    fn class(&self) -> ArgusResult<BackendClass> {
        self.active
            .as_ref()
            .map(|a| a.config.backend)
            .ok_or_else(|| ArgusError::bad_state("video-decode: not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::backend::loopback;
    use argus_core::buffer::packed_image_props;
    use crate::testsync;

    fn config() -> VideoDecodeConfig {
        VideoDecodeConfig {
            backend: BackendClass::Cpu,
            width: 1920,
            height: 1080,
            frame_rate: 30,
            format: ImageFormat::H265,
            input_queue_depth: 4,
            output_queue_depth: 4,
        }
    }

    fn frame_buf(addr: usize) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Nv12, 1920, 1080, 1).unwrap();
        let size = props.frame_size();
        SharedBuffer::image(addr, 61, size, 0, props)
    }

    #[test]
    fn stream_lifecycle() {
        let _serial = testsync::lock();
        loopback::install();

        let mut decode = VideoDecode::new();
        decode.init(config()).unwrap();

        // Stream opens on start, not init.
        let before = loopback::stats(BackendClass::Cpu);
        decode.start().unwrap();
        let after_start = loopback::stats(BackendClass::Cpu);
        assert_eq!(after_start.create - before.create, 1);

        let bitstream = SharedBuffer::raw(0x800_0000, 60, 0x10000, 0, 0x8000);
        let frame = frame_buf(0x810_0000);
        decode.execute(&bitstream, &frame, 33_000_000, 7).unwrap();
        assert_eq!(loopback::stats(BackendClass::Cpu).run - after_start.run, 1);

        // Stop flushes and closes the stream.
        decode.stop().unwrap();
        let after_stop = loopback::stats(BackendClass::Cpu);
        assert_eq!(after_stop.destroy - before.destroy, 1);

        decode.deinit().unwrap();
        assert_eq!(decode.state(), ComponentState::Initial);
    }

    #[test]
    fn execute_requires_open_stream() {
        let _serial = testsync::lock();
        loopback::install();

        let mut decode = VideoDecode::new();
        decode.init(config()).unwrap();
        let bitstream = SharedBuffer::raw(0x820_0000, 62, 0x10000, 0, 0x8000);
        let frame = frame_buf(0x830_0000);
        let err = decode
            .execute(&bitstream, &frame, 0, 0)
            .expect_err("decode before start must be rejected");
        assert!(matches!(err, ArgusError::BadState(_)));
        decode.deinit().unwrap();
    }

    #[test]
    fn config_validation() {
        let mut cfg = config();
        cfg.backend = BackendClass::Npu0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.format = ImageFormat::Nv12;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.width = 1921;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.output_queue_depth = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_bitstream_is_rejected() {
        let _serial = testsync::lock();
        loopback::install();

        let mut decode = VideoDecode::new();
        decode.init(config()).unwrap();
        decode.start().unwrap();

        let empty = SharedBuffer::raw(0x860_0000, 64, 0x10000, 0, 0);
        let frame = frame_buf(0x870_0000);
        let err = decode
            .execute(&empty, &frame, 0, 0)
            .expect_err("empty bitstream chunk must be rejected");
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));

        decode.stop().unwrap();
        decode.deinit().unwrap();
    }

    #[test]
    fn bitstream_format_mismatch() {
        let _serial = testsync::lock();
        loopback::install();

        let mut decode = VideoDecode::new();
        decode.init(config()).unwrap();
        decode.start().unwrap();

        let props = argus_core::buffer::ImageProps {
            format: ImageFormat::H264,
            batch: 1,
            width: 1920,
            height: 1080,
            stride: [0; 4],
            plane_height: [0; 4],
            plane_size: [0x8000, 0, 0, 0],
            num_planes: 1,
        };
        let tagged = SharedBuffer::image(0x840_0000, 63, props.frame_size(), 0, props);
        let frame = frame_buf(0x850_0000);
        let err = decode
            .execute(&tagged, &frame, 0, 0)
            .expect_err("codec mismatch must be rejected");
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));

        decode.stop().unwrap();
        decode.deinit().unwrap();
    }
}
