//! Stereo disparity from a rectified NV12 pair, with confidence output.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{ImageRef, StereoJob, StereoParams, TensorRef};
use argus_core::backend::KernelHandle;
use argus_core::buffer::{SharedBuffer, MAX_IMAGE_DIM};
use argus_core::capability::{self, Component};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, ImageFormat};

use crate::common::BufferTracker;
use crate::dispatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoDepthConfig {
    pub backend: BackendClass,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Search from right image to left instead of the default direction.
    #[serde(default)]
    pub search_right_to_left: bool,
    #[serde(default)]
    pub hole_fill: bool,
    /// Confidence assigned to occluded pixels, 0 disables occlusion
    /// handling.
    #[serde(default)]
    pub occlusion_confidence: u8,
}

impl StereoDepthConfig {
    fn validate(&self) -> ArgusResult<()> {
        capability::ensure_supported(self.backend, Component::StereoDepth)?;
        if self.width == 0
            || self.height == 0
            || self.width > MAX_IMAGE_DIM
            || self.height > MAX_IMAGE_DIM
        {
            return Err(ArgusError::bad_args(format!(
                "invalid stereo size {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ArgusError::bad_args(format!(
                "stereo size {}x{} must be even",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(ArgusError::bad_args("zero frame rate"));
        }
        Ok(())
    }
}

struct Active {
    config: StereoDepthConfig,
    kernel: KernelHandle,
    session: BackendSession,
}

pub struct StereoDepth {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for StereoDepth {
    fn default() -> Self {
        Self::new()
    }
}

impl StereoDepth {
    pub fn new() -> Self {
        StereoDepth {
            core: ComponentCore::new("stereo-depth"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: StereoDepthConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        config.validate()?;

        let session = BackendSession::acquire(config.backend)?;
        let binding = session::binding(config.backend)?;
        let kernel = dispatch::stereo_create(
            &binding,
            &StereoParams {
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
                search_right_to_left: config.search_right_to_left,
                hole_fill: config.hole_fill,
                occlusion_confidence: config.occlusion_confidence,
            },
        )?;

        self.active = Some(Active {
            config,
            kernel,
            session,
        });
        self.core.set_state(ComponentState::Ready);
        Ok(())
    }

    pub fn start(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Ready])?;
        self.core.set_state(ComponentState::Running);
        Ok(())
    }

    pub fn stop(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        self.core.set_state(ComponentState::Ready);
        Ok(())
    }

    pub fn execute(
        &mut self,
        left: &SharedBuffer,
        right: &SharedBuffer,
        disparity: &SharedBuffer,
        confidence: &SharedBuffer,
    ) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("stereo-depth: not configured"))?;
        let config = &active.config;
        let class = config.backend;

        for buf in [left, right] {
            buf.image_props()?
                .require_shape(ImageFormat::Nv12, config.width, config.height)?;
        }
        disparity.validate()?;
        confidence.validate()?;

        for buf in [left, right] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Input)?;
        }
        for buf in [disparity, confidence] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Output)?;
        }

        let binding = session::binding(class)?;
        let _exec = session::exec_guard(class);
        dispatch::stereo_run(
            &binding,
            active.kernel,
            &StereoJob {
                left: ImageRef::from_buffer(left, 0)?,
                right: ImageRef::from_buffer(right, 0)?,
                disparity: TensorRef::from_buffer(disparity),
                confidence: TensorRef::from_buffer(confidence),
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
            .ok_or_else(|| ArgusError::bad_state("stereo-depth: not configured"))?;
        let class = active.config.backend;
        self.buffers.deregister_all(class);

        let mut first_err = None;
        if let Ok(binding) = session::binding(class) {
            if let Err(e) = dispatch::stereo_destroy(&binding, active.kernel) {
                warn!("stereo-depth: kernel destroy failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = active.session.shutdown() {
            warn!("stereo-depth: session shutdown failed: {e}");
            first_err.get_or_insert(e);
        }
        self.core.set_state(ComponentState::Initial);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn class(&self) -> ArgusResult<BackendClass> {
        self.active
            .as_ref()
            .map(|a| a.config.backend)
            .ok_or_else(|| ArgusError::bad_state("stereo-depth: not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::backend::loopback;
    use argus_core::buffer::{packed_image_props, TensorProps};
    use argus_core::types::TensorDtype;
    use crate::testsync;

    fn config() -> StereoDepthConfig {
        StereoDepthConfig {
            backend: BackendClass::Npu0,
            width: 640,
            height: 400,
            frame_rate: 15,
            search_right_to_left: false,
            hole_fill: true,
            occlusion_confidence: 8,
        }
    }

    fn nv12_buf(addr: usize) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Nv12, 640, 400, 1).unwrap();
        SharedBuffer::image(addr, 31, props.frame_size(), 0, props)
    }

    fn tensor_buf(addr: usize) -> SharedBuffer {
        let props = TensorProps::new(TensorDtype::U8, &[640 * 400]).unwrap();
        SharedBuffer::tensor(addr, 32, props.byte_size(), props)
    }

    #[test]
    fn lifecycle_and_execute() {
        let _serial = testsync::lock();
        loopback::install();

        let mut stereo = StereoDepth::new();
        stereo.init(config()).unwrap();
        stereo.start().unwrap();

        let before = loopback::stats(BackendClass::Npu0);
        stereo
            .execute(
                &nv12_buf(0x500_0000),
                &nv12_buf(0x510_0000),
                &tensor_buf(0x520_0000),
                &tensor_buf(0x530_0000),
            )
            .unwrap();
        let after = loopback::stats(BackendClass::Npu0);
        assert_eq!(after.run - before.run, 1);

        stereo.stop().unwrap();
        stereo.deinit().unwrap();
        assert_eq!(stereo.state(), ComponentState::Initial);
    }

    #[test]
    fn mismatched_pair_rejected() {
        let _serial = testsync::lock();
        loopback::install();
        let mut stereo = StereoDepth::new();
        stereo.init(config()).unwrap();
        stereo.start().unwrap();

        let props = packed_image_props(ImageFormat::Nv12, 320, 200, 1).unwrap();
        let small = SharedBuffer::image(0x540_0000, 33, props.frame_size(), 0, props);
        let before = loopback::stats(BackendClass::Npu0);
        let err = stereo
            .execute(
                &nv12_buf(0x500_0000),
                &small,
                &tensor_buf(0x520_0000),
                &tensor_buf(0x530_0000),
            )
            .unwrap_err();
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));
        assert_eq!(loopback::stats(BackendClass::Npu0).run, before.run);

        stereo.stop().unwrap();
        stereo.deinit().unwrap();
    }
}
