//! Image remapping: N inputs converted/warped into one batched output,
//! optionally through per-input undistortion lookup tables.
//!
//! One kernel handle ("worker") per configured input is created at init
//! and reused for every execute; the output batch slot `i` receives
//! input `i`.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{ImageRef, RemapJob, RemapMapParams, Roi};
use argus_core::backend::KernelHandle;
use argus_core::buffer::{SharedBuffer, MAX_IMAGE_DIM};
use argus_core::capability::{self, Component, RemapPipeline};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, ImageFormat};

use crate::common::BufferTracker;
use crate::dispatch;

fn default_roi_scale() -> f32 {
    1.0
}

/// Undistortion lookup tables, one f32 X and one f32 Y table of
/// `map_width * map_height` entries each, caller-owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndistortConfig {
    pub map_width: u32,
    pub map_height: u32,
    pub map_x_addr: usize,
    pub map_y_addr: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapInputConfig {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Source region to sample; full frame when absent.
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default = "default_roi_scale")]
    pub roi_scale: f32,
    #[serde(default)]
    pub undistort: Option<UndistortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapConfig {
    pub backend: BackendClass,
    pub inputs: Vec<RemapInputConfig>,
    pub output_format: ImageFormat,
    pub output_width: u32,
    pub output_height: u32,
    /// Per-channel normalization factors; selects the normalizing pipeline
    /// variant when present.
    #[serde(default)]
    pub normalize: Option<[f32; 3]>,
    /// Fill value for samples outside the source.
    #[serde(default)]
    pub border_const: u8,
}

impl RemapConfig {
    fn validate(&self) -> ArgusResult<Vec<RemapPipeline>> {
        capability::ensure_supported(self.backend, Component::Remap)?;
        if self.inputs.is_empty() {
            return Err(ArgusError::bad_args("remap needs at least one input"));
        }
        if self.output_width == 0
            || self.output_height == 0
            || self.output_width > MAX_IMAGE_DIM
            || self.output_height > MAX_IMAGE_DIM
        {
            return Err(ArgusError::bad_args(format!(
                "invalid output size {}x{}",
                self.output_width, self.output_height
            )));
        }
        let mut pipelines = Vec::with_capacity(self.inputs.len());
        for (i, input) in self.inputs.iter().enumerate() {
            if input.width == 0
                || input.height == 0
                || input.width > MAX_IMAGE_DIM
                || input.height > MAX_IMAGE_DIM
            {
                return Err(ArgusError::bad_args(format!(
                    "input {i}: invalid size {}x{}",
                    input.width, input.height
                )));
            }
            if input.roi_scale <= 0.0 {
                return Err(ArgusError::bad_args(format!(
                    "input {i}: roi scale must be positive"
                )));
            }
            if let Some(roi) = &input.roi {
                if !roi.fits_within(input.width, input.height) {
                    return Err(ArgusError::bad_args(format!(
                        "input {i}: roi {}x{}+{}+{} outside {}x{}",
                        roi.width, roi.height, roi.x, roi.y, input.width, input.height
                    )));
                }
            }
            if let Some(map) = &input.undistort {
                if map.map_width == 0 || map.map_height == 0 {
                    return Err(ArgusError::bad_args(format!(
                        "input {i}: empty undistortion map"
                    )));
                }
                if map.map_x_addr == 0 || map.map_y_addr == 0 {
                    return Err(ArgusError::bad_args(format!(
                        "input {i}: undistortion enabled without map tables"
                    )));
                }
            }
            pipelines.push(capability::remap_pipeline(
                self.backend,
                input.format,
                self.output_format,
                self.normalize.is_some(),
            )?);
        }
        Ok(pipelines)
    }
}

struct Active {
    config: RemapConfig,
    pipelines: Vec<RemapPipeline>,
    workers: Vec<KernelHandle>,
    session: BackendSession,
}

/// The remap component. One instance per output stream.
pub struct Remap {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for Remap {
    fn default() -> Self {
        Self::new()
    }
}

impl Remap {
    pub fn new() -> Self {
        Remap {
            core: ComponentCore::new("remap"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: RemapConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        let pipelines = config.validate()?;

        let session = BackendSession::acquire(config.backend)?;
        let binding = session::binding(config.backend)?;

        let mut workers = Vec::with_capacity(config.inputs.len());
        for (input, pipeline) in config.inputs.iter().zip(&pipelines) {
            let (map_w, map_h, map_x, map_y, undistort) = match &input.undistort {
                Some(m) => (m.map_width, m.map_height, m.map_x_addr, m.map_y_addr, true),
                None => (0, 0, 0, 0, false),
            };
            let params = RemapMapParams {
                pipeline: pipeline.wire_code(),
                src_width: input.width,
                src_height: input.height,
                dst_width: config.output_width,
                dst_height: config.output_height,
                map_width: map_w,
                map_height: map_h,
                map_x_addr: map_x,
                map_y_addr: map_y,
                undistort,
                border_const: config.border_const,
            };
            match dispatch::remap_create(&binding, &params) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Partial bring-up unwinds; the session drop releases
                    // the backend.
                    for worker in workers {
                        if let Err(d) = dispatch::remap_destroy(&binding, worker) {
                            warn!("remap: unwind destroy failed: {d}");
                        }
                    }
                    return Err(e);
                }
            }
        }

        self.active = Some(Active {
            config,
            pipelines,
            workers,
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

    /// Run every configured input into its batch slot of `output`.
    pub fn execute(&mut self, inputs: &[SharedBuffer], output: &SharedBuffer) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("remap: not configured"))?;
        let config = &active.config;
        let class = config.backend;

        if inputs.len() != config.inputs.len() {
            return Err(ArgusError::bad_args(format!(
                "expected {} inputs, got {}",
                config.inputs.len(),
                inputs.len()
            )));
        }
        // Shapes are re-checked every call; buffer identity is not trusted.
        for (buf, cfg) in inputs.iter().zip(&config.inputs) {
            buf.image_props()?
                .require_shape(cfg.format, cfg.width, cfg.height)?;
        }
        let out_props = *output.image_props()?;
        out_props.require_shape(config.output_format, config.output_width, config.output_height)?;
        if out_props.batch != inputs.len() as u32 {
            return Err(ArgusError::invalid_buffer(format!(
                "output batch {} does not match input count {}",
                out_props.batch,
                inputs.len()
            )));
        }

        for buf in inputs {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Input)?;
        }
        self.buffers
            .ensure_registered(class, output, BufferRole::Output)?;

        let binding = session::binding(class)?;
        let _exec = session::exec_guard(class);
        for (i, (buf, cfg)) in inputs.iter().zip(&config.inputs).enumerate() {
            let job = RemapJob {
                src: ImageRef::from_buffer(buf, 0)?,
                dst: ImageRef::from_buffer(output, i as u32)?,
                roi: cfg
                    .roi
                    .unwrap_or_else(|| Roi::full(cfg.width, cfg.height)),
                roi_scale: cfg.roi_scale,
                normalize: active.pipelines[i]
                    .is_normalizing()
                    .then_some(config.normalize)
                    .flatten(),
            };
            dispatch::remap_run(&binding, active.workers[i], &job)?;
        }
        Ok(())
    }

    /// Pre-register buffers ahead of the first execute.
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
            .ok_or_else(|| ArgusError::bad_state("remap: not configured"))?;
        let class = active.config.backend;
        self.buffers.deregister_all(class);

        let mut first_err = None;
        if let Ok(binding) = session::binding(class) {
            for worker in active.workers {
                if let Err(e) = dispatch::remap_destroy(&binding, worker) {
                    warn!("remap: worker destroy failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = active.session.shutdown() {
            warn!("remap: session shutdown failed: {e}");
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
            .ok_or_else(|| ArgusError::bad_state("remap: not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::backend::loopback;
    use argus_core::buffer::packed_image_props;
    use crate::testsync;

    fn config(backend: BackendClass) -> RemapConfig {
        RemapConfig {
            backend,
            inputs: vec![RemapInputConfig {
                format: ImageFormat::Nv12,
                width: 128,
                height: 96,
                roi: None,
                roi_scale: 1.0,
                undistort: None,
            }],
            output_format: ImageFormat::Rgb888,
            output_width: 64,
            output_height: 48,
            normalize: None,
            border_const: 0,
        }
    }

    fn input_buf(addr: usize) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Nv12, 128, 96, 1).unwrap();
        SharedBuffer::image(addr, 11, props.frame_size(), 0, props)
    }

    fn output_buf(addr: usize, batch: u32) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Rgb888, 64, 48, batch).unwrap();
        SharedBuffer::image(addr, 12, props.frame_size() * batch as usize, 0, props)
    }

    #[test]
    fn lifecycle_and_execute() {
        let _serial = testsync::lock();
        loopback::install();

        let mut remap = Remap::new();
        remap.init(config(BackendClass::Npu0)).unwrap();
        assert_eq!(remap.state(), ComponentState::Ready);

        // Execute before start is gated.
        let err = remap
            .execute(&[input_buf(0x100_0000)], &output_buf(0x200_0000, 1))
            .unwrap_err();
        assert!(matches!(err, ArgusError::BadState(_)));

        remap.start().unwrap();
        let before = loopback::stats(BackendClass::Npu0);
        remap
            .execute(&[input_buf(0x100_0000)], &output_buf(0x200_0000, 1))
            .unwrap();
        let after = loopback::stats(BackendClass::Npu0);
        assert_eq!(after.run - before.run, 1);

        remap.stop().unwrap();
        remap.deinit().unwrap();
        assert_eq!(remap.state(), ComponentState::Initial);
        assert_eq!(argus_core::session::use_count(BackendClass::Npu0), 0);
    }

    #[test]
    fn double_init_rejected() {
        let _serial = testsync::lock();
        loopback::install();
        let mut remap = Remap::new();
        remap.init(config(BackendClass::Cpu)).unwrap();
        let err = remap.init(config(BackendClass::Cpu)).unwrap_err();
        assert!(matches!(err, ArgusError::BadState(_)));
        remap.deinit().unwrap();
    }

    #[test]
    fn shape_drift_stops_before_backend() {
        let _serial = testsync::lock();
        loopback::install();
        let mut remap = Remap::new();
        remap.init(config(BackendClass::Cpu)).unwrap();
        remap.start().unwrap();

        // Wrong input size.
        let props = packed_image_props(ImageFormat::Nv12, 64, 64, 1).unwrap();
        let wrong = SharedBuffer::image(0x300_0000, 13, props.frame_size(), 0, props);
        let before = loopback::stats(BackendClass::Cpu);
        let err = remap
            .execute(&[wrong], &output_buf(0x200_0000, 1))
            .unwrap_err();
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));
        let after = loopback::stats(BackendClass::Cpu);
        assert_eq!(after.run, before.run);
        assert_eq!(after.register, before.register);

        remap.stop().unwrap();
        remap.deinit().unwrap();
    }

    #[test]
    fn config_validation() {
        let mut bad = config(BackendClass::Cpu);
        bad.inputs.clear();
        assert!(bad.validate().is_err());

        let mut bad = config(BackendClass::Cpu);
        bad.inputs[0].roi = Some(Roi {
            x: 100,
            y: 0,
            width: 64,
            height: 32,
        });
        assert!(bad.validate().is_err());

        let mut bad = config(BackendClass::Cpu);
        bad.output_format = ImageFormat::Uyvy; // no such pipeline
        assert!(bad.validate().is_err());

        // UBWC input resolves only on the accelerators.
        let mut ubwc = config(BackendClass::Npu1);
        ubwc.inputs[0].format = ImageFormat::Nv12Ubwc;
        ubwc.output_format = ImageFormat::Bgr888;
        assert!(ubwc.validate().is_ok());
        ubwc.backend = BackendClass::Cpu;
        assert!(ubwc.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = config(BackendClass::Npu1);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RemapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.backend, BackendClass::Npu1);
        assert_eq!(back.inputs.len(), 1);
        assert_eq!(back.inputs[0].roi_scale, 1.0);
    }
}
