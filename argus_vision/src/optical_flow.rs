//! Dense optical flow over an NV12 frame pair, producing motion-vector and
//! confidence maps. The backend keeps per-stream state, so the kernel
//! session is created at init and its filter chain is programmed at start.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{FlowFilterParams, FlowJob, FlowParams, ImageRef, TensorRef};
use argus_core::backend::KernelHandle;
use argus_core::buffer::{SharedBuffer, MAX_IMAGE_DIM};
use argus_core::capability::{self, Component};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, ImageFormat};

use crate::common::BufferTracker;
use crate::dispatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowQuality {
    Low,
    Medium,
    High,
}

impl FlowQuality {
    fn wire_code(self) -> u32 {
        match self {
            FlowQuality::Low => 0,
            FlowQuality::Medium => 1,
            FlowQuality::High => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    /// Motion from reference to current.
    Forward,
    Backward,
}

impl FlowDirection {
    fn wire_code(self) -> u32 {
        match self {
            FlowDirection::Forward => 0,
            FlowDirection::Backward => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowFilterConfig {
    #[serde(default)]
    pub hole_fill: bool,
    #[serde(default)]
    pub confidence_threshold: u8,
    #[serde(default)]
    pub variance_threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticalFlowConfig {
    pub backend: BackendClass,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub quality: FlowQuality,
    pub direction: FlowDirection,
    #[serde(default)]
    pub filter: Option<FlowFilterConfig>,
}

impl OpticalFlowConfig {
    fn validate(&self) -> ArgusResult<()> {
        capability::ensure_supported(self.backend, Component::OpticalFlow)?;
        if self.width == 0
            || self.height == 0
            || self.width > MAX_IMAGE_DIM
            || self.height > MAX_IMAGE_DIM
        {
            return Err(ArgusError::bad_args(format!(
                "invalid flow size {}x{}",
                self.width, self.height
            )));
        }
        // NV12 chroma subsampling requires even dimensions.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ArgusError::bad_args(format!(
                "flow size {}x{} must be even",
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
    config: OpticalFlowConfig,
    kernel: KernelHandle,
    session: BackendSession,
}

pub struct OpticalFlow {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for OpticalFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl OpticalFlow {
    pub fn new() -> Self {
        OpticalFlow {
            core: ComponentCore::new("optical-flow"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: OpticalFlowConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        config.validate()?;

        let session = BackendSession::acquire(config.backend)?;
        let binding = session::binding(config.backend)?;
        let kernel = dispatch::flow_create(
            &binding,
            &FlowParams {
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
                quality: config.quality.wire_code(),
                direction: config.direction.wire_code(),
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

    /// Ready → Running; programs the filter chain configured at init.
    pub fn start(&mut self) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Ready])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("optical-flow: not configured"))?;
        if let Some(filter) = &active.config.filter {
            let binding = session::binding(active.config.backend)?;
            dispatch::flow_set_filter(
                &binding,
                active.kernel,
                &FlowFilterParams {
                    hole_fill: filter.hole_fill,
                    confidence_threshold: filter.confidence_threshold,
                    variance_threshold: filter.variance_threshold,
                },
            )?;
        }
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
        current: &SharedBuffer,
        reference: &SharedBuffer,
        motion: &SharedBuffer,
        confidence: &SharedBuffer,
    ) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("optical-flow: not configured"))?;
        let config = &active.config;
        let class = config.backend;

        for buf in [current, reference] {
            buf.image_props()?
                .require_shape(ImageFormat::Nv12, config.width, config.height)?;
        }
        motion.validate()?;
        confidence.validate()?;

        for buf in [current, reference] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Input)?;
        }
        for buf in [motion, confidence] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Output)?;
        }

        let binding = session::binding(class)?;
        let _exec = session::exec_guard(class);
        dispatch::flow_run(
            &binding,
            active.kernel,
            &FlowJob {
                current: ImageRef::from_buffer(current, 0)?,
                reference: ImageRef::from_buffer(reference, 0)?,
                motion: TensorRef::from_buffer(motion),
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
            .ok_or_else(|| ArgusError::bad_state("optical-flow: not configured"))?;
        let class = active.config.backend;
        self.buffers.deregister_all(class);

        let mut first_err = None;
        if let Ok(binding) = session::binding(class) {
            if let Err(e) = dispatch::flow_destroy(&binding, active.kernel) {
                warn!("optical-flow: kernel destroy failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = active.session.shutdown() {
            warn!("optical-flow: session shutdown failed: {e}");
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
            .ok_or_else(|| ArgusError::bad_state("optical-flow: not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::backend::loopback;
    use argus_core::buffer::{packed_image_props, TensorProps};
    use argus_core::types::TensorDtype;
    use crate::testsync;

    fn config() -> OpticalFlowConfig {
        OpticalFlowConfig {
            backend: BackendClass::Npu1,
            width: 256,
            height: 128,
            frame_rate: 30,
            quality: FlowQuality::Medium,
            direction: FlowDirection::Forward,
            filter: Some(FlowFilterConfig {
                hole_fill: true,
                confidence_threshold: 16,
                variance_threshold: 4,
            }),
        }
    }

    fn nv12_buf(addr: usize) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Nv12, 256, 128, 1).unwrap();
        SharedBuffer::image(addr, 21, props.frame_size(), 0, props)
    }

    fn tensor_buf(addr: usize, elems: u32) -> SharedBuffer {
        let props = TensorProps::new(TensorDtype::U8, &[elems]).unwrap();
        SharedBuffer::tensor(addr, 22, props.byte_size(), props)
    }

    #[test]
    fn lifecycle_with_filter() {
        let _serial = testsync::lock();
        loopback::install();

        let mut flow = OpticalFlow::new();
        flow.init(config()).unwrap();

        let err = flow
            .execute(
                &nv12_buf(0x400_0000),
                &nv12_buf(0x410_0000),
                &tensor_buf(0x420_0000, 4096),
                &tensor_buf(0x430_0000, 512),
            )
            .unwrap_err();
        assert!(matches!(err, ArgusError::BadState(_)));

        flow.start().unwrap();
        let before = loopback::stats(BackendClass::Npu1);
        flow.execute(
            &nv12_buf(0x400_0000),
            &nv12_buf(0x410_0000),
            &tensor_buf(0x420_0000, 4096),
            &tensor_buf(0x430_0000, 512),
        )
        .unwrap();
        let after = loopback::stats(BackendClass::Npu1);
        assert_eq!(after.run - before.run, 1);

        flow.stop().unwrap();
        flow.deinit().unwrap();
        assert_eq!(argus_core::session::use_count(BackendClass::Npu1), 0);
    }

    #[test]
    fn odd_dimensions_rejected() {
        let mut cfg = config();
        cfg.width = 255;
        assert!(matches!(cfg.validate(), Err(ArgusError::BadArguments(_))));
    }

    #[test]
    fn wrong_input_format_stops_execute() {
        let _serial = testsync::lock();
        loopback::install();
        let mut flow = OpticalFlow::new();
        let mut cfg = config();
        cfg.backend = BackendClass::Npu0;
        flow.init(cfg).unwrap();
        flow.start().unwrap();

        let props = packed_image_props(ImageFormat::Rgb888, 256, 128, 1).unwrap();
        let rgb = SharedBuffer::image(0x440_0000, 23, props.frame_size(), 0, props);
        let before = loopback::stats(BackendClass::Npu0);
        let err = flow
            .execute(
                &rgb,
                &nv12_buf(0x410_0000),
                &tensor_buf(0x420_0000, 4096),
                &tensor_buf(0x430_0000, 512),
            )
            .unwrap_err();
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));
        assert_eq!(loopback::stats(BackendClass::Npu0).run, before.run);

        flow.stop().unwrap();
        flow.deinit().unwrap();
    }
}
