//! 3D bounding-box extraction from CenterPoint-style head tensors:
//! heatmap/xy/z/size/theta grids in, box list with labels, scores, and
//! per-box metadata out, plus an optional center-range/label filter and
//! point-to-box assignment.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{BoxFilterParams, BoxJob, BoxParams, TensorRef};
use argus_core::backend::KernelHandle;
use argus_core::buffer::SharedBuffer;
use argus_core::capability::{self, Component};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, TensorDtype};

use crate::common::BufferTracker;
use crate::dispatch;

/// Keep only detections whose center lies in the box and whose label is
/// listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxFilterConfig {
    pub min_center: [f32; 3],
    pub max_center: [f32; 3],
    /// Class labels to keep; empty keeps all.
    #[serde(default)]
    pub labels: Vec<u32>,
    pub max_filtered: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxExtractConfig {
    pub backend: BackendClass,
    /// Grid cell extent in meters, x/y.
    pub pillar_size: [f32; 2],
    pub min_range: [f32; 2],
    pub max_range: [f32; 2],
    pub num_classes: u32,
    pub max_points: u32,
    pub point_dims: u32,
    pub max_detections: u32,
    /// Downsample ratio between the pillar grid and the head grids.
    pub head_stride: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    /// Also assign each input point to its containing box.
    #[serde(default)]
    pub map_points_to_boxes: bool,
    #[serde(default)]
    pub filter: Option<BoxFilterConfig>,
}

impl BoxExtractConfig {
    fn validate(&self) -> ArgusResult<()> {
        capability::ensure_supported(self.backend, Component::BoxExtract)?;
        if self.pillar_size.iter().any(|&s| s <= 0.0) {
            return Err(ArgusError::bad_args(format!(
                "pillar size {:?} must be positive",
                self.pillar_size
            )));
        }
        for axis in 0..2 {
            if self.min_range[axis] >= self.max_range[axis] {
                return Err(ArgusError::bad_args(format!(
                    "range [{}, {}] on axis {axis} is not ordered",
                    self.min_range[axis], self.max_range[axis]
                )));
            }
        }
        if self.num_classes == 0 || self.num_classes > 64 {
            return Err(ArgusError::bad_args(format!(
                "class count {} out of range 1..=64",
                self.num_classes
            )));
        }
        if self.max_detections == 0 || self.head_stride == 0 {
            return Err(ArgusError::bad_args("zero detection capacity or stride"));
        }
        if self.map_points_to_boxes && (self.max_points == 0 || self.point_dims < 3) {
            return Err(ArgusError::bad_args(
                "point-to-box mapping needs a point layout",
            ));
        }
        if !(0.0..=1.0).contains(&self.score_threshold)
            || !(0.0..=1.0).contains(&self.iou_threshold)
        {
            return Err(ArgusError::bad_args(format!(
                "thresholds score={} iou={} outside [0, 1]",
                self.score_threshold, self.iou_threshold
            )));
        }
        if let Some(filter) = &self.filter {
            for axis in 0..3 {
                if filter.min_center[axis] >= filter.max_center[axis] {
                    return Err(ArgusError::bad_args(format!(
                        "filter range on axis {axis} is not ordered"
                    )));
                }
            }
            if filter.max_filtered == 0 {
                return Err(ArgusError::bad_args("zero filter capacity"));
            }
            if let Some(&bad) = filter.labels.iter().find(|&&l| l >= self.num_classes) {
                return Err(ArgusError::bad_args(format!(
                    "filter label {bad} outside {} classes",
                    self.num_classes
                )));
            }
        }
        Ok(())
    }

    fn filter_params(&self) -> Option<BoxFilterParams> {
        self.filter.as_ref().map(|f| BoxFilterParams {
            min_center: f.min_center,
            max_center: f.max_center,
            label_mask: if f.labels.is_empty() {
                u64::MAX
            } else {
                f.labels.iter().fold(0u64, |mask, &l| mask | (1 << l))
            },
            max_filtered: f.max_filtered,
        })
    }
}

/// Head tensors and the optional point cloud for one execute.
#[derive(Debug, Clone, Copy)]
pub struct BoxExtractInputs<'a> {
    pub heatmap: &'a SharedBuffer,
    pub xy: &'a SharedBuffer,
    pub z: &'a SharedBuffer,
    pub size: &'a SharedBuffer,
    pub theta: &'a SharedBuffer,
    pub points: &'a SharedBuffer,
    pub num_points: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BoxExtractOutputs<'a> {
    pub boxes: &'a SharedBuffer,
    pub labels: &'a SharedBuffer,
    pub scores: &'a SharedBuffer,
    pub metadata: &'a SharedBuffer,
}

struct Active {
    config: BoxExtractConfig,
    kernel: KernelHandle,
    session: BackendSession,
}

pub struct BoxExtract {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for BoxExtract {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxExtract {
    pub fn new() -> Self {
        BoxExtract {
            core: ComponentCore::new("box-extract"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: BoxExtractConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        config.validate()?;

        let session = BackendSession::acquire(config.backend)?;
        let binding = session::binding(config.backend)?;
        let kernel = dispatch::bbox_create(
            &binding,
            &BoxParams {
                pillar_size: config.pillar_size,
                min_range: config.min_range,
                max_range: config.max_range,
                num_classes: config.num_classes,
                max_points: config.max_points,
                point_dims: config.point_dims,
                max_detections: config.max_detections,
                head_stride: config.head_stride,
                score_threshold: config.score_threshold,
                iou_threshold: config.iou_threshold,
                map_points_to_boxes: config.map_points_to_boxes,
            },
        )?;
        if let Some(filter) = config.filter_params() {
            if let Err(e) = dispatch::bbox_set_filter(&binding, kernel, &filter) {
                if let Err(d) = dispatch::bbox_destroy(&binding, kernel) {
                    warn!("box-extract: unwind destroy failed: {d}");
                }
                return Err(e);
            }
        }

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

    /// Run one extraction; returns the number of detections written.
    pub fn execute(
        &mut self,
        inputs: &BoxExtractInputs<'_>,
        outputs: &BoxExtractOutputs<'_>,
    ) -> ArgusResult<u32> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("box-extract: not configured"))?;
        let config = &active.config;
        let class = config.backend;

        for head in [
            inputs.heatmap,
            inputs.xy,
            inputs.z,
            inputs.size,
            inputs.theta,
        ] {
            let props = head.tensor_props()?;
            props.validate()?;
            if props.dtype != TensorDtype::F32 {
                return Err(ArgusError::invalid_buffer(format!(
                    "head tensor dtype {:?}, expected F32",
                    props.dtype
                )));
            }
        }
        if config.map_points_to_boxes {
            inputs.points.tensor_props()?.require_shape(
                TensorDtype::F32,
                &[config.max_points, config.point_dims],
            )?;
            if inputs.num_points > config.max_points {
                return Err(ArgusError::bad_args(format!(
                    "{} points exceed configured maximum {}",
                    inputs.num_points, config.max_points
                )));
            }
        } else {
            inputs.points.validate()?;
        }
        for buf in [outputs.boxes, outputs.labels, outputs.scores, outputs.metadata] {
            buf.validate()?;
        }

        for head in [
            inputs.heatmap,
            inputs.xy,
            inputs.z,
            inputs.size,
            inputs.theta,
            inputs.points,
        ] {
            self.buffers
                .ensure_registered(class, head, BufferRole::Input)?;
        }
        for buf in [outputs.boxes, outputs.labels, outputs.scores, outputs.metadata] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Output)?;
        }

        let binding = session::binding(class)?;
        let _exec = session::exec_guard(class);
        dispatch::bbox_run(
            &binding,
            active.kernel,
            &BoxJob {
                heatmap: TensorRef::from_buffer(inputs.heatmap),
                xy: TensorRef::from_buffer(inputs.xy),
                z: TensorRef::from_buffer(inputs.z),
                size: TensorRef::from_buffer(inputs.size),
                theta: TensorRef::from_buffer(inputs.theta),
                points: TensorRef::from_buffer(inputs.points),
                num_points: inputs.num_points,
                boxes: TensorRef::from_buffer(outputs.boxes),
                labels: TensorRef::from_buffer(outputs.labels),
                scores: TensorRef::from_buffer(outputs.scores),
                metadata: TensorRef::from_buffer(outputs.metadata),
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
            .ok_or_else(|| ArgusError::bad_state("box-extract: not configured"))?;
        let class = active.config.backend;
        self.buffers.deregister_all(class);

        let mut first_err = None;
        if let Ok(binding) = session::binding(class) {
            if let Err(e) = dispatch::bbox_destroy(&binding, active.kernel) {
                warn!("box-extract: kernel destroy failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = active.session.shutdown() {
            warn!("box-extract: session shutdown failed: {e}");
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
            .ok_or_else(|| ArgusError::bad_state("box-extract: not configured"))
    }
}
