//! Point-cloud pillarization: an XYZR point tensor is scattered into a
//! fixed grid of vertical pillars, emitting a pillar index tensor and a
//! per-pillar feature tensor for the detection network.

use log::warn;
use serde::{Deserialize, Serialize};

use argus_core::backend::params::{PillarJob, PillarParams, TensorRef};
use argus_core::backend::KernelHandle;
use argus_core::buffer::SharedBuffer;
use argus_core::capability::{self, Component};
use argus_core::component::{ComponentCore, ComponentState};
use argus_core::error::{ArgusError, ArgusResult};
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, TensorDtype};

use crate::common::BufferTracker;
use crate::dispatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PillarizeConfig {
    pub backend: BackendClass,
    /// Pillar cell extent in meters, x/y/z.
    pub pillar_size: [f32; 3],
    pub min_range: [f32; 3],
    pub max_range: [f32; 3],
    pub max_points: u32,
    /// Values per point; at least x/y/z plus reflectance.
    pub point_dims: u32,
    pub max_pillars: u32,
    pub max_points_per_pillar: u32,
    pub feature_dims: u32,
}

impl PillarizeConfig {
    fn validate(&self) -> ArgusResult<()> {
        capability::ensure_supported(self.backend, Component::Pillarize)?;
        if self.pillar_size.iter().any(|&s| s <= 0.0) {
            return Err(ArgusError::bad_args(format!(
                "pillar size {:?} must be positive",
                self.pillar_size
            )));
        }
        for axis in 0..3 {
            if self.min_range[axis] >= self.max_range[axis] {
                return Err(ArgusError::bad_args(format!(
                    "range [{}, {}] on axis {axis} is not ordered",
                    self.min_range[axis], self.max_range[axis]
                )));
            }
        }
        if self.point_dims < 4 {
            return Err(ArgusError::bad_args(format!(
                "point dims {} below XYZR minimum of 4",
                self.point_dims
            )));
        }
        if self.max_points == 0
            || self.max_pillars == 0
            || self.max_points_per_pillar == 0
            || self.feature_dims == 0
        {
            return Err(ArgusError::bad_args("zero pillarization capacity"));
        }
        Ok(())
    }
}

struct Active {
    config: PillarizeConfig,
    kernel: KernelHandle,
    session: BackendSession,
}

pub struct Pillarize {
    core: ComponentCore,
    active: Option<Active>,
    buffers: BufferTracker,
}

impl Default for Pillarize {
    fn default() -> Self {
        Self::new()
    }
}

impl Pillarize {
    pub fn new() -> Self {
        Pillarize {
            core: ComponentCore::new("pillarize"),
            active: None,
            buffers: BufferTracker::default(),
        }
    }

    pub fn state(&self) -> ComponentState {
        self.core.state()
    }

    pub fn init(&mut self, config: PillarizeConfig) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Initial])?;
        config.validate()?;

        let session = BackendSession::acquire(config.backend)?;
        let binding = session::binding(config.backend)?;
        let kernel = dispatch::pillar_create(
            &binding,
            &PillarParams {
                pillar_size: config.pillar_size,
                min_range: config.min_range,
                max_range: config.max_range,
                max_points: config.max_points,
                point_dims: config.point_dims,
                max_pillars: config.max_pillars,
                max_points_per_pillar: config.max_points_per_pillar,
                feature_dims: config.feature_dims,
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

    /// Scatter the first `num_points` of `points` into pillars.
    pub fn execute(
        &mut self,
        points: &SharedBuffer,
        num_points: u32,
        pillars: &SharedBuffer,
        features: &SharedBuffer,
    ) -> ArgusResult<()> {
        self.core.ensure(&[ComponentState::Running])?;
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ArgusError::bad_state("pillarize: not configured"))?;
        let config = &active.config;
        let class = config.backend;

        points.tensor_props()?.require_shape(
            TensorDtype::F32,
            &[config.max_points, config.point_dims],
        )?;
        if num_points > config.max_points {
            return Err(ArgusError::bad_args(format!(
                "{num_points} points exceed configured maximum {}",
                config.max_points
            )));
        }
        pillars.validate()?;
        features.validate()?;

        self.buffers
            .ensure_registered(class, points, BufferRole::Input)?;
        for buf in [pillars, features] {
            self.buffers
                .ensure_registered(class, buf, BufferRole::Output)?;
        }

        let binding = session::binding(class)?;
        let _exec = session::exec_guard(class);
        dispatch::pillar_run(
            &binding,
            active.kernel,
            &PillarJob {
                points: TensorRef::from_buffer(points),
                num_points,
                pillars: TensorRef::from_buffer(pillars),
                features: TensorRef::from_buffer(features),
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
            .ok_or_else(|| ArgusError::bad_state("pillarize: not configured"))?;
        let class = active.config.backend;
        self.buffers.deregister_all(class);

        let mut first_err = None;
        if let Ok(binding) = session::binding(class) {
            if let Err(e) = dispatch::pillar_destroy(&binding, active.kernel) {
                warn!("pillarize: kernel destroy failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = active.session.shutdown() {
            warn!("pillarize: session shutdown failed: {e}");
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
            .ok_or_else(|| ArgusError::bad_state("pillarize: not configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::backend::loopback;
    use argus_core::buffer::TensorProps;
    use crate::testsync;

    fn config() -> PillarizeConfig {
        PillarizeConfig {
            backend: BackendClass::Cpu,
            pillar_size: [0.32, 0.32, 6.0],
            min_range: [-51.2, -51.2, -3.0],
            max_range: [51.2, 51.2, 3.0],
            max_points: 20000,
            point_dims: 4,
            max_pillars: 12000,
            max_points_per_pillar: 32,
            feature_dims: 10,
        }
    }

    fn points_buf(addr: usize) -> SharedBuffer {
        let props = TensorProps::new(TensorDtype::F32, &[20000, 4]).unwrap();
        SharedBuffer::tensor(addr, 41, props.byte_size(), props)
    }

    fn out_buf(addr: usize, dims: &[u32]) -> SharedBuffer {
        let props = TensorProps::new(TensorDtype::F32, dims).unwrap();
        SharedBuffer::tensor(addr, 42, props.byte_size(), props)
    }

    #[test]
    fn cpu_end_to_end() {
        let _serial = testsync::lock();
        loopback::install();

        let mut pillarize = Pillarize::new();
        pillarize.init(config()).unwrap();
        pillarize.start().unwrap();

        let before = loopback::stats(BackendClass::Cpu);
        pillarize
            .execute(
                &points_buf(0x600_0000),
                5000,
                &out_buf(0x610_0000, &[12000, 4]),
                &out_buf(0x620_0000, &[12000, 32, 10]),
            )
            .unwrap();
        let after = loopback::stats(BackendClass::Cpu);
        assert_eq!(after.run - before.run, 1);
        // Input plus two outputs, lazily registered on first execute.
        assert_eq!(after.register - before.register, 3);

        // Second execute on the same buffers registers nothing new.
        pillarize
            .execute(
                &points_buf(0x600_0000),
                4000,
                &out_buf(0x610_0000, &[12000, 4]),
                &out_buf(0x620_0000, &[12000, 32, 10]),
            )
            .unwrap();
        assert_eq!(loopback::stats(BackendClass::Cpu).register - before.register, 3);

        pillarize.stop().unwrap();
        pillarize.deinit().unwrap();
        assert_eq!(argus_core::session::use_count(BackendClass::Cpu), 0);
    }

    #[test]
    fn config_rejects_unordered_ranges() {
        let mut cfg = config();
        cfg.min_range[1] = 60.0;
        assert!(matches!(cfg.validate(), Err(ArgusError::BadArguments(_))));

        let mut cfg = config();
        cfg.pillar_size[0] = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.point_dims = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn too_many_points_rejected() {
        let _serial = testsync::lock();
        loopback::install();
        let mut pillarize = Pillarize::new();
        pillarize.init(config()).unwrap();
        pillarize.start().unwrap();

        let err = pillarize
            .execute(
                &points_buf(0x600_0000),
                20001,
                &out_buf(0x610_0000, &[12000, 4]),
                &out_buf(0x620_0000, &[12000, 32, 10]),
            )
            .unwrap_err();
        assert!(matches!(err, ArgusError::BadArguments(_)));

        pillarize.stop().unwrap();
        pillarize.deinit().unwrap();
    }

    #[test]
    fn wrong_point_dtype_rejected() {
        let _serial = testsync::lock();
        loopback::install();
        let mut pillarize = Pillarize::new();
        pillarize.init(config()).unwrap();
        pillarize.start().unwrap();

        let props = TensorProps::new(TensorDtype::I32, &[20000, 4]).unwrap();
        let wrong = SharedBuffer::tensor(0x630_0000, 43, props.byte_size(), props);
        let err = pillarize
            .execute(
                &wrong,
                100,
                &out_buf(0x610_0000, &[12000, 4]),
                &out_buf(0x620_0000, &[12000, 32, 10]),
            )
            .unwrap_err();
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));

        pillarize.stop().unwrap();
        pillarize.deinit().unwrap();
    }
}
