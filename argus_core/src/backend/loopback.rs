//! In-process fake backend for every class.
//!
//! The loopback backend honors both seam contracts without touching any
//! vendor library or transport: host classes get a [`VendorLibrary`] that
//! hands out incrementing handles, remote classes get an
//! [`AcceleratorChannel`] that interprets the [`wire`](super::wire) blocks.
//! Every call bumps a per-class atomic counter so tests can assert exact
//! call sequences, and a one-shot failure can be injected per class to
//! exercise the error path.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ArgusError, ArgusResult};
use crate::types::{BackendClass, BufferRole};

use super::params::{
    BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams, FlowJob,
    FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob, StereoParams,
};
use super::{wire, AcceleratorChannel, BackendBinding, BackendProvider, KernelHandle, VendorLibrary};

/// Per-class call counters. Read them through [`stats`].
#[derive(Debug)]
struct CallStats {
    init: AtomicU32,
    deinit: AtomicU32,
    register: AtomicU32,
    deregister: AtomicU32,
    create: AtomicU32,
    run: AtomicU32,
    destroy: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
}

impl CallStats {
    const fn new() -> Self {
        CallStats {
            init: AtomicU32::new(0),
            deinit: AtomicU32::new(0),
            register: AtomicU32::new(0),
            deregister: AtomicU32::new(0),
            create: AtomicU32::new(0),
            run: AtomicU32::new(0),
            destroy: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }
}

/// Point-in-time copy of one class's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub init: u32,
    pub deinit: u32,
    pub register: u32,
    pub deregister: u32,
    pub create: u32,
    pub run: u32,
    pub destroy: u32,
    pub opens: u32,
    pub closes: u32,
}

static STATS: [CallStats; BackendClass::COUNT] = [
    CallStats::new(),
    CallStats::new(),
    CallStats::new(),
    CallStats::new(),
];

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static FAIL_NEXT_RUN: [AtomicI32; BackendClass::COUNT] = [
    AtomicI32::new(0),
    AtomicI32::new(0),
    AtomicI32::new(0),
    AtomicI32::new(0),
];

fn bump(class: BackendClass, field: fn(&CallStats) -> &AtomicU32) {
    field(&STATS[class.index()]).fetch_add(1, Ordering::SeqCst);
}

/// Snapshot the loopback counters for one class. Counters are process-wide
/// and monotonic; tests compare deltas around the sequence under test.
pub fn stats(class: BackendClass) -> StatsSnapshot {
    let s = &STATS[class.index()];
    StatsSnapshot {
        init: s.init.load(Ordering::SeqCst),
        deinit: s.deinit.load(Ordering::SeqCst),
        register: s.register.load(Ordering::SeqCst),
        deregister: s.deregister.load(Ordering::SeqCst),
        create: s.create.load(Ordering::SeqCst),
        run: s.run.load(Ordering::SeqCst),
        destroy: s.destroy.load(Ordering::SeqCst),
        opens: s.opens.load(Ordering::SeqCst),
        closes: s.closes.load(Ordering::SeqCst),
    }
}

/// Make the next run-shaped call on `class` fail with the given nonzero
/// native code. One-shot; cleared as soon as it fires.
pub fn fail_next_run(class: BackendClass, code: i32) {
    FAIL_NEXT_RUN[class.index()].store(code, Ordering::SeqCst);
}

fn take_injected_failure(class: BackendClass) -> i32 {
    FAIL_NEXT_RUN[class.index()].swap(0, Ordering::SeqCst)
}

fn next_handle() -> KernelHandle {
    KernelHandle(NEXT_HANDLE.fetch_add(1, Ordering::SeqCst))
}

/// Host-side fake vendor table.
pub struct LoopbackLibrary {
    class: BackendClass,
}

impl LoopbackLibrary {
    pub fn new(class: BackendClass) -> Self {
        LoopbackLibrary { class }
    }

    fn created(&self) -> ArgusResult<KernelHandle> {
        bump(self.class, |s| &s.create);
        Ok(next_handle())
    }

    fn ran(&self) -> ArgusResult<()> {
        bump(self.class, |s| &s.run);
        let code = take_injected_failure(self.class);
        if code != 0 {
            return Err(ArgusError::backend(self.class, code, "injected failure"));
        }
        Ok(())
    }

    fn destroyed(&self) -> ArgusResult<()> {
        bump(self.class, |s| &s.destroy);
        Ok(())
    }
}

impl VendorLibrary for LoopbackLibrary {
    fn init(&self) -> ArgusResult<()> {
        bump(self.class, |s| &s.init);
        Ok(())
    }

    fn deinit(&self) -> ArgusResult<()> {
        bump(self.class, |s| &s.deinit);
        Ok(())
    }

    fn register_buffer(&self, _role: BufferRole, _addr: usize, _size: usize) -> ArgusResult<()> {
        bump(self.class, |s| &s.register);
        Ok(())
    }

    fn deregister_buffer(&self, _addr: usize) -> ArgusResult<()> {
        bump(self.class, |s| &s.deregister);
        Ok(())
    }

    fn remap_create_map(&self, _params: &RemapMapParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn remap_run(&self, _map: KernelHandle, _job: &RemapJob) -> ArgusResult<()> {
        self.ran()
    }

    fn remap_destroy_map(&self, _map: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }

    fn flow_create(&self, _params: &FlowParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn flow_set_filter(
        &self,
        _session: KernelHandle,
        _filter: &FlowFilterParams,
    ) -> ArgusResult<()> {
        Ok(())
    }

    fn flow_run(&self, _session: KernelHandle, _job: &FlowJob) -> ArgusResult<()> {
        self.ran()
    }

    fn flow_destroy(&self, _session: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }

    fn stereo_create(&self, _params: &StereoParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn stereo_run(&self, _session: KernelHandle, _job: &StereoJob) -> ArgusResult<()> {
        self.ran()
    }

    fn stereo_destroy(&self, _session: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }

    fn pillar_create(&self, _params: &PillarParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn pillar_run(&self, _encoder: KernelHandle, _job: &PillarJob) -> ArgusResult<()> {
        self.ran()
    }

    fn pillar_destroy(&self, _encoder: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }

    fn bbox_create(&self, _params: &BoxParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn bbox_set_filter(&self, _post: KernelHandle, _filter: &BoxFilterParams) -> ArgusResult<()> {
        Ok(())
    }

    fn bbox_run(&self, _post: KernelHandle, _job: &BoxJob) -> ArgusResult<u32> {
        self.ran()?;
        Ok(0)
    }

    fn bbox_destroy(&self, _post: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }

    fn decode_create(&self, _params: &DecodeParams) -> ArgusResult<KernelHandle> {
        self.created()
    }

    fn decode_run(&self, _stream: KernelHandle, _job: &DecodeJob) -> ArgusResult<()> {
        self.ran()
    }

    fn decode_flush(&self, _stream: KernelHandle) -> ArgusResult<()> {
        Ok(())
    }

    fn decode_destroy(&self, _stream: KernelHandle) -> ArgusResult<()> {
        self.destroyed()
    }
}

/// Remote-side fake channel. One instance serves both NPU classes; the
/// class is recovered from the remote handle it handed out.
pub struct LoopbackChannel;

const REMOTE_BASE: u64 = 0x4000_0000;

fn class_of_remote(handle: u64) -> ArgusResult<BackendClass> {
    match handle.checked_sub(REMOTE_BASE) {
        Some(2) => Ok(BackendClass::Npu0),
        Some(3) => Ok(BackendClass::Npu1),
        _ => Err(ArgusError::bad_args(format!(
            "unknown loopback remote handle {handle:#x}"
        ))),
    }
}

fn write_status(args: &mut [u8], code: i32) -> ArgusResult<()> {
    let n = args.len();
    if n < 4 {
        return Err(ArgusError::bad_args("argument block too short"));
    }
    args[n - 4..].copy_from_slice(&code.to_le_bytes());
    Ok(())
}

fn write_handle(args: &mut [u8]) -> ArgusResult<()> {
    if args.len() < 12 {
        return Err(ArgusError::bad_args("argument block too short for handle"));
    }
    args[..8].copy_from_slice(&next_handle().0.to_le_bytes());
    Ok(())
}

impl AcceleratorChannel for LoopbackChannel {
    fn open(&self, uri: &str) -> ArgusResult<u64> {
        // The session encodes the domain in the URI it built.
        let class = if uri.contains("dom=0") {
            BackendClass::Npu0
        } else if uri.contains("dom=1") {
            BackendClass::Npu1
        } else {
            return Err(ArgusError::bad_args(format!("malformed session uri {uri:?}")));
        };
        bump(class, |s| &s.opens);
        Ok(REMOTE_BASE + class.index() as u64)
    }

    fn close(&self, handle: u64) -> ArgusResult<()> {
        bump(class_of_remote(handle)?, |s| &s.closes);
        Ok(())
    }

    fn invoke(&self, handle: u64, method: u32, args: &mut [u8]) -> ArgusResult<()> {
        let class = class_of_remote(handle)?;
        match method {
            wire::METHOD_INIT => bump(class, |s| &s.init),
            wire::METHOD_DEINIT => bump(class, |s| &s.deinit),
            wire::METHOD_VERSION => {
                let text = b"loopback-1.0";
                if args.len() < wire::VERSION_LEN + 8 {
                    return Err(ArgusError::bad_args("version block too short"));
                }
                args[..text.len()].copy_from_slice(text);
            }
            wire::METHOD_MMAP | wire::METHOD_REG_BUF => bump(class, |s| &s.register),
            wire::METHOD_MUNMAP | wire::METHOD_DEREG_BUF => bump(class, |s| &s.deregister),
            wire::METHOD_REMAP_CREATE
            | wire::METHOD_FLOW_CREATE
            | wire::METHOD_STEREO_CREATE
            | wire::METHOD_PILLAR_CREATE
            | wire::METHOD_BBOX_CREATE => {
                bump(class, |s| &s.create);
                write_handle(args)?;
            }
            wire::METHOD_REMAP_RUN
            | wire::METHOD_FLOW_RUN
            | wire::METHOD_STEREO_RUN
            | wire::METHOD_PILLAR_RUN
            | wire::METHOD_BBOX_RUN => {
                bump(class, |s| &s.run);
                let code = take_injected_failure(class);
                if code != 0 {
                    return write_status(args, code);
                }
            }
            wire::METHOD_FLOW_FILTER | wire::METHOD_BBOX_FILTER => {}
            wire::METHOD_REMAP_DESTROY
            | wire::METHOD_FLOW_DESTROY
            | wire::METHOD_STEREO_DESTROY
            | wire::METHOD_PILLAR_DESTROY
            | wire::METHOD_BBOX_DESTROY => bump(class, |s| &s.destroy),
            other => {
                return Err(ArgusError::bad_args(format!(
                    "loopback: unknown method {other:#x}"
                )))
            }
        }
        write_status(args, wire::STATUS_OK)
    }
}

/// Provider wiring every class to the loopback fakes.
pub struct LoopbackProvider;

impl BackendProvider for LoopbackProvider {
    fn bring_up(&self, class: BackendClass, uri: &str) -> ArgusResult<BackendBinding> {
        if class.is_remote() {
            let channel: Arc<dyn AcceleratorChannel> = Arc::new(LoopbackChannel);
            let remote = channel.open(uri)?;
            Ok(BackendBinding::Remote {
                class,
                channel,
                remote,
            })
        } else {
            Ok(BackendBinding::Host {
                class,
                lib: Arc::new(LoopbackLibrary::new(class)),
            })
        }
    }
}

/// Route all backend bring-up through the loopback fakes. Idempotent.
pub fn install() {
    super::install_provider(Arc::new(LoopbackProvider));
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::params::{ImageRef, Roi};

    fn map_params() -> RemapMapParams {
        RemapMapParams {
            pipeline: 1,
            src_width: 64,
            src_height: 64,
            dst_width: 32,
            dst_height: 32,
            map_width: 0,
            map_height: 0,
            map_x_addr: 0,
            map_y_addr: 0,
            undistort: false,
            border_const: 0,
        }
    }

    fn remap_job() -> RemapJob {
        let img = ImageRef {
            addr: 0x1000,
            dma_handle: 1,
            region_offset: 0,
            width: 64,
            height: 64,
            stride: [64, 0, 0, 0],
            plane_size: [4096, 0, 0, 0],
            num_planes: 1,
        };
        RemapJob {
            src: img,
            dst: img,
            roi: Roi::full(64, 64),
            roi_scale: 1.0,
            normalize: None,
        }
    }

    #[test]
    fn host_library_counts_calls() {
        let lib = LoopbackLibrary::new(BackendClass::Cpu);
        let before = stats(BackendClass::Cpu);
        lib.init().unwrap();
        lib.register_buffer(BufferRole::Input, 0x1000, 4096).unwrap();
        let map = lib.remap_create_map(&map_params()).unwrap();
        lib.remap_destroy_map(map).unwrap();
        lib.deregister_buffer(0x1000).unwrap();
        lib.deinit().unwrap();
        let after = stats(BackendClass::Cpu);
        assert_eq!(after.init - before.init, 1);
        assert_eq!(after.register - before.register, 1);
        assert_eq!(after.create - before.create, 1);
        assert_eq!(after.destroy - before.destroy, 1);
        assert_eq!(after.deregister - before.deregister, 1);
        assert_eq!(after.deinit - before.deinit, 1);
    }

    #[test]
    fn channel_routes_by_domain_and_writes_status() {
        let channel = LoopbackChannel;
        let remote = channel.open("argus://npu?dom=1&session=1").unwrap();
        assert_eq!(class_of_remote(remote).unwrap(), BackendClass::Npu1);

        let mut args = wire::InitArgs {
            _reserved: 0,
            status: -1,
        };
        wire::invoke_block(
            &channel,
            remote,
            BackendClass::Npu1,
            wire::METHOD_INIT,
            &mut args,
            &[],
        )
        .unwrap();
        assert_eq!(args.status, wire::STATUS_OK);
        channel.close(remote).unwrap();
    }

    #[test]
    fn create_methods_hand_out_distinct_handles() {
        let channel = LoopbackChannel;
        let remote = channel.open("argus://npu?dom=0&session=1").unwrap();
        let mut a = bytemuck::Zeroable::zeroed();
        let mut b = bytemuck::Zeroable::zeroed();
        for args in [&mut a, &mut b] {
            wire::invoke_block::<wire::FlowCreateArgs>(
                &channel,
                remote,
                BackendClass::Npu0,
                wire::METHOD_FLOW_CREATE,
                args,
                &[],
            )
            .unwrap();
        }
        assert_ne!(a.handle, 0);
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn injected_failure_surfaces_as_backend_error() {
        let lib = LoopbackLibrary::new(BackendClass::Gpu);
        fail_next_run(BackendClass::Gpu, -12);
        let err = lib.remap_run(KernelHandle(7), &remap_job()).unwrap_err();
        match err {
            crate::error::ArgusError::Backend { backend, code, .. } => {
                assert_eq!(backend, BackendClass::Gpu);
                assert_eq!(code, -12);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // One-shot: the next run succeeds.
        lib.remap_run(KernelHandle(7), &remap_job()).unwrap();
    }
}
