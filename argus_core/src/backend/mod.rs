//! Backend seams: the vendor kernel-library contract, the remote-call
//! channel contract, and the process-wide provider that binds a
//! [`BackendClass`](crate::types::BackendClass) to a concrete
//! implementation at session bring-up.
//!
//! Three implementations exist:
//! - the statically linked host SDK (`vendor-sdk` feature),
//! - the dlopened GPU kernel library (`gpu-vendor` feature),
//! - the always-compiled in-process [`loopback`] backend, which fakes both
//!   contracts, counts calls, and keeps the test suite green on machines
//!   without any vendor hardware.
//!
//! The remote accelerators have no vendor-library object on the host side;
//! every operation against them is one [`AcceleratorChannel::invoke`] of a
//! fixed-size argument block (see [`wire`]).

pub mod loopback;
pub mod params;
pub mod wire;

#[cfg(any(feature = "vendor-sdk", feature = "gpu-vendor"))]
mod abi;
#[cfg(feature = "gpu-vendor")]
mod gpu;
#[cfg(feature = "vendor-sdk")]
mod host_ffi;
#[cfg(feature = "npu-transport")]
mod transport;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ArgusError, ArgusResult};
use crate::types::{BackendClass, BufferRole};

use params::{
    BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams, FlowJob,
    FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob, StereoParams,
};

/// Opaque handle to a backend-side persistent object (a remap map, a flow
/// session, a pillar pre-proc instance, ...). Host libraries hand back a
/// pointer-sized token; remote backends hand back their own 64-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandle(pub u64);

/// The `Create/Run/Destroy`-shaped contract every host-side vendor kernel
/// library exposes. Implementations are opaque to the core: the dispatcher
/// only sequences calls against this trait.
///
/// Addresses are host virtual addresses passed through untouched; the
/// caller guarantees the backing memory outlives its registration.
pub trait VendorLibrary: Send + Sync {
    /// One-time library bring-up. Called on the session 0→1 transition.
    fn init(&self) -> ArgusResult<()>;
    /// Library teardown. Called exactly once on the 1→0 transition.
    fn deinit(&self) -> ArgusResult<()>;

    fn register_buffer(&self, role: BufferRole, addr: usize, size: usize) -> ArgusResult<()>;
    fn deregister_buffer(&self, addr: usize) -> ArgusResult<()>;

    fn remap_create_map(&self, params: &RemapMapParams) -> ArgusResult<KernelHandle>;
    fn remap_run(&self, map: KernelHandle, job: &RemapJob) -> ArgusResult<()>;
    fn remap_destroy_map(&self, map: KernelHandle) -> ArgusResult<()>;

    fn flow_create(&self, params: &FlowParams) -> ArgusResult<KernelHandle>;
    fn flow_set_filter(&self, session: KernelHandle, filter: &FlowFilterParams) -> ArgusResult<()>;
    fn flow_run(&self, session: KernelHandle, job: &FlowJob) -> ArgusResult<()>;
    fn flow_destroy(&self, session: KernelHandle) -> ArgusResult<()>;

    fn stereo_create(&self, params: &StereoParams) -> ArgusResult<KernelHandle>;
    fn stereo_run(&self, session: KernelHandle, job: &StereoJob) -> ArgusResult<()>;
    fn stereo_destroy(&self, session: KernelHandle) -> ArgusResult<()>;

    fn pillar_create(&self, params: &PillarParams) -> ArgusResult<KernelHandle>;
    fn pillar_run(&self, encoder: KernelHandle, job: &PillarJob) -> ArgusResult<()>;
    fn pillar_destroy(&self, encoder: KernelHandle) -> ArgusResult<()>;

    fn bbox_create(&self, params: &BoxParams) -> ArgusResult<KernelHandle>;
    fn bbox_set_filter(&self, post: KernelHandle, filter: &BoxFilterParams) -> ArgusResult<()>;
    /// Returns the number of detections written to the output buffers.
    fn bbox_run(&self, post: KernelHandle, job: &BoxJob) -> ArgusResult<u32>;
    fn bbox_destroy(&self, post: KernelHandle) -> ArgusResult<()>;

    fn decode_create(&self, params: &DecodeParams) -> ArgusResult<KernelHandle>;
    fn decode_run(&self, stream: KernelHandle, job: &DecodeJob) -> ArgusResult<()>;
    fn decode_flush(&self, stream: KernelHandle) -> ArgusResult<()>;
    fn decode_destroy(&self, stream: KernelHandle) -> ArgusResult<()>;
}

/// The opaque remote-call channel to an accelerator.
///
/// Calls are synchronous and bounded: `args` is a fixed-size block the
/// callee may write result fields back into. Transport-level failure is an
/// `Err`; method-level failure is a nonzero status field inside the block
/// (see [`wire::invoke_block`]).
pub trait AcceleratorChannel: Send + Sync {
    fn open(&self, uri: &str) -> ArgusResult<u64>;
    fn close(&self, handle: u64) -> ArgusResult<()>;
    fn invoke(&self, handle: u64, method: u32, args: &mut [u8]) -> ArgusResult<()>;
}

/// What a session holds once a backend class is brought up.
#[derive(Clone)]
pub enum BackendBinding {
    /// CPU or GPU: a bound vendor function table.
    Host {
        class: BackendClass,
        lib: Arc<dyn VendorLibrary>,
    },
    /// NPU: an open remote handle on its channel.
    Remote {
        class: BackendClass,
        channel: Arc<dyn AcceleratorChannel>,
        remote: u64,
    },
}

impl BackendBinding {
    pub fn class(&self) -> BackendClass {
        match self {
            BackendBinding::Host { class, .. } => *class,
            BackendBinding::Remote { class, .. } => *class,
        }
    }

    /// Host-side vendor table, if this binding has one.
    pub fn host_lib(&self) -> ArgusResult<&Arc<dyn VendorLibrary>> {
        match self {
            BackendBinding::Host { lib, .. } => Ok(lib),
            BackendBinding::Remote { class, .. } => Err(ArgusError::bad_state(format!(
                "{class} is a remote backend with no host vendor table"
            ))),
        }
    }
}

impl std::fmt::Debug for BackendBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendBinding::Host { class, .. } => write!(f, "BackendBinding::Host({class})"),
            BackendBinding::Remote { class, remote, .. } => {
                write!(f, "BackendBinding::Remote({class}, {remote:#x})")
            }
        }
    }
}

/// Creates the binding for a backend class at first acquire. The session
/// performs the init handshake itself; a provider only constructs the raw
/// binding (open channel / load library / hand out the linked SDK).
pub trait BackendProvider: Send + Sync {
    fn bring_up(&self, class: BackendClass, uri: &str) -> ArgusResult<BackendBinding>;
}

/// Default provider: the compiled-in vendor paths. Each class errors with
/// `Unsupported` when its cargo feature is absent.
struct SdkProvider;

impl BackendProvider for SdkProvider {
    fn bring_up(&self, class: BackendClass, uri: &str) -> ArgusResult<BackendBinding> {
        match class {
            BackendClass::Cpu => host_sdk().map(|lib| BackendBinding::Host { class, lib }),
            BackendClass::Gpu => gpu_sdk().map(|lib| BackendBinding::Host { class, lib }),
            BackendClass::Npu0 | BackendClass::Npu1 => {
                let channel = npu_channel()?;
                let remote = channel.open(uri)?;
                Ok(BackendBinding::Remote {
                    class,
                    channel,
                    remote,
                })
            }
        }
    }
}

#[cfg(feature = "vendor-sdk")]
fn host_sdk() -> ArgusResult<Arc<dyn VendorLibrary>> {
    Ok(Arc::new(host_ffi::HostSdk::new()))
}

#[cfg(not(feature = "vendor-sdk"))]
fn host_sdk() -> ArgusResult<Arc<dyn VendorLibrary>> {
    Err(ArgusError::unsupported(
        "host vendor SDK not compiled in (enable the `vendor-sdk` feature)",
    ))
}

#[cfg(feature = "gpu-vendor")]
fn gpu_sdk() -> ArgusResult<Arc<dyn VendorLibrary>> {
    Ok(Arc::new(gpu::GpuSdk::load()?))
}

#[cfg(not(feature = "gpu-vendor"))]
fn gpu_sdk() -> ArgusResult<Arc<dyn VendorLibrary>> {
    Err(ArgusError::unsupported(
        "GPU vendor library not compiled in (enable the `gpu-vendor` feature)",
    ))
}

#[cfg(feature = "npu-transport")]
fn npu_channel() -> ArgusResult<Arc<dyn AcceleratorChannel>> {
    Ok(Arc::new(transport::FastChannel::new()))
}

#[cfg(not(feature = "npu-transport"))]
fn npu_channel() -> ArgusResult<Arc<dyn AcceleratorChannel>> {
    Err(ArgusError::unsupported(
        "NPU transport not compiled in (enable the `npu-transport` feature)",
    ))
}

static PROVIDER: RwLock<Option<Arc<dyn BackendProvider>>> = RwLock::new(None);

/// Install a process-wide backend provider, replacing the compiled-in SDK
/// paths. Intended for tests and for embedders bridging to their own
/// transport. Takes effect for backends not yet brought up.
pub fn install_provider(provider: Arc<dyn BackendProvider>) {
    *PROVIDER.write() = Some(provider);
}

/// The currently active provider.
pub(crate) fn provider() -> Arc<dyn BackendProvider> {
    if let Some(p) = PROVIDER.read().as_ref() {
        return Arc::clone(p);
    }
    Arc::new(SdkProvider)
}
