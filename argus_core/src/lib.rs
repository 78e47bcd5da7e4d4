//! Argus core: backend sessions, shared-buffer registries, capability
//! tables, and the component state machine for heterogeneous vision
//! execution (CPU, GPU, and two remote NPU accelerators).
//!
//! The vision components themselves live in `argus_vision`; this crate
//! owns everything they share. Backends are reached through two seams —
//! the [`backend::VendorLibrary`] trait for host kernel libraries and the
//! [`backend::AcceleratorChannel`] trait for the remote-call transport —
//! so the whole stack runs against the in-process
//! [`backend::loopback`] fakes when no vendor hardware is present.

pub mod backend;
pub mod buffer;
pub mod capability;
pub mod component;
pub mod error;
pub mod registry;
pub mod session;
pub mod types;

pub use buffer::{ImageProps, SharedBuffer, TensorProps};
pub use component::{ComponentCore, ComponentState};
pub use error::{ArgusError, ArgusResult};
pub use session::BackendSession;
pub use types::{BackendClass, BufferRole, ImageFormat, TensorDtype};

// Unit tests that assert process-wide use counts or counter deltas
// serialize on this; cargo runs test functions concurrently.
#[cfg(test)]
pub(crate) mod testsync {
    pub static SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
}
