//! Per-backend session lifecycle.
//!
//! Each backend class has one process-wide slot holding its binding and a
//! use count. [`BackendSession::acquire`] brings the backend up on the
//! 0→1 transition and every later acquire is a cheap increment; dropping
//! the last session tears the backend down again, deregistering any
//! buffers still in its table first. Classes never block each other: each
//! slot has its own lock.

use bytemuck::Zeroable;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::backend::{self, wire, BackendBinding};
use crate::error::{ArgusError, ArgusResult};
use crate::registry;
use crate::types::BackendClass;

/// Overrides the client id baked into NPU session URIs.
pub const SESSION_ID_ENV: &str = "ARGUS_NPU_SESSION_ID";
const SESSION_ID_MAX: u32 = 12;
const SESSION_ID_DEFAULT: u32 = 1;

struct Slot {
    binding: Option<BackendBinding>,
    use_count: u32,
}

impl Slot {
    const fn empty() -> Self {
        Slot {
            binding: None,
            use_count: 0,
        }
    }
}

static SLOTS: [Mutex<Slot>; BackendClass::COUNT] = [
    Mutex::new(Slot::empty()),
    Mutex::new(Slot::empty()),
    Mutex::new(Slot::empty()),
    Mutex::new(Slot::empty()),
];

// The accelerators execute one request at a time; concurrent invokes would
// interleave on the wire. Host backends schedule internally.
static EXEC_LOCKS: [Mutex<()>; BackendClass::COUNT] = [
    Mutex::new(()),
    Mutex::new(()),
    Mutex::new(()),
    Mutex::new(()),
];

/// Owning handle on one backend class. Construction acquires, drop (or
/// [`shutdown`](Self::shutdown), which surfaces teardown errors) releases.
#[derive(Debug)]
pub struct BackendSession {
    class: BackendClass,
    released: bool,
}

impl BackendSession {
    pub fn acquire(class: BackendClass) -> ArgusResult<Self> {
        let mut slot = SLOTS[class.index()].lock();
        if slot.use_count == 0 {
            let uri = session_uri(class);
            let binding = backend::provider().bring_up(class, &uri)?;
            if let Err(e) = bring_up_handshake(&binding) {
                abandon(&binding);
                return Err(e);
            }
            slot.binding = Some(binding);
            info!("{class}: backend brought up");
        }
        slot.use_count += 1;
        debug!("{class}: acquired, use_count={}", slot.use_count);
        Ok(BackendSession {
            class,
            released: false,
        })
    }

    pub fn class(&self) -> BackendClass {
        self.class
    }

    /// Release with teardown errors surfaced, instead of logged by drop.
    pub fn shutdown(mut self) -> ArgusResult<()> {
        self.released = true;
        release(self.class)
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release(self.class) {
                warn!("{}: release on drop failed: {e}", self.class);
            }
        }
    }
}

/// Binding of an active session. `BadState` when no session holds `class`.
pub fn binding(class: BackendClass) -> ArgusResult<BackendBinding> {
    SLOTS[class.index()]
        .lock()
        .binding
        .clone()
        .ok_or_else(|| ArgusError::bad_state(format!("{class}: no active session")))
}

/// Number of live sessions on `class`.
pub fn use_count(class: BackendClass) -> u32 {
    SLOTS[class.index()].lock().use_count
}

/// Serialization guard for execute calls. Remote classes are serialized;
/// host classes return `None` and run concurrently.
pub fn exec_guard(class: BackendClass) -> Option<MutexGuard<'static, ()>> {
    class.is_remote().then(|| EXEC_LOCKS[class.index()].lock())
}

fn release(class: BackendClass) -> ArgusResult<()> {
    let mut slot = SLOTS[class.index()].lock();
    if slot.use_count == 0 {
        return Err(ArgusError::bad_state(format!(
            "{class}: release without a matching acquire"
        )));
    }
    slot.use_count -= 1;
    debug!("{class}: released, use_count={}", slot.use_count);
    if slot.use_count > 0 {
        return Ok(());
    }
    let binding = slot.binding.take().ok_or_else(|| {
        ArgusError::bad_state(format!("{class}: session slot lost its binding"))
    })?;
    registry::clear_class(class, &binding);
    let result = tear_down(class, &binding);
    info!("{class}: backend torn down");
    result
}

fn bring_up_handshake(binding: &BackendBinding) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.init(),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut init = wire::InitArgs::zeroed();
            wire::invoke_block(
                channel.as_ref(),
                *remote,
                *class,
                wire::METHOD_INIT,
                &mut init,
                &[],
            )?;
            let mut version = wire::VersionArgs::zeroed();
            wire::invoke_block(
                channel.as_ref(),
                *remote,
                *class,
                wire::METHOD_VERSION,
                &mut version,
                &[],
            )?;
            info!("{class}: accelerator reports version {}", version.as_str());
            Ok(())
        }
    }
}

// Bring-up handshake failed after the binding was constructed: give the
// transport back its handle, keep the original error.
fn abandon(binding: &BackendBinding) {
    if let BackendBinding::Remote {
        class,
        channel,
        remote,
    } = binding
    {
        if let Err(e) = channel.close(*remote) {
            warn!("{class}: closing handle after failed handshake: {e}");
        }
    }
}

fn tear_down(class: BackendClass, binding: &BackendBinding) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.deinit(),
        BackendBinding::Remote {
            channel, remote, ..
        } => {
            let mut args = wire::InitArgs::zeroed();
            let deinit = wire::invoke_block(
                channel.as_ref(),
                *remote,
                class,
                wire::METHOD_DEINIT,
                &mut args,
                &[],
            );
            // Close even when deinit failed; report the first error.
            let close = channel.close(*remote);
            deinit.and(close)
        }
    }
}

fn session_uri(class: BackendClass) -> String {
    match class {
        BackendClass::Cpu | BackendClass::Gpu => format!("argus://host?class={class}"),
        BackendClass::Npu0 => remote_uri(0),
        BackendClass::Npu1 => remote_uri(1),
    }
}

fn remote_uri(domain: u32) -> String {
    format!("argus://npu?dom={domain}&session={}", npu_session_id())
}

/// Client id for NPU URIs: `ARGUS_NPU_SESSION_ID` when it parses and is in
/// range, otherwise 1.
fn npu_session_id() -> u32 {
    match std::env::var(SESSION_ID_ENV) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(id) if id <= SESSION_ID_MAX => id,
            _ => {
                warn!(
                    "ignoring {SESSION_ID_ENV}={raw:?}, using client id {SESSION_ID_DEFAULT}"
                );
                SESSION_ID_DEFAULT
            }
        },
        Err(_) => SESSION_ID_DEFAULT,
    }
}
