//! Buffer bookkeeping shared by all components.

use log::warn;

use argus_core::buffer::SharedBuffer;
use argus_core::error::ArgusResult;
use argus_core::registry;
use argus_core::types::{BackendClass, BufferRole};

/// Addresses a component has registered, so deinit can deregister exactly
/// what this instance added and nothing another component still uses.
#[derive(Debug, Default)]
pub(crate) struct BufferTracker {
    addrs: Vec<usize>,
}

impl BufferTracker {
    /// Register `buf` if this instance has not already; identical
    /// re-registration inside the registry is a no-op either way.
    pub(crate) fn ensure_registered(
        &mut self,
        class: BackendClass,
        buf: &SharedBuffer,
        role: BufferRole,
    ) -> ArgusResult<()> {
        registry::register(class, buf, role)?;
        if !self.addrs.contains(&buf.addr) {
            self.addrs.push(buf.addr);
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, class: BackendClass, addr: usize) -> ArgusResult<()> {
        registry::deregister(class, addr)?;
        self.addrs.retain(|&a| a != addr);
        Ok(())
    }

    /// Teardown path: deregister everything, log failures, never bail.
    pub(crate) fn deregister_all(&mut self, class: BackendClass) {
        for addr in self.addrs.drain(..) {
            if let Err(e) = registry::deregister(class, addr) {
                warn!("{class}: deregister of {addr:#x} at deinit failed: {e}");
            }
        }
    }
}
