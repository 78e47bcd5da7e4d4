//! FastRPC-style remote-call transport to the NPU accelerators
//! (`npu-transport` feature). The transport library owns session routing
//! and buffer marshalling; this wrapper only shepherds argument blocks
//! through and tags transport failures with the right backend class.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};

use parking_lot::Mutex;

use crate::error::{ArgusError, ArgusResult};
use crate::types::BackendClass;

use super::AcceleratorChannel;

extern "C" {
    fn argusrpc_open(uri: *const c_char, out: *mut u64) -> c_int;
    fn argusrpc_close(handle: u64) -> c_int;
    fn argusrpc_invoke(handle: u64, method: u32, args: *mut u8, len: usize) -> c_int;
}

/// Domain encoded in a session URI (`dom=0` or `dom=1`).
fn class_of_uri(uri: &str) -> ArgusResult<BackendClass> {
    if uri.contains("dom=0") {
        Ok(BackendClass::Npu0)
    } else if uri.contains("dom=1") {
        Ok(BackendClass::Npu1)
    } else {
        Err(ArgusError::bad_args(format!("malformed session uri {uri:?}")))
    }
}

pub struct FastChannel {
    // Remote handle -> class, so invoke/close can tag their errors.
    routes: Mutex<HashMap<u64, BackendClass>>,
}

impl FastChannel {
    pub fn new() -> Self {
        FastChannel {
            routes: Mutex::new(HashMap::new()),
        }
    }

    fn class_of(&self, handle: u64) -> BackendClass {
        self.routes
            .lock()
            .get(&handle)
            .copied()
            .unwrap_or(BackendClass::Npu0)
    }
}

impl AcceleratorChannel for FastChannel {
    fn open(&self, uri: &str) -> ArgusResult<u64> {
        let class = class_of_uri(uri)?;
        let c_uri = CString::new(uri)
            .map_err(|_| ArgusError::bad_args("session uri contains a NUL byte"))?;
        let mut handle = 0u64;
        let code = unsafe { argusrpc_open(c_uri.as_ptr(), &mut handle) };
        if code != 0 {
            return Err(ArgusError::backend(class, code, "argusrpc_open failed"));
        }
        self.routes.lock().insert(handle, class);
        Ok(handle)
    }

    fn close(&self, handle: u64) -> ArgusResult<()> {
        let class = self.class_of(handle);
        let code = unsafe { argusrpc_close(handle) };
        self.routes.lock().remove(&handle);
        if code != 0 {
            return Err(ArgusError::backend(class, code, "argusrpc_close failed"));
        }
        Ok(())
    }

    fn invoke(&self, handle: u64, method: u32, args: &mut [u8]) -> ArgusResult<()> {
        let code = unsafe { argusrpc_invoke(handle, method, args.as_mut_ptr(), args.len()) };
        if code != 0 {
            return Err(ArgusError::backend(
                self.class_of(handle),
                code,
                format!("argusrpc_invoke({method:#x}) failed"),
            ));
        }
        Ok(())
    }
}
