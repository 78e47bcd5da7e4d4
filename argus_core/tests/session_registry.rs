//! Session sharing and registry teardown, exercised through the loopback
//! backend the way two components on one accelerator would.

use std::sync::{Mutex, MutexGuard};

use argus_core::backend::loopback;
use argus_core::buffer::TensorProps;
use argus_core::session::{self, BackendSession};
use argus_core::types::{BackendClass, BufferRole, TensorDtype};
use argus_core::{registry, ArgusError, SharedBuffer};

// These tests assert process-wide counter deltas; run them one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn tensor_buf(addr: usize) -> SharedBuffer {
    let props = TensorProps::new(TensorDtype::F32, &[1024]).unwrap();
    SharedBuffer::tensor(addr, 90, props.byte_size(), props)
}

#[test]
fn shared_backend_torn_down_once() {
    let _serial = serial();
    loopback::install();
    let class = BackendClass::Npu1;
    let before = loopback::stats(class);

    let first = BackendSession::acquire(class).unwrap();
    let second = BackendSession::acquire(class).unwrap();
    assert_eq!(session::use_count(class), 2);
    // One bring-up for both holders.
    assert_eq!(loopback::stats(class).opens - before.opens, 1);
    assert_eq!(loopback::stats(class).init - before.init, 1);

    let buf = tensor_buf(0xa00_0000);
    registry::register(class, &buf, BufferRole::Input).unwrap();
    assert!(registry::is_registered(class, buf.addr));
    // Remote tensor mapping is one mmap plus one register call.
    assert_eq!(loopback::stats(class).register - before.register, 2);

    first.shutdown().unwrap();
    assert_eq!(session::use_count(class), 1);
    assert!(registry::is_registered(class, buf.addr));
    assert_eq!(loopback::stats(class).deinit - before.deinit, 0);

    second.shutdown().unwrap();
    assert_eq!(session::use_count(class), 0);
    assert!(!registry::is_registered(class, buf.addr));
    let after = loopback::stats(class);
    assert_eq!(after.deinit - before.deinit, 1);
    assert_eq!(after.closes - before.closes, 1);
    assert_eq!(after.deregister - before.deregister, 2);

    let err = session::binding(class).expect_err("binding after last release");
    assert!(matches!(err, ArgusError::BadState(_)));
}

#[test]
fn drop_releases_session() {
    let _serial = serial();
    loopback::install();
    let class = BackendClass::Gpu;

    let held = BackendSession::acquire(class).unwrap();
    assert_eq!(session::use_count(class), 1);
    drop(held);
    assert_eq!(session::use_count(class), 0);
}

#[test]
fn register_without_session_is_rejected() {
    let _serial = serial();
    loopback::install();

    let buf = tensor_buf(0xa10_0000);
    let err = registry::register(BackendClass::Npu0, &buf, BufferRole::Input)
        .expect_err("no session holds npu0");
    assert!(matches!(err, ArgusError::BadState(_)));
}
