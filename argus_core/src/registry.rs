//! Per-backend shared-buffer registries.
//!
//! A backend cannot touch caller memory until the region is in its table:
//! host libraries pin the address range, remote backends additionally map
//! the DMA region into the accelerator first. Registration is keyed by the
//! region's host address. Re-registering the same address with identical
//! geometry is a no-op; with different geometry it is an error — silently
//! honoring the stale mapping hides caller bugs until the backend faults.
//!
//! Linear multi-plane images register each plane as its own range; UBWC
//! and bitstream layouts register one contiguous range; output images
//! register one range per batch element so the backend can retire them
//! independently.

use std::collections::BTreeMap;

use bytemuck::Zeroable;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::{wire, BackendBinding};
use crate::buffer::{BufferPayload, SharedBuffer};
use crate::error::{ArgusError, ArgusResult};
use crate::session;
use crate::types::{BackendClass, BufferRole};

/// One registered range, relative to the region base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubRange {
    offset: usize,
    size: usize,
}

#[derive(Debug, Clone)]
struct BufferRecord {
    role: BufferRole,
    dma_handle: u64,
    region_size: usize,
    offset: usize,
    payload_size: usize,
    batch: u32,
    subs: Vec<SubRange>,
}

impl BufferRecord {
    fn matches(&self, buf: &SharedBuffer, role: BufferRole) -> bool {
        self.role == role
            && self.dma_handle == buf.dma_handle
            && self.region_size == buf.region_size
            && self.offset == buf.offset
            && self.payload_size == buf.payload_size
            && self.batch == buf.batch()
    }
}

// Each map lock also serializes the multi-step backend sequence behind it,
// so two threads cannot interleave mmap/reg calls for the same class.
static MAPS: [Mutex<BTreeMap<usize, BufferRecord>>; BackendClass::COUNT] = [
    Mutex::new(BTreeMap::new()),
    Mutex::new(BTreeMap::new()),
    Mutex::new(BTreeMap::new()),
    Mutex::new(BTreeMap::new()),
];

/// Register `buf` with the backend of `class`. Requires an active session.
pub fn register(class: BackendClass, buf: &SharedBuffer, role: BufferRole) -> ArgusResult<()> {
    buf.validate()?;
    let binding = session::binding(class)?;
    let mut map = MAPS[class.index()].lock();
    if let Some(existing) = map.get(&buf.addr) {
        if existing.matches(buf, role) {
            debug!("{class}: buffer {:#x} already registered", buf.addr);
            return Ok(());
        }
        warn!(
            "{class}: buffer {:#x} re-registered with different geometry \
             (had {}B@+{} x{}, got {}B@+{} x{})",
            buf.addr,
            existing.payload_size,
            existing.offset,
            existing.batch,
            buf.payload_size,
            buf.offset,
            buf.batch()
        );
        return Err(ArgusError::invalid_buffer(format!(
            "buffer {:#x} is already registered with different geometry",
            buf.addr
        )));
    }

    let subs = plan_sub_ranges(buf, role);
    backend_register(class, &binding, buf, role, &subs)?;
    map.insert(
        buf.addr,
        BufferRecord {
            role,
            dma_handle: buf.dma_handle,
            region_size: buf.region_size,
            offset: buf.offset,
            payload_size: buf.payload_size,
            batch: buf.batch(),
            subs,
        },
    );
    debug!(
        "{class}: registered buffer {:#x} ({} ranges)",
        buf.addr,
        map.get(&buf.addr).map_or(0, |r| r.subs.len())
    );
    Ok(())
}

/// Remove `addr` from the backend's table. Unknown addresses are a no-op:
/// teardown paths deregister unconditionally.
pub fn deregister(class: BackendClass, addr: usize) -> ArgusResult<()> {
    // Slot lock before map lock, so the binding is resolved up front.
    let binding = session::binding(class).ok();
    let mut map = MAPS[class.index()].lock();
    let Some(record) = map.remove(&addr) else {
        debug!("{class}: deregister of unknown buffer {addr:#x}, ignoring");
        return Ok(());
    };
    match binding {
        // The map guard stays held across the backend sequence, like in
        // register: a concurrent register of the same address must not
        // map it while the unmap is still in flight.
        Some(binding) => backend_deregister(class, &binding, addr, &record),
        // Session already gone; its teardown cleared the backend table.
        None => Ok(()),
    }
}

/// Whether `addr` is currently in the table of `class`.
pub fn is_registered(class: BackendClass, addr: usize) -> bool {
    MAPS[class.index()].lock().contains_key(&addr)
}

/// Drop every record of `class`, deregistering backend-side. Called from
/// session teardown with the slot lock held, so it must not call back into
/// the session module.
pub(crate) fn clear_class(class: BackendClass, binding: &BackendBinding) {
    let drained: Vec<(usize, BufferRecord)> = {
        let mut map = MAPS[class.index()].lock();
        std::mem::take(&mut *map).into_iter().collect()
    };
    if drained.is_empty() {
        return;
    }
    warn!(
        "{class}: {} buffer(s) still registered at teardown",
        drained.len()
    );
    for (addr, record) in drained {
        if let Err(e) = backend_deregister(class, binding, addr, &record) {
            warn!("{class}: teardown deregister of {addr:#x} failed: {e}");
        }
    }
}

fn plan_sub_ranges(buf: &SharedBuffer, role: BufferRole) -> Vec<SubRange> {
    let props = match &buf.payload {
        BufferPayload::Image(p) => p,
        // Tensors and raw regions are one flat range.
        _ => {
            return vec![SubRange {
                offset: buf.offset,
                size: buf.payload_size,
            }]
        }
    };

    if props.format.is_ubwc() || props.format.is_bitstream() {
        // Meta and data tiles (or the bitstream ring) are one contiguous
        // allocation; the backend wants the whole thing.
        return vec![SubRange {
            offset: buf.offset,
            size: buf.payload_size,
        }];
    }

    let sub = buf.sub_size();
    let mut subs = Vec::new();
    if role == BufferRole::Input {
        // Linear inputs register per plane; the kernels address planes
        // independently.
        for i in 0..props.batch as usize {
            let base = buf.offset + i * sub;
            let mut plane_offset = 0usize;
            for p in 0..props.num_planes as usize {
                subs.push(SubRange {
                    offset: base + plane_offset,
                    size: props.plane_size[p] as usize,
                });
                plane_offset += props.plane_size[p] as usize;
            }
        }
    } else {
        // Outputs retire per batch element.
        for i in 0..props.batch as usize {
            subs.push(SubRange {
                offset: buf.offset + i * sub,
                size: sub,
            });
        }
    }
    subs
}

fn backend_register(
    class: BackendClass,
    binding: &BackendBinding,
    buf: &SharedBuffer,
    role: BufferRole,
    subs: &[SubRange],
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => {
            for (i, sub) in subs.iter().enumerate() {
                if let Err(e) = lib.register_buffer(role, buf.addr + sub.offset, sub.size) {
                    // Unwind ranges registered so far.
                    for done in &subs[..i] {
                        let _ = lib.deregister_buffer(buf.addr + done.offset);
                    }
                    return Err(e);
                }
            }
            Ok(())
        }
        BackendBinding::Remote {
            channel, remote, ..
        } => {
            let mut mmap = wire::MmapArgs::zeroed();
            mmap.fd = buf.dma_handle as i32;
            mmap.size = buf.region_size as u32;
            wire::invoke_block(
                channel.as_ref(),
                *remote,
                class,
                wire::METHOD_MMAP,
                &mut mmap,
                &[wire::STATUS_ALREADY],
            )?;
            for sub in subs {
                let mut reg = wire::RegBufArgs::zeroed();
                reg.role = role.wire_code();
                reg.fd = buf.dma_handle as i32;
                reg.size = sub.size as u32;
                reg.offset = sub.offset as u32;
                reg.batch = buf.batch();
                wire::invoke_block(
                    channel.as_ref(),
                    *remote,
                    class,
                    wire::METHOD_REG_BUF,
                    &mut reg,
                    &[],
                )?;
            }
            Ok(())
        }
    }
}

fn backend_deregister(
    class: BackendClass,
    binding: &BackendBinding,
    addr: usize,
    record: &BufferRecord,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => {
            let mut first_err = None;
            for sub in &record.subs {
                if let Err(e) = lib.deregister_buffer(addr + sub.offset) {
                    first_err.get_or_insert(e);
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        BackendBinding::Remote {
            channel, remote, ..
        } => {
            let mut first_err = None;
            for sub in &record.subs {
                let mut dereg = wire::DeregBufArgs::zeroed();
                dereg.fd = record.dma_handle as i32;
                dereg.size = sub.size as u32;
                dereg.offset = sub.offset as u32;
                dereg.batch = record.batch;
                if let Err(e) = wire::invoke_block(
                    channel.as_ref(),
                    *remote,
                    class,
                    wire::METHOD_DEREG_BUF,
                    &mut dereg,
                    &[],
                ) {
                    first_err.get_or_insert(e);
                }
            }
            let mut munmap = wire::MunmapArgs::zeroed();
            munmap.fd = record.dma_handle as i32;
            munmap.size = record.region_size as u32;
            if let Err(e) = wire::invoke_block(
                channel.as_ref(),
                *remote,
                class,
                wire::METHOD_MUNMAP,
                &mut munmap,
                &[],
            ) {
                first_err.get_or_insert(e);
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback;
    use crate::buffer::{packed_image_props, TensorProps};
    use crate::session::BackendSession;
    use crate::testsync;
    use crate::types::{ImageFormat, TensorDtype};

    fn nv12(addr: usize, batch: u32) -> SharedBuffer {
        let props = packed_image_props(ImageFormat::Nv12, 64, 64, batch).unwrap();
        let size = props.frame_size() * batch as usize;
        SharedBuffer::image(addr, 42, size, 0, props)
    }

    #[test]
    fn plane_ranges_for_linear_input() {
        let buf = nv12(0x10_0000, 2);
        let subs = plan_sub_ranges(&buf, BufferRole::Input);
        // 2 batch elements x 2 planes
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].offset, 0);
        assert_eq!(subs[0].size, 64 * 64);
        assert_eq!(subs[1].offset, 64 * 64);
        assert_eq!(subs[1].size, 64 * 32);
        assert_eq!(subs[2].offset, buf.sub_size());
    }

    #[test]
    fn batch_ranges_for_output() {
        let buf = nv12(0x10_0000, 3);
        let subs = plan_sub_ranges(&buf, BufferRole::Output);
        assert_eq!(subs.len(), 3);
        assert!(subs.iter().all(|s| s.size == buf.sub_size()));
    }

    #[test]
    fn ubwc_is_one_contiguous_range() {
        let mut props = packed_image_props(ImageFormat::Nv12, 64, 64, 1).unwrap();
        props.format = ImageFormat::Nv12Ubwc;
        let buf = SharedBuffer::image(0x10_0000, 42, props.frame_size(), 0, props);
        let subs = plan_sub_ranges(&buf, BufferRole::Input);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].size, buf.payload_size);
    }

    #[test]
    fn register_requires_session_and_reaches_backend() {
        let _serial = testsync::SERIAL.lock();
        loopback::install();
        let buf = nv12(0x20_0000, 1);

        assert!(register(BackendClass::Npu0, &buf, BufferRole::Input).is_err());

        let session = BackendSession::acquire(BackendClass::Npu0).unwrap();
        let before = loopback::stats(BackendClass::Npu0);
        register(BackendClass::Npu0, &buf, BufferRole::Input).unwrap();
        let after = loopback::stats(BackendClass::Npu0);
        // One mmap plus one reg per plane.
        assert_eq!(after.register - before.register, 3);
        assert!(is_registered(BackendClass::Npu0, buf.addr));

        deregister(BackendClass::Npu0, buf.addr).unwrap();
        assert!(!is_registered(BackendClass::Npu0, buf.addr));

        // Deregistered addresses can be registered again.
        register(BackendClass::Npu0, &buf, BufferRole::Input).unwrap();
        assert!(is_registered(BackendClass::Npu0, buf.addr));
        deregister(BackendClass::Npu0, buf.addr).unwrap();
        session.shutdown().unwrap();
    }

    #[test]
    fn identical_reregistration_is_a_noop() {
        let _serial = testsync::SERIAL.lock();
        loopback::install();
        let session = BackendSession::acquire(BackendClass::Cpu).unwrap();
        let buf = nv12(0x30_0000, 1);
        register(BackendClass::Cpu, &buf, BufferRole::Input).unwrap();
        let before = loopback::stats(BackendClass::Cpu);
        register(BackendClass::Cpu, &buf, BufferRole::Input).unwrap();
        let after = loopback::stats(BackendClass::Cpu);
        assert_eq!(after.register, before.register);
        deregister(BackendClass::Cpu, buf.addr).unwrap();
        session.shutdown().unwrap();
    }

    #[test]
    fn conflicting_reregistration_is_rejected() {
        let _serial = testsync::SERIAL.lock();
        loopback::install();
        let session = BackendSession::acquire(BackendClass::Cpu).unwrap();
        let buf = nv12(0x40_0000, 1);
        register(BackendClass::Cpu, &buf, BufferRole::Input).unwrap();

        let conflicting = nv12(0x40_0000, 2);
        let err = register(BackendClass::Cpu, &conflicting, BufferRole::Input).unwrap_err();
        assert!(matches!(err, ArgusError::InvalidBuffer(_)));
        // Original record survives.
        assert!(is_registered(BackendClass::Cpu, buf.addr));

        deregister(BackendClass::Cpu, buf.addr).unwrap();
        session.shutdown().unwrap();
    }

    #[test]
    fn deregister_of_unknown_buffer_is_tolerated() {
        assert!(deregister(BackendClass::Gpu, 0xdead_0000).is_ok());
    }

    mod slow_unmap {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        use crate::backend::loopback::LoopbackLibrary;
        use crate::backend::params::{
            BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams,
            FlowJob, FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob,
            StereoParams,
        };
        use crate::backend::{
            BackendBinding, BackendProvider, KernelHandle, VendorLibrary,
        };
        use crate::error::ArgusResult;
        use crate::types::{BackendClass, BufferRole};

        /// Loopback wrapper whose unmap stalls, to expose register calls
        /// that run while a deregister of the same class is mid-flight.
        pub(super) struct SlowUnmapLib {
            inner: LoopbackLibrary,
            pub(super) unmap_in_flight: AtomicBool,
            pub(super) overlapped: AtomicBool,
        }

        impl SlowUnmapLib {
            pub(super) fn new(class: BackendClass) -> Self {
                SlowUnmapLib {
                    inner: LoopbackLibrary::new(class),
                    unmap_in_flight: AtomicBool::new(false),
                    overlapped: AtomicBool::new(false),
                }
            }
        }

        impl VendorLibrary for SlowUnmapLib {
            fn init(&self) -> ArgusResult<()> {
                self.inner.init()
            }
            fn deinit(&self) -> ArgusResult<()> {
                self.inner.deinit()
            }
            fn register_buffer(
                &self,
                role: BufferRole,
                addr: usize,
                size: usize,
            ) -> ArgusResult<()> {
                if self.unmap_in_flight.load(Ordering::SeqCst) {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
                self.inner.register_buffer(role, addr, size)
            }
            fn deregister_buffer(&self, addr: usize) -> ArgusResult<()> {
                self.unmap_in_flight.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                let result = self.inner.deregister_buffer(addr);
                self.unmap_in_flight.store(false, Ordering::SeqCst);
                result
            }
            fn remap_create_map(&self, params: &RemapMapParams) -> ArgusResult<KernelHandle> {
                self.inner.remap_create_map(params)
            }
            fn remap_run(&self, map: KernelHandle, job: &RemapJob) -> ArgusResult<()> {
                self.inner.remap_run(map, job)
            }
            fn remap_destroy_map(&self, map: KernelHandle) -> ArgusResult<()> {
                self.inner.remap_destroy_map(map)
            }
            fn flow_create(&self, params: &FlowParams) -> ArgusResult<KernelHandle> {
                self.inner.flow_create(params)
            }
            fn flow_set_filter(
                &self,
                session: KernelHandle,
                filter: &FlowFilterParams,
            ) -> ArgusResult<()> {
                self.inner.flow_set_filter(session, filter)
            }
            fn flow_run(&self, session: KernelHandle, job: &FlowJob) -> ArgusResult<()> {
                self.inner.flow_run(session, job)
            }
            fn flow_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
                self.inner.flow_destroy(session)
            }
            fn stereo_create(&self, params: &StereoParams) -> ArgusResult<KernelHandle> {
                self.inner.stereo_create(params)
            }
            fn stereo_run(&self, session: KernelHandle, job: &StereoJob) -> ArgusResult<()> {
                self.inner.stereo_run(session, job)
            }
            fn stereo_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
                self.inner.stereo_destroy(session)
            }
            fn pillar_create(&self, params: &PillarParams) -> ArgusResult<KernelHandle> {
                self.inner.pillar_create(params)
            }
            fn pillar_run(&self, encoder: KernelHandle, job: &PillarJob) -> ArgusResult<()> {
                self.inner.pillar_run(encoder, job)
            }
            fn pillar_destroy(&self, encoder: KernelHandle) -> ArgusResult<()> {
                self.inner.pillar_destroy(encoder)
            }
            fn bbox_create(&self, params: &BoxParams) -> ArgusResult<KernelHandle> {
                self.inner.bbox_create(params)
            }
            fn bbox_set_filter(
                &self,
                post: KernelHandle,
                filter: &BoxFilterParams,
            ) -> ArgusResult<()> {
                self.inner.bbox_set_filter(post, filter)
            }
            fn bbox_run(&self, post: KernelHandle, job: &BoxJob) -> ArgusResult<u32> {
                self.inner.bbox_run(post, job)
            }
            fn bbox_destroy(&self, post: KernelHandle) -> ArgusResult<()> {
                self.inner.bbox_destroy(post)
            }
            fn decode_create(&self, params: &DecodeParams) -> ArgusResult<KernelHandle> {
                self.inner.decode_create(params)
            }
            fn decode_run(&self, stream: KernelHandle, job: &DecodeJob) -> ArgusResult<()> {
                self.inner.decode_run(stream, job)
            }
            fn decode_flush(&self, stream: KernelHandle) -> ArgusResult<()> {
                self.inner.decode_flush(stream)
            }
            fn decode_destroy(&self, stream: KernelHandle) -> ArgusResult<()> {
                self.inner.decode_destroy(stream)
            }
        }

        pub(super) struct SlowProvider(pub(super) Arc<SlowUnmapLib>);

        impl BackendProvider for SlowProvider {
            fn bring_up(&self, class: BackendClass, _uri: &str) -> ArgusResult<BackendBinding> {
                Ok(BackendBinding::Host {
                    class,
                    lib: self.0.clone(),
                })
            }
        }
    }

    #[test]
    fn deregister_blocks_concurrent_register_of_same_address() {
        use std::sync::atomic::Ordering;
        use std::sync::Arc;

        let _serial = testsync::SERIAL.lock();
        let lib = Arc::new(slow_unmap::SlowUnmapLib::new(BackendClass::Gpu));
        crate::backend::install_provider(Arc::new(slow_unmap::SlowProvider(lib.clone())));

        let session = BackendSession::acquire(BackendClass::Gpu).unwrap();
        let buf = nv12(0x60_0000, 1);
        register(BackendClass::Gpu, &buf, BufferRole::Input).unwrap();

        let addr = buf.addr;
        let deregistering =
            std::thread::spawn(move || deregister(BackendClass::Gpu, addr).unwrap());
        // Wait until the unmap is actually in flight, then race a register
        // of the same address: it must block until the unmap completes.
        while !lib.unmap_in_flight.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        register(BackendClass::Gpu, &buf, BufferRole::Input).unwrap();
        deregistering.join().unwrap();

        assert!(
            !lib.overlapped.load(Ordering::SeqCst),
            "backend mapping ran while the unmap of the same address was in flight"
        );
        assert!(is_registered(BackendClass::Gpu, buf.addr));

        deregister(BackendClass::Gpu, buf.addr).unwrap();
        session.shutdown().unwrap();
        loopback::install();
    }

    #[test]
    fn teardown_clears_leftover_registrations() {
        let _serial = testsync::SERIAL.lock();
        loopback::install();
        let session = BackendSession::acquire(BackendClass::Npu1).unwrap();
        let props = TensorProps::new(TensorDtype::F32, &[256]).unwrap();
        let buf = SharedBuffer::tensor(0x50_0000, 9, props.byte_size(), props);
        register(BackendClass::Npu1, &buf, BufferRole::InOut).unwrap();

        let before = loopback::stats(BackendClass::Npu1);
        session.shutdown().unwrap();
        let after = loopback::stats(BackendClass::Npu1);
        assert!(!is_registered(BackendClass::Npu1, buf.addr));
        // Dereg of the range plus the munmap.
        assert_eq!(after.deregister - before.deregister, 2);
    }
}
