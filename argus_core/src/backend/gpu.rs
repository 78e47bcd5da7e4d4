//! Dlopened GPU vendor library (`gpu-vendor` feature).
//!
//! The GPU build of viskit ships as a standalone shared object rather than
//! a link-time dependency. Symbols are resolved once at load; the
//! [`libloading::Library`] is kept alive for as long as any resolved
//! pointer may be called.

use std::os::raw::c_void;

use libloading::Library;
use log::info;

use crate::error::{ArgusError, ArgusResult};
use crate::types::{BackendClass, BufferRole};

use super::abi::{
    self, VkBoxDesc, VkBoxFilter, VkFlowDesc, VkFlowFilter, VkImage, VkPillarDesc, VkRemapDesc,
    VkRoi, VkStereoDesc,
};
use super::params::{
    BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams, FlowJob,
    FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob, StereoParams,
};
use super::{KernelHandle, VendorLibrary};

const DEFAULT_LIBRARY: &str = "libviskit_gpu.so";
const LIBRARY_ENV: &str = "ARGUS_GPU_LIBRARY";

struct GpuFns {
    init: abi::InitFn,
    deinit: abi::DeinitFn,
    reg_buf: abi::RegBufFn,
    dereg_buf: abi::DeregBufFn,
    remap_create: abi::RemapCreateFn,
    remap_run: abi::RemapRunFn,
    remap_destroy: abi::HandleFn,
    flow_create: abi::FlowCreateFn,
    flow_set_filter: abi::FlowFilterFn,
    flow_run: abi::FlowRunFn,
    flow_destroy: abi::HandleFn,
    stereo_create: abi::StereoCreateFn,
    stereo_run: abi::StereoRunFn,
    stereo_destroy: abi::HandleFn,
    pillar_create: abi::PillarCreateFn,
    pillar_run: abi::PillarRunFn,
    pillar_destroy: abi::HandleFn,
    bbox_create: abi::BoxCreateFn,
    bbox_set_filter: abi::BoxFilterFn,
    bbox_run: abi::BoxRunFn,
    bbox_destroy: abi::HandleFn,
}

/// The dlopened GPU build of viskit.
pub struct GpuSdk {
    // Field order matters: `fns` holds raw pointers into `_lib`.
    fns: GpuFns,
    _lib: Library,
}

fn rc(code: i32, call: &str) -> ArgusResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ArgusError::backend(
            BackendClass::Gpu,
            code,
            format!("{call} failed"),
        ))
    }
}

fn as_ptr(handle: KernelHandle) -> *mut c_void {
    handle.0 as *mut c_void
}

impl GpuSdk {
    /// Load the GPU library and resolve its full symbol table. Fails with
    /// `Unsupported` when the library or a symbol is missing, so a box
    /// without the GPU stack degrades cleanly.
    pub fn load() -> ArgusResult<Self> {
        let path = std::env::var(LIBRARY_ENV).unwrap_or_else(|_| DEFAULT_LIBRARY.to_owned());
        // SAFETY: the library is a vendor kernel table with no
        // initialization side effects beyond its constructors.
        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            ArgusError::unsupported(format!("cannot load GPU library {path:?}: {e}"))
        })?;

        unsafe fn sym<T: Copy>(lib: &Library, name: &[u8]) -> ArgusResult<T> {
            lib.get::<T>(name)
                .map(|s| *s)
                .map_err(|e| {
                    ArgusError::unsupported(format!(
                        "GPU library lacks {}: {e}",
                        String::from_utf8_lossy(&name[..name.len() - 1])
                    ))
                })
        }

        let fns = unsafe {
            GpuFns {
                init: sym(&lib, b"viskit_gpu_init\0")?,
                deinit: sym(&lib, b"viskit_gpu_deinit\0")?,
                reg_buf: sym(&lib, b"viskit_gpu_reg_buf\0")?,
                dereg_buf: sym(&lib, b"viskit_gpu_dereg_buf\0")?,
                remap_create: sym(&lib, b"viskit_gpu_remap_create\0")?,
                remap_run: sym(&lib, b"viskit_gpu_remap_run\0")?,
                remap_destroy: sym(&lib, b"viskit_gpu_remap_destroy\0")?,
                flow_create: sym(&lib, b"viskit_gpu_flow_create\0")?,
                flow_set_filter: sym(&lib, b"viskit_gpu_flow_set_filter\0")?,
                flow_run: sym(&lib, b"viskit_gpu_flow_run\0")?,
                flow_destroy: sym(&lib, b"viskit_gpu_flow_destroy\0")?,
                stereo_create: sym(&lib, b"viskit_gpu_stereo_create\0")?,
                stereo_run: sym(&lib, b"viskit_gpu_stereo_run\0")?,
                stereo_destroy: sym(&lib, b"viskit_gpu_stereo_destroy\0")?,
                pillar_create: sym(&lib, b"viskit_gpu_pillar_create\0")?,
                pillar_run: sym(&lib, b"viskit_gpu_pillar_run\0")?,
                pillar_destroy: sym(&lib, b"viskit_gpu_pillar_destroy\0")?,
                bbox_create: sym(&lib, b"viskit_gpu_bbox_create\0")?,
                bbox_set_filter: sym(&lib, b"viskit_gpu_bbox_set_filter\0")?,
                bbox_run: sym(&lib, b"viskit_gpu_bbox_run\0")?,
                bbox_destroy: sym(&lib, b"viskit_gpu_bbox_destroy\0")?,
            }
        };

        info!("loaded GPU vendor library from {path}");
        Ok(GpuSdk { fns, _lib: lib })
    }
}

impl VendorLibrary for GpuSdk {
    fn init(&self) -> ArgusResult<()> {
        rc(unsafe { (self.fns.init)() }, "viskit_gpu_init")
    }

    fn deinit(&self) -> ArgusResult<()> {
        rc(unsafe { (self.fns.deinit)() }, "viskit_gpu_deinit")
    }

    fn register_buffer(&self, role: BufferRole, addr: usize, size: usize) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.reg_buf)(role.wire_code() as i32, addr as *mut c_void, size) },
            "viskit_gpu_reg_buf",
        )
    }

    fn deregister_buffer(&self, addr: usize) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.dereg_buf)(addr as *mut c_void) },
            "viskit_gpu_dereg_buf",
        )
    }

    fn remap_create_map(&self, params: &RemapMapParams) -> ArgusResult<KernelHandle> {
        let desc = VkRemapDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { (self.fns.remap_create)(&desc, &mut out) },
            "viskit_gpu_remap_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn remap_run(&self, map: KernelHandle, job: &RemapJob) -> ArgusResult<()> {
        let src = VkImage::from(&job.src);
        let dst = VkImage::from(&job.dst);
        let roi = VkRoi::from(&job.roi);
        let normalize = job
            .normalize
            .as_ref()
            .map_or(std::ptr::null(), |n| n.as_ptr());
        rc(
            unsafe {
                (self.fns.remap_run)(as_ptr(map), &src, &dst, &roi, job.roi_scale, normalize)
            },
            "viskit_gpu_remap_run",
        )
    }

    fn remap_destroy_map(&self, map: KernelHandle) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.remap_destroy)(as_ptr(map)) },
            "viskit_gpu_remap_destroy",
        )
    }

    fn flow_create(&self, params: &FlowParams) -> ArgusResult<KernelHandle> {
        let desc = VkFlowDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { (self.fns.flow_create)(&desc, &mut out) },
            "viskit_gpu_flow_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn flow_set_filter(&self, session: KernelHandle, filter: &FlowFilterParams) -> ArgusResult<()> {
        let filter = VkFlowFilter::from(filter);
        rc(
            unsafe { (self.fns.flow_set_filter)(as_ptr(session), &filter) },
            "viskit_gpu_flow_set_filter",
        )
    }

    fn flow_run(&self, session: KernelHandle, job: &FlowJob) -> ArgusResult<()> {
        let current = VkImage::from(&job.current);
        let reference = VkImage::from(&job.reference);
        rc(
            unsafe {
                (self.fns.flow_run)(
                    as_ptr(session),
                    &current,
                    &reference,
                    job.motion.addr as *mut c_void,
                    job.motion.bytes,
                    job.confidence.addr as *mut c_void,
                    job.confidence.bytes,
                )
            },
            "viskit_gpu_flow_run",
        )
    }

    fn flow_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.flow_destroy)(as_ptr(session)) },
            "viskit_gpu_flow_destroy",
        )
    }

    fn stereo_create(&self, params: &StereoParams) -> ArgusResult<KernelHandle> {
        let desc = VkStereoDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { (self.fns.stereo_create)(&desc, &mut out) },
            "viskit_gpu_stereo_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn stereo_run(&self, session: KernelHandle, job: &StereoJob) -> ArgusResult<()> {
        let left = VkImage::from(&job.left);
        let right = VkImage::from(&job.right);
        rc(
            unsafe {
                (self.fns.stereo_run)(
                    as_ptr(session),
                    &left,
                    &right,
                    job.disparity.addr as *mut c_void,
                    job.disparity.bytes,
                    job.confidence.addr as *mut c_void,
                    job.confidence.bytes,
                )
            },
            "viskit_gpu_stereo_run",
        )
    }

    fn stereo_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.stereo_destroy)(as_ptr(session)) },
            "viskit_gpu_stereo_destroy",
        )
    }

    fn pillar_create(&self, params: &PillarParams) -> ArgusResult<KernelHandle> {
        let desc = VkPillarDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { (self.fns.pillar_create)(&desc, &mut out) },
            "viskit_gpu_pillar_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn pillar_run(&self, encoder: KernelHandle, job: &PillarJob) -> ArgusResult<()> {
        rc(
            unsafe {
                (self.fns.pillar_run)(
                    as_ptr(encoder),
                    job.points.addr as *const c_void,
                    job.num_points,
                    job.pillars.addr as *mut c_void,
                    job.features.addr as *mut c_void,
                )
            },
            "viskit_gpu_pillar_run",
        )
    }

    fn pillar_destroy(&self, encoder: KernelHandle) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.pillar_destroy)(as_ptr(encoder)) },
            "viskit_gpu_pillar_destroy",
        )
    }

    fn bbox_create(&self, params: &BoxParams) -> ArgusResult<KernelHandle> {
        let desc = VkBoxDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { (self.fns.bbox_create)(&desc, &mut out) },
            "viskit_gpu_bbox_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn bbox_set_filter(&self, post: KernelHandle, filter: &BoxFilterParams) -> ArgusResult<()> {
        let filter = VkBoxFilter::from(filter);
        rc(
            unsafe { (self.fns.bbox_set_filter)(as_ptr(post), &filter) },
            "viskit_gpu_bbox_set_filter",
        )
    }

    fn bbox_run(&self, post: KernelHandle, job: &BoxJob) -> ArgusResult<u32> {
        let heads = [
            job.heatmap.addr as *const c_void,
            job.xy.addr as *const c_void,
            job.z.addr as *const c_void,
            job.size.addr as *const c_void,
            job.theta.addr as *const c_void,
        ];
        let mut detections = 0u32;
        rc(
            unsafe {
                (self.fns.bbox_run)(
                    as_ptr(post),
                    heads.as_ptr(),
                    heads.len() as u32,
                    job.points.addr as *const c_void,
                    job.num_points,
                    job.boxes.addr as *mut c_void,
                    job.labels.addr as *mut c_void,
                    job.scores.addr as *mut c_void,
                    job.metadata.addr as *mut c_void,
                    &mut detections,
                )
            },
            "viskit_gpu_bbox_run",
        )?;
        Ok(detections)
    }

    fn bbox_destroy(&self, post: KernelHandle) -> ArgusResult<()> {
        rc(
            unsafe { (self.fns.bbox_destroy)(as_ptr(post)) },
            "viskit_gpu_bbox_destroy",
        )
    }

    fn decode_create(&self, _params: &DecodeParams) -> ArgusResult<KernelHandle> {
        Err(ArgusError::unsupported("video decode is CPU-only"))
    }

    fn decode_run(&self, _stream: KernelHandle, _job: &DecodeJob) -> ArgusResult<()> {
        Err(ArgusError::unsupported("video decode is CPU-only"))
    }

    fn decode_flush(&self, _stream: KernelHandle) -> ArgusResult<()> {
        Err(ArgusError::unsupported("video decode is CPU-only"))
    }

    fn decode_destroy(&self, _stream: KernelHandle) -> ArgusResult<()> {
        Err(ArgusError::unsupported("video decode is CPU-only"))
    }
}
