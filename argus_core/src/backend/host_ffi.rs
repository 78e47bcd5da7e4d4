//! Statically linked host vendor SDK (`vendor-sdk` feature). Links the
//! CPU build of libviskit and adapts its return-code ABI onto
//! [`VendorLibrary`].

use std::os::raw::{c_int, c_void};

use crate::error::{ArgusError, ArgusResult};
use crate::types::{BackendClass, BufferRole};

use super::abi::{
    VkBoxDesc, VkBoxFilter, VkDecodeDesc, VkFlowDesc, VkFlowFilter, VkImage, VkPillarDesc,
    VkRemapDesc, VkRoi, VkStereoDesc,
};
use super::params::{
    BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams, FlowJob,
    FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob, StereoParams,
};
use super::{KernelHandle, VendorLibrary};

extern "C" {
    fn viskit_init() -> c_int;
    fn viskit_deinit() -> c_int;
    fn viskit_reg_buf(role: c_int, addr: *mut c_void, size: usize) -> c_int;
    fn viskit_dereg_buf(addr: *mut c_void) -> c_int;

    fn viskit_remap_create(desc: *const VkRemapDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_remap_run(
        map: *mut c_void,
        src: *const VkImage,
        dst: *const VkImage,
        roi: *const VkRoi,
        roi_scale: f32,
        normalize: *const f32,
    ) -> c_int;
    fn viskit_remap_destroy(map: *mut c_void) -> c_int;

    fn viskit_flow_create(desc: *const VkFlowDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_flow_set_filter(session: *mut c_void, filter: *const VkFlowFilter) -> c_int;
    fn viskit_flow_run(
        session: *mut c_void,
        current: *const VkImage,
        reference: *const VkImage,
        motion: *mut c_void,
        motion_bytes: usize,
        confidence: *mut c_void,
        confidence_bytes: usize,
    ) -> c_int;
    fn viskit_flow_destroy(session: *mut c_void) -> c_int;

    fn viskit_stereo_create(desc: *const VkStereoDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_stereo_run(
        session: *mut c_void,
        left: *const VkImage,
        right: *const VkImage,
        disparity: *mut c_void,
        disparity_bytes: usize,
        confidence: *mut c_void,
        confidence_bytes: usize,
    ) -> c_int;
    fn viskit_stereo_destroy(session: *mut c_void) -> c_int;

    fn viskit_pillar_create(desc: *const VkPillarDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_pillar_run(
        encoder: *mut c_void,
        points: *const c_void,
        num_points: u32,
        pillars: *mut c_void,
        features: *mut c_void,
    ) -> c_int;
    fn viskit_pillar_destroy(encoder: *mut c_void) -> c_int;

    fn viskit_bbox_create(desc: *const VkBoxDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_bbox_set_filter(post: *mut c_void, filter: *const VkBoxFilter) -> c_int;
    fn viskit_bbox_run(
        post: *mut c_void,
        heads: *const *const c_void,
        num_heads: u32,
        points: *const c_void,
        num_points: u32,
        boxes: *mut c_void,
        labels: *mut c_void,
        scores: *mut c_void,
        metadata: *mut c_void,
        detections: *mut u32,
    ) -> c_int;
    fn viskit_bbox_destroy(post: *mut c_void) -> c_int;

    fn viskit_decode_create(desc: *const VkDecodeDesc, out: *mut *mut c_void) -> c_int;
    fn viskit_decode_run(
        stream: *mut c_void,
        bitstream: *const c_void,
        bitstream_bytes: usize,
        frame: *const VkImage,
        timestamp_ns: u64,
        mark: u64,
    ) -> c_int;
    fn viskit_decode_flush(stream: *mut c_void) -> c_int;
    fn viskit_decode_destroy(stream: *mut c_void) -> c_int;
}

fn rc(code: c_int, call: &str) -> ArgusResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ArgusError::backend(
            BackendClass::Cpu,
            code,
            format!("{call} failed"),
        ))
    }
}

fn as_ptr(handle: KernelHandle) -> *mut c_void {
    handle.0 as *mut c_void
}

/// The linked CPU build of libviskit.
pub struct HostSdk;

impl HostSdk {
    pub fn new() -> Self {
        HostSdk
    }
}

impl VendorLibrary for HostSdk {
    fn init(&self) -> ArgusResult<()> {
        rc(unsafe { viskit_init() }, "viskit_init")
    }

    fn deinit(&self) -> ArgusResult<()> {
        rc(unsafe { viskit_deinit() }, "viskit_deinit")
    }

    fn register_buffer(&self, role: BufferRole, addr: usize, size: usize) -> ArgusResult<()> {
        rc(
            unsafe { viskit_reg_buf(role.wire_code() as c_int, addr as *mut c_void, size) },
            "viskit_reg_buf",
        )
    }

    fn deregister_buffer(&self, addr: usize) -> ArgusResult<()> {
        rc(
            unsafe { viskit_dereg_buf(addr as *mut c_void) },
            "viskit_dereg_buf",
        )
    }

    fn remap_create_map(&self, params: &RemapMapParams) -> ArgusResult<KernelHandle> {
        let desc = VkRemapDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_remap_create(&desc, &mut out) },
            "viskit_remap_create",
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
            unsafe { viskit_remap_run(as_ptr(map), &src, &dst, &roi, job.roi_scale, normalize) },
            "viskit_remap_run",
        )
    }

    fn remap_destroy_map(&self, map: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_remap_destroy(as_ptr(map)) }, "viskit_remap_destroy")
    }

    fn flow_create(&self, params: &FlowParams) -> ArgusResult<KernelHandle> {
        let desc = VkFlowDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_flow_create(&desc, &mut out) },
            "viskit_flow_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn flow_set_filter(&self, session: KernelHandle, filter: &FlowFilterParams) -> ArgusResult<()> {
        let filter = VkFlowFilter::from(filter);
        rc(
            unsafe { viskit_flow_set_filter(as_ptr(session), &filter) },
            "viskit_flow_set_filter",
        )
    }

    fn flow_run(&self, session: KernelHandle, job: &FlowJob) -> ArgusResult<()> {
        let current = VkImage::from(&job.current);
        let reference = VkImage::from(&job.reference);
        rc(
            unsafe {
                viskit_flow_run(
                    as_ptr(session),
                    &current,
                    &reference,
                    job.motion.addr as *mut c_void,
                    job.motion.bytes,
                    job.confidence.addr as *mut c_void,
                    job.confidence.bytes,
                )
            },
            "viskit_flow_run",
        )
    }

    fn flow_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_flow_destroy(as_ptr(session)) }, "viskit_flow_destroy")
    }

    fn stereo_create(&self, params: &StereoParams) -> ArgusResult<KernelHandle> {
        let desc = VkStereoDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_stereo_create(&desc, &mut out) },
            "viskit_stereo_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn stereo_run(&self, session: KernelHandle, job: &StereoJob) -> ArgusResult<()> {
        let left = VkImage::from(&job.left);
        let right = VkImage::from(&job.right);
        rc(
            unsafe {
                viskit_stereo_run(
                    as_ptr(session),
                    &left,
                    &right,
                    job.disparity.addr as *mut c_void,
                    job.disparity.bytes,
                    job.confidence.addr as *mut c_void,
                    job.confidence.bytes,
                )
            },
            "viskit_stereo_run",
        )
    }

    fn stereo_destroy(&self, session: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_stereo_destroy(as_ptr(session)) }, "viskit_stereo_destroy")
    }

    fn pillar_create(&self, params: &PillarParams) -> ArgusResult<KernelHandle> {
        let desc = VkPillarDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_pillar_create(&desc, &mut out) },
            "viskit_pillar_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn pillar_run(&self, encoder: KernelHandle, job: &PillarJob) -> ArgusResult<()> {
        rc(
            unsafe {
                viskit_pillar_run(
                    as_ptr(encoder),
                    job.points.addr as *const c_void,
                    job.num_points,
                    job.pillars.addr as *mut c_void,
                    job.features.addr as *mut c_void,
                )
            },
            "viskit_pillar_run",
        )
    }

    fn pillar_destroy(&self, encoder: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_pillar_destroy(as_ptr(encoder)) }, "viskit_pillar_destroy")
    }

    fn bbox_create(&self, params: &BoxParams) -> ArgusResult<KernelHandle> {
        let desc = VkBoxDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_bbox_create(&desc, &mut out) },
            "viskit_bbox_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn bbox_set_filter(&self, post: KernelHandle, filter: &BoxFilterParams) -> ArgusResult<()> {
        let filter = VkBoxFilter::from(filter);
        rc(
            unsafe { viskit_bbox_set_filter(as_ptr(post), &filter) },
            "viskit_bbox_set_filter",
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
                viskit_bbox_run(
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
            "viskit_bbox_run",
        )?;
        Ok(detections)
    }

    fn bbox_destroy(&self, post: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_bbox_destroy(as_ptr(post)) }, "viskit_bbox_destroy")
    }

    fn decode_create(&self, params: &DecodeParams) -> ArgusResult<KernelHandle> {
        let desc = VkDecodeDesc::from(params);
        let mut out: *mut c_void = std::ptr::null_mut();
        rc(
            unsafe { viskit_decode_create(&desc, &mut out) },
            "viskit_decode_create",
        )?;
        Ok(KernelHandle(out as u64))
    }

    fn decode_run(&self, stream: KernelHandle, job: &DecodeJob) -> ArgusResult<()> {
        let frame = VkImage::from(&job.frame);
        rc(
            unsafe {
                viskit_decode_run(
                    as_ptr(stream),
                    job.bitstream.addr as *const c_void,
                    job.bitstream.bytes,
                    &frame,
                    job.timestamp_ns,
                    job.mark,
                )
            },
            "viskit_decode_run",
        )
    }

    fn decode_flush(&self, stream: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_decode_flush(as_ptr(stream)) }, "viskit_decode_flush")
    }

    fn decode_destroy(&self, stream: KernelHandle) -> ArgusResult<()> {
        rc(unsafe { viskit_decode_destroy(as_ptr(stream)) }, "viskit_decode_destroy")
    }
}
