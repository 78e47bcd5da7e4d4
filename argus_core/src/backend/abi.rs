//! C-ABI mirrors of the host-call parameter structs, shared by the
//! statically linked SDK and the dlopened GPU library. Field order matches
//! the viskit headers; do not reorder.

use std::os::raw::{c_int, c_void};

use crate::buffer::MAX_IMAGE_PLANES;

use super::params::{
    BoxFilterParams, BoxParams, DecodeParams, FlowFilterParams, FlowParams, ImageRef,
    PillarParams, RemapMapParams, Roi, StereoParams,
};

#[repr(C)]
pub struct VkImage {
    pub addr: *mut c_void,
    pub width: u32,
    pub height: u32,
    pub stride: [u32; MAX_IMAGE_PLANES],
    pub plane_size: [u32; MAX_IMAGE_PLANES],
    pub num_planes: u32,
}

impl From<&ImageRef> for VkImage {
    fn from(img: &ImageRef) -> Self {
        VkImage {
            addr: img.addr as *mut c_void,
            width: img.width,
            height: img.height,
            stride: img.stride,
            plane_size: img.plane_size,
            num_planes: img.num_planes,
        }
    }
}

#[repr(C)]
pub struct VkRoi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&Roi> for VkRoi {
    fn from(roi: &Roi) -> Self {
        VkRoi {
            x: roi.x,
            y: roi.y,
            width: roi.width,
            height: roi.height,
        }
    }
}

#[repr(C)]
pub struct VkRemapDesc {
    pub pipeline: u32,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub map_width: u32,
    pub map_height: u32,
    pub map_x: *const f32,
    pub map_y: *const f32,
    pub undistort: c_int,
    pub border_const: u32,
}

impl From<&RemapMapParams> for VkRemapDesc {
    fn from(p: &RemapMapParams) -> Self {
        VkRemapDesc {
            pipeline: p.pipeline,
            src_width: p.src_width,
            src_height: p.src_height,
            dst_width: p.dst_width,
            dst_height: p.dst_height,
            map_width: p.map_width,
            map_height: p.map_height,
            map_x: p.map_x_addr as *const f32,
            map_y: p.map_y_addr as *const f32,
            undistort: p.undistort as c_int,
            border_const: p.border_const as u32,
        }
    }
}

#[repr(C)]
pub struct VkFlowDesc {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub quality: u32,
    pub direction: u32,
}

impl From<&FlowParams> for VkFlowDesc {
    fn from(p: &FlowParams) -> Self {
        VkFlowDesc {
            width: p.width,
            height: p.height,
            frame_rate: p.frame_rate,
            quality: p.quality,
            direction: p.direction,
        }
    }
}

#[repr(C)]
pub struct VkFlowFilter {
    pub hole_fill: c_int,
    pub confidence_threshold: u32,
    pub variance_threshold: u32,
}

impl From<&FlowFilterParams> for VkFlowFilter {
    fn from(p: &FlowFilterParams) -> Self {
        VkFlowFilter {
            hole_fill: p.hole_fill as c_int,
            confidence_threshold: p.confidence_threshold as u32,
            variance_threshold: p.variance_threshold as u32,
        }
    }
}

#[repr(C)]
pub struct VkStereoDesc {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub search_right_to_left: c_int,
    pub hole_fill: c_int,
    pub occlusion_confidence: u32,
}

impl From<&StereoParams> for VkStereoDesc {
    fn from(p: &StereoParams) -> Self {
        VkStereoDesc {
            width: p.width,
            height: p.height,
            frame_rate: p.frame_rate,
            search_right_to_left: p.search_right_to_left as c_int,
            hole_fill: p.hole_fill as c_int,
            occlusion_confidence: p.occlusion_confidence as u32,
        }
    }
}

#[repr(C)]
pub struct VkPillarDesc {
    pub pillar_size: [f32; 3],
    pub min_range: [f32; 3],
    pub max_range: [f32; 3],
    pub max_points: u32,
    pub point_dims: u32,
    pub max_pillars: u32,
    pub max_points_per_pillar: u32,
    pub feature_dims: u32,
}

impl From<&PillarParams> for VkPillarDesc {
    fn from(p: &PillarParams) -> Self {
        VkPillarDesc {
            pillar_size: p.pillar_size,
            min_range: p.min_range,
            max_range: p.max_range,
            max_points: p.max_points,
            point_dims: p.point_dims,
            max_pillars: p.max_pillars,
            max_points_per_pillar: p.max_points_per_pillar,
            feature_dims: p.feature_dims,
        }
    }
}

#[repr(C)]
pub struct VkBoxDesc {
    pub pillar_size: [f32; 2],
    pub min_range: [f32; 2],
    pub max_range: [f32; 2],
    pub num_classes: u32,
    pub max_points: u32,
    pub point_dims: u32,
    pub max_detections: u32,
    pub head_stride: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub map_points_to_boxes: c_int,
}

impl From<&BoxParams> for VkBoxDesc {
    fn from(p: &BoxParams) -> Self {
        VkBoxDesc {
            pillar_size: p.pillar_size,
            min_range: p.min_range,
            max_range: p.max_range,
            num_classes: p.num_classes,
            max_points: p.max_points,
            point_dims: p.point_dims,
            max_detections: p.max_detections,
            head_stride: p.head_stride,
            score_threshold: p.score_threshold,
            iou_threshold: p.iou_threshold,
            map_points_to_boxes: p.map_points_to_boxes as c_int,
        }
    }
}

#[repr(C)]
pub struct VkBoxFilter {
    pub min_center: [f32; 3],
    pub max_center: [f32; 3],
    pub label_mask: u64,
    pub max_filtered: u32,
}

impl From<&BoxFilterParams> for VkBoxFilter {
    fn from(p: &BoxFilterParams) -> Self {
        VkBoxFilter {
            min_center: p.min_center,
            max_center: p.max_center,
            label_mask: p.label_mask,
            max_filtered: p.max_filtered,
        }
    }
}

#[repr(C)]
pub struct VkDecodeDesc {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitstream: u32,
    pub input_queue_depth: u32,
    pub output_queue_depth: u32,
}

impl From<&DecodeParams> for VkDecodeDesc {
    fn from(p: &DecodeParams) -> Self {
        VkDecodeDesc {
            width: p.width,
            height: p.height,
            frame_rate: p.frame_rate,
            bitstream: p.bitstream,
            input_queue_depth: p.input_queue_depth,
            output_queue_depth: p.output_queue_depth,
        }
    }
}

// Shared signatures: the statically linked SDK exports these names, the GPU
// library exposes the same shapes under `viskit_gpu_` prefixes.
pub type InitFn = unsafe extern "C" fn() -> c_int;
pub type DeinitFn = unsafe extern "C" fn() -> c_int;
pub type RegBufFn = unsafe extern "C" fn(role: c_int, addr: *mut c_void, size: usize) -> c_int;
pub type DeregBufFn = unsafe extern "C" fn(addr: *mut c_void) -> c_int;

pub type RemapCreateFn =
    unsafe extern "C" fn(desc: *const VkRemapDesc, out: *mut *mut c_void) -> c_int;
pub type RemapRunFn = unsafe extern "C" fn(
    map: *mut c_void,
    src: *const VkImage,
    dst: *const VkImage,
    roi: *const VkRoi,
    roi_scale: f32,
    normalize: *const f32,
) -> c_int;
pub type HandleFn = unsafe extern "C" fn(handle: *mut c_void) -> c_int;

pub type FlowCreateFn =
    unsafe extern "C" fn(desc: *const VkFlowDesc, out: *mut *mut c_void) -> c_int;
pub type FlowFilterFn =
    unsafe extern "C" fn(session: *mut c_void, filter: *const VkFlowFilter) -> c_int;
pub type FlowRunFn = unsafe extern "C" fn(
    session: *mut c_void,
    current: *const VkImage,
    reference: *const VkImage,
    motion: *mut c_void,
    motion_bytes: usize,
    confidence: *mut c_void,
    confidence_bytes: usize,
) -> c_int;

pub type StereoCreateFn =
    unsafe extern "C" fn(desc: *const VkStereoDesc, out: *mut *mut c_void) -> c_int;
pub type StereoRunFn = unsafe extern "C" fn(
    session: *mut c_void,
    left: *const VkImage,
    right: *const VkImage,
    disparity: *mut c_void,
    disparity_bytes: usize,
    confidence: *mut c_void,
    confidence_bytes: usize,
) -> c_int;

pub type PillarCreateFn =
    unsafe extern "C" fn(desc: *const VkPillarDesc, out: *mut *mut c_void) -> c_int;
pub type PillarRunFn = unsafe extern "C" fn(
    encoder: *mut c_void,
    points: *const c_void,
    num_points: u32,
    pillars: *mut c_void,
    features: *mut c_void,
) -> c_int;

pub type BoxCreateFn =
    unsafe extern "C" fn(desc: *const VkBoxDesc, out: *mut *mut c_void) -> c_int;
pub type BoxFilterFn =
    unsafe extern "C" fn(post: *mut c_void, filter: *const VkBoxFilter) -> c_int;
pub type BoxRunFn = unsafe extern "C" fn(
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

pub type DecodeCreateFn =
    unsafe extern "C" fn(desc: *const VkDecodeDesc, out: *mut *mut c_void) -> c_int;
pub type DecodeRunFn = unsafe extern "C" fn(
    stream: *mut c_void,
    bitstream: *const c_void,
    bitstream_bytes: usize,
    frame: *const VkImage,
    timestamp_ns: u64,
    mark: u64,
) -> c_int;
