//! Fixed-size argument blocks for the remote-call channel.
//!
//! Every NPU operation is one synchronous `invoke` of a `#[repr(C)]`
//! [`bytemuck::Pod`] block. Layout convention, relied on by helpers and by
//! the loopback backend:
//!
//! - blocks that create a backend-side object start with a `handle: u64`
//!   out-field,
//! - every block ends with a `status: i32` out-field in its last 4 bytes.
//!
//! The transport's own framing (how a block and any attached buffers move
//! across process boundaries) is outside this crate.

use bytemuck::{Pod, Zeroable};

use crate::error::{ArgusError, ArgusResult};
use crate::types::BackendClass;

use super::AcceleratorChannel;

// Session methods.
pub const METHOD_INIT: u32 = 0x01;
pub const METHOD_VERSION: u32 = 0x02;
pub const METHOD_DEINIT: u32 = 0x03;

// Buffer table methods.
pub const METHOD_MMAP: u32 = 0x10;
pub const METHOD_MUNMAP: u32 = 0x11;
pub const METHOD_REG_BUF: u32 = 0x12;
pub const METHOD_DEREG_BUF: u32 = 0x13;

// Algorithm methods.
pub const METHOD_REMAP_CREATE: u32 = 0x20;
pub const METHOD_REMAP_RUN: u32 = 0x21;
pub const METHOD_REMAP_DESTROY: u32 = 0x22;
pub const METHOD_FLOW_CREATE: u32 = 0x28;
pub const METHOD_FLOW_FILTER: u32 = 0x29;
pub const METHOD_FLOW_RUN: u32 = 0x2a;
pub const METHOD_FLOW_DESTROY: u32 = 0x2b;
pub const METHOD_STEREO_CREATE: u32 = 0x30;
pub const METHOD_STEREO_RUN: u32 = 0x31;
pub const METHOD_STEREO_DESTROY: u32 = 0x32;
pub const METHOD_PILLAR_CREATE: u32 = 0x38;
pub const METHOD_PILLAR_RUN: u32 = 0x39;
pub const METHOD_PILLAR_DESTROY: u32 = 0x3a;
pub const METHOD_BBOX_CREATE: u32 = 0x40;
pub const METHOD_BBOX_FILTER: u32 = 0x41;
pub const METHOD_BBOX_RUN: u32 = 0x42;
pub const METHOD_BBOX_DESTROY: u32 = 0x43;

/// Method completed.
pub const STATUS_OK: i32 = 0;
/// Mapping already present; the mmap path treats this as success.
pub const STATUS_ALREADY: i32 = 0x1c;

pub const VERSION_LEN: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InitArgs {
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct VersionArgs {
    pub version: [u8; VERSION_LEN],
    pub _reserved: u32,
    pub status: i32,
}

impl VersionArgs {
    /// The version string the accelerator wrote, trimmed at the first NUL.
    pub fn as_str(&self) -> &str {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_LEN);
        std::str::from_utf8(&self.version[..end]).unwrap_or("<non-utf8>")
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MmapArgs {
    pub fd: i32,
    pub size: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MunmapArgs {
    pub fd: i32,
    pub size: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RegBufArgs {
    pub role: u32,
    pub fd: i32,
    pub size: u32,
    pub offset: u32,
    pub batch: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DeregBufArgs {
    pub fd: i32,
    pub size: u32,
    pub offset: u32,
    pub batch: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RemapCreateArgs {
    pub handle: u64,
    /// Undistortion lookup tables; marshalled by the transport, zero when
    /// undistortion is off.
    pub map_x_addr: u64,
    pub map_y_addr: u64,
    pub pipeline: u32,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub map_width: u32,
    pub map_height: u32,
    pub undistort: u32,
    pub border_const: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RemapRunArgs {
    pub map: u64,
    pub src_fd: i32,
    pub src_offset: u32,
    pub src_plane0_size: u32,
    pub src_plane1_size: u32,
    pub dst_fd: i32,
    pub dst_offset: u32,
    pub dst_plane0_size: u32,
    pub roi_x: u32,
    pub roi_y: u32,
    pub roi_width: u32,
    pub roi_height: u32,
    pub roi_scale: f32,
    pub norm_r: f32,
    pub norm_g: f32,
    pub norm_b: f32,
    pub normalize: u32,
    pub _reserved: u32,
    pub status: i32,
}

/// Destroy/one-handle blocks shared by all algorithms.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct KernelArgs {
    pub handle: u64,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlowCreateArgs {
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub quality: u32,
    pub direction: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlowFilterArgs {
    pub session: u64,
    pub hole_fill: u32,
    pub confidence_threshold: u32,
    pub variance_threshold: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlowRunArgs {
    pub session: u64,
    pub current_fd: i32,
    pub current_offset: u32,
    pub reference_fd: i32,
    pub reference_offset: u32,
    pub motion_fd: i32,
    pub motion_offset: u32,
    pub motion_bytes: u32,
    pub confidence_fd: i32,
    pub confidence_offset: u32,
    pub confidence_bytes: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct StereoCreateArgs {
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub search_right_to_left: u32,
    pub hole_fill: u32,
    pub occlusion_confidence: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct StereoRunArgs {
    pub session: u64,
    pub left_fd: i32,
    pub left_offset: u32,
    pub right_fd: i32,
    pub right_offset: u32,
    pub disparity_fd: i32,
    pub disparity_offset: u32,
    pub disparity_bytes: u32,
    pub confidence_fd: i32,
    pub confidence_offset: u32,
    pub confidence_bytes: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PillarCreateArgs {
    pub handle: u64,
    pub pillar_size: [f32; 3],
    pub min_range: [f32; 3],
    pub max_range: [f32; 3],
    pub max_points: u32,
    pub point_dims: u32,
    pub max_pillars: u32,
    pub max_points_per_pillar: u32,
    pub feature_dims: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PillarRunArgs {
    pub encoder: u64,
    pub points_fd: i32,
    pub points_offset: u32,
    pub points_bytes: u32,
    pub num_points: u32,
    pub pillars_fd: i32,
    pub pillars_offset: u32,
    pub pillars_bytes: u32,
    pub features_fd: i32,
    pub features_offset: u32,
    pub features_bytes: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BoxCreateArgs {
    pub handle: u64,
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
    pub map_points_to_boxes: u32,
    pub _reserved: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BoxFilterArgs {
    pub post: u64,
    pub label_mask: u64,
    pub min_center: [f32; 3],
    pub max_center: [f32; 3],
    pub max_filtered: u32,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BoxRunArgs {
    pub post: u64,
    pub heatmap_fd: i32,
    pub heatmap_offset: u32,
    pub xy_fd: i32,
    pub xy_offset: u32,
    pub z_fd: i32,
    pub z_offset: u32,
    pub size_fd: i32,
    pub size_offset: u32,
    pub theta_fd: i32,
    pub theta_offset: u32,
    pub points_fd: i32,
    pub points_offset: u32,
    pub boxes_fd: i32,
    pub boxes_offset: u32,
    pub labels_fd: i32,
    pub labels_offset: u32,
    pub scores_fd: i32,
    pub scores_offset: u32,
    pub metadata_fd: i32,
    pub metadata_offset: u32,
    pub num_points: u32,
    /// Out: number of detections written.
    pub detections: u32,
    pub _reserved: u32,
    pub status: i32,
}

/// Invoke one method and fold its in-block status into the result.
///
/// Accepted statuses beyond [`STATUS_OK`] can be passed in `tolerate`
/// (the mmap path tolerates [`STATUS_ALREADY`]).
pub fn invoke_block<T: Pod>(
    channel: &dyn AcceleratorChannel,
    remote: u64,
    class: BackendClass,
    method: u32,
    args: &mut T,
    tolerate: &[i32],
) -> ArgusResult<()> {
    let bytes = bytemuck::bytes_of_mut(args);
    channel.invoke(remote, method, bytes)?;
    let n = bytes.len();
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[n - 4..]);
    let status = i32::from_le_bytes(raw);
    if status == STATUS_OK || tolerate.contains(&status) {
        Ok(())
    } else {
        Err(ArgusError::backend(
            class,
            status,
            format!("remote method {method:#x} failed"),
        ))
    }
}
