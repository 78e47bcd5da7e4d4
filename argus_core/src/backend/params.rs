//! Host-call parameter and job structs for the vendor-library contract.
//!
//! These are the arguments the dispatcher hands to a bound vendor table on
//! the CPU/GPU paths. The remote (NPU) path never sees them; it packs the
//! equivalent fields into [`super::wire`] argument blocks instead.

use crate::buffer::{ImageProps, SharedBuffer, MAX_IMAGE_PLANES};
use crate::error::ArgusResult;

/// A rectangular region of interest in source-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Full-frame ROI.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

/// Flat view of one image buffer, resolved for a vendor call. Host paths
/// use the address; remote paths use the DMA handle and region offset.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef {
    pub addr: usize,
    pub dma_handle: u64,
    /// Offset of this view from the start of its region.
    pub region_offset: usize,
    pub width: u32,
    pub height: u32,
    pub stride: [u32; MAX_IMAGE_PLANES],
    pub plane_size: [u32; MAX_IMAGE_PLANES],
    pub num_planes: u32,
}

impl ImageRef {
    /// View of batch element `index` within an image buffer.
    pub fn from_buffer(buf: &SharedBuffer, index: u32) -> ArgusResult<Self> {
        let props: &ImageProps = buf.image_props()?;
        let sub_offset = buf.sub_size() * index as usize;
        Ok(Self {
            addr: buf.payload_addr() + sub_offset,
            dma_handle: buf.dma_handle,
            region_offset: buf.offset + sub_offset,
            width: props.width,
            height: props.height,
            stride: props.stride,
            plane_size: props.plane_size,
            num_planes: props.num_planes,
        })
    }
}

/// Flat view of one tensor (or raw) buffer.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef {
    pub addr: usize,
    pub dma_handle: u64,
    pub region_offset: usize,
    pub bytes: usize,
}

impl TensorRef {
    pub fn from_buffer(buf: &SharedBuffer) -> Self {
        Self {
            addr: buf.payload_addr(),
            dma_handle: buf.dma_handle,
            region_offset: buf.offset,
            bytes: buf.payload_size,
        }
    }
}

/// Parameters for creating one remap map (one per configured input).
#[derive(Debug, Clone, Copy)]
pub struct RemapMapParams {
    /// Capability-table pipeline code, backend family specific.
    pub pipeline: u32,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub map_width: u32,
    pub map_height: u32,
    /// f32 X/Y lookup tables; zero when undistortion is disabled.
    pub map_x_addr: usize,
    pub map_y_addr: usize,
    pub undistort: bool,
    pub border_const: u8,
}

/// One remap invocation: one source into one batch slot of the output.
#[derive(Debug, Clone, Copy)]
pub struct RemapJob {
    pub src: ImageRef,
    pub dst: ImageRef,
    pub roi: Roi,
    pub roi_scale: f32,
    /// Per-channel normalization factors; `None` when the pipeline is not a
    /// normalizing variant.
    pub normalize: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub quality: u32,
    pub direction: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowFilterParams {
    pub hole_fill: bool,
    pub confidence_threshold: u8,
    pub variance_threshold: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowJob {
    pub current: ImageRef,
    pub reference: ImageRef,
    pub motion: TensorRef,
    pub confidence: TensorRef,
}

#[derive(Debug, Clone, Copy)]
pub struct StereoParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub search_right_to_left: bool,
    pub hole_fill: bool,
    pub occlusion_confidence: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct StereoJob {
    pub left: ImageRef,
    pub right: ImageRef,
    pub disparity: TensorRef,
    pub confidence: TensorRef,
}

#[derive(Debug, Clone, Copy)]
pub struct PillarParams {
    pub pillar_size: [f32; 3],
    pub min_range: [f32; 3],
    pub max_range: [f32; 3],
    pub max_points: u32,
    pub point_dims: u32,
    pub max_pillars: u32,
    pub max_points_per_pillar: u32,
    pub feature_dims: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PillarJob {
    pub points: TensorRef,
    pub num_points: u32,
    pub pillars: TensorRef,
    pub features: TensorRef,
}

#[derive(Debug, Clone, Copy)]
pub struct BoxParams {
    pub pillar_size: [f32; 2],
    pub min_range: [f32; 2],
    pub max_range: [f32; 2],
    pub num_classes: u32,
    pub max_points: u32,
    pub point_dims: u32,
    pub max_detections: u32,
    /// Downsample ratio of the center head.
    pub head_stride: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub map_points_to_boxes: bool,
}

/// Optional detection filter: center-range check plus a class-label mask
/// (bit N set keeps label N).
#[derive(Debug, Clone, Copy)]
pub struct BoxFilterParams {
    pub min_center: [f32; 3],
    pub max_center: [f32; 3],
    pub label_mask: u64,
    pub max_filtered: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BoxJob {
    pub heatmap: TensorRef,
    pub xy: TensorRef,
    pub z: TensorRef,
    pub size: TensorRef,
    pub theta: TensorRef,
    pub points: TensorRef,
    pub num_points: u32,
    pub boxes: TensorRef,
    pub labels: TensorRef,
    pub scores: TensorRef,
    pub metadata: TensorRef,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Wire code of the bitstream format (H264/H265).
    pub bitstream: u32,
    pub input_queue_depth: u32,
    pub output_queue_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeJob {
    pub bitstream: TensorRef,
    pub frame: ImageRef,
    pub timestamp_ns: u64,
    /// Opaque caller data copied through to the matching output frame.
    pub mark: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::packed_image_props;
    use crate::types::ImageFormat;

    #[test]
    fn roi_bounds() {
        assert!(Roi::full(640, 480).fits_within(640, 480));
        let roi = Roi {
            x: 600,
            y: 0,
            width: 41,
            height: 10,
        };
        assert!(!roi.fits_within(640, 480));
        let degenerate = Roi {
            x: 0,
            y: 0,
            width: 0,
            height: 10,
        };
        assert!(!degenerate.fits_within(640, 480));
    }

    #[test]
    fn image_ref_batch_indexing() {
        let props = packed_image_props(ImageFormat::Rgb888, 16, 16, 2).unwrap();
        let buf = crate::buffer::SharedBuffer::image(0x1000, 5, 2048, 0, props);
        let first = ImageRef::from_buffer(&buf, 0).unwrap();
        let second = ImageRef::from_buffer(&buf, 1).unwrap();
        assert_eq!(second.addr - first.addr, 16 * 16 * 3);
    }
}
