//! Shared-buffer descriptors.
//!
//! Argus never allocates frame memory itself: callers hand in descriptors
//! of regions they own (DMA heaps, camera pools, decoder output rings) and
//! keep them alive for as long as the buffer is registered with a backend.
//! A descriptor is bookkeeping only — the host address is carried as a
//! `usize` and is never dereferenced by this crate, only forwarded to the
//! vendor libraries and the remote mapping sequence.

use serde::{Deserialize, Serialize};

use crate::error::{ArgusError, ArgusResult};
use crate::types::{ImageFormat, TensorDtype};

/// Maximum number of planes an image buffer can carry.
pub const MAX_IMAGE_PLANES: usize = 4;

/// Maximum tensor rank.
pub const MAX_TENSOR_DIMS: usize = 8;

/// Upper bound for sane image dimensions, both axes.
pub const MAX_IMAGE_DIM: u32 = 16384;

/// Per-plane layout of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProps {
    pub format: ImageFormat,
    /// Number of logically-equal images packed contiguously in the region.
    pub batch: u32,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes, per plane.
    pub stride: [u32; MAX_IMAGE_PLANES],
    /// Allocated scanlines, per plane (>= visible height, alignment padding).
    pub plane_height: [u32; MAX_IMAGE_PLANES],
    /// Allocated bytes per plane (stride * plane_height + padding).
    pub plane_size: [u32; MAX_IMAGE_PLANES],
    pub num_planes: u32,
}

impl ImageProps {
    /// Total bytes of one batch element.
    pub fn frame_size(&self) -> usize {
        self.plane_size[..self.num_planes as usize]
            .iter()
            .map(|&s| s as usize)
            .sum()
    }

    /// Internal-consistency check of the declared layout. Runs on every
    /// execute; buffer identity between calls is never trusted.
    pub fn validate(&self) -> ArgusResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ArgusError::invalid_buffer("zero image dimension"));
        }
        if self.width > MAX_IMAGE_DIM || self.height > MAX_IMAGE_DIM {
            return Err(ArgusError::invalid_buffer(format!(
                "image {}x{} exceeds maximum dimension {}",
                self.width, self.height, MAX_IMAGE_DIM
            )));
        }
        if self.batch == 0 {
            return Err(ArgusError::invalid_buffer("zero batch"));
        }
        let planes = self.num_planes as usize;
        if planes == 0 || planes > MAX_IMAGE_PLANES {
            return Err(ArgusError::invalid_buffer(format!(
                "invalid plane count {}",
                self.num_planes
            )));
        }
        if !self.format.is_bitstream() && planes != self.format.plane_count() {
            return Err(ArgusError::invalid_buffer(format!(
                "{:?} expects {} planes, got {}",
                self.format,
                self.format.plane_count(),
                self.num_planes
            )));
        }
        // UBWC planes carry meta+data tiles; stride checks only apply to
        // linear layouts.
        if !self.format.is_ubwc() && !self.format.is_bitstream() {
            if let Some(bpp) = self.format.bytes_per_pixel() {
                if self.stride[0] < self.width * bpp {
                    return Err(ArgusError::invalid_buffer(format!(
                        "plane 0 stride {} below minimum {} for {}x{} {:?}",
                        self.stride[0],
                        self.width * bpp,
                        self.width,
                        self.height,
                        self.format
                    )));
                }
            }
            for p in 0..planes {
                if self.plane_height[p] < self.expected_plane_height(p) {
                    return Err(ArgusError::invalid_buffer(format!(
                        "plane {} height {} below visible {}",
                        p,
                        self.plane_height[p],
                        self.expected_plane_height(p)
                    )));
                }
                let min = self.stride[p] as u64 * self.plane_height[p] as u64;
                if (self.plane_size[p] as u64) < min {
                    return Err(ArgusError::invalid_buffer(format!(
                        "plane {} size {} below stride*scanlines {}",
                        p, self.plane_size[p], min
                    )));
                }
            }
        }
        Ok(())
    }

    /// Visible scanlines of a plane (chroma planes of 4:2:0 are half height).
    fn expected_plane_height(&self, plane: usize) -> u32 {
        match self.format {
            ImageFormat::Nv12 | ImageFormat::P010 if plane == 1 => self.height.div_ceil(2),
            _ => self.height,
        }
    }

    /// Check the identity captured at configure time. Called on every
    /// execute before any backend call.
    pub fn require_shape(&self, format: ImageFormat, width: u32, height: u32) -> ArgusResult<()> {
        if self.format != format {
            return Err(ArgusError::invalid_buffer(format!(
                "format {:?} does not match configured {:?}",
                self.format, format
            )));
        }
        if self.width != width || self.height != height {
            return Err(ArgusError::invalid_buffer(format!(
                "size {}x{} does not match configured {}x{}",
                self.width, self.height, width, height
            )));
        }
        self.validate()
    }
}

/// Layout of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorProps {
    pub dtype: TensorDtype,
    pub dims: [u32; MAX_TENSOR_DIMS],
    pub num_dims: u32,
}

impl TensorProps {
    /// Build a tensor descriptor from a dim slice. Rank must be in
    /// 1..=[`MAX_TENSOR_DIMS`].
    pub fn new(dtype: TensorDtype, shape: &[u32]) -> ArgusResult<Self> {
        if shape.is_empty() || shape.len() > MAX_TENSOR_DIMS {
            return Err(ArgusError::bad_args(format!(
                "tensor rank {} out of range 1..={}",
                shape.len(),
                MAX_TENSOR_DIMS
            )));
        }
        let mut dims = [0u32; MAX_TENSOR_DIMS];
        dims[..shape.len()].copy_from_slice(shape);
        Ok(Self {
            dtype,
            dims,
            num_dims: shape.len() as u32,
        })
    }

    /// Total element count.
    pub fn elements(&self) -> usize {
        self.dims[..self.num_dims as usize]
            .iter()
            .map(|&d| d as usize)
            .product()
    }

    /// Total payload bytes.
    pub fn byte_size(&self) -> usize {
        self.elements() * self.dtype.size_bytes()
    }

    pub fn validate(&self) -> ArgusResult<()> {
        let rank = self.num_dims as usize;
        if rank == 0 || rank > MAX_TENSOR_DIMS {
            return Err(ArgusError::invalid_buffer(format!(
                "invalid tensor rank {}",
                self.num_dims
            )));
        }
        if self.dims[..rank].iter().any(|&d| d == 0) {
            return Err(ArgusError::invalid_buffer("zero tensor dimension"));
        }
        Ok(())
    }

    /// Check the exact dtype and shape captured at configure time.
    pub fn require_shape(&self, dtype: TensorDtype, shape: &[u32]) -> ArgusResult<()> {
        self.validate()?;
        if self.dtype != dtype {
            return Err(ArgusError::invalid_buffer(format!(
                "tensor dtype {:?} does not match configured {:?}",
                self.dtype, dtype
            )));
        }
        let rank = self.num_dims as usize;
        if rank != shape.len() || self.dims[..rank] != *shape {
            return Err(ArgusError::invalid_buffer(format!(
                "tensor shape {:?} does not match configured {:?}",
                &self.dims[..rank],
                shape
            )));
        }
        Ok(())
    }
}

/// What the region holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BufferPayload {
    Image(ImageProps),
    Tensor(TensorProps),
    Raw,
}

/// Descriptor of a caller-owned shared memory region.
///
/// `addr` is the host virtual address of the region start; `offset` is
/// where the payload begins inside it; `payload_size` covers the whole
/// batch. `dma_handle` is the allocator's DMA identity, used by the remote
/// mapping sequence to derive a mappable fd.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedBuffer {
    pub addr: usize,
    pub dma_handle: u64,
    pub region_size: usize,
    pub offset: usize,
    pub payload_size: usize,
    pub payload: BufferPayload,
}

impl SharedBuffer {
    /// Describe an image region.
    pub fn image(
        addr: usize,
        dma_handle: u64,
        region_size: usize,
        offset: usize,
        props: ImageProps,
    ) -> Self {
        let payload_size = props.frame_size() * props.batch as usize;
        Self {
            addr,
            dma_handle,
            region_size,
            offset,
            payload_size,
            payload: BufferPayload::Image(props),
        }
    }

    /// Describe a tensor region.
    pub fn tensor(addr: usize, dma_handle: u64, region_size: usize, props: TensorProps) -> Self {
        Self {
            addr,
            dma_handle,
            region_size,
            offset: 0,
            payload_size: props.byte_size(),
            payload: BufferPayload::Tensor(props),
        }
    }

    /// Describe an untyped region, e.g. a codec bitstream chunk.
    pub fn raw(
        addr: usize,
        dma_handle: u64,
        region_size: usize,
        offset: usize,
        payload_size: usize,
    ) -> Self {
        Self {
            addr,
            dma_handle,
            region_size,
            offset,
            payload_size,
            payload: BufferPayload::Raw,
        }
    }

    /// Host address of the payload start.
    pub fn payload_addr(&self) -> usize {
        self.addr + self.offset
    }

    /// Batch count: images carry theirs, tensors and raw regions are 1.
    pub fn batch(&self) -> u32 {
        match self.payload {
            BufferPayload::Image(p) => p.batch,
            _ => 1,
        }
    }

    /// Bytes of one batch element.
    pub fn sub_size(&self) -> usize {
        self.payload_size / self.batch().max(1) as usize
    }

    pub fn image_props(&self) -> ArgusResult<&ImageProps> {
        match &self.payload {
            BufferPayload::Image(p) => Ok(p),
            _ => Err(ArgusError::invalid_buffer("expected an image buffer")),
        }
    }

    pub fn tensor_props(&self) -> ArgusResult<&TensorProps> {
        match &self.payload {
            BufferPayload::Tensor(p) => Ok(p),
            _ => Err(ArgusError::invalid_buffer("expected a tensor buffer")),
        }
    }

    /// Cheap structural sanity check, run before touching any backend.
    pub fn validate(&self) -> ArgusResult<()> {
        if self.addr == 0 {
            return Err(ArgusError::bad_args("null buffer address"));
        }
        if self.region_size == 0 || self.payload_size == 0 {
            return Err(ArgusError::invalid_buffer("empty buffer"));
        }
        if self.offset + self.payload_size > self.region_size {
            return Err(ArgusError::invalid_buffer(format!(
                "payload {}+{} exceeds region size {}",
                self.offset, self.payload_size, self.region_size
            )));
        }
        match &self.payload {
            BufferPayload::Image(p) => p.validate(),
            BufferPayload::Tensor(p) => p.validate(),
            BufferPayload::Raw => Ok(()),
        }
    }
}

/// Build tightly-packed image props for the common linear formats.
/// Test and sample-code helper; production callers describe what their
/// allocator actually laid out.
pub fn packed_image_props(
    format: ImageFormat,
    width: u32,
    height: u32,
    batch: u32,
) -> ArgusResult<ImageProps> {
    let bpp = format
        .bytes_per_pixel()
        .ok_or_else(|| ArgusError::bad_args(format!("{format:?} has no packed layout")))?;
    let planes = format.plane_count();
    let mut props = ImageProps {
        format,
        batch,
        width,
        height,
        stride: [0; MAX_IMAGE_PLANES],
        plane_height: [0; MAX_IMAGE_PLANES],
        plane_size: [0; MAX_IMAGE_PLANES],
        num_planes: planes as u32,
    };
    for p in 0..planes {
        let h = props.expected_plane_height(p);
        props.stride[p] = width * bpp;
        props.plane_height[p] = h;
        props.plane_size[p] = props.stride[p] * h;
    }
    props.validate()?;
    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_nv12_layout() {
        let p = packed_image_props(ImageFormat::Nv12, 640, 480, 1).unwrap();
        assert_eq!(p.num_planes, 2);
        assert_eq!(p.plane_size[0], 640 * 480);
        assert_eq!(p.plane_size[1], 640 * 240);
        assert_eq!(p.frame_size(), 640 * 480 + 640 * 240);
    }

    #[test]
    fn stride_below_minimum_rejected() {
        let mut p = packed_image_props(ImageFormat::Rgb888, 64, 64, 1).unwrap();
        p.stride[0] = 64; // needs 192
        assert!(matches!(
            p.validate(),
            Err(crate::error::ArgusError::InvalidBuffer(_))
        ));
    }

    #[test]
    fn require_shape_detects_drift() {
        let p = packed_image_props(ImageFormat::Nv12, 640, 480, 1).unwrap();
        assert!(p.require_shape(ImageFormat::Nv12, 640, 480).is_ok());
        assert!(p.require_shape(ImageFormat::Nv12, 1280, 720).is_err());
        assert!(p.require_shape(ImageFormat::Uyvy, 640, 480).is_err());
    }

    #[test]
    fn tensor_shape_checks() {
        let t = TensorProps::new(TensorDtype::F32, &[20000, 4]).unwrap();
        assert_eq!(t.byte_size(), 20000 * 4 * 4);
        assert!(t.require_shape(TensorDtype::F32, &[20000, 4]).is_ok());
        assert!(t.require_shape(TensorDtype::F32, &[20000, 5]).is_err());
        assert!(t.require_shape(TensorDtype::I32, &[20000, 4]).is_err());
    }

    #[test]
    fn buffer_payload_must_fit_region() {
        let props = TensorProps::new(TensorDtype::F32, &[16]).unwrap();
        let mut buf = SharedBuffer::tensor(0x1000, 7, 64, props);
        assert!(buf.validate().is_ok());
        buf.region_size = 32; // payload is 64 bytes
        assert!(buf.validate().is_err());
        buf.region_size = 64;
        buf.addr = 0;
        assert!(matches!(
            buf.validate(),
            Err(crate::error::ArgusError::BadArguments(_))
        ));
    }
}
