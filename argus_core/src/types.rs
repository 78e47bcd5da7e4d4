//! Core enums shared across the Argus HAL: backend classes, image formats,
//! buffer roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A distinct execution target for vision algorithms.
///
/// `Npu0`/`Npu1` are the two remote accelerators, reached only through the
/// synchronous remote-call channel — never by direct memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendClass {
    /// Host CPU, vendor kernels linked into the process.
    Cpu,
    /// GPU, vendor kernel library loaded at session bring-up.
    Gpu,
    /// Remote NPU accelerator 0.
    Npu0,
    /// Remote NPU accelerator 1.
    Npu1,
}

impl BackendClass {
    /// Number of backend classes. Sizes the per-class state arrays.
    pub const COUNT: usize = 4;

    /// All classes, in slot order.
    pub const ALL: [BackendClass; Self::COUNT] = [
        BackendClass::Cpu,
        BackendClass::Gpu,
        BackendClass::Npu0,
        BackendClass::Npu1,
    ];

    /// Stable index into per-class state arrays.
    pub fn index(self) -> usize {
        match self {
            BackendClass::Cpu => 0,
            BackendClass::Gpu => 1,
            BackendClass::Npu0 => 2,
            BackendClass::Npu1 => 3,
        }
    }

    /// True for backends reached through the remote-call channel.
    pub fn is_remote(self) -> bool {
        matches!(self, BackendClass::Npu0 | BackendClass::Npu1)
    }
}

impl fmt::Display for BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendClass::Cpu => "cpu",
            BackendClass::Gpu => "gpu",
            BackendClass::Npu0 => "npu0",
            BackendClass::Npu1 => "npu1",
        };
        f.write_str(s)
    }
}

/// Image pixel formats understood by the vision components.
///
/// `Nv12Ubwc`/`Tp10Ubwc` are bandwidth-compressed layouts: their planes are
/// registered with a backend as one contiguous range rather than per plane.
/// `H264`/`H265` are codec bitstream formats and only appear on the video
/// decode component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Rgb888,
    Bgr888,
    Uyvy,
    Nv12,
    P010,
    Nv12Ubwc,
    Tp10Ubwc,
    H264,
    H265,
}

impl ImageFormat {
    /// Number of planes the format carries in memory.
    pub fn plane_count(self) -> usize {
        match self {
            ImageFormat::Rgb888 | ImageFormat::Bgr888 | ImageFormat::Uyvy => 1,
            ImageFormat::Nv12 | ImageFormat::P010 => 2,
            ImageFormat::Nv12Ubwc | ImageFormat::Tp10Ubwc => 4,
            ImageFormat::H264 | ImageFormat::H265 => 1,
        }
    }

    /// Bytes per pixel of plane 0, for minimum-stride checks.
    /// Compressed layouts and bitstreams have no meaningful per-pixel size.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            ImageFormat::Rgb888 | ImageFormat::Bgr888 => Some(3),
            ImageFormat::Uyvy => Some(2),
            ImageFormat::Nv12 => Some(1),
            ImageFormat::P010 => Some(2),
            _ => None,
        }
    }

    /// True for bandwidth-compressed (UBWC) layouts.
    pub fn is_ubwc(self) -> bool {
        matches!(self, ImageFormat::Nv12Ubwc | ImageFormat::Tp10Ubwc)
    }

    /// True for codec bitstream formats.
    pub fn is_bitstream(self) -> bool {
        matches!(self, ImageFormat::H264 | ImageFormat::H265)
    }
}

/// How a buffer crosses the backend boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferRole {
    Input,
    Output,
    InOut,
}

impl BufferRole {
    /// Wire encoding used by the remote register-buffer call.
    pub fn wire_code(self) -> u32 {
        match self {
            BufferRole::Input => 1,
            BufferRole::Output => 2,
            BufferRole::InOut => 3,
        }
    }
}

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDtype {
    U8,
    I32,
    F32,
}

impl TensorDtype {
    pub fn size_bytes(self) -> usize {
        match self {
            TensorDtype::U8 => 1,
            TensorDtype::I32 => 4,
            TensorDtype::F32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_indices_are_dense_and_stable() {
        for (i, class) in BackendClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
        assert!(BackendClass::Npu0.is_remote());
        assert!(BackendClass::Npu1.is_remote());
        assert!(!BackendClass::Cpu.is_remote());
        assert!(!BackendClass::Gpu.is_remote());
    }

    #[test]
    fn format_plane_counts() {
        assert_eq!(ImageFormat::Rgb888.plane_count(), 1);
        assert_eq!(ImageFormat::Nv12.plane_count(), 2);
        assert_eq!(ImageFormat::Nv12Ubwc.plane_count(), 4);
        assert!(ImageFormat::Nv12Ubwc.is_ubwc());
        assert!(ImageFormat::H265.is_bitstream());
    }
}
