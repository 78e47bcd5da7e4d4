//! Static capability tables.
//!
//! What a backend family can run is fixed at build time: the host kernel
//! libraries and the accelerator firmware each ship a known set of remap
//! pipelines, and video decode only exists on the host codec engine.
//! Lookups happen once at configure time; components cache the result.

use crate::error::{ArgusError, ArgusResult};
use crate::types::{BackendClass, ImageFormat};

/// Remap conversion pipelines, one per (input, output, normalize) triple a
/// backend family implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapPipeline {
    UyvyToRgb,
    UyvyToRgbNorm,
    UyvyToBgr,
    RgbToRgb,
    Nv12ToRgb,
    Nv12ToRgbNorm,
    Nv12ToBgr,
    Nv12UbwcToBgr,
}

impl RemapPipeline {
    /// Pipeline code as the vendor kernels and the wire blocks carry it.
    pub fn wire_code(self) -> u32 {
        match self {
            RemapPipeline::UyvyToRgb => 1,
            RemapPipeline::UyvyToRgbNorm => 2,
            RemapPipeline::UyvyToBgr => 3,
            RemapPipeline::RgbToRgb => 4,
            RemapPipeline::Nv12ToRgb => 5,
            RemapPipeline::Nv12ToRgbNorm => 6,
            RemapPipeline::Nv12ToBgr => 7,
            RemapPipeline::Nv12UbwcToBgr => 8,
        }
    }

    /// Whether the variant applies per-channel normalization factors.
    pub fn is_normalizing(self) -> bool {
        matches!(
            self,
            RemapPipeline::UyvyToRgbNorm | RemapPipeline::Nv12ToRgbNorm
        )
    }
}

struct PipelineEntry {
    input: ImageFormat,
    output: ImageFormat,
    normalized: bool,
    pipeline: RemapPipeline,
}

const fn entry(
    input: ImageFormat,
    output: ImageFormat,
    normalized: bool,
    pipeline: RemapPipeline,
) -> PipelineEntry {
    PipelineEntry {
        input,
        output,
        normalized,
        pipeline,
    }
}

// Linear pipelines, common to every backend family.
const LINEAR_PIPELINES: &[PipelineEntry] = &[
    entry(ImageFormat::Uyvy, ImageFormat::Rgb888, false, RemapPipeline::UyvyToRgb),
    entry(ImageFormat::Uyvy, ImageFormat::Rgb888, true, RemapPipeline::UyvyToRgbNorm),
    entry(ImageFormat::Uyvy, ImageFormat::Bgr888, false, RemapPipeline::UyvyToBgr),
    entry(ImageFormat::Rgb888, ImageFormat::Rgb888, false, RemapPipeline::RgbToRgb),
    entry(ImageFormat::Nv12, ImageFormat::Rgb888, false, RemapPipeline::Nv12ToRgb),
    entry(ImageFormat::Nv12, ImageFormat::Rgb888, true, RemapPipeline::Nv12ToRgbNorm),
    entry(ImageFormat::Nv12, ImageFormat::Bgr888, false, RemapPipeline::Nv12ToBgr),
];

// Only the accelerator firmware can walk UBWC tile metadata.
const NPU_EXTRA_PIPELINES: &[PipelineEntry] = &[entry(
    ImageFormat::Nv12Ubwc,
    ImageFormat::Bgr888,
    false,
    RemapPipeline::Nv12UbwcToBgr,
)];

/// Resolve the remap pipeline for a conversion on `class`.
pub fn remap_pipeline(
    class: BackendClass,
    input: ImageFormat,
    output: ImageFormat,
    normalized: bool,
) -> ArgusResult<RemapPipeline> {
    let lookup = |table: &[PipelineEntry]| {
        table
            .iter()
            .find(|e| e.input == input && e.output == output && e.normalized == normalized)
            .map(|e| e.pipeline)
    };
    lookup(LINEAR_PIPELINES)
        .or_else(|| {
            if class.is_remote() {
                lookup(NPU_EXTRA_PIPELINES)
            } else {
                None
            }
        })
        .ok_or_else(|| {
            ArgusError::bad_args(format!(
                "{class} has no remap pipeline {input:?} -> {output:?}{}",
                if normalized { " (normalized)" } else { "" }
            ))
        })
}

/// The vision components a backend class can be asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Remap,
    OpticalFlow,
    StereoDepth,
    Pillarize,
    BoxExtract,
    VideoDecode,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Component::Remap => "remap",
            Component::OpticalFlow => "optical-flow",
            Component::StereoDepth => "stereo-depth",
            Component::Pillarize => "pillarize",
            Component::BoxExtract => "box-extract",
            Component::VideoDecode => "video-decode",
        };
        f.write_str(name)
    }
}

/// Whether `class` can run `component` at all.
pub fn supports(class: BackendClass, component: Component) -> bool {
    match component {
        // The codec engine sits behind the host driver only.
        Component::VideoDecode => class == BackendClass::Cpu,
        _ => true,
    }
}

/// Configure-time check, `BadArguments` on an impossible placement.
pub fn ensure_supported(class: BackendClass, component: Component) -> ArgusResult<()> {
    if supports(class, component) {
        Ok(())
    } else {
        Err(ArgusError::bad_args(format!(
            "{component} cannot run on {class}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_variants_are_distinct() {
        let plain =
            remap_pipeline(BackendClass::Cpu, ImageFormat::Nv12, ImageFormat::Rgb888, false)
                .unwrap();
        let norm =
            remap_pipeline(BackendClass::Cpu, ImageFormat::Nv12, ImageFormat::Rgb888, true)
                .unwrap();
        assert_eq!(plain, RemapPipeline::Nv12ToRgb);
        assert_eq!(norm, RemapPipeline::Nv12ToRgbNorm);
        assert!(norm.is_normalizing());
        assert_ne!(plain.wire_code(), norm.wire_code());
    }

    #[test]
    fn ubwc_decode_is_accelerator_only() {
        assert!(remap_pipeline(
            BackendClass::Npu1,
            ImageFormat::Nv12Ubwc,
            ImageFormat::Bgr888,
            false
        )
        .is_ok());
        assert!(remap_pipeline(
            BackendClass::Gpu,
            ImageFormat::Nv12Ubwc,
            ImageFormat::Bgr888,
            false
        )
        .is_err());
    }

    #[test]
    fn unknown_conversion_rejected() {
        assert!(remap_pipeline(
            BackendClass::Cpu,
            ImageFormat::Rgb888,
            ImageFormat::Uyvy,
            false
        )
        .is_err());
    }

    #[test]
    fn decode_is_pinned_to_cpu() {
        assert!(ensure_supported(BackendClass::Cpu, Component::VideoDecode).is_ok());
        assert!(ensure_supported(BackendClass::Npu0, Component::VideoDecode).is_err());
        assert!(ensure_supported(BackendClass::Gpu, Component::OpticalFlow).is_ok());
    }
}
