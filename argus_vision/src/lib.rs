//! Argus vision components.
//!
//! Six components share one shape: a serde config validated at `init`, the
//! uniform Initial/Ready/Running lifecycle from `argus_core::component`,
//! lazy buffer registration, and a validate → register → invoke execute
//! path fanned out per backend class in [`dispatch`].

mod common;
mod dispatch;

pub mod box_extract;
pub mod optical_flow;
pub mod pillarize;
pub mod remap;
pub mod stereo_depth;
pub mod video_decode;

pub use box_extract::{BoxExtract, BoxExtractConfig};
pub use optical_flow::{OpticalFlow, OpticalFlowConfig};
pub use pillarize::{Pillarize, PillarizeConfig};
pub use remap::{Remap, RemapConfig};
pub use stereo_depth::{StereoDepth, StereoDepthConfig};
pub use video_decode::{VideoDecode, VideoDecodeConfig};

// Serializes unit tests that assert process-wide counter deltas.
#[cfg(test)]
pub(crate) mod testsync {
    pub(crate) static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub(crate) fn lock() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }
}
