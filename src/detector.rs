// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The detector capability: `detect(frame_rgb, threshold) ->
//! [{label, confidence, bbox}]`, "may be backed by an in-process model or an
//! HTTP service; the core treats both identically behind this interface."
//!
//! The embedded ONNX/CNN model itself is an external collaborator, an
//! opaque callable, so this module stops at the trait seam: it does not
//! link an inference runtime or an HTTP client. Rather than a duck-typed,
//! string-selected backend dispatch, this is a single detector capability
//! with two variants, chosen once at Supervisor build: one trait, and a
//! `Backend` enum the Supervisor matches on exactly once when it wires a
//! stream's `DetectionWorker`.

use db::detection::BoundingBox;

use base::Error;

#[derive(Clone, Debug)]
pub struct DetectionBox {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// One RGB video frame handed to a detector. Decoding the encoded keyframe
/// into this form is the caller's (`DetectionWorker`'s) responsibility; this
/// workspace carries no H.264/H.265 decoder, so `decode` is itself behind a
/// trait (see [`crate::detection::Decoder`]) supplied the same way.
pub struct FrameRgb<'a> {
    pub width: u32,
    pub height: u32,
    pub rgb: &'a [u8],
}

/// A detector backend. `DetectorError` is `SampleSkipped`, never
/// stream-fatal, so implementations should prefer returning `Err` for any
/// failure over panicking — the caller downgrades every `Err` to a dropped
/// sample and a counted metric.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &FrameRgb, threshold: f64) -> Result<Vec<DetectionBox>, Error>;
}

/// The two backend shapes, selected once when the
/// Supervisor builds a stream's detection pipeline. Neither variant's
/// concrete implementation ships in this crate (no ONNX runtime or HTTP
/// client dependency is pulled in for it — see `DESIGN.md`); both are
/// supplied by the embedder as a boxed [`Detector`].
pub enum Backend {
    InProcess(Box<dyn Detector>),
    Http(Box<dyn Detector>),
}

impl Backend {
    pub fn detector(&self) -> &dyn Detector {
        match self {
            Backend::InProcess(d) | Backend::Http(d) => d.as_ref(),
        }
    }
}

/// Decodes a Motion-JPEG keyframe to RGB8, the only codec this workspace can
/// turn into a [`FrameRgb`] without a video decoder dependency. H.264/H.265 packets are passed
/// through unrecognized and simply yield no frame, matching
/// `mp4_segmenter`'s thumbnail limitation.
pub struct JpegFrameDecoder;

impl crate::detection::Decoder for JpegFrameDecoder {
    fn decode_to_rgb(&self, packets: &[crate::packet::Packet]) -> Option<(u32, u32, Vec<u8>)> {
        let keyframe = packets.iter().rev().find(|p| p.is_video() && p.is_keyframe)?;
        let img = image::load_from_memory(&keyframe.payload).ok()?;
        let rgb = img.to_rgb8();
        let (width, height) = (rgb.width(), rgb.height());
        Some((width, height, rgb.into_raw()))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A detector stub for worker-pool and trigger-controller tests: fires
    /// whenever `wants_hit` returns true for the frame it's given.
    pub struct ScriptedDetector<F: Fn() -> bool + Send + Sync> {
        pub wants_hit: F,
        pub label: String,
        pub confidence: f64,
    }

    impl<F: Fn() -> bool + Send + Sync> Detector for ScriptedDetector<F> {
        fn detect(&self, _frame: &FrameRgb, threshold: f64) -> Result<Vec<DetectionBox>, Error> {
            if (self.wants_hit)() && self.confidence >= threshold {
                Ok(vec![DetectionBox {
                    label: self.label.clone(),
                    confidence: self.confidence,
                    bbox: BoundingBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
                }])
            } else {
                Ok(vec![])
            }
        }
    }
}
