// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The video sample entry: the decoder-configuration blob (`avc1`/`avcC`
//! boxes, width/height, pixel aspect ratio) that every MP4/fMP4 `stsd`/`stsd`
//! fragment needs, produced once per stream by [`crate::ingest::Ingest`] and
//! consumed by [`crate::mux`]'s box writers.
//!
//! Grounded on the teacher's `db::VideoSampleEntryToInsert`: same fields,
//! renamed and moved out of the `db` crate since this repository's `db`
//! crate only stores finalized `RecordingRow`s, not per-codec entries.

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VideoSampleEntry {
    /// A serialized `avc1` (or future: `hev1`) box, ready to splice
    /// directly into an `stsd`.
    pub data: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,
    pub pasp_h_spacing: u16,
    pub pasp_v_spacing: u16,
}
