// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A minimal, append-only `.mp4` box writer: `mdat` first (so samples can be
//! streamed to disk as they arrive), `moov` appended once the segment
//! closes. Grounded on the moonfire-rtsp proof-of-concept mp4 writer (same
//! author/ecosystem as this codebase's retina-based ingest), adapted from
//! async `tokio::io` to a plain `std::fs::File` since every writer here runs
//! on its own dedicated thread rather than inside a Tokio runtime.
//!
//! Deliberately single-track (video only): this repository's ingest path
//! (`crate::stream`) only demuxes a stream's video media, so there is
//! nothing yet to interleave an audio track with.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base::{err, Error};
use bytes::{BufMut, BytesMut};

use crate::media::VideoSampleEntry;
use crate::packet::TimeBase;

/// Fixed output time base for written `.mp4` files, independent of whatever
/// time base the source packets arrived in.
pub const MP4_TIME_BASE: TimeBase = TimeBase { num: 1, den: 90_000 };

macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let buf: &mut BytesMut = $buf;
        let pos_start = buf.len();
        let fourcc: &[u8; 4] = $fourcc;
        buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        let r = { $b };
        let pos_end = buf.len();
        let len = (pos_end - pos_start) as u32;
        buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes());
        r
    }};
}

fn io_err(e: std::io::Error) -> Error {
    err!(Unavailable, msg("mp4 write failed"), source(e))
}

/// Stats about a just-finalized segment, enough to populate a `RecordingRow`
/// and to pick a thumbnail frame.
pub struct FinishedSegment {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sample_count: u32,
    pub duration_ticks: u64,
}

pub struct Mp4BoxWriter {
    file: File,
    path: PathBuf,
    mdat_start: u64,
    data_len: u64,
    video_entry: VideoSampleEntry,
    durations: Vec<u32>,
    sizes: Vec<u32>,
    sync_samples: Vec<u32>,
    offsets: Vec<u64>,
    last_ticks: Option<i64>,
    first_ticks: Option<i64>,
}

impl Mp4BoxWriter {
    /// Creates `path` (and its parent directories) and writes the `ftyp` +
    /// placeholder `mdat` header. `video_entry.data` is the pre-built
    /// `avc1`/`hev1` sample entry box (built by `retina`'s
    /// `VideoParameters::mp4_sample_entry()`, see `crate::stream`), written
    /// into `stsd` verbatim.
    pub fn create(path: &Path, video_entry: VideoSampleEntry) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = path.with_extension("mp4.tmp");
        let mut file = File::create(&tmp_path).map_err(io_err)?;

        let mut buf = BytesMut::new();
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom");
            buf.put_u32(0);
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso2");
            buf.extend_from_slice(b"avc1");
            buf.extend_from_slice(b"mp41");
        });
        let mdat_start = buf.len() as u64;
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(b"mdat");
        file.write_all(&buf).map_err(io_err)?;

        Ok(Mp4BoxWriter {
            file,
            path: tmp_path,
            mdat_start,
            data_len: 0,
            video_entry,
            durations: Vec::new(),
            sizes: Vec::new(),
            sync_samples: Vec::new(),
            offsets: Vec::new(),
            last_ticks: None,
            first_ticks: None,
        })
    }

    pub fn sample_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Appends one sample. `ticks` is in [`MP4_TIME_BASE`] units and must be
    /// non-decreasing across calls (the caller -- `Mp4Segmenter` -- is
    /// responsible for converting from the packet's native time base).
    pub fn write_sample(&mut self, ticks: i64, data: &[u8], is_sync: bool) -> Result<(), Error> {
        if let Some(last) = self.last_ticks {
            let delta = (ticks - last).max(0) as u32;
            self.durations.push(delta);
        }
        self.first_ticks.get_or_insert(ticks);
        self.last_ticks = Some(ticks);

        let offset = self.mdat_start + 8 + self.data_len;
        self.offsets.push(offset);
        self.sizes.push(data.len() as u32);
        if is_sync {
            self.sync_samples.push(self.sizes.len() as u32);
        }
        self.file.write_all(data).map_err(io_err)?;
        self.data_len += data.len() as u64;
        Ok(())
    }

    /// Finalizes the file: patches the `mdat` size, appends `moov`, fsyncs,
    /// and renames into place (so a reader never observes a half-written
    /// segment at its final path).
    pub fn finish(mut self) -> Result<FinishedSegment, Error> {
        let sample_count = self.sizes.len() as u32;
        if sample_count > 0 {
            // `durations` lags samples by one; the final sample's duration
            // is unobservable (no next sample), so pad with its
            // predecessor's value, or 0 for a single-sample segment.
            let pad = self.durations.last().copied().unwrap_or(0);
            self.durations.push(pad);
        }
        let tot_duration: u64 = self.durations.iter().map(|d| *d as u64).sum();

        let mdat_total_len = 8 + self.data_len;
        self.file
            .seek(SeekFrom::Start(self.mdat_start))
            .map_err(io_err)?;
        self.file
            .write_all(&(mdat_total_len as u32).to_be_bytes())
            .map_err(io_err)?;
        self.file.seek(SeekFrom::End(0)).map_err(io_err)?;

        let mut buf = BytesMut::with_capacity(1024 + 12 * self.sizes.len());
        self.write_moov(&mut buf, tot_duration)?;
        self.file.write_all(&buf).map_err(io_err)?;
        self.file.sync_all().map_err(io_err)?;
        drop(self.file);

        let final_path = self.path.with_extension("");
        fs::rename(&self.path, &final_path).map_err(io_err)?;
        let size_bytes = fs::metadata(&final_path).map_err(io_err)?.len();

        Ok(FinishedSegment {
            path: final_path,
            size_bytes,
            sample_count,
            duration_ticks: tot_duration,
        })
    }

    fn write_moov(&self, buf: &mut BytesMut, tot_duration: u64) -> Result<(), Error> {
        let timescale = MP4_TIME_BASE.den;
        let (width, height) = (self.video_entry.width, self.video_entry.height);
        write_box!(buf, b"moov", {
            write_box!(buf, b"mvhd", {
                buf.put_u32(0);
                buf.put_u32(0); // creation_time
                buf.put_u32(0); // modification_time
                buf.put_u32(timescale);
                buf.put_u32(tot_duration.min(u32::MAX as u64) as u32);
                buf.put_u32(0x00010000); // rate 1.0
                buf.put_u16(0x0100); // volume 1.0
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in [0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(v);
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(2); // next_track_id
            });
            write_box!(buf, b"trak", {
                write_box!(buf, b"tkhd", {
                    buf.put_u32(7); // version 0, flags: enabled|in_movie|in_preview
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.put_u32(1); // track_id
                    buf.put_u32(0); // reserved
                    buf.put_u32(tot_duration.min(u32::MAX as u64) as u32);
                    buf.put_u64(0); // reserved
                    buf.put_u16(0); // layer
                    buf.put_u16(0); // alternate_group
                    buf.put_u16(0); // volume (video track)
                    buf.put_u16(0); // reserved
                    for v in [0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                        buf.put_u32(v);
                    }
                    buf.put_u32((width as u32) << 16);
                    buf.put_u32((height as u32) << 16);
                });
                write_box!(buf, b"mdia", {
                    write_box!(buf, b"mdhd", {
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(timescale);
                        buf.put_u32(tot_duration.min(u32::MAX as u64) as u32);
                        buf.put_u16(0x55c4); // language = und
                        buf.put_u16(0);
                    });
                    write_box!(buf, b"hdlr", {
                        buf.put_u32(0);
                        buf.put_u32(0); // pre_defined
                        buf.extend_from_slice(b"vide");
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u8(0); // empty name
                    });
                    write_box!(buf, b"minf", {
                        write_box!(buf, b"vmhd", {
                            buf.put_u32(1);
                            buf.put_u64(0);
                        });
                        write_box!(buf, b"dinf", {
                            write_box!(buf, b"dref", {
                                buf.put_u32(0);
                                buf.put_u32(1);
                                write_box!(buf, b"url ", {
                                    buf.put_u32(1); // self-contained
                                });
                            });
                        });
                        write_box!(buf, b"stbl", {
                            write_box!(buf, b"stsd", {
                                buf.put_u32(0);
                                buf.put_u32(1);
                                buf.extend_from_slice(&self.video_entry.data);
                            });
                            write_box!(buf, b"stts", {
                                buf.put_u32(0);
                                buf.put_u32(self.durations.len() as u32);
                                for d in &self.durations {
                                    buf.put_u32(1);
                                    buf.put_u32(*d);
                                }
                            });
                            write_box!(buf, b"stss", {
                                buf.put_u32(0);
                                buf.put_u32(self.sync_samples.len() as u32);
                                for s in &self.sync_samples {
                                    buf.put_u32(*s);
                                }
                            });
                            write_box!(buf, b"stsc", {
                                buf.put_u32(0);
                                buf.put_u32(1); // one chunk holds every sample
                                buf.put_u32(1);
                                buf.put_u32(self.sizes.len() as u32);
                                buf.put_u32(1);
                            });
                            write_box!(buf, b"stsz", {
                                buf.put_u32(0);
                                buf.put_u32(0); // sample_size=0: sizes vary, see table
                                buf.put_u32(self.sizes.len() as u32);
                                for s in &self.sizes {
                                    buf.put_u32(*s);
                                }
                            });
                            write_box!(buf, b"co64", {
                                buf.put_u32(0);
                                buf.put_u32(1); // entry_count: 1 chunk
                                buf.put_u64(*self.offsets.first().unwrap_or(&0));
                            });
                        });
                    });
                });
            });
        });
        Ok(())
    }
}
