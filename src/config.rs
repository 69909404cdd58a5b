// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Configuration loading: a minimal INI-with-env-override loader producing
//! the typed [`Config`] snapshot the runtime starts from. No INI crate is
//! used anywhere in this codebase's dependency pack, so this is a small
//! hand-rolled parser rather than an added dependency (see `DESIGN.md`).
//!
//! Section syntax: `[global]` for process-wide settings, `[stream.<name>]`
//! per camera, one `key = value` per line, `;` or `#` starting a comment.
//! Every `[global]` key may be overridden by an `LIGHTNVR_<UPPER_KEY>`
//! environment variable, applied after the file is parsed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base::strutil::decode_size;
use base::{bail, err, Error};
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Debug)]
pub struct DetectionConfig {
    pub model: String,
    pub interval_sec: f64,
    pub threshold: f64,
    pub pre_roll_sec: f64,
    pub post_roll_sec: f64,
    pub object_filter: Vec<String>,
}

/// One camera, `spec.md` §3's `StreamConfig`.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub name: String,
    pub url: Url,
    pub enabled: bool,
    pub protocol: Protocol,
    pub width: u16,
    pub height: u16,
    pub fps: f64,
    pub codec: String,
    pub priority: i32,
    pub record: bool,
    pub segment_duration_sec: i64,
    pub detection: Option<DetectionConfig>,
}

#[derive(Clone, Debug)]
pub struct GlobalConfig {
    pub storage_root: PathBuf,
    pub hls_root: PathBuf,
    pub db_path: PathBuf,
    pub max_storage_size: i64,
    pub retention_days: i64,
    pub auto_delete_oldest: bool,
    /// Unused beyond being a value the Supervisor diffs on: the HTTP/REST
    /// API surface is out of scope.
    pub web_port: u16,
    pub detection_worker_threads: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            storage_root: PathBuf::from("/var/lib/lightnvr"),
            hls_root: PathBuf::from("/var/lib/lightnvr/hls"),
            db_path: PathBuf::from("/var/lib/lightnvr/lightnvr.db"),
            max_storage_size: 0,
            retention_days: 7,
            auto_delete_oldest: true,
            web_port: 8080,
            detection_worker_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub global: GlobalConfig,
    pub streams: Vec<StreamConfig>,
}

struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

fn parse_sections(content: &str) -> Result<Vec<Section>, Error> {
    let mut sections = Vec::new();
    let mut current: Option<Section> = None;
    for (lineno, raw_line) in content.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(sec) = current.take() {
                sections.push(sec);
            }
            current = Some(Section { name: name.trim().to_string(), entries: Vec::new() });
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!(InvalidArgument, msg("config line {}: expected `key = value`", lineno + 1));
        };
        let Some(sec) = current.as_mut() else {
            bail!(InvalidArgument, msg("config line {}: key outside of any [section]", lineno + 1));
        };
        sec.entries.push((key.trim().to_string(), value.trim().to_string()));
    }
    if let Some(sec) = current.take() {
        sections.push(sec);
    }
    Ok(sections)
}

fn strip_comment(line: &str) -> &str {
    for (i, c) in line.char_indices() {
        if c == ';' || c == '#' {
            return &line[..i];
        }
    }
    line
}

fn get<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn parse_bool(s: &str) -> Result<bool, Error> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!(InvalidArgument, msg("not a boolean: {other:?}")),
    }
}

fn apply_global(entries: &[(String, String)], base: &mut GlobalConfig) -> Result<(), Error> {
    if let Some(v) = get(entries, "storage_root") {
        base.storage_root = PathBuf::from(v);
    }
    if let Some(v) = get(entries, "hls_root") {
        base.hls_root = PathBuf::from(v);
    }
    if let Some(v) = get(entries, "db_path") {
        base.db_path = PathBuf::from(v);
    }
    if let Some(v) = get(entries, "max_storage_size") {
        base.max_storage_size = decode_size(v).map_err(|_| err!(InvalidArgument, msg("invalid max_storage_size {v:?}")))?;
    }
    if let Some(v) = get(entries, "retention_days") {
        base.retention_days = v
            .parse()
            .map_err(|_| err!(InvalidArgument, msg("invalid retention_days {v:?}")))?;
    }
    if let Some(v) = get(entries, "auto_delete_oldest") {
        base.auto_delete_oldest = parse_bool(v)?;
    }
    if let Some(v) = get(entries, "web_port") {
        base.web_port = v.parse().map_err(|_| err!(InvalidArgument, msg("invalid web_port {v:?}")))?;
    }
    if let Some(v) = get(entries, "detection_worker_threads") {
        base.detection_worker_threads = v
            .parse()
            .map_err(|_| err!(InvalidArgument, msg("invalid detection_worker_threads {v:?}")))?;
    }
    Ok(())
}

/// `LIGHTNVR_<UPPER_KEY>` overrides any `[global]` file value.
fn apply_env_overrides(base: &mut GlobalConfig) -> Result<(), Error> {
    let keys = [
        "storage_root",
        "hls_root",
        "db_path",
        "max_storage_size",
        "retention_days",
        "auto_delete_oldest",
        "web_port",
        "detection_worker_threads",
    ];
    let mut overrides = Vec::new();
    for key in keys {
        let env_name = format!("LIGHTNVR_{}", key.to_ascii_uppercase());
        if let Ok(v) = std::env::var(&env_name) {
            overrides.push((key.to_string(), v));
        }
    }
    apply_global(&overrides, base)
}

fn parse_stream(name: &str, entries: &[(String, String)]) -> Result<StreamConfig, Error> {
    if name.is_empty() || name.len() > 63 || name.contains('/') {
        bail!(InvalidArgument, msg("stream name {name:?} must be 1-63 characters and contain no '/'"));
    }
    let url_str = get(entries, "url").ok_or_else(|| err!(InvalidArgument, msg("stream {name:?} missing url")))?;
    let url = Url::parse(url_str).map_err(|e| err!(InvalidArgument, msg("stream {name:?} invalid url"), source(e)))?;
    let enabled = get(entries, "enabled").map(parse_bool).transpose()?.unwrap_or(true);
    let protocol = match get(entries, "protocol").unwrap_or("tcp").to_ascii_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => bail!(InvalidArgument, msg("stream {name:?} invalid protocol {other:?}")),
    };
    let width = get(entries, "width").unwrap_or("0").parse().unwrap_or(0);
    let height = get(entries, "height").unwrap_or("0").parse().unwrap_or(0);
    let fps = get(entries, "fps").unwrap_or("15").parse().unwrap_or(15.0);
    let codec = get(entries, "codec").unwrap_or("h264").to_string();
    let priority = get(entries, "priority").unwrap_or("0").parse().unwrap_or(0);
    let record = get(entries, "record").map(parse_bool).transpose()?.unwrap_or(true);
    let segment_duration_sec = get(entries, "segment_duration_sec").unwrap_or("900").parse().unwrap_or(900);

    let detection_keys = ["detection_model", "detection_interval", "detection_threshold", "pre_roll_sec", "post_roll_sec"];
    let present: Vec<bool> = detection_keys.iter().map(|k| get(entries, k).is_some()).collect();
    let any_present = present.iter().any(|b| *b);
    let all_present = present.iter().all(|b| *b);
    // "the detection block is either fully absent or fully valid".
    if any_present && !all_present {
        bail!(InvalidArgument, msg("stream {name:?} has a partially-specified detection block"));
    }
    let detection = if all_present {
        let threshold: f64 = get(entries, "detection_threshold").unwrap().parse().unwrap_or(0.5);
        if !(0.0..=1.0).contains(&threshold) {
            bail!(InvalidArgument, msg("stream {name:?} detection_threshold must be in [0,1]"));
        }
        Some(DetectionConfig {
            model: get(entries, "detection_model").unwrap().to_string(),
            interval_sec: get(entries, "detection_interval").unwrap().parse().unwrap_or(1.0),
            threshold,
            pre_roll_sec: get(entries, "pre_roll_sec").unwrap().parse().unwrap_or(5.0),
            post_roll_sec: get(entries, "post_roll_sec").unwrap().parse().unwrap_or(10.0),
            object_filter: get(entries, "object_filter")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(StreamConfig {
        name: name.to_string(),
        url,
        enabled,
        protocol,
        width,
        height,
        fps,
        codec,
        priority,
        record,
        segment_duration_sec,
        detection,
    })
}

/// Parses `path`, applies `LIGHTNVR_*` overrides, and validates the
/// invariants `spec.md` §3 names (unique stream names, all-or-nothing
/// detection block). Any violation is reported as `ErrorKind::InvalidArgument`
/// -- the caller (`main`) maps this to exit code 1, `spec.md` §6's
/// `ConfigInvalid`.
pub fn load(path: &Path) -> Result<Config, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| err!(InvalidArgument, msg("reading config file {}", path.display()), source(e)))?;
    load_str(&content)
}

pub fn load_str(content: &str) -> Result<Config, Error> {
    let sections = parse_sections(content)?;
    let mut global = GlobalConfig::default();
    let mut streams = Vec::new();
    let mut seen_names = HashSet::new();

    for sec in &sections {
        if sec.name == "global" {
            apply_global(&sec.entries, &mut global)?;
        } else if let Some(stream_name) = sec.name.strip_prefix("stream.") {
            let cfg = parse_stream(stream_name, &sec.entries)?;
            if !seen_names.insert(cfg.name.clone()) {
                bail!(InvalidArgument, msg("duplicate stream name {:?}", cfg.name));
            }
            streams.push(cfg);
        } else {
            bail!(InvalidArgument, msg("unknown config section [{}]", sec.name));
        }
    }
    apply_env_overrides(&mut global)?;
    Ok(Config { global, streams })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_and_stream_sections() {
        let cfg = load_str(
            "[global]\nstorage_root = /data\nretention_days = 14\nmax_storage_size = 10G\n\n\
             [stream.cam1]\nurl = rtsp://cam1.local/stream\nwidth=1920\nheight=1080\n",
        )
        .unwrap();
        assert_eq!(cfg.global.storage_root, PathBuf::from("/data"));
        assert_eq!(cfg.global.retention_days, 14);
        assert_eq!(cfg.global.max_storage_size, 10i64 << 30);
        assert_eq!(cfg.streams.len(), 1);
        assert_eq!(cfg.streams[0].name, "cam1");
        assert_eq!(cfg.streams[0].width, 1920);
        assert!(cfg.streams[0].detection.is_none());
    }

    #[test]
    fn rejects_duplicate_stream_names() {
        let err = load_str(
            "[stream.cam1]\nurl = rtsp://a/\n[stream.cam1]\nurl = rtsp://b/\n",
        )
        .unwrap_err();
        assert!(err.chain().contains("duplicate"));
    }

    #[test]
    fn rejects_partial_detection_block() {
        let err = load_str("[stream.cam1]\nurl = rtsp://a/\ndetection_model = yolo\n").unwrap_err();
        assert!(err.chain().contains("partially-specified"));
    }

    #[test]
    fn accepts_full_detection_block() {
        let cfg = load_str(
            "[stream.cam1]\nurl = rtsp://a/\ndetection_model = yolo\ndetection_interval = 2\n\
             detection_threshold = 0.6\npre_roll_sec = 5\npost_roll_sec = 15\nobject_filter = person, car\n",
        )
        .unwrap();
        let d = cfg.streams[0].detection.as_ref().unwrap();
        assert_eq!(d.model, "yolo");
        assert_eq!(d.object_filter, vec!["person".to_string(), "car".to_string()]);
    }

    #[test]
    fn rejects_stream_name_with_slash() {
        let err = load_str("[stream.cam/1]\nurl = rtsp://a/\n").unwrap_err();
        assert!(err.chain().contains("must be 1-63"));
    }
}
