//! Process-wide configuration record. Built once from the single
//! `--intel-pt` comma-separated option group and never mutated once
//! the pipeline threads start.

use crate::error::{CollectorError, Result};
use crate::instrumentation::JMX_DEFAULT_MAPPING_OFFSET;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the acquisition thread sends bytes drained from the aux ring.
#[derive(Debug, Clone)]
pub enum RecordingSink {
    /// Internal decode pipeline: Staging Ring + Packet Decoder + Output Writer.
    Internal { trace_output: PathBuf },
    /// Raw aux-ring bytes written verbatim to a sidecar file, no decoding.
    Sidecar { path: PathBuf },
}

/// Process-wide, read-only-after-init configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mapping_file: Option<PathBuf>,
    pub sink: RecordingSink,
    pub insert_jmx: bool,
    pub use_chain_count: bool,
    pub insert_pt_write: bool,
    /// Added to the host IP before it is written to the mapping file,
    /// per the "mapping_offset added to host address" convention.
    pub mapping_offset: u64,
    pub worker_count: usize,
    pub ring_capacity: usize,
}

impl Config {
    pub fn decode_internally(&self) -> bool {
        matches!(self.sink, RecordingSink::Internal { .. })
    }
}

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_RING_CAPACITY: usize = 16 * 1024 * 1024;
const DEFAULT_TRACE_OUTPUT: &str = "trace.out";

/// Defaults read from an optional TOML file (`--config`), layered
/// underneath the mandatory `--intel-pt` flag group. Every field is
/// optional: an absent or unparsable file just leaves the built-in
/// defaults in place, the way the teacher's own `Config::load`
/// tolerates a missing file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileDefaults {
    pub worker_count: Option<usize>,
    pub ring_capacity: Option<usize>,
    pub mapping_offset: Option<u64>,
}

impl FileDefaults {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

/// Parses the single `--intel-pt key=val,key=val,...` option group, in the
/// shape the source's `intel_pt_opt_parse` accepted. At least one
/// recognised sub-option must be present. `worker_count`, `ring_capacity`
/// and `mapping_offset` are not part of this fixed sub-option set; they
/// only ever come from `defaults` (the `--config` TOML file).
pub fn parse_intel_pt_opts(optarg: &str) -> Result<Config> {
    parse_intel_pt_opts_with_defaults(optarg, &FileDefaults::default())
}

/// Same as [`parse_intel_pt_opts`], but using `defaults` (typically
/// loaded from a `--config` TOML file) in place of the built-in
/// fallbacks wherever the flag group leaves a value unset.
pub fn parse_intel_pt_opts_with_defaults(optarg: &str, defaults: &FileDefaults) -> Result<Config> {
    let mut mapping_file = None;
    let mut sidecar_path = None;
    let mut insert_jmx = false;
    let mut use_chain_count = false;
    let mut insert_pt_write = false;
    let mut mapping_offset = defaults.mapping_offset.unwrap_or(0);
    let mut mapping_offset_given = defaults.mapping_offset.is_some();
    let worker_count = defaults.worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
    let ring_capacity = defaults.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY);
    let mut seen_any = false;

    for kv in optarg.split(',').filter(|s| !s.is_empty()) {
        let (key, value) = kv.split_once('=').ok_or_else(|| {
            CollectorError::Config(format!("malformed sub-option `{kv}`, expected key=value"))
        })?;

        match key {
            "mapping" => {
                mapping_file = Some(PathBuf::from(value));
                seen_any = true;
            }
            "intel-pt-data" => {
                sidecar_path = Some(PathBuf::from(value));
                seen_any = true;
            }
            "insert-jmx" => {
                insert_jmx = parse_bool(key, value)?;
                seen_any = true;
            }
            "use-chain-count" => {
                use_chain_count = parse_bool(key, value)?;
                seen_any = true;
            }
            "insert-pt-write" => {
                insert_pt_write = parse_bool(key, value)?;
                seen_any = true;
            }
            other => {
                return Err(CollectorError::Config(format!(
                    "unknown intel-pt sub-option `{other}`"
                )));
            }
        }
    }

    if !seen_any {
        return Err(CollectorError::Config(
            "at least one intel-pt sub-option must be given".to_string(),
        ));
    }

    // Enabling insert-jmx implies the jmx jump's own mapping offset
    // unless the caller picked a different one explicitly.
    if insert_jmx && !mapping_offset_given {
        mapping_offset = JMX_DEFAULT_MAPPING_OFFSET;
    }

    let sink = match sidecar_path {
        Some(path) => RecordingSink::Sidecar { path },
        None => RecordingSink::Internal {
            trace_output: PathBuf::from(DEFAULT_TRACE_OUTPUT),
        },
    };

    Ok(Config {
        mapping_file,
        sink,
        insert_jmx,
        use_chain_count,
        insert_pt_write,
        mapping_offset,
        worker_count,
        ring_capacity,
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CollectorError::Config(format!(
            "value for `{key}` must be either 'true' or 'false', got `{value}`"
        ))),
    }
}
