//! Error kinds for the collector pipeline, grouped per the failure
//! classes the components actually raise: configuration, resource
//! acquisition, wire-protocol, overflow and invariant violations.

use std::io;

pub type Result<T> = std::result::Result<T, CollectorError>;

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    SysfsRead { path: String, source: io::Error },

    #[error("perf_event_open failed: {0}")]
    PerfOpen(io::Error),

    #[error("mmap of {region} region failed: {source}")]
    Mmap { region: &'static str, source: io::Error },

    #[error("failed to open output file {path}: {source}")]
    FileOpen { path: String, source: io::Error },

    #[error("write to {path} failed: {source}")]
    FileWrite { path: String, source: io::Error },

    #[error("staging ring overflow: requested {requested} bytes with {available} free")]
    RingOverflow { requested: usize, available: usize },

    #[error("output writer invariant violated: {0} job(s) still pending at shutdown")]
    PendingJobsAtShutdown(usize),

    #[error("address map invariant violated: {0}")]
    AddrMapInvariant(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
