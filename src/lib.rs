pub mod addr_map;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod instrumentation;
pub mod metrics;
pub mod output_writer;
pub mod perf_sys;
pub mod staging_ring;

pub mod acquisition;

pub use config::Config;
pub use controller::Controller;
pub use error::{CollectorError, Result};
pub use metrics::Metrics;
