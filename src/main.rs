//! Binary entry point. Parses the `--intel-pt` option group, builds a
//! [`Controller`], and runs it until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use pt_collector::config::{parse_intel_pt_opts_with_defaults, FileDefaults};
use pt_collector::Controller;

const DEFAULT_CONFIG_PATH: &str = "/etc/pt-collector/pt-collector.toml";

#[derive(Parser, Debug)]
#[command(name = "pt-collectord")]
#[command(about = "In-process Intel-PT style hardware trace collector")]
struct Args {
    /// Comma-separated intel-pt option group, e.g.
    /// `mapping=/tmp/map.txt,insert-jmx=true`.
    #[arg(long = "intel-pt", value_name = "OPTS")]
    intel_pt: String,

    /// Optional mapping-file override; takes precedence over any
    /// `mapping=` sub-option.
    #[arg(long, value_name = "PATH")]
    mapping_file: Option<PathBuf>,

    /// TOML file supplying defaults (worker_count, ring_capacity,
    /// mapping_offset) for whatever the `--intel-pt` group leaves
    /// unset. Missing or unparsable files are silently ignored.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn run() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let defaults = FileDefaults::load(&args.config);
    let mut config = parse_intel_pt_opts_with_defaults(&args.intel_pt, &defaults)
        .context("failed to parse --intel-pt option group")?;
    if let Some(path) = args.mapping_file {
        config.mapping_file = Some(path);
    }

    info!("starting pt-collectord, sink={:?}", config.sink);
    let controller = Controller::init(config).context("failed to initialize controller")?;
    controller
        .start_recording()
        .context("failed to start recording")?;

    wait_for_shutdown_signal().context("failed to install signal handler")?;

    controller
        .stop_recording()
        .context("failed to stop recording")?;
    controller.shutdown().context("failed to shut down controller")?;
    info!("pt-collectord stopped cleanly");
    Ok(())
}

/// Blocks until SIGINT/SIGTERM, mirroring the emulator-embedded
/// lifecycle where `finish_recording_and_close_file` is invoked by the
/// host process on shutdown rather than by this binary polling a flag.
fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown_requested);
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))
        .context("failed to register ctrlc handler")?;

    while !shutdown_requested.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("fatal: {e:#}");
        eprintln!("pt-collectord: {e:#}");
        std::process::exit(1);
    }
}
