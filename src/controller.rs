//! Pipeline owner (§4.F). Replaces the source's process-wide static
//! state (the `ipt_perf_fd`/`header`/`reading_data` globals in
//! recording.c) with a single value created at `init` and torn down
//! at `shutdown`; nothing here is a global.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::acquisition::{self, AcquisitionHandle, Sink};
use crate::addr_map::AddrMap;
use crate::config::{Config, RecordingSink};
use crate::decoder;
use crate::error::{CollectorError, Result};
use crate::metrics::Metrics;
use crate::output_writer::OutputWriter;
use crate::perf_sys::{self, PerfMmap};
use crate::staging_ring::StagingRing;

const JOB_SIZE: usize = 65536;
const PREAMBLE: usize = 4096;

/// Owns every long-lived piece of the pipeline: the perf fd and its
/// mmaps, the acquisition thread, the decoder worker pool, and the
/// shared Address Map / Output Writer they feed.
pub struct Controller {
    config: Config,
    metrics: Arc<Metrics>,
    addr_map: Arc<AddrMap>,
    perf_fd: std::fs::File,
    mmap: Arc<PerfMmap>,
    handle: AcquisitionHandle,
    acquisition_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    output: Option<Arc<OutputWriter>>,
    ring: Option<Arc<StagingRing>>,
    mapping_file: Option<Mutex<BufWriter<File>>>,
    recording_enabled: AtomicBool,
}

impl Controller {
    /// Startup sequence (§4.C "Startup"): read the sysfs perf type,
    /// open the event disabled, map its regions, spawn the
    /// acquisition thread pinned to CPUs 3-5, and spawn the decoder
    /// worker pool when the internal decode path is active.
    pub fn init(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let addr_map = Arc::new(AddrMap::new());

        let (perf_fd, mmap) = acquisition::open_perf_event()?;
        let mmap = Arc::new(mmap);

        let handle = AcquisitionHandle {
            stop: Arc::new(AtomicBool::new(false)),
            reading: Arc::new(AtomicBool::new(false)),
        };

        let (sink, ring, output) = match &config.sink {
            RecordingSink::Internal { trace_output } => {
                let ring = Arc::new(StagingRing::new(config.ring_capacity));
                let output = Arc::new(OutputWriter::create(trace_output)?);
                (Sink::Ring(Arc::clone(&ring)), Some(ring), Some(output))
            }
            RecordingSink::Sidecar { path } => {
                let file = std::fs::File::create(path).map_err(|source| CollectorError::FileOpen {
                    path: path.display().to_string(),
                    source,
                })?;
                (Sink::Sidecar(file), None, None)
            }
        };

        let acquisition_thread = {
            let mmap = Arc::clone(&mmap);
            let metrics = Arc::clone(&metrics);
            let stop = Arc::clone(&handle.stop);
            let reading = Arc::clone(&handle.reading);
            std::thread::Builder::new()
                .name("pt-acquisition".into())
                .spawn(move || {
                    acquisition::pin_acquisition_thread().unwrap_or_else(|e| {
                        warn!("failed to pin acquisition thread: {e}");
                    });
                    let local_handle = AcquisitionHandle { stop, reading };
                    if let Err(e) = acquisition::drain_loop(&mmap, sink, &local_handle, &metrics) {
                        error!("acquisition thread terminated with error: {e}");
                    }
                })
                .expect("failed to spawn acquisition thread")
        };

        acquisition::pin_current_thread_to_emulator_cpus().unwrap_or_else(|e| {
            warn!("failed to pin emulator thread: {e}");
        });

        let workers = if let (Some(ring), Some(output)) = (&ring, &output) {
            spawn_decoder_workers(
                config.worker_count,
                Arc::clone(ring),
                Arc::clone(&addr_map),
                Arc::clone(output),
                Arc::clone(&metrics),
            )
        } else {
            Vec::new()
        };

        let mapping_file = match &config.mapping_file {
            Some(path) => {
                let file = File::create(path).map_err(|source| CollectorError::FileOpen {
                    path: path.display().to_string(),
                    source,
                })?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };

        Ok(Self {
            config,
            metrics,
            addr_map,
            perf_fd,
            mmap,
            handle,
            acquisition_thread: Mutex::new(Some(acquisition_thread)),
            workers: Mutex::new(workers),
            output,
            ring,
            mapping_file,
            recording_enabled: AtomicBool::new(false),
        })
    }

    /// Handles the emulator's `pc_mapping(host_ip, guest_pc)` hook
    /// (§6): records the pair in the Address Map and, if a mapping
    /// file was configured, appends `guest_pc, host_ip` to it with
    /// `mapping_offset` added to the host address — the source has two
    /// variants disagreeing on which side the offset lands on; later
    /// variants add it to the host, which this follows (§9 Open
    /// Questions).
    pub fn pc_mapping(&self, host_ip: u64, guest_pc: u64) -> Result<()> {
        self.addr_map.insert(guest_pc, host_ip);

        if let Some(mapping_file) = &self.mapping_file {
            let mut file = mapping_file.lock().unwrap();
            let record = format_mapping_record(guest_pc, host_ip, self.config.mapping_offset);
            writeln!(file, "{record}").map_err(|source| CollectorError::FileWrite {
                path: "<mapping>".to_string(),
                source,
            })?;
        }

        Ok(())
    }

    /// Waits out any in-progress aux-ring copy, then enables the
    /// hardware counter (§4.F).
    pub fn start_recording(&self) -> Result<()> {
        self.handle.wait_for_idle();
        perf_sys::ioctl_enable(perf_sys::fd_as_raw(&self.perf_fd))?;
        self.recording_enabled.store(true, Ordering::Release);
        info!("intel-pt recording started");
        Ok(())
    }

    /// Waits out any in-progress aux-ring copy, then disables the
    /// hardware counter. A no-op if recording was never started.
    pub fn stop_recording(&self) -> Result<()> {
        if !self.recording_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.handle.wait_for_idle();
        perf_sys::ioctl_disable(perf_sys::fd_as_raw(&self.perf_fd))?;
        self.recording_enabled.store(false, Ordering::Release);
        info!("intel-pt recording stopped");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn addr_map(&self) -> &AddrMap {
        &self.addr_map
    }

    /// Stops the acquisition thread, joins the decoder worker pool,
    /// and closes the output file. A non-empty pending set at this
    /// point is an invariant violation and propagates as a fatal
    /// error (§7).
    pub fn shutdown(self) -> Result<()> {
        self.stop_recording()?;
        self.handle.stop.store(true, Ordering::Release);

        if let Some(thread) = self.acquisition_thread.lock().unwrap().take() {
            let _ = thread.join();
        }

        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }

        if let Some(output) = self.output {
            let output = Arc::try_unwrap(output)
                .map_err(|_| CollectorError::AddrMapInvariant("output writer still shared".into()))?;
            output.close()?;
        }

        if let Some(mapping_file) = &self.mapping_file {
            mapping_file
                .lock()
                .unwrap()
                .flush()
                .map_err(|source| CollectorError::FileWrite {
                    path: "<mapping>".to_string(),
                    source,
                })?;
        }

        Ok(())
    }
}

/// `"%lX, %lX\n"` of `guest_pc, host_ip + mapping_offset` (§6).
fn format_mapping_record(guest_pc: u64, host_ip: u64, mapping_offset: u64) -> String {
    let offset_host_ip = host_ip.wrapping_add(mapping_offset);
    format!("{guest_pc:X}, {offset_host_ip:X}")
}

fn spawn_decoder_workers(
    worker_count: usize,
    ring: Arc<StagingRing>,
    addr_map: Arc<AddrMap>,
    output: Arc<OutputWriter>,
    metrics: Arc<Metrics>,
) -> Vec<JoinHandle<()>> {
    (0..worker_count.max(1))
        .map(|idx| {
            let ring = Arc::clone(&ring);
            let addr_map = Arc::clone(&addr_map);
            let output = Arc::clone(&output);
            let metrics = Arc::clone(&metrics);
            std::thread::Builder::new()
                .name(format!("pt-decode-{idx}"))
                .spawn(move || decoder_worker_loop(&ring, &addr_map, &output, &metrics))
                .expect("failed to spawn decoder worker")
        })
        .collect()
}

/// `while next_job(buf, JOB_SIZE, PREAMBLE) > 0: decode_job(buf, &job); output.submit(job)` (§4.F).
fn decoder_worker_loop(
    ring: &StagingRing,
    addr_map: &AddrMap,
    output: &OutputWriter,
    metrics: &Metrics,
) {
    let mut buf = Vec::new();
    while let Some(mut job) = ring.next_job(&mut buf, JOB_SIZE, PREAMBLE) {
        decoder::decode_job_with_metrics(&buf, &mut job, addr_map, Some(metrics));
        metrics.inc_jobs_decoded();
        metrics.add_guest_pcs_logged(job.trace.len() as u64);
        if let Err(e) = output.submit(job) {
            error!("output writer error: {e}");
            return;
        }
    }
}
