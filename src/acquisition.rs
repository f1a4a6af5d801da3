//! Acquisition Thread (§4.C). Owns the perf event fd and its two
//! mmap'd regions, drains the hardware aux ring as it fills, and
//! hands the bytes either to the Staging Ring (internal decode path)
//! or straight to a sidecar file (raw-capture path).
//!
//! The source ran this as a pthread pinned to CPUs 3-5, leaving 0-2
//! for the emulator (`set_trace_thead_cpu_affinity`). This version
//! does the same with `nix::sched::sched_setaffinity`, and replaces
//! the `reading_data`/`stop_thread` plain-`int` flags with atomics
//! checked from `start_recording`/`stop_recording`.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::{CollectorError, Result};
use crate::metrics::Metrics;
use crate::perf_sys::{
    self, PerfEventAttr, PerfMmap,
};
use crate::staging_ring::StagingRing;

/// CPUs reserved for the acquisition thread, leaving the low CPUs for
/// the emulator (recording.c's `set_trace_thead_cpu_affinity`).
const ACQUISITION_CPUS: std::ops::Range<usize> = 3..6;
const EMULATOR_CPUS: std::ops::Range<usize> = 0..3;

/// Backpressure threshold: don't start a new drain copy unless the
/// ring has at least this much headroom (§4.B).
const BACKPRESSURE_THRESHOLD: usize = 64 * 1024;

pub enum Sink {
    Ring(Arc<StagingRing>),
    Sidecar(File),
}

/// Shared flags the controller uses to coordinate start/stop with the
/// acquisition thread without it ever touching a mutex on the hot
/// path (§4.F "Start/Stop hooks").
pub struct AcquisitionHandle {
    pub stop: Arc<AtomicBool>,
    pub reading: Arc<AtomicBool>,
}

impl AcquisitionHandle {
    /// Busy-waits for an in-progress copy to finish, mirroring the
    /// source's `wait_for_pt_thread` spin.
    pub fn wait_for_idle(&self) {
        while self.reading.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
}

pub fn pin_acquisition_thread() -> Result<()> {
    let mut set = CpuSet::new();
    for cpu in ACQUISITION_CPUS {
        set.set(cpu).map_err(|e| {
            CollectorError::Config(format!("invalid cpu {cpu} in affinity set: {e}"))
        })?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| CollectorError::Config(format!("failed to pin acquisition thread: {e}")))
}

pub fn pin_current_thread_to_emulator_cpus() -> Result<()> {
    let mut set = CpuSet::new();
    for cpu in EMULATOR_CPUS {
        set.set(cpu).map_err(|e| {
            CollectorError::Config(format!("invalid cpu {cpu} in affinity set: {e}"))
        })?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| CollectorError::Config(format!("failed to pin emulator thread: {e}")))
}

/// Opens the Intel PT perf event and maps its data/aux regions.
/// Fatal on any failure (§7: resource errors are fatal at startup).
pub fn open_perf_event() -> Result<(File, PerfMmap)> {
    let perf_type = perf_sys::read_intel_pt_perf_type()?;
    let attr = PerfEventAttr::for_intel_pt(perf_type);
    let fd = perf_sys::perf_event_open(&attr, perf_sys::current_pid(), -1)?;
    let mmap = PerfMmap::map(perf_sys::fd_as_raw(&fd))?;
    Ok((fd, mmap))
}

/// Runs the steady-state drain loop until `stop` is raised, copying
/// newly-available aux-ring bytes into `sink` as they appear.
///
/// Mirrors `record_pt_data_to_trace_file` / `record_pt_data_to_internal_memory`:
/// poll `aux_head`, compute the wrapped head/tail pair, copy one or
/// two contiguous spans, publish the new `aux_tail`, and clear the
/// `reading` flag once the copy is committed.
pub fn drain_loop(
    mmap: &PerfMmap,
    mut sink: Sink,
    handle: &AcquisitionHandle,
    metrics: &Metrics,
) -> Result<()> {
    let mut last_head: u64 = 0;
    let size = mmap.aux_size();
    // A reused scratch buffer for one drain's worth of aux bytes, the
    // same shape as the per-connection scratch slots `stream_listener`
    // keeps for its read loop.
    let mut scratch = bytes::BytesMut::with_capacity(size as usize);

    loop {
        let head = mmap.read_aux_head();

        if head == last_head {
            if handle.stop.load(Ordering::Acquire) {
                break;
            }
            std::hint::spin_loop();
            continue;
        }

        if let Sink::Ring(ring) = &sink {
            while !ring.has_headroom(BACKPRESSURE_THRESHOLD) {
                metrics.inc_ring_backpressure_stall();
                std::thread::yield_now();
            }
        }

        handle.reading.store(true, Ordering::Release);

        let wrapped_head = (head % size) as usize;
        let wrapped_tail = (last_head % size) as usize;

        scratch.clear();
        if wrapped_head > wrapped_tail {
            scratch.extend_from_slice(mmap.read_aux(wrapped_tail, wrapped_head - wrapped_tail));
        } else {
            scratch.extend_from_slice(mmap.read_aux(wrapped_tail, size as usize - wrapped_tail));
            scratch.extend_from_slice(mmap.read_aux(0, wrapped_head));
        }

        match &mut sink {
            Sink::Ring(ring) => ring.push(&scratch),
            Sink::Sidecar(file) => file
                .write_all(&scratch)
                .map_err(|source| CollectorError::FileWrite {
                    path: "<sidecar>".to_string(),
                    source,
                })?,
        }
        metrics.add_bytes_drained(scratch.len() as u64);

        last_head = head;
        mmap.publish_aux_tail(head);

        handle.reading.store(false, Ordering::Release);
    }

    if let Sink::Ring(ring) = &sink {
        ring.signal_end_of_stream();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_handle_wait_for_idle_returns_once_flag_clears() {
        let handle = AcquisitionHandle {
            stop: Arc::new(AtomicBool::new(false)),
            reading: Arc::new(AtomicBool::new(false)),
        };
        // Not reading: must return immediately rather than hang.
        handle.wait_for_idle();
    }

    #[test]
    fn backpressure_threshold_leaves_room_in_a_16mb_ring() {
        assert!(BACKPRESSURE_THRESHOLD < 16 * 1024 * 1024);
    }
}
