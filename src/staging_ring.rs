//! Lock-protected circular byte buffer between the acquisition thread
//! and the decoder worker pool (§4.B).
//!
//! The source moved this much the same way but blocked on `volatile`
//! flags polled in a spin loop. Per the re-architecture notes this
//! version uses a `Mutex` guarding the cursors/live-count plus two
//! `Condvar`s (`not_full` for `push`, `not_empty` for `next_job`) so
//! both blocking points park instead of spinning.

use std::sync::{Condvar, Mutex};

/// A contiguous byte range handed to one decoder worker, identified by
/// absolute offsets in the conceptual infinite consumed-byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub start_offset: u64,
    pub end_offset: u64,
    pub trace: Vec<u64>,
}

impl Job {
    fn new(start_offset: u64, end_offset: u64) -> Self {
        Self {
            start_offset,
            end_offset,
            trace: Vec::new(),
        }
    }

    /// Appends a guest PC to the trace, growing by doubling when full —
    /// mirrors the source's manual `realloc`-and-double growth.
    pub fn push_pc(&mut self, pc: u64) {
        if self.trace.len() == self.trace.capacity() {
            let new_cap = (self.trace.capacity() * 2).max(16);
            self.trace.reserve(new_cap - self.trace.capacity());
        }
        self.trace.push(pc);
    }
}

struct Inner {
    buf: Vec<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    live: usize,
    total_consumed: u64,
    end_of_stream: bool,
}

pub struct StagingRing {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl StagingRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "staging ring capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                capacity,
                head: 0,
                tail: 0,
                live: 0,
                total_consumed: 0,
                end_of_stream: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `bytes` to the ring, blocking until enough free space
    /// exists. Only the acquisition thread may call this.
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        loop {
            let free = inner.capacity - inner.live;
            if free >= bytes.len() {
                break;
            }
            inner = self.not_full.wait(inner).unwrap();
        }

        let cap = inner.capacity;
        let head = inner.head;
        let first_len = (cap - head).min(bytes.len());
        inner.buf[head..head + first_len].copy_from_slice(&bytes[..first_len]);
        if first_len < bytes.len() {
            let remaining = bytes.len() - first_len;
            inner.buf[0..remaining].copy_from_slice(&bytes[first_len..]);
        }
        inner.head = (head + bytes.len()) % cap;
        inner.live += bytes.len();
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Non-blocking predicate: is there at least `threshold` bytes of
    /// free space right now? The acquisition thread checks this before
    /// draining a new chunk from the hardware aux ring and pauses
    /// (outside this type) until it becomes true.
    pub fn has_headroom(&self, threshold: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.capacity - inner.live >= threshold
    }

    /// Blocks until either a full `(job_size + preamble)` window of
    /// live bytes is available, or end-of-stream has been signalled.
    /// Returns `None` once the stream has ended and the ring is
    /// drained dry.
    pub fn next_job(&self, out_buf: &mut Vec<u8>, job_size: usize, preamble: usize) -> Option<Job> {
        let window = job_size + preamble;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.live >= window {
                let job = self.copy_full_window(&mut inner, job_size, preamble, out_buf);
                drop(inner);
                self.not_full.notify_all();
                return Some(job);
            }
            if inner.end_of_stream {
                if inner.live == 0 {
                    return None;
                }
                let job = self.copy_tail_remainder(&mut inner, out_buf);
                drop(inner);
                self.not_full.notify_all();
                return Some(job);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    fn copy_full_window(
        &self,
        inner: &mut Inner,
        job_size: usize,
        preamble: usize,
        out_buf: &mut Vec<u8>,
    ) -> Job {
        let window = job_size + preamble;
        out_buf.clear();
        out_buf.reserve(window);
        self.copy_from_tail(inner, window, out_buf);

        let start = inner.total_consumed;
        let end = start + job_size as u64;
        inner.tail = (inner.tail + job_size) % inner.capacity;
        inner.live -= job_size;
        inner.total_consumed = end;
        Job::new(start, end)
    }

    fn copy_tail_remainder(&self, inner: &mut Inner, out_buf: &mut Vec<u8>) -> Job {
        let live = inner.live;
        out_buf.clear();
        out_buf.reserve(live);
        self.copy_from_tail(inner, live, out_buf);

        let start = inner.total_consumed;
        let end = start + live as u64;
        inner.tail = (inner.tail + live) % inner.capacity;
        inner.live = 0;
        inner.total_consumed = end;
        Job::new(start, end)
    }

    /// Copies `len` bytes starting at the current tail into `out_buf`,
    /// splitting into two contiguous spans if they straddle the end
    /// of the backing storage.
    fn copy_from_tail(&self, inner: &Inner, len: usize, out_buf: &mut Vec<u8>) {
        let cap = inner.capacity;
        let tail = inner.tail;
        let first_len = (cap - tail).min(len);
        out_buf.extend_from_slice(&inner.buf[tail..tail + first_len]);
        if first_len < len {
            let remaining = len - first_len;
            out_buf.extend_from_slice(&inner.buf[0..remaining]);
        }
    }

    /// Signals that no more bytes will ever be pushed. Called once,
    /// when acquisition terminates.
    pub fn signal_end_of_stream(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.end_of_stream = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn total_consumed(&self) -> u64 {
        self.inner.lock().unwrap().total_consumed
    }
}


#[cfg(test)]
impl StagingRing {
    /// Test-only helper that drains `len` bytes without respecting job
    /// framing, used to set up wrap-around fixtures.
    fn next_job_peek(&self, out_buf: &mut Vec<u8>, len: usize) -> Option<Job> {
        self.next_job(out_buf, len, 0)
    }
}
