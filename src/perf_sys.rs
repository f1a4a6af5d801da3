//! Raw `perf_event_open(2)` / mmap plumbing for the Intel-PT aux ring
//! (§6 "Perf interface"). This is the only module that talks to the
//! kernel directly; everything above it works in terms of
//! `PerfEventMmapPage` field reads and the two mapped regions.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::io::FromRawFd;
use std::ptr;

use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};

use crate::error::{CollectorError, Result};

pub const INTEL_PT_TYPE_PATH: &str = "/sys/bus/event_source/devices/intel_pt/type";

pub const DATA_PAGES: u64 = 256;
pub const AUX_PAGES: u64 = 1024;

/// `0010000000000001`: disables return-compression in the PT packet
/// stream, matching the source's literal `config` value.
pub const INTEL_PT_CONFIG: u64 = 0x2001;

const PERF_EVENT_IOC_ENABLE: c_ulong = ioc_none(b'$', 0);
const PERF_EVENT_IOC_DISABLE: c_ulong = ioc_none(b'$', 1);

const IOC_NRBITS: c_ulong = 8;
const IOC_TYPEBITS: c_ulong = 8;
const IOC_SIZEBITS: c_ulong = 14;
const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;

const fn ioc_none(kind: u8, nr: c_ulong) -> c_ulong {
    (0 << IOC_DIRSHIFT) | ((kind as c_ulong) << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config: u64,
    pub bp_len_or_config: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
}

/// Bit layout of `perf_event_attr.flags` used by the fields this
/// collector sets: `disabled`, `exclude_kernel`, `exclude_hv`, and the
/// two-bit `precise_ip`.
mod attr_flags {
    pub const DISABLED: u64 = 1 << 0;
    pub const EXCLUDE_KERNEL: u64 = 1 << 5;
    pub const EXCLUDE_HV: u64 = 1 << 6;
    pub const PRECISE_IP_SHIFT: u64 = 15;
}

impl PerfEventAttr {
    /// Builds the attr the source sets in `trace_thread_proc`: disabled
    /// at open, user-mode only, precise_ip=2, intel_pt config bits.
    pub fn for_intel_pt(perf_type: u32) -> Self {
        let mut flags = attr_flags::DISABLED | attr_flags::EXCLUDE_KERNEL | attr_flags::EXCLUDE_HV;
        flags |= 2u64 << attr_flags::PRECISE_IP_SHIFT;

        Self {
            kind: perf_type,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: INTEL_PT_CONFIG,
            sample_period_or_freq: 0,
            sample_type: 0,
            read_format: 0,
            flags,
            wakeup_events_or_watermark: 0,
            bp_type: 0,
            bp_addr_or_config: 0,
            bp_len_or_config: 0,
            branch_sample_type: 0,
            sample_regs_user: 0,
            sample_stack_user: 0,
            clock_id: 0,
        }
    }
}

#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved: [u8; 118 * 8 + 4],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Reads the dynamic Intel PT perf event type from sysfs (§6).
pub fn read_intel_pt_perf_type() -> Result<u32> {
    let mut file = File::open(INTEL_PT_TYPE_PATH).map_err(|source| CollectorError::SysfsRead {
        path: INTEL_PT_TYPE_PATH.to_string(),
        source,
    })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| CollectorError::SysfsRead {
            path: INTEL_PT_TYPE_PATH.to_string(),
            source,
        })?;
    contents.trim().parse::<u32>().map_err(|_| {
        CollectorError::SysfsRead {
            path: INTEL_PT_TYPE_PATH.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "non-numeric type"),
        }
    })
}

pub fn perf_event_open(attr: &PerfEventAttr, pid: pid_t, cpu: c_int) -> Result<File> {
    let fd = unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            -1i32,
            0u64,
        ) as RawFd
    };
    if fd < 0 {
        return Err(CollectorError::PerfOpen(std::io::Error::last_os_error()));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

pub fn ioctl_enable(fd: RawFd) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE as _) };
    if ret == -1 {
        return Err(CollectorError::PerfOpen(std::io::Error::last_os_error()));
    }
    Ok(())
}

pub fn ioctl_disable(fd: RawFd) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_DISABLE as _) };
    if ret == -1 {
        return Err(CollectorError::PerfOpen(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Queried once via `sysconf(_SC_PAGESIZE)` rather than hardcoded,
/// mirroring the lazily-computed process-wide statics the teacher
/// keeps for values that are cheap to cache but not truly constant
/// (`HOSTNAME` in `stream_listener.rs`).
static PAGE_SIZE: once_cell::sync::Lazy<u64> = once_cell::sync::Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
});

/// Owns the two mmap regions backing a perf event: the header+data
/// region at file offset 0, and the aux region at the header-published
/// `aux_offset`. Unmaps both on drop.
pub struct PerfMmap {
    base_ptr: *mut libc::c_void,
    base_len: usize,
    aux_ptr: *mut libc::c_void,
    aux_len: usize,
}

unsafe impl Send for PerfMmap {}

impl PerfMmap {
    pub fn map(fd: RawFd) -> Result<Self> {
        let base_len = ((DATA_PAGES + 1) * *PAGE_SIZE) as usize;
        let base_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                base_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base_ptr == libc::MAP_FAILED {
            return Err(CollectorError::Mmap {
                region: "data",
                source: std::io::Error::last_os_error(),
            });
        }

        let header = base_ptr as *mut PerfEventMmapPage;
        let data_offset = unsafe { (*header).data_offset };
        let data_size = unsafe { (*header).data_size };
        let aux_size = AUX_PAGES * *PAGE_SIZE;

        unsafe {
            (*header).aux_offset = data_offset + data_size;
            (*header).aux_size = aux_size;
        }
        let aux_offset = unsafe { (*header).aux_offset };

        let aux_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aux_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                aux_offset as libc::off_t,
            )
        };
        if aux_ptr == libc::MAP_FAILED {
            unsafe {
                libc::munmap(base_ptr, base_len);
            }
            return Err(CollectorError::Mmap {
                region: "aux",
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(Self {
            base_ptr,
            base_len,
            aux_ptr,
            aux_len: aux_size as usize,
        })
    }

    pub fn header(&self) -> &PerfEventMmapPage {
        unsafe { &*(self.base_ptr as *const PerfEventMmapPage) }
    }

    /// Reads `aux_head` with an acquire barrier, per §4.C/§6.
    pub fn read_aux_head(&self) -> u64 {
        let header = self.base_ptr as *const PerfEventMmapPage;
        unsafe {
            let ptr = ptr::addr_of!((*header).aux_head);
            let value = ptr::read_volatile(ptr);
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
            value
        }
    }

    /// Publishes a new `aux_tail` using the source's `0->0` CAS
    /// followed by an `old->head` CAS, with a release barrier first.
    pub fn publish_aux_tail(&self, new_tail: u64) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        let header = self.base_ptr as *mut PerfEventMmapPage;
        unsafe {
            let ptr = ptr::addr_of_mut!((*header).aux_tail) as *mut u64 as *const std::sync::atomic::AtomicU64;
            let atomic = &*ptr;
            let mut old = atomic.load(std::sync::atomic::Ordering::Relaxed);
            loop {
                match atomic.compare_exchange(
                    old,
                    new_tail,
                    std::sync::atomic::Ordering::Release,
                    std::sync::atomic::Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => old = observed,
                }
            }
        }
    }

    pub fn aux_size(&self) -> u64 {
        self.header().aux_size
    }

    /// Reads `len` bytes starting at byte offset `offset` in the aux
    /// region. Caller is responsible for wrap-around splitting.
    pub fn read_aux(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.aux_len);
        unsafe { std::slice::from_raw_parts((self.aux_ptr as *const u8).add(offset), len) }
    }
}

impl Drop for PerfMmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.aux_ptr, self.aux_len);
            libc::munmap(self.base_ptr, self.base_len);
        }
    }
}

pub fn current_pid() -> pid_t {
    std::process::id() as pid_t
}

pub fn fd_as_raw(file: &File) -> RawFd {
    file.as_raw_fd()
}
