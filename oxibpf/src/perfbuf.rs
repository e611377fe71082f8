//! Per-CPU `PERF_EVENT_ARRAY` consumer: opens one perf event per CPU, mmaps
//! its ring, and fans all CPUs into a single callback on a dedicated thread.

use crate::arch::Arch;
use crate::codec::get_u32_le;
use crate::error::Result;
use crate::maps::Map;
use crate::sys::{self, uapi};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const PERF_RECORD_SAMPLE: u32 = 9;
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_COUNT_SW_BPF_OUTPUT: u64 = 10;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;

/// Aggregated, atomics-backed statistics for a running consumer. Every field
/// is updated from the poll thread and readable without synchronization.
#[derive(Default)]
pub struct PerfBufStats {
    pub polls: AtomicU64,
    pub reads: AtomicU64,
    pub events_processed: AtomicU64,
    pub errors: AtomicU64,
    events_this_rollup: AtomicU64,
    events_per_second: AtomicU64,
}

impl PerfBufStats {
    /// Swap the current second's event count into `events_per_second` and
    /// reset the counter. Called once per rollup interval from the poll loop.
    pub fn rollup(&self) {
        let count = self.events_this_rollup.swap(0, Ordering::Relaxed);
        self.events_per_second.store(count, Ordering::Relaxed);
    }

    pub fn events_per_second(&self) -> u64 {
        self.events_per_second.load(Ordering::Relaxed)
    }
}

struct CpuBuf {
    perf_fd: RawFd,
    meta: *mut u8,
    data: *mut u8,
    data_size: usize,
    page_size: usize,
}

unsafe impl Send for CpuBuf {}

impl CpuBuf {
    fn data_head(&self) -> u64 {
        unsafe { std::ptr::read_volatile(self.meta as *const AtomicU64 as *const u64) }
    }

    fn data_tail(&self) -> u64 {
        let tail_ptr = unsafe { (self.meta as *mut u8).add(8) } as *const u64;
        unsafe { std::ptr::read_volatile(tail_ptr) }
    }

    fn set_data_tail(&self, v: u64) {
        let tail_ptr = unsafe { (self.meta as *mut u8).add(8) } as *mut u64;
        unsafe { std::ptr::write_volatile(tail_ptr, v) };
    }

    /// Drain every full record currently available, invoking `on_sample`
    /// for each `PERF_RECORD_SAMPLE`.
    fn drain(&self, on_sample: &mut dyn FnMut(&[u8])) -> usize {
        let mut tail = self.data_tail();
        let head = self.data_head();
        let mut delivered = 0;
        while head.wrapping_sub(tail) >= 8 {
            let offset = (tail as usize) & (self.data_size - 1);
            let hdr = self.read_n(offset, 8);
            let rec_type = get_u32_le(&hdr, 0);
            let misc_size = get_u32_le(&hdr, 4);
            let size = (misc_size >> 16) as usize;
            if size < 8 {
                break;
            }
            if rec_type == PERF_RECORD_SAMPLE {
                let payload = self.read_n((offset + 8) & (self.data_size - 1), size - 8);
                on_sample(&payload);
                delivered += 1;
            }
            tail = tail.wrapping_add(size as u64);
        }
        self.set_data_tail(tail);
        delivered
    }

    fn read_n(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let first = (self.data_size - offset).min(len);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(offset), out.as_mut_ptr(), first);
            if first < len {
                std::ptr::copy_nonoverlapping(self.data, out.as_mut_ptr().add(first), len - first);
            }
        }
        out
    }
}

impl Drop for CpuBuf {
    fn drop(&mut self) {
        let total = self.page_size + self.data_size;
        let _ = sys::munmap(self.meta as *mut libc::c_void, total);
        let _ = sys::close(self.perf_fd);
    }
}

/// A running, multi-CPU perf buffer consumer.
pub struct PerfBuf {
    cancelled: Arc<AtomicBool>,
    stats: Arc<PerfBufStats>,
    handle: Option<JoinHandle<()>>,
}

impl PerfBuf {
    /// Open one perf event per CPU in `cpus`, install each into `array_map`
    /// at its CPU index, enable all, and spawn the fan-in poll thread.
    pub fn open(
        arch: &Arch,
        array_map: &Map,
        cpus: &[u32],
        pages: u32,
        poll_interval: Duration,
        mut on_sample: impl FnMut(u32, &[u8]) + Send + 'static,
    ) -> Result<Self> {
        let page_size = arch.page_size;
        let data_size = page_size * (pages as usize);
        let mut bufs = Vec::with_capacity(cpus.len());

        for &cpu in cpus {
            let attr = uapi::PerfEventAttr {
                type_: PERF_TYPE_SOFTWARE,
                config: PERF_COUNT_SW_BPF_OUTPUT,
                sample_period: 1,
                disabled: true,
                inherit: true,
                watermark: true,
                wakeup_events: 1,
                ..Default::default()
            }
            .to_bytes();
            let perf_fd = sys::perf_event_open(arch, &attr, -1, cpu as i32, -1, 0)?;
            let total = page_size + data_size;
            let meta = sys::mmap(perf_fd, total, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, 0)?;
            let data = unsafe { (meta as *mut u8).add(page_size) };
            sys::ioctl_arg(perf_fd, PERF_EVENT_IOC_ENABLE, 0)?;

            let key = cpu.to_le_bytes();
            let value = (perf_fd as u32).to_le_bytes();
            array_map.update(arch, &key, &value, crate::maps::UpdateFlags::Any)?;

            bufs.push((cpu, CpuBuf { perf_fd, meta: meta as *mut u8, data, data_size, page_size }));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PerfBufStats::default());
        let thread_cancelled = cancelled.clone();
        let thread_stats = stats.clone();

        let handle = std::thread::spawn(move || {
            let rollup_every = Duration::from_secs(1).max(poll_interval);
            let mut elapsed = Duration::ZERO;
            while !thread_cancelled.load(Ordering::Relaxed) {
                for (cpu, buf) in &bufs {
                    let cpu = *cpu;
                    thread_stats.reads.fetch_add(1, Ordering::Relaxed);
                    let n = buf.drain(&mut |payload| on_sample(cpu, payload));
                    if n > 0 {
                        thread_stats.events_processed.fetch_add(n as u64, Ordering::Relaxed);
                        thread_stats.events_this_rollup.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
                thread_stats.polls.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(poll_interval);
                elapsed += poll_interval;
                if elapsed >= rollup_every {
                    thread_stats.rollup();
                    elapsed = Duration::ZERO;
                }
            }
        });

        Ok(PerfBuf { cancelled, stats, handle: Some(handle) })
    }

    pub fn stats(&self) -> &PerfBufStats {
        &self.stats
    }

    /// Signal shutdown and join the poll thread, bounded by `timeout`.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = tx.send(());
            });
            if rx.recv_timeout(timeout).is_err() {
                log::warn!("perf buffer poll thread did not join within {timeout:?}");
            }
        }
        Ok(())
    }
}

impl Drop for PerfBuf {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_record_sample_type_constant() {
        assert_eq!(PERF_RECORD_SAMPLE, 9);
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = PerfBufStats::default();
        assert_eq!(stats.polls.load(Ordering::Relaxed), 0);
        assert_eq!(stats.reads.load(Ordering::Relaxed), 0);
        assert_eq!(stats.events_processed.load(Ordering::Relaxed), 0);
        assert_eq!(stats.events_per_second(), 0);
    }

    #[test]
    fn rollup_swaps_this_period_count_into_events_per_second() {
        let stats = PerfBufStats::default();
        stats.events_this_rollup.fetch_add(42, Ordering::Relaxed);
        stats.rollup();
        assert_eq!(stats.events_per_second(), 42);
        // the counter that feeds the next rollup has been reset
        stats.rollup();
        assert_eq!(stats.events_per_second(), 0);
    }
}
