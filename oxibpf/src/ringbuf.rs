//! `BPF_MAP_TYPE_RINGBUF` consumer: maps the kernel's producer/consumer ring
//! protocol and turns committed records into a pull-based iterator.
//!
//! Layout: one page for the consumer position (read-write), followed by one
//! page for the producer position plus the data region (read-only from
//! user space). The data region's size is a power of two, so wrap-around
//! addressing is a bit-mask rather than a modulo.

use crate::arch::Arch;
use crate::codec::{align8, get_u32_le};
use crate::error::{Error, Result};
use crate::sys;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const BUSY_BIT: u32 = 0x8000_0000;
const DISCARD_BIT: u32 = 0x4000_0000;
const LEN_MASK: u32 = 0x0fff_ffff;
const HEADER_SIZE: usize = 8;

/// A live mapping over a ring-buffer map's fd.
pub struct RingBuf {
    map_fd: RawFd,
    consumer_page: *mut u8,
    producer_region: *mut u8,
    data_size: usize,
    page_size: usize,
    cancelled: Arc<AtomicBool>,
}

// The mapped regions are only ever touched through atomic/volatile accessors
// below, so sharing the handle across the one reader thread it's designed
// for is sound.
unsafe impl Send for RingBuf {}

impl RingBuf {
    /// `data_size` must already be a power of two (the map's `max_entries`).
    pub fn open(arch: &Arch, map_fd: RawFd, data_size: usize) -> Result<Self> {
        if !data_size.is_power_of_two() {
            return Err(Error::UsageError(format!("ring buffer data_size {data_size} is not a power of two")));
        }
        let page_size = arch.page_size;
        let consumer_ptr = sys::mmap(map_fd, page_size, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED, 0)?;
        let producer_len = page_size + data_size;
        let producer_ptr = match sys::mmap(map_fd, producer_len, libc::PROT_READ, libc::MAP_SHARED, page_size as i64) {
            Ok(p) => p,
            Err(e) => {
                let _ = sys::munmap(consumer_ptr, page_size);
                return Err(e);
            }
        };
        Ok(RingBuf {
            map_fd,
            consumer_page: consumer_ptr as *mut u8,
            producer_region: producer_ptr as *mut u8,
            data_size,
            page_size,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn consumer_pos(&self) -> &AtomicU64 {
        unsafe { &*(self.consumer_page as *const AtomicU64) }
    }

    fn producer_pos(&self) -> &AtomicU64 {
        unsafe { &*(self.producer_region as *const AtomicU64) }
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { self.producer_region.add(self.page_size) }
    }

    /// Drain every currently-committed record, invoking `on_record` for each
    /// non-discarded payload. Stops at the first BUSY record (still being
    /// written by the producer).
    pub fn poll_batch(&self, mut on_record: impl FnMut(&[u8])) -> Result<usize> {
        let mut consumer = self.consumer_pos().load(Ordering::Relaxed);
        let producer = self.producer_pos().load(Ordering::Acquire);
        let mut delivered = 0usize;

        while producer.wrapping_sub(consumer) >= HEADER_SIZE as u64 {
            let offset = (consumer as usize) & (self.data_size - 1);
            let header = read_header(self.data_ptr(), offset);
            if header & BUSY_BIT != 0 {
                break;
            }
            let record_len = (header & LEN_MASK) as usize;
            let discard = header & DISCARD_BIT != 0;
            if record_len == 0 && !discard {
                return Err(Error::ProtocolViolation { detail: "committed record has zero length".into() });
            }
            let aligned_len = align8(record_len);
            let total = HEADER_SIZE + aligned_len;

            if total as u64 > producer.wrapping_sub(consumer) {
                return Err(Error::ProtocolViolation {
                    detail: format!("record length {record_len} exceeds available bytes"),
                });
            }

            if !discard {
                let payload_off = (offset + HEADER_SIZE) & (self.data_size - 1);
                let payload = read_payload(self.data_ptr(), self.data_size, payload_off, record_len);
                on_record(&payload);
                delivered += 1;
            }

            consumer = consumer.wrapping_add(total as u64);
        }

        self.consumer_pos().store(consumer, Ordering::Release);
        Ok(delivered)
    }

    /// Block (via epoll) until more data is available or `timeout_ms`
    /// elapses, or the cancellation flag is set.
    pub fn wait(&self, timeout_ms: i32) -> Result<bool> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(Error::syscall_failed("epoll_create1", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: 0 };
        let ctl = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, self.map_fd, &mut ev) };
        if ctl < 0 {
            unsafe { libc::close(epfd) };
            return Err(Error::syscall_failed("epoll_ctl", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 1];
        let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), 1, timeout_ms) };
        unsafe { libc::close(epfd) };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                return Ok(false);
            }
            return Err(Error::syscall_failed("epoll_wait", errno));
        }
        Ok(n > 0)
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Drop for RingBuf {
    fn drop(&mut self) {
        let _ = sys::munmap(self.consumer_page as *mut libc::c_void, self.page_size);
        let _ = sys::munmap(self.producer_region as *mut libc::c_void, self.page_size + self.data_size);
    }
}

fn read_header(data: *const u8, offset: usize) -> u32 {
    let ptr = unsafe { data.add(offset) } as *const u32;
    unsafe { std::ptr::read_volatile(ptr) }
}

/// Copy `len` bytes starting at `offset` within a `size`-byte ring,
/// coalescing into at most two bulk copies across the wrap point.
fn read_payload(data: *const u8, size: usize, offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let first = (size - offset).min(len);
    unsafe {
        std::ptr::copy_nonoverlapping(data.add(offset), out.as_mut_ptr(), first);
        if first < len {
            std::ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), len - first);
        }
    }
    out
}
