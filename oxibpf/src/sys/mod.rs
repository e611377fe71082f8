//! Raw syscall façade. Every wrapper here marshals a UAPI struct, invokes
//! the syscall via `libc::syscall`, and turns a negative return into a
//! typed, classified [`Error`]. Nothing above this module ever calls
//! `libc::syscall` directly.

pub mod uapi;

use crate::arch::Arch;
use crate::error::{Error, Result};
use std::os::fd::RawFd;

/// Invoke the `bpf()` multiplexed syscall with a 128-byte `bpf_attr` buffer.
/// Returns the raw (non-negative) return value, which is an fd for most
/// commands and 0 for others.
pub fn bpf(arch: &Arch, cmd: i32, attr: &[u8; uapi::BPF_ATTR_SIZE]) -> Result<i64> {
    log::trace!("bpf(cmd={cmd})");
    let ret = unsafe {
        libc::syscall(arch.bpf_nr, cmd as libc::c_long, attr.as_ptr(), attr.len() as libc::c_ulong)
    };
    if ret < 0 {
        let errno = last_errno();
        log::warn!("bpf(cmd={cmd}) failed: errno={errno}");
        return Err(Error::syscall_failed("bpf", errno));
    }
    log::debug!("bpf(cmd={cmd}) -> {ret}");
    Ok(ret)
}

/// Like [`bpf`] but for `BPF_PROG_LOAD`, where a non-empty log buffer on
/// failure should be surfaced as a [`Error::VerifierRejection`] rather than
/// a bare syscall error. A `Resource` failure (e.g. `ENOSPC`) is passed
/// through unconverted: it means the log buffer itself was too small, and
/// the caller grows it and retries before giving up.
pub fn bpf_prog_load(
    arch: &Arch,
    attr: &[u8; uapi::BPF_ATTR_SIZE],
    name: &str,
    log_buf: &[u8],
) -> Result<i64> {
    match bpf(arch, uapi::BPF_PROG_LOAD, attr) {
        Ok(fd) => Ok(fd),
        Err(e @ Error::SyscallFailed { kind: crate::error::ErrnoKind::Resource, .. }) => Err(e),
        Err(e) => {
            let log_str = String::from_utf8_lossy(log_buf);
            let log_str = log_str.trim_end_matches('\0');
            if !log_str.is_empty() {
                return Err(Error::VerifierRejection { name: name.to_string(), log: log_str.to_string() });
            }
            Err(e)
        }
    }
}

pub fn perf_event_open(
    arch: &Arch,
    attr: &[u8; uapi::PERF_EVENT_ATTR_SIZE],
    pid: libc::pid_t,
    cpu: i32,
    group_fd: RawFd,
    flags: u64,
) -> Result<RawFd> {
    log::trace!("perf_event_open(pid={pid}, cpu={cpu})");
    let ret = unsafe {
        libc::syscall(
            arch.perf_event_open_nr,
            attr.as_ptr(),
            pid as libc::c_long,
            cpu as libc::c_long,
            group_fd as libc::c_long,
            flags as libc::c_ulong,
        )
    };
    if ret < 0 {
        let errno = last_errno();
        log::warn!("perf_event_open(pid={pid}, cpu={cpu}) failed: errno={errno}");
        return Err(Error::syscall_failed("perf_event_open", errno));
    }
    log::debug!("perf_event_open(pid={pid}, cpu={cpu}) -> {ret}");
    Ok(ret as RawFd)
}

/// Map `len` bytes of `fd` at `offset`. Returns the mapped pointer.
pub fn mmap(fd: RawFd, len: usize, prot: i32, flags: i32, offset: i64) -> Result<*mut libc::c_void> {
    log::trace!("mmap(fd={fd}, len={len})");
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, fd, offset) };
    if ptr == libc::MAP_FAILED {
        let errno = last_errno();
        log::warn!("mmap(fd={fd}, len={len}) failed: errno={errno}");
        return Err(Error::syscall_failed("mmap", errno));
    }
    Ok(ptr)
}

pub fn munmap(ptr: *mut libc::c_void, len: usize) -> Result<()> {
    let ret = unsafe { libc::munmap(ptr, len) };
    if ret != 0 {
        let errno = last_errno();
        log::warn!("munmap failed: errno={errno}");
        return Err(Error::syscall_failed("munmap", errno));
    }
    Ok(())
}

/// `ioctl` with a single integer argument, e.g. `PERF_EVENT_IOC_ENABLE`.
pub fn ioctl_arg(fd: RawFd, request: libc::c_ulong, arg: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret < 0 {
        let errno = last_errno();
        log::warn!("ioctl(fd={fd}, request={request}) failed: errno={errno}");
        return Err(Error::syscall_failed("ioctl", errno));
    }
    Ok(())
}

pub fn close(fd: RawFd) -> Result<()> {
    let ret = unsafe { libc::close(fd) };
    if ret != 0 {
        let errno = last_errno();
        log::warn!("close(fd={fd}) failed: errno={errno}");
        return Err(Error::syscall_failed("close", errno));
    }
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_invalid_fd_is_classified_as_error() {
        let err = close(-1).unwrap_err();
        assert!(matches!(err, Error::SyscallFailed { .. }));
    }

    #[test]
    fn mmap_zero_len_rejected_by_kernel() {
        let err = mmap(-1, 0, libc::PROT_READ, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, 0);
        assert!(err.is_err());
    }
}
