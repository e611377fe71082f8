//! CPU architecture probing: syscall numbers, page size, endianness, and a
//! best-effort CAP_BPF check. Everything here is a one-shot environment read,
//! the same spirit as the BTF offset derivation this crate's teacher performs
//! once at startup and then treats as immutable for the process lifetime.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Syscall numbers and machine facts for the architecture this process is
/// running on. Constructed once via [`Arch::detect`].
#[derive(Debug, Clone, Copy)]
pub struct Arch {
    pub bpf_nr: i64,
    pub perf_event_open_nr: i64,
    pub page_size: usize,
    pub endian: Endian,
    pub pointer_width: u8,
}

impl Arch {
    /// Detect the running architecture's syscall table. Fails with
    /// [`Error::ArchUnsupported`] on architectures this crate has no table
    /// for.
    pub fn detect() -> Result<Self> {
        let (bpf_nr, perf_event_open_nr) = syscall_numbers()?;
        let page_size = sysconf_page_size();
        Ok(Arch {
            bpf_nr,
            perf_event_open_nr,
            page_size,
            endian: native_endian(),
            pointer_width: (std::mem::size_of::<usize>() * 8) as u8,
        })
    }

    /// Round `n` up to the next multiple of the page size.
    pub fn round_to_page(&self, n: usize) -> usize {
        let p = self.page_size;
        (n + p - 1) & !(p - 1)
    }
}

#[cfg(target_arch = "x86_64")]
fn syscall_numbers() -> Result<(i64, i64)> {
    Ok((321, 298))
}

#[cfg(target_arch = "aarch64")]
fn syscall_numbers() -> Result<(i64, i64)> {
    Ok((280, 241))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn syscall_numbers() -> Result<(i64, i64)> {
    Err(Error::ArchUnsupported(std::env::consts::ARCH.to_string()))
}

fn sysconf_page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

fn native_endian() -> Endian {
    if cfg!(target_endian = "little") {
        Endian::Little
    } else {
        Endian::Big
    }
}

/// Parse `/proc/sys/kernel/osrelease` into the packed `(a<<16)|(b<<8)|c`
/// kernel version form used by `bpf_attr.kern_version`.
pub fn kernel_version() -> Result<u32> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
    parse_kernel_version(raw.trim())
}

fn parse_kernel_version(s: &str) -> Result<u32> {
    let core = s.split(|c: char| !c.is_ascii_digit() && c != '.').next().unwrap_or(s);
    let mut parts = core.split('.');
    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::UsageError(format!("unparsable kernel release: {s}")))?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major << 16) | (minor << 8) | patch)
}

/// Best-effort check for CAP_BPF (bit 39) in `/proc/self/status`'s CapEff.
/// Never fails the caller: absence of the capability is logged, not an
/// error, since many attach paths work fine without it on permissive
/// kernels.
pub fn has_cap_bpf() -> bool {
    const CAP_BPF_BIT: u64 = 39;
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(s) => s,
        Err(e) => {
            log::warn!("could not read /proc/self/status to check CAP_BPF: {e}");
            return false;
        }
    };
    for line in status.lines() {
        if let Some(hex) = line.strip_prefix("CapEff:") {
            if let Ok(mask) = u64::from_str_radix(hex.trim(), 16) {
                let has = mask & (1 << CAP_BPF_BIT) != 0;
                if !has {
                    log::warn!("CAP_BPF not present in effective capability set");
                }
                return has;
            }
        }
    }
    log::warn!("CapEff line not found in /proc/self/status");
    false
}
