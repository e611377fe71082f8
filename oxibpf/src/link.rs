//! Link handles: a uniform wrapper around a `BPF_LINK_CREATE` fd. Closing a
//! link atomically detaches the program from its target in the kernel,
//! unlike perf-based attachments which need an explicit disable step.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::sys::{self, uapi};
use std::ffi::CString;
use std::os::fd::RawFd;

pub const BPF_LSM_MAC: u32 = 29;
pub const BPF_TRACE_KPROBE_MULTI: u32 = 32;

/// An owned `BPF_LINK_CREATE` fd.
pub struct Link {
    fd: RawFd,
}

impl Link {
    /// Create an LSM link: `BPF_LINK_CREATE` with `attach_type=BPF_LSM_MAC`
    /// and the target BTF id the program was verified against.
    pub fn create_lsm(arch: &Arch, prog_fd: RawFd, attach_btf_id: u32) -> Result<Self> {
        let mut buf = [0u8; uapi::BPF_ATTR_SIZE];
        crate::codec::put_u32_le(&mut buf, 0, prog_fd as u32);
        crate::codec::put_u32_le(&mut buf, 8, BPF_LSM_MAC);
        crate::codec::put_u32_le(&mut buf, 16, attach_btf_id); // link_create.target_btf_id
        let fd = sys::bpf(arch, uapi::BPF_LINK_CREATE, &buf)? as RawFd;
        log::info!("created LSM link fd={fd} target_btf_id={attach_btf_id}");
        Ok(Link { fd })
    }

    /// Create a kprobe-multi link: `BPF_LINK_CREATE` with
    /// `attach_type=BPF_TRACE_KPROBE_MULTI`, attaching to every symbol in
    /// `symbols` at once. `flags` bit 0 selects return-probe semantics.
    pub fn create_kprobe_multi(arch: &Arch, prog_fd: RawFd, symbols: &[String], flags: u32) -> Result<Self> {
        let cstrs = symbols
            .iter()
            .map(|s| CString::new(s.as_str()).map_err(|_| Error::UsageError("symbol name contains NUL".into())))
            .collect::<Result<Vec<_>>>()?;
        let ptrs: Vec<u64> = cstrs.iter().map(|c| c.as_ptr() as u64).collect();
        let attr = uapi::LinkCreateKprobeMultiAttr {
            prog_fd: prog_fd as u32,
            attach_type: BPF_TRACE_KPROBE_MULTI,
            flags: 0,
            kprobe_multi_flags: flags,
            cnt: ptrs.len() as u32,
            syms_ptr: ptrs.as_ptr() as u64,
        }
        .to_bytes();
        let fd = sys::bpf(arch, uapi::BPF_LINK_CREATE, &attr)? as RawFd;
        log::info!("created kprobe-multi link fd={fd} symbols={}", symbols.len());
        Ok(Link { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Hand the fd to a caller that takes over its lifetime (e.g. storing it
    /// in a `Program`'s attachment list), bypassing this wrapper's `Drop`.
    pub fn into_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = sys::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsm_attach_type_constant() {
        assert_eq!(BPF_LSM_MAC, 29);
        assert_eq!(BPF_TRACE_KPROBE_MULTI, 32);
    }
}
