//! Program lifecycle: load (with optional verifier log), attach to any of
//! the supported hook types, detach, pin.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::netlink::{self, XdpMode};
use crate::sys::{self, uapi};
use std::ffi::CString;
use std::fs;
use std::os::fd::RawFd;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgType {
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    RawTracepoint = 17,
    Lsm = 29,
}

pub const LOG_LEVEL_VERBOSE: u32 = 1;
const DEFAULT_LOG_SIZE: usize = 64 * 1024;
const MAX_LOG_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProgSpec {
    pub prog_type: ProgType,
    pub name: String,
    pub license: String,
    pub log_level: u32,
}

/// A loaded, owned BPF program and its live attachments.
pub struct Program {
    fd: RawFd,
    spec: ProgSpec,
    attachments: Vec<Attachment>,
}

impl Program {
    pub fn load(arch: &Arch, spec: ProgSpec, bytecode: &[u8]) -> Result<Self> {
        let insn_cnt = (bytecode.len() / crate::insn::INSN_SIZE) as u32;
        let license = CString::new(spec.license.as_str()).map_err(|_| Error::UsageError("license contains NUL".into()))?;
        let kern_version = crate::arch::kernel_version().unwrap_or(0);

        let mut log_size = if spec.log_level > 0 { DEFAULT_LOG_SIZE } else { 0 };
        loop {
            let mut log_buf = vec![0u8; log_size];
            let attr = uapi::ProgLoadAttr {
                prog_type: spec.prog_type as u32,
                insn_cnt,
                insns_ptr: bytecode.as_ptr() as u64,
                license_ptr: license.as_ptr() as u64,
                log_level: spec.log_level,
                log_size: log_size as u32,
                log_buf: if log_size > 0 { log_buf.as_mut_ptr() as u64 } else { 0 },
                kern_version,
                ..Default::default()
            }
            .to_bytes(&spec.name);

            match sys::bpf_prog_load(arch, &attr, &spec.name, &log_buf) {
                Ok(fd) => {
                    log::info!("loaded program `{}` type={:?} fd={fd}", spec.name, spec.prog_type);
                    return Ok(Program { fd: fd as RawFd, spec, attachments: Vec::new() });
                }
                Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::Resource, .. }) if log_size < MAX_LOG_SIZE => {
                    log_size = (log_size * 2).max(DEFAULT_LOG_SIZE).min(MAX_LOG_SIZE);
                    continue;
                }
                Err(e @ Error::SyscallFailed { kind: crate::error::ErrnoKind::Resource, .. }) => {
                    // Retry budget exhausted at MAX_LOG_SIZE; surface whatever
                    // the kernel managed to write rather than a bare errno.
                    let log_str = String::from_utf8_lossy(&log_buf);
                    let log_str = log_str.trim_end_matches('\0');
                    if !log_str.is_empty() {
                        return Err(Error::VerifierRejection { name: spec.name.clone(), log: log_str.to_string() });
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn spec(&self) -> &ProgSpec {
        &self.spec
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Attach via the legacy perf-event kprobe path.
    pub fn attach_kprobe(&mut self, arch: &Arch, symbol: &str, is_return: bool) -> Result<()> {
        let probe_type = read_kprobe_pmu_type()?;
        let attr = uapi::PerfEventAttr {
            type_: probe_type,
            config: if is_return { 1 } else { 0 },
            sample_period: 0,
            disabled: true,
            inherit: false,
            watermark: false,
            wakeup_events: 0,
            ..Default::default()
        }
        .to_bytes();
        let perf_fd = sys::perf_event_open(arch, &attr, -1, 0, -1, 0)?;
        attach_perf_fd_to_prog(perf_fd, self.fd)?;
        self.attachments.push(Attachment::Perf { perf_fd, kind: PerfAttachKind::Kprobe { symbol: symbol.to_string(), is_return } });
        Ok(())
    }

    /// Attach via the legacy perf-event tracepoint path.
    pub fn attach_tracepoint(&mut self, arch: &Arch, category: &str, name: &str) -> Result<()> {
        let id = read_tracepoint_id(category, name)?;
        let attr = uapi::PerfEventAttr {
            type_: PERF_TYPE_TRACEPOINT,
            config: id as u64,
            disabled: true,
            ..Default::default()
        }
        .to_bytes();
        let perf_fd = sys::perf_event_open(arch, &attr, -1, 0, -1, 0)?;
        attach_perf_fd_to_prog(perf_fd, self.fd)?;
        self.attachments.push(Attachment::Perf {
            perf_fd,
            kind: PerfAttachKind::Tracepoint { category: category.to_string(), name: name.to_string() },
        });
        Ok(())
    }

    /// Attach via `BPF_RAW_TRACEPOINT_OPEN`.
    pub fn attach_raw_tracepoint(&mut self, arch: &Arch, name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| Error::UsageError("tracepoint name contains NUL".into()))?;
        let attr = uapi::ObjAttr { pathname_ptr: c_name.as_ptr() as u64, bpf_fd: self.fd as u32, ..Default::default() }
            .to_bytes();
        let fd = sys::bpf(arch, uapi::BPF_RAW_TRACEPOINT_OPEN, &attr)? as RawFd;
        self.attachments.push(Attachment::RawTracepoint { fd, name: name.to_string() });
        Ok(())
    }

    /// Attach via `BPF_LINK_CREATE` with `BPF_TRACE_KPROBE_MULTI`.
    pub fn attach_kprobe_multi(&mut self, arch: &Arch, symbols: &[String], flags: u32) -> Result<()> {
        let link = Link::create_kprobe_multi(arch, self.fd, symbols, flags)?;
        self.attachments.push(Attachment::Link { link_fd: link.into_fd() });
        Ok(())
    }

    /// Attach via `RTM_SETLINK`/`IFLA_XDP`.
    pub fn attach_xdp(&mut self, ifindex: u32, mode: XdpMode) -> Result<()> {
        netlink::set_xdp(ifindex, Some(self.fd), mode)?;
        self.attachments.push(Attachment::Xdp { ifindex, mode });
        Ok(())
    }

    /// Attach as a `clsact` ingress/egress classifier via netlink TC.
    pub fn attach_tc(&mut self, ifindex: u32, ingress: bool, priority: u16) -> Result<()> {
        netlink::attach_tc_filter(ifindex, ingress, priority, self.fd, &self.spec.name)?;
        self.attachments.push(Attachment::Tc { ifindex, ingress, priority, prog_fd: self.fd, name: self.spec.name.clone() });
        Ok(())
    }

    /// Attach to a cgroup hook via the legacy `BPF_PROG_ATTACH` path.
    pub fn attach_cgroup(&mut self, arch: &Arch, cgroup_fd: RawFd, attach_type: u32, flags: u32) -> Result<()> {
        let attr = uapi::ProgAttachAttr {
            target_fd: cgroup_fd as u32,
            attach_bpf_fd: self.fd as u32,
            attach_type,
            attach_flags: flags,
            replace_bpf_fd: 0,
        }
        .to_bytes();
        sys::bpf(arch, uapi::BPF_PROG_ATTACH, &attr)?;
        self.attachments.push(Attachment::Cgroup { arch: *arch, cgroup_fd, prog_fd: self.fd, attach_type });
        Ok(())
    }

    /// Attach an LSM program via `BPF_LINK_CREATE`.
    pub fn attach_lsm(&mut self, arch: &Arch, attach_btf_id: u32) -> Result<()> {
        let link = Link::create_lsm(arch, self.fd, attach_btf_id)?;
        self.attachments.push(Attachment::Link { link_fd: link.into_fd() });
        Ok(())
    }

    /// Detach every attachment in the order they were created.
    pub fn detach_all(&mut self) -> Result<()> {
        for a in self.attachments.drain(..) {
            a.close()?;
        }
        Ok(())
    }

    pub fn pin(&self, arch: &Arch, path: &Path) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::UsageError("pin path contains NUL".into()))?;
        let attr = uapi::ObjAttr { pathname_ptr: c_path.as_ptr() as u64, bpf_fd: self.fd as u32, ..Default::default() }
            .to_bytes();
        sys::bpf(arch, uapi::BPF_OBJ_PIN, &attr)?;
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let _ = self.detach_all();
        if self.fd >= 0 {
            let _ = sys::close(self.fd);
        }
    }
}

#[derive(Debug, Clone)]
pub enum PerfAttachKind {
    Kprobe { symbol: String, is_return: bool },
    Tracepoint { category: String, name: String },
}

pub enum Attachment {
    Perf { perf_fd: RawFd, kind: PerfAttachKind },
    Link { link_fd: RawFd },
    RawTracepoint { fd: RawFd, name: String },
    Xdp { ifindex: u32, mode: XdpMode },
    Tc { ifindex: u32, ingress: bool, priority: u16, prog_fd: RawFd, name: String },
    Cgroup { arch: Arch, cgroup_fd: RawFd, prog_fd: RawFd, attach_type: u32 },
}

impl Attachment {
    fn close(self) -> Result<()> {
        match self {
            Attachment::Perf { perf_fd, .. } => sys::close(perf_fd),
            Attachment::Link { link_fd } => sys::close(link_fd),
            Attachment::RawTracepoint { fd, .. } => sys::close(fd),
            Attachment::Cgroup { arch, cgroup_fd, prog_fd, attach_type } => {
                let attr = uapi::ProgAttachAttr {
                    target_fd: cgroup_fd as u32,
                    attach_bpf_fd: prog_fd as u32,
                    attach_type,
                    attach_flags: 0,
                    replace_bpf_fd: 0,
                }
                .to_bytes();
                sys::bpf(&arch, uapi::BPF_PROG_DETACH, &attr)?;
                Ok(())
            }
            Attachment::Xdp { ifindex, mode } => netlink::set_xdp(ifindex, None, mode),
            Attachment::Tc { ifindex, ingress, priority, prog_fd, name } => {
                netlink::detach_tc_filter(ifindex, ingress, priority, prog_fd, &name)
            }
        }
    }
}

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;

fn attach_perf_fd_to_prog(perf_fd: RawFd, prog_fd: RawFd) -> Result<()> {
    sys::ioctl_arg(perf_fd, PERF_EVENT_IOC_SET_BPF, prog_fd)?;
    sys::ioctl_arg(perf_fd, PERF_EVENT_IOC_ENABLE, 0)?;
    Ok(())
}

fn read_kprobe_pmu_type() -> Result<u32> {
    let raw = fs::read_to_string("/sys/bus/event_source/devices/kprobe/type")?;
    raw.trim().parse::<u32>().map_err(|_| Error::UsageError("unparsable kprobe PMU type".into()))
}

fn read_tracepoint_id(category: &str, name: &str) -> Result<u32> {
    let path = format!("/sys/kernel/tracing/events/{category}/{name}/id");
    let raw = fs::read_to_string(&path)?;
    raw.trim().parse::<u32>().map_err(|_| Error::UsageError(format!("unparsable tracepoint id at {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prog_spec_carries_fields() {
        let spec = ProgSpec { prog_type: ProgType::Xdp, name: "xdp_pass".into(), license: "GPL".into(), log_level: 0 };
        assert_eq!(spec.prog_type, ProgType::Xdp);
        assert_eq!(spec.name, "xdp_pass");
    }

    #[test]
    fn prog_type_values_match_uapi() {
        assert_eq!(ProgType::Kprobe as u32, 2);
        assert_eq!(ProgType::Xdp as u32, 6);
        assert_eq!(ProgType::RawTracepoint as u32, 17);
        assert_eq!(ProgType::Lsm as u32, 29);
    }

    #[test]
    fn attach_type_field_survives_construction() {
        let attachment = Attachment::Xdp { ifindex: 2, mode: XdpMode::Driver };
        match attachment {
            Attachment::Xdp { ifindex, mode } => {
                assert_eq!(ifindex, 2);
                assert_eq!(mode, XdpMode::Driver);
            }
            _ => panic!("wrong variant"),
        }
    }
}
