//! TC attachment via a raw `AF_NETLINK`/`NETLINK_ROUTE` conversation:
//! add/remove a `clsact` qdisc and attach/detach a `bpf` classifier.

use crate::codec::{align4, get_i32_le, put_u16_le, put_u32_le};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::fd::RawFd;

pub const NLMSG_HDR_LEN: usize = 16;
const TCMSG_LEN: usize = 20;

const NLMSG_ERROR: u16 = 2;
const RTM_NEWQDISC: u16 = 36;
const RTM_DELQDISC: u16 = 37;
const RTM_NEWTFILTER: u16 = 44;
const RTM_DELTFILTER: u16 = 45;
const RTM_SETLINK: u16 = 19;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_CREATE: u16 = 0x0400;
const NLM_F_EXCL: u16 = 0x0200;

const IFINFOMSG_LEN: usize = 16;
const IFLA_XDP: u16 = 43;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;

/// `XDP_FLAGS_*`, mutually exclusive mode bits accepted by `IFLA_XDP_FLAGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    Skb,
    Driver,
    HwOffload,
}

impl XdpMode {
    fn flag(self) -> u32 {
        match self {
            XdpMode::Skb => 1 << 1,      // XDP_FLAGS_SKB_MODE
            XdpMode::Driver => 1 << 2,   // XDP_FLAGS_DRV_MODE
            XdpMode::HwOffload => 1 << 3, // XDP_FLAGS_HW_MODE
        }
    }
}

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const NLA_F_NESTED: u16 = 0x8000;

const TCA_BPF_FD: u16 = 1;
const TCA_BPF_NAME: u16 = 2;
const TCA_BPF_FLAGS: u16 = 3;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1;

const CLSACT_HANDLE: u32 = 0xFFFF_0000;
const CLSACT_PARENT: u32 = 0xFFFF_FFF1;
const ETH_P_ALL: u32 = 0x0003;

/// One netlink attribute, padded to a 4-byte boundary on emission.
struct Nla {
    attr_type: u16,
    payload: Vec<u8>,
}

impl Nla {
    fn string(attr_type: u16, s: &str) -> Self {
        let mut payload = s.as_bytes().to_vec();
        payload.push(0);
        Nla { attr_type, payload }
    }

    fn u32(attr_type: u16, v: u32) -> Self {
        Nla { attr_type, payload: v.to_le_bytes().to_vec() }
    }

    fn nested(attr_type: u16, children: Vec<Nla>) -> Self {
        let mut payload = Vec::new();
        for c in children {
            c.encode_into(&mut payload);
        }
        Nla { attr_type: attr_type | NLA_F_NESTED, payload }
    }

    /// `nla_len` (unpadded: header + payload), followed by the payload
    /// zero-padded out to a 4-byte boundary.
    fn encode_into(&self, out: &mut Vec<u8>) {
        let nla_len = 4 + self.payload.len();
        let start = out.len();
        out.resize(start + 4, 0);
        put_u16_le(&mut out[start..], 0, nla_len as u16);
        put_u16_le(&mut out[start..], 2, self.attr_type);
        out.extend_from_slice(&self.payload);
        let padded = align4(nla_len);
        out.resize(start + padded, 0);
    }
}

fn nlmsghdr(len: u32, msg_type: u16, flags: u16, seq: u32) -> Vec<u8> {
    let mut b = vec![0u8; NLMSG_HDR_LEN];
    put_u32_le(&mut b, 0, len);
    put_u16_le(&mut b, 4, msg_type);
    put_u16_le(&mut b, 6, flags);
    put_u32_le(&mut b, 8, seq);
    put_u32_le(&mut b, 12, 0); // pid: kernel-addressed
    b
}

fn tcmsg(ifindex: u32, handle: u32, parent: u32, info: u32) -> Vec<u8> {
    let mut b = vec![0u8; TCMSG_LEN];
    b[0] = libc::AF_UNSPEC as u8;
    put_u32_le(&mut b, 4, ifindex);
    put_u32_le(&mut b, 8, handle);
    put_u32_le(&mut b, 12, parent);
    put_u32_le(&mut b, 16, info);
    b
}

fn ifinfomsg(ifindex: u32) -> Vec<u8> {
    let mut b = vec![0u8; IFINFOMSG_LEN];
    b[0] = libc::AF_UNSPEC as u8;
    put_u32_le(&mut b, 4, ifindex);
    b
}

/// Assemble an `RTM_SETLINK` message that installs or removes an XDP program
/// on `ifindex` via the nested `IFLA_XDP`/`IFLA_XDP_FD` attribute. `prog_fd`
/// of `None` detaches (fd `-1`, per the kernel's XDP netlink convention).
pub fn build_xdp_msg(ifindex: u32, prog_fd: Option<RawFd>, mode: XdpMode, seq: u32) -> Vec<u8> {
    let fd = prog_fd.unwrap_or(-1);
    let xdp = Nla::nested(
        IFLA_XDP,
        vec![Nla::u32(IFLA_XDP_FD, fd as u32), Nla::u32(IFLA_XDP_FLAGS, mode.flag())],
    );
    let mut attrs = Vec::new();
    xdp.encode_into(&mut attrs);

    let mut body = ifinfomsg(ifindex);
    body.extend_from_slice(&attrs);

    let total_len = NLMSG_HDR_LEN + body.len();
    let mut msg = nlmsghdr(total_len as u32, RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
    msg.extend_from_slice(&body);
    msg
}

/// Assemble a clsact-qdisc add/remove message. Returns the full netlink
/// message (header + tcmsg + attributes), with `nlmsghdr.len` set to the
/// total length.
pub fn build_clsact_msg(ifindex: u32, add: bool, seq: u32) -> Vec<u8> {
    let msg_type = if add { RTM_NEWQDISC } else { RTM_DELQDISC };
    let flags = if add {
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
    } else {
        NLM_F_REQUEST | NLM_F_ACK
    };

    let mut attrs = Vec::new();
    Nla::string(TCA_KIND, "clsact").encode_into(&mut attrs);

    let mut body = tcmsg(ifindex, CLSACT_HANDLE, CLSACT_PARENT, 0);
    body.extend_from_slice(&attrs);

    let total_len = NLMSG_HDR_LEN + body.len();
    let mut msg = nlmsghdr(total_len as u32, msg_type, flags, seq);
    msg.extend_from_slice(&body);
    msg
}

/// Assemble a `bpf` filter add/remove message on the clsact ingress or
/// egress hook.
pub fn build_filter_msg(ifindex: u32, ingress: bool, priority: u16, prog_fd: RawFd, name: &str, add: bool, seq: u32) -> Vec<u8> {
    let msg_type = if add { RTM_NEWTFILTER } else { RTM_DELTFILTER };
    let flags = if add {
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
    } else {
        NLM_F_REQUEST | NLM_F_ACK
    };

    let parent_minor: u32 = if ingress { 0xFFF2 } else { 0xFFF3 };
    let parent = CLSACT_HANDLE | parent_minor;
    let info = ((priority as u32) << 16) | ETH_P_ALL;

    let mut attrs = Vec::new();
    Nla::string(TCA_KIND, "bpf").encode_into(&mut attrs);
    let options = Nla::nested(
        TCA_OPTIONS,
        vec![
            Nla::u32(TCA_BPF_FD, prog_fd as u32),
            Nla::string(TCA_BPF_NAME, name),
            Nla::u32(TCA_BPF_FLAGS, TCA_BPF_FLAG_ACT_DIRECT),
        ],
    );
    options.encode_into(&mut attrs);

    let mut body = tcmsg(ifindex, 0, parent, info);
    body.extend_from_slice(&attrs);

    let total_len = NLMSG_HDR_LEN + body.len();
    let mut msg = nlmsghdr(total_len as u32, msg_type, flags, seq);
    msg.extend_from_slice(&body);
    msg
}

/// Parse a netlink response, expecting a single `NLMSG_ERROR` ack whose
/// error code is zero.
pub fn parse_ack(buf: &[u8]) -> Result<()> {
    if buf.len() < NLMSG_HDR_LEN + 4 {
        return Err(Error::NetlinkError { op: "parse_ack", errno: crate::error::Errno(libc::EBADMSG) });
    }
    let msg_type = u16::from_le_bytes([buf[4], buf[5]]);
    if msg_type != NLMSG_ERROR {
        return Err(Error::NetlinkError { op: "parse_ack", errno: crate::error::Errno(libc::EPROTO) });
    }
    let code = get_i32_le(buf, NLMSG_HDR_LEN);
    if code == 0 {
        Ok(())
    } else {
        Err(Error::NetlinkError { op: "tc", errno: crate::error::Errno(-code) })
    }
}

/// Open an `AF_NETLINK`/`NETLINK_ROUTE` socket bound to the kernel.
pub fn open_route_socket() -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if fd < 0 {
        return Err(Error::syscall_failed("socket", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as u32,
        )
    };
    if ret < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        unsafe { libc::close(fd) };
        return Err(Error::syscall_failed("bind", errno));
    }
    Ok(fd)
}

pub fn send_and_ack(fd: RawFd, msg: &[u8]) -> Result<()> {
    let n = unsafe { libc::send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
    if n < 0 {
        return Err(Error::syscall_failed("send", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    let mut buf = vec![0u8; 4096];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(Error::syscall_failed("recv", std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    parse_ack(&buf[..n as usize])
}

/// Install or remove an XDP program on `ifindex` in one round trip.
pub fn set_xdp(ifindex: u32, prog_fd: Option<RawFd>, mode: XdpMode) -> Result<()> {
    let sock = open_route_socket()?;
    let msg = build_xdp_msg(ifindex, prog_fd, mode, 1);
    let result = send_and_ack(sock, &msg);
    let _ = sys_close(sock);
    result
}

/// Ensure a `clsact` qdisc exists on `ifindex`, then attach a `bpf` filter on
/// the ingress or egress hook. Tolerates the qdisc already being present.
pub fn attach_tc_filter(ifindex: u32, ingress: bool, priority: u16, prog_fd: RawFd, name: &str) -> Result<()> {
    let sock = open_route_socket()?;
    let qdisc_msg = build_clsact_msg(ifindex, true, 1);
    match send_and_ack(sock, &qdisc_msg) {
        Ok(()) => {}
        Err(Error::NetlinkError { errno, .. }) if errno.0 == libc::EEXIST => {}
        Err(e) => {
            let _ = sys_close(sock);
            return Err(e);
        }
    }
    let filter_msg = build_filter_msg(ifindex, ingress, priority, prog_fd, name, true, 2);
    let result = send_and_ack(sock, &filter_msg);
    let _ = sys_close(sock);
    result
}

/// Remove a previously attached `bpf` filter from `ifindex`.
pub fn detach_tc_filter(ifindex: u32, ingress: bool, priority: u16, prog_fd: RawFd, name: &str) -> Result<()> {
    let sock = open_route_socket()?;
    let filter_msg = build_filter_msg(ifindex, ingress, priority, prog_fd, name, false, 1);
    let result = send_and_ack(sock, &filter_msg);
    let _ = sys_close(sock);
    result
}

fn sys_close(fd: RawFd) -> Result<()> {
    crate::sys::close(fd)
}

/// Lookup an interface's index by name, e.g. `"lo"` or `"eth0"`.
pub fn if_nametoindex(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| Error::UsageError("interface name contains NUL".into()))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(Error::UsageError(format!("unknown interface `{name}`")));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clsact_message_length_matches_spec_example() {
        // nlmsghdr(16) + tcmsg(20) + TCA_KIND("clsact"\0 = 7 bytes, padded to 8, header 4) = 16+20+12 = 48
        let msg = build_clsact_msg(1, true, 1);
        let len = u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]);
        assert_eq!(len, 48);
        assert_eq!(msg.len(), 48);
    }

    #[test]
    fn clsact_handle_and_parent_are_fixed() {
        let msg = build_clsact_msg(7, true, 1);
        let ifindex = u32::from_le_bytes([msg[16], msg[17], msg[18], msg[19]]);
        let handle = u32::from_le_bytes([msg[20], msg[21], msg[22], msg[23]]);
        let parent = u32::from_le_bytes([msg[24], msg[25], msg[26], msg[27]]);
        assert_eq!(ifindex, 7);
        assert_eq!(handle, CLSACT_HANDLE);
        assert_eq!(parent, CLSACT_PARENT);
    }

    #[test]
    fn filter_msg_parent_differs_by_direction() {
        let ingress = build_filter_msg(1, true, 1, 5, "prog", true, 2);
        let egress = build_filter_msg(1, false, 1, 5, "prog", true, 2);
        let parent_in = u32::from_le_bytes([ingress[24], ingress[25], ingress[26], ingress[27]]);
        let parent_eg = u32::from_le_bytes([egress[24], egress[25], egress[26], egress[27]]);
        assert_ne!(parent_in, parent_eg);
    }

    #[test]
    fn nla_padding_rounds_to_4_bytes() {
        let mut out = Vec::new();
        Nla::string(TCA_KIND, "bpf").encode_into(&mut out);
        // header(4) + "bpf\0"(4) = 8, already 4-aligned
        assert_eq!(out.len(), 8);

        let mut out2 = Vec::new();
        Nla::string(TCA_KIND, "clsact").encode_into(&mut out2);
        // header(4) + "clsact\0"(7) = 11 -> padded to 12
        assert_eq!(out2.len(), 12);
    }

    #[test]
    fn parse_ack_accepts_zero_error() {
        let mut buf = vec![0u8; NLMSG_HDR_LEN + 4];
        put_u16_le(&mut buf, 4, NLMSG_ERROR);
        assert!(parse_ack(&buf).is_ok());
    }

    #[test]
    fn parse_ack_rejects_nonzero_error() {
        let mut buf = vec![0u8; NLMSG_HDR_LEN + 4];
        put_u16_le(&mut buf, 4, NLMSG_ERROR);
        put_u32_le(&mut buf, NLMSG_HDR_LEN, (-(libc::EPERM)) as u32);
        assert!(parse_ack(&buf).is_err());
    }

    #[test]
    fn xdp_msg_carries_fd_and_flags() {
        let msg = build_xdp_msg(3, Some(9), XdpMode::Driver, 1);
        let msg_type = u16::from_le_bytes([msg[4], msg[5]]);
        assert_eq!(msg_type, RTM_SETLINK);
        let ifindex = u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]);
        assert_eq!(ifindex, 3);
    }

    #[test]
    fn xdp_detach_uses_negative_one_fd() {
        let msg = build_xdp_msg(3, None, XdpMode::Skb, 1);
        // IFLA_XDP (nested) header starts right after the ifinfomsg body;
        // IFLA_XDP_FD is its first nested attribute, payload at +8.
        let nested_payload_start = NLMSG_HDR_LEN + IFINFOMSG_LEN + 4 + 4;
        let fd = u32::from_le_bytes([
            msg[nested_payload_start],
            msg[nested_payload_start + 1],
            msg[nested_payload_start + 2],
            msg[nested_payload_start + 3],
        ]);
        assert_eq!(fd, u32::MAX);
    }

    #[test]
    fn nested_options_carry_nested_flag() {
        let mut out = Vec::new();
        let options = Nla::nested(TCA_OPTIONS, vec![Nla::u32(TCA_BPF_FD, 3)]);
        options.encode_into(&mut out);
        let attr_type = u16::from_le_bytes([out[2], out[3]]);
        assert_eq!(attr_type & NLA_F_NESTED, NLA_F_NESTED);
    }
}
