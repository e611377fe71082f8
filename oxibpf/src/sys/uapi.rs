//! Byte-exact layouts of the kernel UAPI structures this crate marshals
//! across the `bpf()` and `perf_event_open()` syscalls. The real
//! `union bpf_attr` is 128 bytes wide with a different field arrangement per
//! command; rather than model a Rust union, each variant below is a
//! zero-initialized 128-byte buffer with setters at the offsets that
//! command actually reads.

use crate::codec::*;

pub const BPF_ATTR_SIZE: usize = 128;
pub const PERF_EVENT_ATTR_SIZE: usize = 128;

// bpf() command numbers (uapi/linux/bpf.h).
pub const BPF_MAP_CREATE: i32 = 0;
pub const BPF_MAP_LOOKUP_ELEM: i32 = 1;
pub const BPF_MAP_UPDATE_ELEM: i32 = 2;
pub const BPF_MAP_DELETE_ELEM: i32 = 3;
pub const BPF_MAP_GET_NEXT_KEY: i32 = 4;
pub const BPF_PROG_LOAD: i32 = 5;
pub const BPF_OBJ_PIN: i32 = 6;
pub const BPF_OBJ_GET: i32 = 7;
pub const BPF_PROG_ATTACH: i32 = 8;
pub const BPF_PROG_DETACH: i32 = 9;
pub const BPF_RAW_TRACEPOINT_OPEN: i32 = 17;
pub const BPF_MAP_LOOKUP_AND_DELETE_ELEM: i32 = 21;
pub const BPF_MAP_LOOKUP_BATCH: i32 = 24;
pub const BPF_MAP_LOOKUP_AND_DELETE_BATCH: i32 = 25;
pub const BPF_MAP_UPDATE_BATCH: i32 = 26;
pub const BPF_MAP_DELETE_BATCH: i32 = 27;
pub const BPF_LINK_CREATE: i32 = 28;

/// Builds the `map_create` variant of `bpf_attr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub map_ifindex: u32,
    pub btf_fd: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
}

impl MapCreateAttr {
    pub fn to_bytes(&self, name: &str) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.map_type);
        put_u32_le(&mut b, 4, self.key_size);
        put_u32_le(&mut b, 8, self.value_size);
        put_u32_le(&mut b, 12, self.max_entries);
        put_u32_le(&mut b, 16, self.map_flags);
        put_u32_le(&mut b, 20, self.inner_map_fd);
        put_u32_le(&mut b, 24, self.numa_node);
        put_cstr_fixed(&mut b[28..44], name);
        put_u32_le(&mut b, 44, self.map_ifindex);
        put_u32_le(&mut b, 48, self.btf_fd);
        put_u32_le(&mut b, 52, self.btf_key_type_id);
        put_u32_le(&mut b, 56, self.btf_value_type_id);
        b
    }
}

/// Builds the `prog_load` variant of `bpf_attr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgLoadAttr {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub insns_ptr: u64,
    pub license_ptr: u64,
    pub log_level: u32,
    pub log_size: u32,
    pub log_buf: u64,
    pub kern_version: u32,
    pub prog_flags: u32,
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
    pub prog_btf_fd: u32,
}

impl ProgLoadAttr {
    pub fn to_bytes(&self, name: &str) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.prog_type);
        put_u32_le(&mut b, 4, self.insn_cnt);
        put_u64_le(&mut b, 8, self.insns_ptr);
        put_u64_le(&mut b, 16, self.license_ptr);
        put_u32_le(&mut b, 24, self.log_level);
        put_u32_le(&mut b, 28, self.log_size);
        put_u64_le(&mut b, 32, self.log_buf);
        put_u32_le(&mut b, 40, self.kern_version);
        put_u32_le(&mut b, 44, self.prog_flags);
        put_cstr_fixed(&mut b[48..64], name);
        put_u32_le(&mut b, 64, self.prog_ifindex);
        put_u32_le(&mut b, 68, self.expected_attach_type);
        put_u32_le(&mut b, 72, self.prog_btf_fd);
        b
    }
}

/// Builds the `map_elem` variant of `bpf_attr` used by lookup/update/delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapElemAttr {
    pub map_fd: u32,
    pub key_ptr: u64,
    pub value_or_next_key_ptr: u64,
    pub flags: u64,
}

impl MapElemAttr {
    pub fn to_bytes(&self) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.map_fd);
        put_u64_le(&mut b, 8, self.key_ptr);
        put_u64_le(&mut b, 16, self.value_or_next_key_ptr);
        put_u64_le(&mut b, 24, self.flags);
        b
    }
}

/// Builds the `obj` variant of `bpf_attr` used by `BPF_OBJ_PIN`/`BPF_OBJ_GET`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjAttr {
    pub pathname_ptr: u64,
    pub bpf_fd: u32,
    pub file_flags: u32,
}

impl ObjAttr {
    pub fn to_bytes(&self) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u64_le(&mut b, 0, self.pathname_ptr);
        put_u32_le(&mut b, 8, self.bpf_fd);
        put_u32_le(&mut b, 12, self.file_flags);
        b
    }
}

/// Builds the `prog_attach` variant of `bpf_attr` used by
/// `BPF_PROG_ATTACH`/`BPF_PROG_DETACH` (the legacy cgroup-hook path).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgAttachAttr {
    pub target_fd: u32,
    pub attach_bpf_fd: u32,
    pub attach_type: u32,
    pub attach_flags: u32,
    pub replace_bpf_fd: u32,
}

impl ProgAttachAttr {
    pub fn to_bytes(&self) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.target_fd);
        put_u32_le(&mut b, 4, self.attach_bpf_fd);
        put_u32_le(&mut b, 8, self.attach_type);
        put_u32_le(&mut b, 12, self.attach_flags);
        put_u32_le(&mut b, 16, self.replace_bpf_fd);
        b
    }
}

/// Builds the batch-op variant of `bpf_attr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapBatchAttr {
    pub in_batch_ptr: u64,
    pub out_batch_ptr: u64,
    pub keys_ptr: u64,
    pub values_ptr: u64,
    pub count: u32,
    pub map_fd: u32,
    pub elem_flags: u64,
    pub flags: u64,
}

impl MapBatchAttr {
    pub fn to_bytes(&self) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u64_le(&mut b, 0, self.in_batch_ptr);
        put_u64_le(&mut b, 8, self.out_batch_ptr);
        put_u64_le(&mut b, 16, self.keys_ptr);
        put_u64_le(&mut b, 24, self.values_ptr);
        put_u32_le(&mut b, 32, self.count);
        put_u32_le(&mut b, 36, self.map_fd);
        put_u64_le(&mut b, 40, self.elem_flags);
        put_u64_le(&mut b, 48, self.flags);
        b
    }
}

/// Builds the `link_create` variant (kprobe-multi form).
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCreateKprobeMultiAttr {
    pub prog_fd: u32,
    pub attach_type: u32,
    pub flags: u32,
    pub kprobe_multi_flags: u32,
    pub cnt: u32,
    pub syms_ptr: u64,
}

impl LinkCreateKprobeMultiAttr {
    pub fn to_bytes(&self) -> [u8; BPF_ATTR_SIZE] {
        let mut b = [0u8; BPF_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.prog_fd);
        put_u32_le(&mut b, 8, self.attach_type);
        put_u32_le(&mut b, 12, self.flags);
        put_u32_le(&mut b, 16, self.kprobe_multi_flags);
        put_u32_le(&mut b, 20, self.cnt);
        put_u64_le(&mut b, 24, self.syms_ptr);
        b
    }
}

/// Builds `struct perf_event_attr`'s fields this crate actually populates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub disabled: bool,
    pub inherit: bool,
    pub watermark: bool,
    pub wakeup_events: u32,
}

impl PerfEventAttr {
    pub fn to_bytes(&self) -> [u8; PERF_EVENT_ATTR_SIZE] {
        let mut b = [0u8; PERF_EVENT_ATTR_SIZE];
        put_u32_le(&mut b, 0, self.type_);
        put_u32_le(&mut b, 4, PERF_EVENT_ATTR_SIZE as u32);
        put_u64_le(&mut b, 8, self.config);
        put_u64_le(&mut b, 16, self.sample_period);
        put_u64_le(&mut b, 24, self.sample_type);
        put_u64_le(&mut b, 32, self.read_format);
        let mut flags: u64 = 0;
        if self.disabled {
            flags |= 1 << 0;
        }
        if self.inherit {
            flags |= 1 << 1;
        }
        if self.watermark {
            flags |= 1 << 6;
        }
        put_u64_le(&mut b, 40, flags);
        put_u32_le(&mut b, 48, self.wakeup_events);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_create_field_offsets() {
        let attr = MapCreateAttr {
            map_type: 1,
            key_size: 4,
            value_size: 8,
            max_entries: 10,
            map_flags: 0,
            ..Default::default()
        };
        let b = attr.to_bytes("test_map");
        assert_eq!(get_u32_le(&b, 0), 1);
        assert_eq!(get_u32_le(&b, 4), 4);
        assert_eq!(get_u32_le(&b, 8), 8);
        assert_eq!(get_u32_le(&b, 12), 10);
        assert_eq!(cstr_from_fixed(&b[28..44]), "test_map");
        assert_eq!(b.len(), BPF_ATTR_SIZE);
    }

    #[test]
    fn prog_load_field_offsets() {
        let attr = ProgLoadAttr {
            prog_type: 6,
            insn_cnt: 2,
            insns_ptr: 0x1000,
            license_ptr: 0x2000,
            kern_version: 0x0006_0000,
            ..Default::default()
        };
        let b = attr.to_bytes("xdp_pass");
        assert_eq!(get_u32_le(&b, 0), 6);
        assert_eq!(get_u32_le(&b, 4), 2);
        assert_eq!(get_u64_le(&b, 8), 0x1000);
        assert_eq!(get_u64_le(&b, 16), 0x2000);
        assert_eq!(get_u32_le(&b, 40), 0x0006_0000);
        assert_eq!(cstr_from_fixed(&b[48..64]), "xdp_pass");
    }

    #[test]
    fn perf_event_attr_disabled_bit() {
        let attr = PerfEventAttr { type_: 1, disabled: true, wakeup_events: 1, ..Default::default() };
        let b = attr.to_bytes();
        let flags = get_u64_le(&b, 40);
        assert_eq!(flags & 1, 1);
        assert_eq!(get_u32_le(&b, 48), 1);
    }

    #[test]
    fn all_attr_buffers_are_128_bytes() {
        assert_eq!(MapCreateAttr::default().to_bytes("x").len(), 128);
        assert_eq!(ProgLoadAttr::default().to_bytes("x").len(), 128);
        assert_eq!(MapElemAttr::default().to_bytes().len(), 128);
        assert_eq!(ObjAttr::default().to_bytes().len(), 128);
        assert_eq!(MapBatchAttr::default().to_bytes().len(), 128);
        assert_eq!(LinkCreateKprobeMultiAttr::default().to_bytes().len(), 128);
        assert_eq!(PerfEventAttr::default().to_bytes().len(), 128);
        assert_eq!(ProgAttachAttr::default().to_bytes().len(), 128);
    }

    #[test]
    fn prog_attach_field_offsets() {
        let attr = ProgAttachAttr { target_fd: 3, attach_bpf_fd: 4, attach_type: 0, attach_flags: 0, replace_bpf_fd: 0 };
        let b = attr.to_bytes();
        assert_eq!(get_u32_le(&b, 0), 3);
        assert_eq!(get_u32_le(&b, 4), 4);
    }
}
