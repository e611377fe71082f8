//! Map lifecycle: create, lookup, update, delete, iterate, batch, pin.
//!
//! A [`Map`] owns exactly one fd, closed on drop. Key/value (de)serialization
//! is delegated to a small codec capability the caller supplies, rather than
//! a registry of type-erased codecs.

use crate::arch::Arch;
use crate::codec::{get_u32_le, put_u32_le};
use crate::error::{Error, Result};
use crate::sys::{self, uapi};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapType {
    Hash = 1,
    Array = 2,
    ProgArray = 3,
    PerfEventArray = 4,
    PerCpuHash = 5,
    PerCpuArray = 6,
    StackTrace = 7,
    LruHash = 9,
    LruPerCpuHash = 10,
    LpmTrie = 11,
    Queue = 22,
    Stack = 23,
    RingBuf = 27,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlags {
    Any,
    NoExist,
    Exist,
}

impl UpdateFlags {
    fn bits(self) -> u64 {
        match self {
            UpdateFlags::Any => 0,
            UpdateFlags::NoExist => 1,
            UpdateFlags::Exist => 2,
        }
    }
}

/// Options passed to [`Map::create`].
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: String,
    pub inner_map_fd: Option<RawFd>,
    pub numa_node: Option<u32>,
}

impl MapSpec {
    /// Convenience constructor for the common case with no inner map and no
    /// NUMA pinning.
    pub fn new(map_type: MapType, key_size: u32, value_size: u32, max_entries: u32, name: impl Into<String>) -> Self {
        MapSpec {
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            name: name.into(),
            inner_map_fd: None,
            numa_node: None,
        }
    }
}

/// An owned, fd-backed BPF map.
pub struct Map {
    fd: RawFd,
    spec: MapSpec,
}

impl Map {
    pub fn create(arch: &Arch, spec: MapSpec) -> Result<Self> {
        let attr = uapi::MapCreateAttr {
            map_type: spec.map_type as u32,
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            inner_map_fd: spec.inner_map_fd.map(|fd| fd as u32).unwrap_or(0),
            numa_node: spec.numa_node.unwrap_or(0),
            ..Default::default()
        }
        .to_bytes(&spec.name);
        let fd = sys::bpf(arch, uapi::BPF_MAP_CREATE, &attr)? as RawFd;
        log::info!("created map `{}` type={:?} fd={fd}", spec.name, spec.map_type);
        Ok(Map { fd, spec })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub fn lookup(&self, arch: &Arch, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut value = vec![0u8; self.spec.value_size as usize];
        let attr = uapi::MapElemAttr {
            map_fd: self.fd as u32,
            key_ptr: key.as_ptr() as u64,
            value_or_next_key_ptr: value.as_mut_ptr() as u64,
            flags: 0,
        }
        .to_bytes();
        match sys::bpf(arch, uapi::BPF_MAP_LOOKUP_ELEM, &attr) {
            Ok(_) => Ok(Some(value)),
            Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::NotFound, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn update(&self, arch: &Arch, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()> {
        let attr = uapi::MapElemAttr {
            map_fd: self.fd as u32,
            key_ptr: key.as_ptr() as u64,
            value_or_next_key_ptr: value.as_ptr() as u64,
            flags: flags.bits(),
        }
        .to_bytes();
        sys::bpf(arch, uapi::BPF_MAP_UPDATE_ELEM, &attr)?;
        Ok(())
    }

    pub fn delete(&self, arch: &Arch, key: &[u8], allow_missing: bool) -> Result<()> {
        let attr = uapi::MapElemAttr { map_fd: self.fd as u32, key_ptr: key.as_ptr() as u64, ..Default::default() }
            .to_bytes();
        match sys::bpf(arch, uapi::BPF_MAP_DELETE_ELEM, &attr) {
            Ok(_) => Ok(()),
            Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::NotFound, .. }) if allow_missing => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Lazily iterate every key via repeated `MAP_GET_NEXT_KEY`.
    pub fn iter_keys<'a>(&'a self, arch: &'a Arch) -> KeyIter<'a> {
        KeyIter { map: self, arch, prev: None, done: false }
    }

    /// `MAP_LOOKUP_AND_DELETE_ELEM`: atomically reads and removes an entry.
    /// Used directly by stack/queue `pop`, and exposed generally since the
    /// kernel supports it on hash/LRU maps too.
    pub fn lookup_and_delete(&self, arch: &Arch, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut value = vec![0u8; self.spec.value_size as usize];
        let attr = uapi::MapElemAttr {
            map_fd: self.fd as u32,
            key_ptr: key.as_ptr() as u64,
            value_or_next_key_ptr: value.as_mut_ptr() as u64,
            flags: 0,
        }
        .to_bytes();
        match sys::bpf(arch, uapi::BPF_MAP_LOOKUP_AND_DELETE_ELEM, &attr) {
            Ok(_) => Ok(Some(value)),
            Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::NotFound, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Push a value onto a `BPF_MAP_TYPE_STACK` or `BPF_MAP_TYPE_QUEUE`
    /// (zero-sized key, `MAP_UPDATE_ELEM` with a null key pointer).
    pub fn push(&self, arch: &Arch, value: &[u8], flags: UpdateFlags) -> Result<()> {
        let attr = uapi::MapElemAttr {
            map_fd: self.fd as u32,
            key_ptr: 0,
            value_or_next_key_ptr: value.as_ptr() as u64,
            flags: flags.bits(),
        }
        .to_bytes();
        sys::bpf(arch, uapi::BPF_MAP_UPDATE_ELEM, &attr)?;
        Ok(())
    }

    /// Pop (read + remove) the next value from a stack/queue map.
    pub fn pop(&self, arch: &Arch) -> Result<Option<Vec<u8>>> {
        self.lookup_and_delete(arch, &[])
    }

    /// Peek (read without removing) the next value from a stack/queue map.
    pub fn peek(&self, arch: &Arch) -> Result<Option<Vec<u8>>> {
        self.lookup(arch, &[])
    }

    /// `MAP_LOOKUP_BATCH`: fetch up to `keys.len()` entries starting from
    /// `cursor` (`None` to start from the beginning). Returns the
    /// `(key, value)` pairs read this call and the cursor to resume from, or
    /// `None` once the kernel reports `ENOENT` (iteration exhausted).
    pub fn lookup_batch(
        &self,
        arch: &Arch,
        cursor: Option<Vec<u8>>,
        max_count: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>)> {
        self.batch_op(arch, uapi::BPF_MAP_LOOKUP_BATCH, cursor, max_count)
    }

    /// `MAP_LOOKUP_AND_DELETE_BATCH`: like [`Map::lookup_batch`] but also
    /// removes each returned entry.
    pub fn lookup_and_delete_batch(
        &self,
        arch: &Arch,
        cursor: Option<Vec<u8>>,
        max_count: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>)> {
        self.batch_op(arch, uapi::BPF_MAP_LOOKUP_AND_DELETE_BATCH, cursor, max_count)
    }

    fn batch_op(
        &self,
        arch: &Arch,
        cmd: i32,
        cursor: Option<Vec<u8>>,
        max_count: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>)> {
        let key_size = self.spec.key_size as usize;
        let value_size = self.spec.value_size as usize;
        let mut in_batch = cursor.unwrap_or_else(|| vec![0u8; key_size]);
        let mut out_batch = vec![0u8; key_size];
        let mut keys = vec![0u8; key_size * max_count as usize];
        let mut values = vec![0u8; value_size * max_count as usize];

        let attr = uapi::MapBatchAttr {
            in_batch_ptr: in_batch.as_mut_ptr() as u64,
            out_batch_ptr: out_batch.as_mut_ptr() as u64,
            keys_ptr: keys.as_mut_ptr() as u64,
            values_ptr: values.as_mut_ptr() as u64,
            count: max_count,
            map_fd: self.fd as u32,
            elem_flags: 0,
            flags: 0,
        }
        .to_bytes();

        let exhausted = match sys::bpf(arch, cmd, &attr) {
            Ok(_) => false,
            Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::NotFound, .. }) => true,
            Err(e) => return Err(e),
        };

        // The kernel rewrites `count` in place to the number of entries
        // actually returned.
        let returned = get_u32_le(&attr, 32) as usize;
        let mut pairs = Vec::with_capacity(returned);
        for i in 0..returned {
            let k = keys[i * key_size..(i + 1) * key_size].to_vec();
            let v = values[i * value_size..(i + 1) * value_size].to_vec();
            pairs.push((k, v));
        }
        let next_cursor = if exhausted { None } else { Some(out_batch) };
        Ok((pairs, next_cursor))
    }

    /// `MAP_UPDATE_BATCH`: write every `(key, value)` pair in one syscall.
    pub fn update_batch(&self, arch: &Arch, pairs: &[(Vec<u8>, Vec<u8>)], flags: UpdateFlags) -> Result<()> {
        let key_size = self.spec.key_size as usize;
        let value_size = self.spec.value_size as usize;
        let mut keys = Vec::with_capacity(key_size * pairs.len());
        let mut values = Vec::with_capacity(value_size * pairs.len());
        for (k, v) in pairs {
            keys.extend_from_slice(k);
            values.extend_from_slice(v);
        }
        let attr = uapi::MapBatchAttr {
            in_batch_ptr: 0,
            out_batch_ptr: 0,
            keys_ptr: keys.as_ptr() as u64,
            values_ptr: values.as_ptr() as u64,
            count: pairs.len() as u32,
            map_fd: self.fd as u32,
            elem_flags: flags.bits(),
            flags: 0,
        }
        .to_bytes();
        sys::bpf(arch, uapi::BPF_MAP_UPDATE_BATCH, &attr)?;
        Ok(())
    }

    /// `MAP_DELETE_BATCH`: remove every key in one syscall.
    pub fn delete_batch(&self, arch: &Arch, keys: &[Vec<u8>]) -> Result<()> {
        let key_size = self.spec.key_size as usize;
        let mut flat_keys = Vec::with_capacity(key_size * keys.len());
        for k in keys {
            flat_keys.extend_from_slice(k);
        }
        let attr = uapi::MapBatchAttr {
            in_batch_ptr: 0,
            out_batch_ptr: 0,
            keys_ptr: flat_keys.as_ptr() as u64,
            values_ptr: 0,
            count: keys.len() as u32,
            map_fd: self.fd as u32,
            elem_flags: 0,
            flags: 0,
        }
        .to_bytes();
        sys::bpf(arch, uapi::BPF_MAP_DELETE_BATCH, &attr)?;
        Ok(())
    }

    pub fn pin(&self, arch: &Arch, path: &Path) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::UsageError("pin path contains NUL".into()))?;
        let attr = uapi::ObjAttr { pathname_ptr: c_path.as_ptr() as u64, bpf_fd: self.fd as u32, ..Default::default() }
            .to_bytes();
        sys::bpf(arch, uapi::BPF_OBJ_PIN, &attr)?;
        log::info!("pinned map `{}` at {}", self.spec.name, path.display());
        Ok(())
    }

    pub fn get_pinned(arch: &Arch, path: &Path, spec: MapSpec) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::UsageError("pin path contains NUL".into()))?;
        let attr = uapi::ObjAttr { pathname_ptr: c_path.as_ptr() as u64, ..Default::default() }.to_bytes();
        let fd = sys::bpf(arch, uapi::BPF_OBJ_GET, &attr)? as RawFd;
        Ok(Map { fd, spec })
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = sys::close(self.fd);
        }
    }
}

pub struct KeyIter<'a> {
    map: &'a Map,
    arch: &'a Arch,
    prev: Option<Vec<u8>>,
    done: bool,
}

impl<'a> Iterator for KeyIter<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut next_key = vec![0u8; self.map.spec.key_size as usize];
        let key_ptr = self.prev.as_ref().map(|k| k.as_ptr() as u64).unwrap_or(0);
        let attr = uapi::MapElemAttr {
            map_fd: self.map.fd as u32,
            key_ptr,
            value_or_next_key_ptr: next_key.as_mut_ptr() as u64,
            flags: 0,
        }
        .to_bytes();
        match sys::bpf(self.arch, uapi::BPF_MAP_GET_NEXT_KEY, &attr) {
            Ok(_) => {
                self.prev = Some(next_key.clone());
                Some(Ok(next_key))
            }
            Err(Error::SyscallFailed { kind: crate::error::ErrnoKind::NotFound, .. }) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Per-CPU aggregation over the concatenated per-CPU value buffer returned
/// by a per-CPU map lookup. `stride` is the 8-byte-rounded-up value size the
/// kernel uses between per-CPU slots.
pub fn percpu_values<T: Copy>(buf: &[u8], stride: usize, ncpu: usize, decode: impl Fn(&[u8]) -> T) -> Vec<T> {
    (0..ncpu).map(|i| decode(&buf[i * stride..i * stride + std::mem::size_of::<T>()])).collect()
}

pub fn percpu_sum_u64(buf: &[u8], stride: usize, ncpu: usize) -> u64 {
    percpu_values(buf, stride, ncpu, |s| get_u32_le(s, 0) as u64).into_iter().sum()
}

pub fn percpu_max_u64(buf: &[u8], stride: usize, ncpu: usize) -> u64 {
    percpu_values(buf, stride, ncpu, |s| get_u32_le(s, 0) as u64).into_iter().max().unwrap_or(0)
}

pub fn percpu_min_u64(buf: &[u8], stride: usize, ncpu: usize) -> u64 {
    percpu_values(buf, stride, ncpu, |s| get_u32_le(s, 0) as u64).into_iter().min().unwrap_or(0)
}

pub fn percpu_mean_u64(buf: &[u8], stride: usize, ncpu: usize) -> f64 {
    if ncpu == 0 {
        return 0.0;
    }
    percpu_sum_u64(buf, stride, ncpu) as f64 / ncpu as f64
}

/// Round a per-CPU value size up to the kernel's 8-byte stride.
pub fn percpu_stride(value_size: u32) -> usize {
    crate::codec::align8(value_size as usize)
}

pub fn put_key_u32(key: u32) -> [u8; 4] {
    let mut b = [0u8; 4];
    put_u32_le(&mut b, 0, key);
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percpu_stride_rounds_up() {
        assert_eq!(percpu_stride(4), 8);
        assert_eq!(percpu_stride(8), 8);
        assert_eq!(percpu_stride(9), 16);
    }

    #[test]
    fn percpu_sum_adds_each_cpu_slot() {
        let stride = 8;
        let ncpu = 3;
        let mut buf = vec![0u8; stride * ncpu];
        put_u32_le(&mut buf, 0 * stride, 10);
        put_u32_le(&mut buf, 1 * stride, 20);
        put_u32_le(&mut buf, 2 * stride, 30);
        assert_eq!(percpu_sum_u64(&buf, stride, ncpu), 60);
        assert_eq!(percpu_max_u64(&buf, stride, ncpu), 30);
        assert_eq!(percpu_min_u64(&buf, stride, ncpu), 10);
        assert_eq!(percpu_mean_u64(&buf, stride, ncpu), 20.0);
    }

    #[test]
    fn percpu_mean_of_empty_is_zero() {
        assert_eq!(percpu_mean_u64(&[], 8, 0), 0.0);
    }

    #[test]
    fn map_spec_carries_fields() {
        let spec = MapSpec::new(MapType::Hash, 4, 4, 10, "m");
        assert_eq!(spec.key_size, 4);
        assert_eq!(spec.map_type, MapType::Hash);
        assert!(spec.inner_map_fd.is_none());
    }
}
