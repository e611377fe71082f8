//! Small byte-packing helpers shared by the UAPI struct layer, the ELF
//! reader, and the netlink driver. Kept as free functions over `&[u8]`
//! rather than a trait hierarchy: every caller already knows its endianness
//! and field width at the call site.

/// Write `v` as little-endian bytes into `buf[offset..offset+N]`.
pub fn put_u16_le(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32_le(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64_le(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn put_i16_le(buf: &mut [u8], offset: usize, v: i16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_i32_le(buf: &mut [u8], offset: usize, v: i32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn get_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn get_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn get_u64_le(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn get_i16_le(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn get_i32_le(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Copy a NUL-terminated (or fully-occupied) C string out of a fixed-size
/// field, e.g. `bpf_attr.prog_name[16]`.
pub fn cstr_from_fixed(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Write `s` into a fixed-size field, truncating to `buf.len() - 1` bytes and
/// NUL-terminating. Matches the kernel's truncate-silently behavior for
/// `prog_name`/`map_name`.
pub fn put_cstr_fixed(buf: &mut [u8], s: &str) {
    buf.fill(0);
    let max = buf.len().saturating_sub(1);
    let bytes = s.as_bytes();
    let n = bytes.len().min(max);
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// Round `n` up to the next multiple of 8 (record alignment used by the
/// ring buffer and per-CPU map value packing).
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Round `n` up to the next multiple of 4 (netlink attribute padding).
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u32() {
        let mut buf = [0u8; 8];
        put_u32_le(&mut buf, 2, 0xdead_beef);
        assert_eq!(get_u32_le(&buf, 2), 0xdead_beef);
    }

    #[test]
    fn cstr_roundtrip_truncates() {
        let mut buf = [0xffu8; 16];
        put_cstr_fixed(&mut buf, "a_very_long_program_name");
        assert_eq!(cstr_from_fixed(&buf), "a_very_long_pro");
        assert_eq!(buf[15], 0);
    }

    #[test]
    fn cstr_roundtrip_short() {
        let mut buf = [0xffu8; 16];
        put_cstr_fixed(&mut buf, "xdp_pass");
        assert_eq!(cstr_from_fixed(&buf), "xdp_pass");
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align4(5), 8);
        assert_eq!(align4(6), 8);
        assert_eq!(align4(8), 8);
    }
}
