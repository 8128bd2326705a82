//! Sequence number arithmetic
//!
//! RLC state variables live in a modular sequence space. Comparisons are
//! always made relative to a window base, never on raw values.

/// 10-bit sequence number space used by AMD and 10-bit UMD PDUs
pub const SN_MODULUS_10: u16 = 1024;

/// 5-bit sequence number space used by short UMD PDUs
pub const SN_MODULUS_5: u16 = 32;

/// `sn + n` in a space of `modulus` sequence numbers
pub fn sn_add(sn: u16, n: u16, modulus: u16) -> u16 {
    ((sn as u32 + n as u32) % modulus as u32) as u16
}

/// `sn - n` in a space of `modulus` sequence numbers
pub fn sn_sub(sn: u16, n: u16, modulus: u16) -> u16 {
    let n = n % modulus;
    ((sn as u32 + modulus as u32 - n as u32) % modulus as u32) as u16
}

/// Distance from `base` forward to `sn`
pub fn sn_offset(sn: u16, base: u16, modulus: u16) -> u16 {
    sn_sub(sn % modulus, base, modulus)
}

/// Whether `sn` lies in `[base, base + size)`
pub fn in_window(sn: u16, base: u16, size: u16, modulus: u16) -> bool {
    sn_offset(sn, base, modulus) < size
}
