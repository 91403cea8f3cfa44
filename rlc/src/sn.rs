//! Sequence Number Arithmetic
//!
//! Every window and ordering decision in the engines goes through these
//! helpers. Raw sequence numbers are never compared directly: they are first
//! mapped to their distance above a window base (3GPP TS 36.322 section 7.1).

use common::SnFieldLength;

/// Distance of `x` above `base` in an SN space of size `modulus`
#[inline]
pub fn mod_base(x: u16, base: u16, modulus: u16) -> u16 {
    let m = modulus as u32;
    ((x as u32 + m - (base as u32 % m)) % m) as u16
}

/// A modulo sequence number space with its window size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnSpace {
    modulus: u16,
    window: u16,
}

impl SnSpace {
    /// SN space for a field length, with an explicit window size
    pub fn new(sn_field_length: SnFieldLength, window: u16) -> Self {
        Self {
            modulus: sn_field_length.modulus(),
            window,
        }
    }

    /// Number of distinct sequence numbers
    pub fn modulus(&self) -> u16 {
        self.modulus
    }

    /// Window size
    pub fn window(&self) -> u16 {
        self.window
    }

    /// `sn + 1`
    #[inline]
    pub fn inc(&self, sn: u16) -> u16 {
        self.add(sn, 1)
    }

    /// `sn + n`
    #[inline]
    pub fn add(&self, sn: u16, n: u16) -> u16 {
        ((sn as u32 + n as u32) % self.modulus as u32) as u16
    }

    /// `sn - n`
    #[inline]
    pub fn sub(&self, sn: u16, n: u16) -> u16 {
        let m = self.modulus as u32;
        ((sn as u32 + m - (n as u32 % m)) % m) as u16
    }

    /// Distance of `sn` above `base`
    #[inline]
    pub fn distance(&self, sn: u16, base: u16) -> u16 {
        mod_base(sn, base, self.modulus)
    }

    /// `a < b` when both are measured from `base`
    #[inline]
    pub fn lt(&self, a: u16, b: u16, base: u16) -> bool {
        self.distance(a, base) < self.distance(b, base)
    }

    /// `a <= b` when both are measured from `base`
    #[inline]
    pub fn le(&self, a: u16, b: u16, base: u16) -> bool {
        self.distance(a, base) <= self.distance(b, base)
    }

    /// `lo <= sn < hi`, with `lo` as the base
    #[inline]
    pub fn in_range(&self, sn: u16, lo: u16, hi: u16) -> bool {
        self.distance(sn, lo) < self.distance(hi, lo)
    }

    /// `base <= sn < base + window`
    #[inline]
    pub fn in_window(&self, sn: u16, base: u16) -> bool {
        self.distance(sn, base) < self.window
    }

    /// Sequence numbers `lo, lo + 1, ..., hi - 1`
    pub fn range(&self, lo: u16, hi: u16) -> impl Iterator<Item = u16> {
        let space = *self;
        let count = self.distance(hi, lo);
        (0..count).map(move |i| space.add(lo, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mod_base_wraps() {
        assert_eq!(mod_base(2, 30, 32), 4);
        assert_eq!(mod_base(30, 30, 32), 0);
        assert_eq!(mod_base(29, 30, 32), 31);
        assert_eq!(mod_base(5, 1020, 1024), 9);
    }

    #[test]
    fn test_comparison_across_wraparound() {
        let space = SnSpace::new(SnFieldLength::Bits5, 16);
        // 31 precedes 1 when the window starts at 28
        assert!(space.lt(31, 1, 28));
        assert!(!space.lt(1, 31, 28));
        assert!(space.le(3, 3, 28));
    }

    #[test]
    fn test_window_membership() {
        let space = SnSpace::new(SnFieldLength::Bits10, 512);
        assert!(space.in_window(1023, 1000));
        assert!(space.in_window(487, 1000));
        assert!(!space.in_window(488, 1000));
        assert!(space.in_range(2, 1022, 5));
        assert!(!space.in_range(5, 1022, 5));
    }

    #[test]
    fn test_inc_add_sub() {
        let space = SnSpace::new(SnFieldLength::Bits5, 16);
        assert_eq!(space.inc(31), 0);
        assert_eq!(space.add(30, 5), 3);
        assert_eq!(space.sub(2, 16), 18);
        assert_eq!(space.range(30, 2).collect::<Vec<_>>(), vec![30, 31, 0, 1]);
    }
}
