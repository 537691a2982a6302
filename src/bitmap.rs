// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-size 256-bit vector bitmaps, one bit per interrupt vector.
//!
//! [`VectorBitmap`] is owned by a single vCPU's thread. [`SharedBitmap`] is
//! the atomic-backed variant used where another vCPU may set bits
//! concurrently with the owner draining them.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// The number of 32-bit words covering 256 vectors.
pub(crate) const BANKS: usize = 8;

/// Splits a vector into its word index and bit mask.
pub(crate) fn bank_mask(vector: u8) -> (usize, u32) {
    (vector as usize / 32, 1 << (vector % 32))
}

/// A 256-bit bitmap indexed by interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorBitmap([u32; BANKS]);

impl VectorBitmap {
    /// An empty bitmap.
    pub const fn new() -> Self {
        Self([0; BANKS])
    }

    /// The raw 32-bit words, lowest vectors first.
    pub fn words(&self) -> [u32; BANKS] {
        self.0
    }

    pub(crate) fn word(&self, bank: usize) -> u32 {
        self.0[bank]
    }

    pub(crate) fn word_mut(&mut self, bank: usize) -> &mut u32 {
        &mut self.0[bank]
    }

    /// Sets the bit for `vector`.
    pub fn set(&mut self, vector: u8) {
        let (bank, mask) = bank_mask(vector);
        self.0[bank] |= mask;
    }

    /// Clears the bit for `vector`.
    pub fn clear(&mut self, vector: u8) {
        let (bank, mask) = bank_mask(vector);
        self.0[bank] &= !mask;
    }

    /// Returns whether the bit for `vector` is set.
    pub fn test(&self, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        self.0[bank] & mask != 0
    }

    /// Returns the highest set vector, scanning from the most significant
    /// word down, or `None` if the bitmap is empty.
    pub fn find_highest(&self) -> Option<u8> {
        for (bank, &word) in self.0.iter().enumerate().rev() {
            if word != 0 {
                return Some((bank as u32 * 32 + (31 - word.leading_zeros())) as u8);
            }
        }
        None
    }

    /// The number of set bits.
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    /// Returns whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.0 = [0; BANKS];
    }
}

/// A 256-bit bitmap whose bits may be set by remote vCPUs while the owner
/// drains them.
#[derive(Debug, Default)]
pub(crate) struct SharedBitmap([AtomicU32; BANKS]);

impl SharedBitmap {
    /// Sets a bit with release ordering, so that any associated state written
    /// before the request becomes visible to the draining side. Returns true
    /// if the bit was newly set.
    pub fn set(&self, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        self.0[bank].fetch_or(mask, Ordering::Release) & mask == 0
    }

    /// Sets or clears a bit to match `value`. Used for side bitmaps (trigger
    /// mode) that are published before the corresponding request bit.
    pub fn assign(&self, vector: u8, value: bool) {
        let (bank, mask) = bank_mask(vector);
        if (self.0[bank].load(Ordering::Relaxed) & mask != 0) != value {
            if value {
                self.0[bank].fetch_or(mask, Ordering::Relaxed);
            } else {
                self.0[bank].fetch_and(!mask, Ordering::Relaxed);
            }
        }
    }

    pub fn load_word(&self, bank: usize) -> u32 {
        self.0[bank].load(Ordering::Relaxed)
    }

    /// Atomically takes one word, with acquire ordering pairing with the
    /// release in [`Self::set`]. Cheap when the word is empty.
    pub fn take_word(&self, bank: usize) -> u32 {
        if self.0[bank].load(Ordering::Relaxed) == 0 {
            0
        } else {
            self.0[bank].swap(0, Ordering::Acquire)
        }
    }

    pub fn clear_all(&self) {
        for word in &self.0 {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SharedBitmap;
    use super::VectorBitmap;

    #[test]
    fn set_test_clear() {
        let mut map = VectorBitmap::new();
        assert!(map.is_empty());
        map.set(0x41);
        assert!(map.test(0x41));
        assert!(!map.test(0x40));
        assert_eq!(map.count(), 1);
        map.clear(0x41);
        assert!(map.is_empty());
    }

    #[test]
    fn find_highest_scans_words_downward() {
        let mut map = VectorBitmap::new();
        assert_eq!(map.find_highest(), None);
        map.set(0x21);
        map.set(0xfe);
        map.set(0x80);
        assert_eq!(map.find_highest(), Some(0xfe));
        map.clear(0xfe);
        assert_eq!(map.find_highest(), Some(0x80));
        map.clear(0x80);
        assert_eq!(map.find_highest(), Some(0x21));
    }

    #[test]
    fn shared_set_reports_newly_set() {
        let map = SharedBitmap::default();
        assert!(map.set(0x33));
        assert!(!map.set(0x33));
        assert_eq!(map.take_word(1), 1 << (0x33 % 32));
        assert_eq!(map.take_word(1), 0);
        assert!(map.set(0x33));
    }

    #[test]
    fn assign_tracks_value() {
        let map = SharedBitmap::default();
        map.assign(0x55, true);
        assert_eq!(map.load_word(2), 1 << (0x55 % 32));
        map.assign(0x55, false);
        assert_eq!(map.load_word(2), 0);
    }
}
