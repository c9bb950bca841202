//! Change bitmap — fixed-length, word-packed bit vector.
//!
//! One bit per field offset of a tree instance. Bit 0 conventionally means
//! "the whole tree changed". The synchronization passes in
//! [`crate::projection`] read and write these bitmaps; the monitor queue
//! accumulates them across undelivered updates.
//!
//! The length is fixed at construction and all set-algebra operations
//! require equal lengths — mixing bitmaps of two different tree shapes is a
//! logic error and panics.

// ---------------------------------------------------------------------------
// ChangeBitmap
// ---------------------------------------------------------------------------

const WORD_BITS: usize = 64;

/// Fixed-length bit vector marking which field offsets need action in one
/// synchronization pass.
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeBitmap {
    words: Vec<u64>,
    len: usize,
}

impl ChangeBitmap {
    /// Creates an all-clear bitmap for a tree with `len` field offsets.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Returns the number of addressable bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap addresses zero bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `idx`. Returns `true` if the bit was previously clear.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize) -> bool {
        assert!(idx < self.len, "bit index {idx} out of range {}", self.len);
        let word = &mut self.words[idx / WORD_BITS];
        let mask = 1u64 << (idx % WORD_BITS);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clears bit `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn clear(&mut self, idx: usize) {
        assert!(idx < self.len, "bit index {idx} out of range {}", self.len);
        self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
    }

    /// Returns bit `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit index {idx} out of range {}", self.len);
        self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    /// Sets every bit.
    pub fn set_all(&mut self) {
        for word in &mut self.words {
            *word = u64::MAX;
        }
        self.mask_tail();
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
    }

    /// Returns `true` if any bit is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Returns the number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `self |= other`.
    pub fn union_with(&mut self, other: &Self) {
        self.check_len(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    /// `self &= other`.
    pub fn intersect_with(&mut self, other: &Self) {
        self.check_len(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= b;
        }
    }

    /// `self &= !other`.
    pub fn subtract(&mut self, other: &Self) {
        self.check_len(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= !b;
        }
    }

    /// Returns `true` if `self & other` has any bit set.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.check_len(other);
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    /// Returns an iterator over the indices of set bits, ascending.
    pub fn ones(&self) -> Ones<'_> {
        Ones {
            bitmap: self,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Returns `true` if every bit in `range` is set.
    #[must_use]
    pub fn all_set_in(&self, mut range: std::ops::Range<usize>) -> bool {
        range.all(|i| self.get(i))
    }

    fn check_len(&self, other: &Self) {
        assert_eq!(
            self.len, other.len,
            "bitmap length mismatch: {} vs {}",
            self.len, other.len
        );
    }

    /// Clears the unused bits of the last word.
    fn mask_tail(&mut self) {
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Debug for ChangeBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ones()).finish()
    }
}

// ---------------------------------------------------------------------------
// Ones iterator
// ---------------------------------------------------------------------------

/// Iterator over set-bit indices of a [`ChangeBitmap`], ascending.
pub struct Ones<'a> {
    bitmap: &'a ChangeBitmap,
    word_idx: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.current == 0 {
            self.word_idx += 1;
            if self.word_idx >= self.bitmap.words.len() {
                return None;
            }
            self.current = self.bitmap.words[self.word_idx];
        }
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.word_idx * WORD_BITS + bit)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- basic ops --

    #[test]
    fn test_bitmap_set_get_clear() {
        let mut bm = ChangeBitmap::new(100);
        assert!(!bm.get(0));
        assert!(bm.set(0));
        assert!(!bm.set(0)); // already set
        assert!(bm.get(0));

        assert!(bm.set(99));
        assert!(bm.get(99));

        bm.clear(0);
        assert!(!bm.get(0));
        assert!(bm.get(99));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bitmap_out_of_range_panics() {
        let mut bm = ChangeBitmap::new(10);
        bm.set(10);
    }

    #[test]
    fn test_bitmap_set_all_clear_all() {
        let mut bm = ChangeBitmap::new(70);
        bm.set_all();
        assert_eq!(bm.count(), 70);
        assert!(bm.any());

        bm.clear_all();
        assert_eq!(bm.count(), 0);
        assert!(!bm.any());
    }

    #[test]
    fn test_bitmap_set_all_masks_tail() {
        // Tail bits beyond len must not leak into count
        let mut bm = ChangeBitmap::new(65);
        bm.set_all();
        assert_eq!(bm.count(), 65);
    }

    // -- set algebra --

    #[test]
    fn test_bitmap_union_intersect_subtract() {
        let mut a = ChangeBitmap::new(16);
        let mut b = ChangeBitmap::new(16);
        a.set(1);
        a.set(2);
        b.set(2);
        b.set(3);

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u.ones().collect::<Vec<_>>(), vec![1, 2, 3]);

        let mut i = a.clone();
        i.intersect_with(&b);
        assert_eq!(i.ones().collect::<Vec<_>>(), vec![2]);

        a.subtract(&b);
        assert_eq!(a.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_bitmap_intersects() {
        let mut a = ChangeBitmap::new(8);
        let mut b = ChangeBitmap::new(8);
        a.set(4);
        assert!(!a.intersects(&b));
        b.set(4);
        assert!(a.intersects(&b));
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn test_bitmap_length_mismatch_panics() {
        let mut a = ChangeBitmap::new(8);
        let b = ChangeBitmap::new(9);
        a.union_with(&b);
    }

    // -- iteration --

    #[test]
    fn test_bitmap_ones_crosses_words() {
        let mut bm = ChangeBitmap::new(200);
        for idx in [0, 63, 64, 127, 128, 199] {
            bm.set(idx);
        }
        assert_eq!(
            bm.ones().collect::<Vec<_>>(),
            vec![0, 63, 64, 127, 128, 199]
        );
    }

    #[test]
    fn test_bitmap_ones_empty() {
        let bm = ChangeBitmap::new(64);
        assert_eq!(bm.ones().count(), 0);
    }

    #[test]
    fn test_bitmap_all_set_in_range() {
        let mut bm = ChangeBitmap::new(10);
        bm.set(2);
        bm.set(3);
        bm.set(4);
        assert!(bm.all_set_in(2..5));
        assert!(!bm.all_set_in(2..6));
        assert!(bm.all_set_in(5..5)); // empty range
    }
}
