//! The on-disk (and in-memory mirror) header block codec.
//!
//! Layout (little-endian, spec §4.6): a 32-bit entry count at offset 0,
//! followed by up to `LOG_SIZE` 32-bit block numbers. The distilled spec
//! specifies *signed* 32-bit fields, matching the original on-disk format
//! even though block numbers are semantically non-negative (see
//! SPEC_FULL.md's Open Questions); this type stores them as `i32` and
//! converts at the boundary, so a corrupt or foreign image with a
//! negative entry is caught rather than silently reinterpreted.

use bwal_params::LOG_SIZE;
use bwal_types::BlockNo;
use dataview::Pod;

/// Contents of the header block: both the on-disk record and the
/// in-memory record of blocks logged so far in the current commit group.
#[repr(C)]
#[derive(Pod)]
pub struct LogHeader {
    len: i32,
    blocks: [i32; LOG_SIZE],
}

impl LogHeader {
    pub(crate) const fn new() -> Self {
        Self {
            len: 0,
            blocks: [0; LOG_SIZE],
        }
    }

    pub(crate) fn len(&self) -> usize {
        usize::try_from(self.len)
            .unwrap_or_else(|_| panic!("write-ahead log: corrupt header entry count {}", self.len))
    }

    /// Logically empties the log (spec §3 invariant 5: `write_head` with
    /// `n=0` makes the on-disk log empty).
    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Overwrites `self` with the contents of `other` (used by
    /// `read_head`/recovery to mirror the on-disk block into memory).
    pub(crate) fn copy_from(&mut self, other: &Self) {
        self.len = other.len;
        let n = self.len();
        self.blocks[..n].copy_from_slice(&other.blocks[..n]);
    }

    /// The home block numbers currently logged, in slot order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = BlockNo> + '_ {
        let n = self.len();
        self.blocks[..n].iter().map(|&b| {
            let b = u32::try_from(b).unwrap_or_else(|_| {
                panic!("write-ahead log: corrupt header references negative block number {b}")
            });
            BlockNo::new(b)
        })
    }

    /// The slot index already holding `block`, if any (absorption, spec
    /// §3 invariant 4 / §4.4).
    pub(crate) fn position(&self, block: BlockNo) -> Option<usize> {
        self.entries().position(|b| b == block)
    }

    /// Appends `block` as a new entry.
    ///
    /// # Panics
    ///
    /// Panics if the header is already full. Callers must check
    /// [`Self::len`] against `LOG_SIZE` first (spec §4.4 guard).
    pub(crate) fn push(&mut self, block: BlockNo) {
        let n = self.len();
        assert!(n < LOG_SIZE, "write-ahead log: header is full");
        self.blocks[n] = i32::try_from(block.value())
            .expect("write-ahead log: block number does not fit the on-disk header field");
        self.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_is_empty() {
        let h = LogHeader::new();
        assert_eq!(h.len(), 0);
        assert_eq!(h.entries().count(), 0);
    }

    #[test]
    fn push_and_absorption() {
        let mut h = LogHeader::new();
        h.push(BlockNo::new(100));
        h.push(BlockNo::new(200));
        assert_eq!(h.len(), 2);
        assert_eq!(h.position(BlockNo::new(100)), Some(0));
        assert_eq!(h.position(BlockNo::new(200)), Some(1));
        assert_eq!(h.position(BlockNo::new(300)), None);
        assert_eq!(
            h.entries().collect::<Vec<_>>(),
            vec![BlockNo::new(100), BlockNo::new(200)]
        );
    }

    #[test]
    fn copy_from_mirrors_length_and_entries() {
        let mut src = LogHeader::new();
        src.push(BlockNo::new(7));
        src.push(BlockNo::new(9));

        let mut dst = LogHeader::new();
        dst.push(BlockNo::new(1));
        dst.copy_from(&src);

        assert_eq!(dst.entries().collect::<Vec<_>>(), vec![BlockNo::new(7), BlockNo::new(9)]);
    }

    #[test]
    fn clear_empties_the_header() {
        let mut h = LogHeader::new();
        h.push(BlockNo::new(5));
        h.clear();
        assert_eq!(h.len(), 0);
        assert_eq!(h.entries().count(), 0);
    }

    #[test]
    #[should_panic]
    fn push_past_log_size_panics() {
        let mut h = LogHeader::new();
        for i in 0..LOG_SIZE as u32 {
            h.push(BlockNo::new(i));
        }
        h.push(BlockNo::new(LOG_SIZE as u32));
    }
}
