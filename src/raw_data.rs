//! Owned, move-only byte buffer passed by value through chain
//! completions.

use std::ops::{Deref, DerefMut};

/// An owned block of bytes. Cheap to move, expensive to clone — cloning
/// is spelled [`RawData::duplicate`] so call sites never pay for a copy
/// by accident.
#[derive(Default)]
pub struct RawData {
    bytes: Vec<u8>,
}

impl RawData {
    /// Allocate `size` zeroed bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    /// Take ownership of an existing buffer, e.g. one filled by a
    /// previous operation.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copy from a borrowed slice (the one allocating constructor that
    /// isn't zero-fill-then-overwrite).
    pub fn allocate_from(src: &[u8]) -> Self {
        Self {
            bytes: src.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Deep copy. Named distinctly from `Clone` since the whole point of
    /// this type is that moves, not copies, are the default.
    pub fn duplicate(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
        }
    }

    /// Shrink the logical length after a short transfer filled fewer
    /// bytes than were allocated for it.
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

impl Deref for RawData {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for RawData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for RawData {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for RawData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_zeroed() {
        let d = RawData::allocate(8);
        assert_eq!(d.len(), 8);
        assert!(d.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_from_copies() {
        let src = b"hello";
        let d = RawData::allocate_from(src);
        assert_eq!(&*d, src);
    }

    #[test]
    fn duplicate_is_independent() {
        let mut a = RawData::allocate_from(b"abc");
        let b = a.duplicate();
        a.as_mut_slice()[0] = b'z';
        assert_eq!(&*b, b"abc");
        assert_eq!(&*a, b"zbc");
    }

    #[test]
    fn truncate_shrinks_len() {
        let mut d = RawData::allocate(16);
        d.truncate(4);
        assert_eq!(d.len(), 4);
    }
}
