//! Reference-counted byte slices and ordered slice buffers.
//!
//! [`Slice`] is an immutable, cheaply-cloneable byte range that may carry a
//! quota reservation from the allocator that produced it. [`SliceBuffer`] is
//! the unit of endpoint I/O: an ordered sequence of slices with a running
//! byte total, supporting append and prefix-consume.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::ops::Deref;
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::quota::QuotaReservation;

/// An immutable, reference-counted contiguous byte range.
///
/// Clones share the underlying storage. When the slice came from a
/// quota-backed allocation, the charge is released once the last clone drops.
#[derive(Clone)]
pub struct Slice {
    bytes: Bytes,
    reservation: Option<Arc<QuotaReservation>>,
}

impl Slice {
    /// Wraps a static byte range.
    pub fn from_static(data: &'static [u8]) -> Self {
        Slice {
            bytes: Bytes::from_static(data),
            reservation: None,
        }
    }

    /// Copies `data` into a new unaccounted slice.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Slice {
            bytes: Bytes::copy_from_slice(data),
            reservation: None,
        }
    }

    pub(crate) fn with_reservation(bytes: Bytes, reservation: Arc<QuotaReservation>) -> Self {
        Slice {
            bytes,
            reservation: Some(reservation),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length slice.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Splits off and returns the first `n` bytes; `self` keeps the rest.
    /// Both halves share storage and the reservation.
    pub fn split_to(&mut self, n: usize) -> Slice {
        Slice {
            bytes: self.bytes.split_to(n),
            reservation: self.reservation.clone(),
        }
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.bytes.advance(n);
    }
}

impl Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Slice {
    fn from(data: Vec<u8>) -> Self {
        Slice {
            bytes: Bytes::from(data),
            reservation: None,
        }
    }
}

impl From<Bytes> for Slice {
    fn from(bytes: Bytes) -> Self {
        Slice {
            bytes,
            reservation: None,
        }
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slice({} bytes)", self.len())
    }
}

/// An ordered sequence of slices with a total byte count.
///
/// Endpoint reads append into one; endpoint writes drain one front-to-back.
/// Ownership moves into the engine with each operation and is handed back
/// through the completion callback.
#[derive(Default)]
pub struct SliceBuffer {
    slices: VecDeque<Slice>,
    len: usize,
}

impl SliceBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        SliceBuffer::default()
    }

    /// Appends a slice at the back.
    pub fn append(&mut self, slice: Slice) {
        if slice.is_empty() {
            return;
        }
        self.len += slice.len();
        self.slices.push_back(slice);
    }

    /// Copies `data` into a new slice appended at the back.
    pub fn append_copy(&mut self, data: &[u8]) {
        self.append(Slice::copy_from_slice(data));
    }

    /// Moves every slice out of `other` onto the back of `self`.
    pub fn extend(&mut self, other: &mut SliceBuffer) {
        self.len += other.len;
        self.slices.append(&mut other.slices);
        other.len = 0;
    }

    /// Discards the first `n` bytes (or everything, if shorter).
    pub fn consume_prefix(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let front = self
                .slices
                .front_mut()
                .expect("length accounting out of sync");
            if front.len() <= n {
                n -= front.len();
                self.slices.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    /// Removes and returns the first slice.
    pub fn take_first(&mut self) -> Option<Slice> {
        let slice = self.slices.pop_front()?;
        self.len -= slice.len();
        Some(slice)
    }

    /// Drops every slice.
    pub fn clear(&mut self) {
        self.slices.clear();
        self.len = 0;
    }

    /// Total byte count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slices held.
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Iterates the slices in order.
    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }

    /// Borrows the slices as vectored-I/O buffers.
    pub fn as_io_slices(&self) -> Vec<IoSlice<'_>> {
        self.slices.iter().map(|s| IoSlice::new(s)).collect()
    }

    /// Flattens the contents into one `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl std::fmt::Debug for SliceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SliceBuffer({} bytes in {} slices)",
            self.len,
            self.slices.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_tracks_length() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"hello");
        buf.append_copy(b" world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.slice_count(), 2);
        assert_eq!(buf.to_vec(), b"hello world");
    }

    #[test]
    fn test_empty_slices_are_skipped() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"");
        assert_eq!(buf.slice_count(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_prefix_within_slice() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abcdef");
        buf.consume_prefix(2);
        assert_eq!(buf.to_vec(), b"cdef");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_consume_prefix_across_slices() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abc");
        buf.append_copy(b"def");
        buf.append_copy(b"ghi");
        buf.consume_prefix(5);
        assert_eq!(buf.to_vec(), b"fghi");
        assert_eq!(buf.slice_count(), 2);
    }

    #[test]
    fn test_consume_prefix_saturates() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"abc");
        buf.consume_prefix(100);
        assert!(buf.is_empty());
        assert_eq!(buf.slice_count(), 0);
    }

    #[test]
    fn test_take_first() {
        let mut buf = SliceBuffer::new();
        buf.append_copy(b"one");
        buf.append_copy(b"two");
        let first = buf.take_first().unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_extend_moves_everything() {
        let mut a = SliceBuffer::new();
        a.append_copy(b"aa");
        let mut b = SliceBuffer::new();
        b.append_copy(b"bb");
        b.append_copy(b"cc");
        a.extend(&mut b);
        assert_eq!(a.to_vec(), b"aabbcc");
        assert!(b.is_empty());
        assert_eq!(b.slice_count(), 0);
    }

    #[test]
    fn test_slice_split_to_shares_storage() {
        let mut slice = Slice::copy_from_slice(b"abcdef");
        let head = slice.split_to(2);
        assert_eq!(&head[..], b"ab");
        assert_eq!(&slice[..], b"cdef");
    }

    #[test]
    fn test_clone_shares_contents() {
        let slice = Slice::copy_from_slice(b"shared");
        let clone = slice.clone();
        assert_eq!(&slice[..], &clone[..]);
    }

    proptest! {
        // Length bookkeeping must survive arbitrary append/consume interleavings.
        #[test]
        fn prop_append_consume_conserves_bytes(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..20),
            consumes in prop::collection::vec(0usize..128, 0..20),
        ) {
            let mut buf = SliceBuffer::new();
            let mut model: Vec<u8> = Vec::new();
            let mut consume_iter = consumes.into_iter();
            for chunk in chunks {
                model.extend_from_slice(&chunk);
                buf.append_copy(&chunk);
                if let Some(n) = consume_iter.next() {
                    let n = n.min(model.len());
                    model.drain(..n);
                    buf.consume_prefix(n);
                }
                prop_assert_eq!(buf.len(), model.len());
                prop_assert_eq!(buf.to_vec(), model.clone());
            }
        }
    }
}
