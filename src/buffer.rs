//! The in-memory destination buffer.
//!
//! Writes into it are disjoint by construction (invariant I1): every byte
//! of `[0, length)` is assigned to exactly one scheduler recursion, and no
//! two recursions ever claim overlapping ranges. That's what lets
//! concurrent I/O tasks write into the same buffer without a lock (spec.md
//! §5, "Ordering guarantees") — at the cost of a small, explicitly-scoped
//! `unsafe` block, since the compiler cannot see the disjointness that the
//! scheduler's recursion structure guarantees at the type level.

use std::cell::UnsafeCell;

pub struct SharedBuffer {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: callers of `slice_mut` must only ever request disjoint
// [start, end) ranges concurrently; the scheduler upholds this as
// invariant I1. Reads of the finished buffer only happen after every
// writer has been joined.
unsafe impl Sync for SharedBuffer {}
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    pub fn new(len: u64) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> u64 {
        unsafe { (*self.data.get()).len() as u64 }
    }

    /// Returns a mutable view of `[start, end)`.
    ///
    /// # Safety
    /// The caller must guarantee no other live call to `slice_mut` overlaps
    /// `[start, end)` (invariant I1).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, start: u64, end: u64) -> &mut [u8] {
        &mut (*self.data.get())[start as usize..end as usize]
    }

    /// Consumes the buffer once the scheduler has returned and every byte
    /// has been written (invariant I5).
    pub fn into_inner(self) -> Box<[u8]> {
        self.data.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_slices_are_independently_writable() {
        let buf = SharedBuffer::new(10);
        unsafe {
            buf.slice_mut(0, 5).copy_from_slice(&[1, 2, 3, 4, 5]);
            buf.slice_mut(5, 10).copy_from_slice(&[6, 7, 8, 9, 10]);
        }
        assert_eq!(&*buf.into_inner(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }
}
