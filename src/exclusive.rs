//! Load-linked/store-conditional style access to a `(tag, pointer)` pair.
//!
//! This is the wide-CAS analogue of `mem::epoch::Atomic`'s plain `AtomicPtr`:
//! instead of a single word, [`WideCell`] holds a pointer together with a
//! 64-bit tag in one naturally-aligned double word, mutated only through a
//! single atomic compare-and-swap. Unlike the ll/sc pair a real ISA exposes,
//! [`load_linked`]/[`store_conditional`] here are built on top of a genuine
//! CAS (`portable_atomic::AtomicU128`), so `store_conditional` can be retried
//! directly with the snapshot it returns on failure.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

/// A `(tag, pointer)` pair packed into one 128-bit word: the tag occupies the
/// high 64 bits, the pointer (widened to `u64`) the low 64 bits.
pub(crate) struct WideCell<T> {
    word: AtomicU128,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for WideCell<T> {}
unsafe impl<T> Sync for WideCell<T> {}

#[inline(always)]
fn pack<T>(tag: u64, ptr: *mut T) -> u128 {
    ((tag as u128) << 64) | (ptr as usize as u64 as u128)
}

#[inline(always)]
fn unpack<T>(word: u128) -> (u64, *mut T) {
    let tag = (word >> 64) as u64;
    let ptr = (word as u64) as usize as *mut T;
    (tag, ptr)
}

impl<T> WideCell<T> {
    pub(crate) fn new(tag: u64, ptr: *mut T) -> Self {
        WideCell {
            word: AtomicU128::new(pack(tag, ptr)),
            _marker: PhantomData,
        }
    }

    /// Plain load of the pair. Used by advisory, non-pinning reads.
    pub(crate) fn load(&self, ord: Ordering) -> (u64, *mut T) {
        unpack(self.word.load(ord))
    }

    /// Unconditionally exchange the pair, returning the previous value.
    ///
    /// This assumes the caller side producing `new` is not itself concurrently
    /// shared; see `AtomicSlot::swap`.
    pub(crate) fn exchange(&self, tag: u64, ptr: *mut T, ord: Ordering) -> (u64, *mut T) {
        unpack(self.word.swap(pack(tag, ptr), ord))
    }

    /// Snapshot the pair for a subsequent `store_conditional`.
    pub(crate) fn load_linked(&self, ord: Ordering) -> Linked<'_, T> {
        Linked {
            cell: self,
            snapshot: self.word.load(ord),
        }
    }
}

/// A snapshot of a [`WideCell`], usable for exactly one conditional store.
pub(crate) struct Linked<'a, T> {
    cell: &'a WideCell<T>,
    snapshot: u128,
}

impl<'a, T> Linked<'a, T> {
    pub(crate) fn tag(&self) -> u64 {
        unpack::<T>(self.snapshot).0
    }

    pub(crate) fn ptr(&self) -> *mut T {
        unpack(self.snapshot).1
    }

    /// Attempt to replace the snapshotted pair with `(tag, ptr)`.
    ///
    /// On success, returns `Ok(())`. On failure (the word changed since the
    /// snapshot was taken), returns `Err` with a fresh `Linked` reflecting the
    /// current value, so callers can inspect it before deciding whether to
    /// retry.
    pub(crate) fn store_conditional(
        self,
        tag: u64,
        ptr: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Linked<'a, T>> {
        match self
            .cell
            .word
            .compare_exchange_weak(self.snapshot, pack(tag, ptr), success, failure)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(Linked {
                cell: self.cell,
                snapshot: actual,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::Ordering::{Acquire, Relaxed};

    #[test]
    fn load_and_exchange_roundtrip() {
        let mut val: u64 = 0;
        let cell = WideCell::<u64>::new(0, ptr::null_mut());
        assert_eq!(cell.load(Relaxed), (0, ptr::null_mut()));

        let prev = cell.exchange(1, &mut val, Relaxed);
        assert_eq!(prev, (0, ptr::null_mut()));
        assert_eq!(cell.load(Relaxed), (1, &mut val as *mut u64));
    }

    #[test]
    fn store_conditional_succeeds_when_unchanged() {
        let mut val: u64 = 0;
        let cell = WideCell::<u64>::new(0, ptr::null_mut());
        let ll = cell.load_linked(Acquire);
        assert!(ll
            .store_conditional(1, &mut val, Relaxed, Relaxed)
            .is_ok());
        assert_eq!(cell.load(Relaxed), (1, &mut val as *mut u64));
    }

    #[test]
    fn store_conditional_fails_after_concurrent_change() {
        let mut val: u64 = 0;
        let mut other: u64 = 0;
        let cell = WideCell::<u64>::new(0, ptr::null_mut());
        let ll = cell.load_linked(Acquire);
        cell.exchange(2, &mut other, Relaxed);

        let retry = ll
            .store_conditional(1, &mut val, Relaxed, Relaxed)
            .unwrap_err();
        assert_eq!(retry.tag(), 2);
        assert_eq!(retry.ptr(), &mut other as *mut u64);
    }

    #[test]
    fn concurrent_cas_loop_converges() {
        use std::thread;

        const THREADS: usize = 4;
        const ROUNDS: usize = 20_000;

        let cell = WideCell::<()>::new(0, ptr::null_mut());
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        loop {
                            let ll = cell.load_linked(Relaxed);
                            let next = ll.tag() + 1;
                            if ll.store_conditional(next, ptr::null_mut(), Relaxed, Relaxed).is_ok() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        assert_eq!(cell.load(Relaxed).0, (THREADS * ROUNDS) as u64);
    }
}
