//! The indirection object shared by every [`Pinned`](crate::Pinned) and
//! [`AtomicSlot`](crate::AtomicSlot) pointing at the same payload.
//!
//! A `Block<T>` colocates the payload with a single packed counter (see
//! [`Counts`]) the way `pleco_arc::ArcInner`/`darc::Inner` colocate data and
//! refcount, rather than keeping the payload behind a second `Box`.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

#[cfg(feature = "logging")]
use log::trace;

use crate::pool::Recycler;

/// Packs the ephemeral count (high 32 bits) and the reference count (low 32
/// bits) into one `AtomicI64`, following `splitrc::SplitCount`'s technique of
/// encoding two independent signed counters as componentwise deltas on a
/// single word so that both move under one `fetch_add`.
struct Counts(std::sync::atomic::AtomicI64);

#[inline(always)]
fn pack_delta(d_eph: i32, d_refs: i32) -> i64 {
    ((d_eph as i64) << 32) | (d_refs as u32 as i64)
}

#[inline(always)]
fn unpack(word: i64) -> (i32, i32) {
    ((word >> 32) as i32, word as i32)
}

impl Counts {
    fn new(ephemeral: i32, refs: i32) -> Self {
        Counts(std::sync::atomic::AtomicI64::new(pack_delta(ephemeral, refs)))
    }

    /// Reinitialize a block pulled out of a pool. The caller has exclusive
    /// access (the block is not yet published), so `Relaxed` suffices.
    fn reset(&self, ephemeral: i32, refs: i32) {
        self.0.store(pack_delta(ephemeral, refs), Ordering::Relaxed);
    }

    #[inline(always)]
    fn current(&self, ord: Ordering) -> (i32, i32) {
        unpack(self.0.load(ord))
    }

    /// Apply `(d_eph, d_refs)` with full ordering, returning whether the
    /// result is `(0, 0)`. See `SPEC_FULL.md` §4.1 for why a single `AcqRel`
    /// RMW is sufficient for both the "non-zero release" and "zero acquire"
    /// cases the original design calls for.
    #[inline]
    fn adjust(&self, d_eph: i32, d_refs: i32) -> bool {
        let old = self.0.fetch_add(pack_delta(d_eph, d_refs), Ordering::AcqRel);
        let (eph, refs) = unpack(old);
        (eph + d_eph, refs + d_refs) == (0, 0)
    }

    /// Pure-increment fast path: adding shares never needs a fence.
    #[inline]
    fn adjust_relaxed(&self, d_eph: i32, d_refs: i32) {
        debug_assert!(d_eph >= 0 && d_refs >= 0, "adjust_relaxed is increment-only");
        self.0.fetch_add(pack_delta(d_eph, d_refs), Ordering::Relaxed);
    }
}

/// The indirection object between handles and a payload of type `T`.
///
/// Opaque by design: its fields are private, and it is only ever touched
/// through [`crate::Pinned`], [`crate::AtomicSlot`], and the [`Recycler`]
/// trait (which needs to name the type to receive retired blocks).
pub struct Block<T> {
    payload: std::cell::UnsafeCell<ManuallyDrop<T>>,
    counts: CachePadded<Counts>,
    recycler: std::cell::UnsafeCell<Option<Arc<dyn Recycler<T> + Send + Sync>>>,
    link: AtomicPtr<Block<T>>,
}

unsafe impl<T: Send + Sync> Send for Block<T> {}
unsafe impl<T: Send + Sync> Sync for Block<T> {}

impl<T> Block<T> {
    /// Allocate a fresh block with the given initial counts.
    pub(crate) fn alloc(payload: T, ephemeral: i32, refs: i32) -> NonNull<Block<T>> {
        let boxed = Box::new(Block {
            payload: std::cell::UnsafeCell::new(ManuallyDrop::new(payload)),
            counts: CachePadded::new(Counts::new(ephemeral, refs)),
            recycler: std::cell::UnsafeCell::new(None),
            link: AtomicPtr::new(std::ptr::null_mut()),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    /// Re-initialize a block retrieved from a pool, writing a fresh payload
    /// into its now-empty payload slot. Caller must have exclusive,
    /// non-concurrent access (the block is not yet published).
    ///
    /// # Safety
    /// `block` must point at a live `Block<T>` whose payload has already
    /// been dropped (the only state a `Recycler` is ever handed, per
    /// `SPEC_FULL.md` §9).
    pub(crate) unsafe fn reset(block: NonNull<Block<T>>, payload: T, ephemeral: i32, refs: i32) {
        let b = block.as_ref();
        b.counts.reset(ephemeral, refs);
        *b.payload.get() = ManuallyDrop::new(payload);
        *b.recycler.get() = None;
        b.link.store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn adjust(block: NonNull<Block<T>>, d_eph: i32, d_refs: i32) -> bool {
        unsafe { block.as_ref() }.counts.adjust(d_eph, d_refs)
    }

    #[inline]
    pub(crate) fn adjust_relaxed(block: NonNull<Block<T>>, d_eph: i32, d_refs: i32) {
        unsafe { block.as_ref() }.counts.adjust_relaxed(d_eph, d_refs)
    }

    #[cfg(test)]
    pub(crate) fn counts(block: NonNull<Block<T>>) -> (i32, i32) {
        unsafe { block.as_ref() }.counts.current(Ordering::Acquire)
    }

    /// A dependent-load-equivalent read of the payload; see `SPEC_FULL.md`
    /// §5 and §9 for why this is a plain read rather than an attempt at
    /// consume ordering (Rust has no such primitive, and the prior
    /// `Acquire` on the pointer read already orders this access).
    ///
    /// # Safety
    /// `block` must be kept alive by a durable share for the duration of the
    /// returned borrow's use.
    #[inline]
    pub(crate) unsafe fn payload<'a>(block: NonNull<Block<T>>) -> &'a T {
        &*(*block.as_ptr()).payload.get()
    }

    pub(crate) fn set_recycler(block: NonNull<Block<T>>, recycler: Arc<dyn Recycler<T> + Send + Sync>) {
        unsafe { *block.as_ref().recycler.get() = Some(recycler) };
    }

    pub(crate) fn recycler(block: NonNull<Block<T>>) -> Option<Arc<dyn Recycler<T> + Send + Sync>> {
        unsafe { (*block.as_ref().recycler.get()).clone() }
    }

    /// Borrow the intrusive free-list link. Ownership of this field belongs
    /// to whichever pool currently holds the (otherwise-quiescent) block.
    ///
    /// # Safety
    /// `block` must point at a live allocation for the lifetime `'a`.
    pub(crate) unsafe fn link<'a>(block: NonNull<Block<T>>) -> &'a AtomicPtr<Block<T>> {
        &(*block.as_ptr()).link
    }

    /// Drop the payload and either deallocate or hand the block to its
    /// recycler. Called exactly once, by the thread that drove the counts
    /// to `(0, 0)`.
    ///
    /// # Safety
    /// `block` must not be accessed by any other thread after this call
    /// returns (nor during it, besides via the recycler's own contract).
    pub(crate) unsafe fn destroy_or_recycle(block: NonNull<Block<T>>) {
        ManuallyDrop::drop(&mut *block.as_ref().payload.get());
        match Block::recycler(block) {
            Some(recycler) => {
                #[cfg(feature = "logging")]
                trace!("recycling block {:p}", block.as_ptr());
                recycler.recycle(block);
            }
            None => {
                #[cfg(feature = "logging")]
                trace!("deallocating block {:p}", block.as_ptr());
                drop(Box::from_raw(block.as_ptr()));
            }
        }
    }
}

impl<T> fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (eph, refs) = self.counts.current(Ordering::Relaxed);
        f.debug_struct("Block")
            .field("ephemeral", &eph)
            .field("refs", &refs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_reports_zero_transition() {
        let block = Block::alloc(5i32, 1, 0);
        assert!(!Block::adjust(block, 0, 0)); // no-op stays non-zero
        assert!(Block::adjust(block, -1, 0));
        unsafe { Block::destroy_or_recycle(block) };
    }

    #[test]
    fn counts_pack_and_unpack_independently() {
        let block = Block::alloc((), 3, 4);
        assert_eq!(Block::counts(block), (3, 4));
        Block::adjust_relaxed(block, 2, 0);
        assert_eq!(Block::counts(block), (5, 4));
        assert!(Block::adjust(block, -5, -4));
        unsafe { Block::destroy_or_recycle(block) };
    }
}
