//! [`AtomicSlot`]: the one cross-thread publication point for a [`Block`].

use std::fmt;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{self, Acquire, Relaxed};

use crate::block::Block;
use crate::exclusive::WideCell;
use crate::pinned::Pinned;

/// A shared publication point holding `(eph_out, block)` as one packed word.
///
/// `eph_out` counts ephemeral shares this slot has handed out via [`pin`]
/// and migrated onto the block's durable count, but not yet paid back; it is
/// settled only when the slot itself is dropped. Modeled on the teacher's
/// `mem::epoch::Atomic<T>` (`load`/`store`/`cas`/`swap` shape), with the
/// packed pair carried by [`WideCell`] instead of a plain `AtomicPtr`.
///
/// [`pin`]: AtomicSlot::pin
pub struct AtomicSlot<T> {
    cell: WideCell<Block<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicSlot<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSlot<T> {}

impl<T> AtomicSlot<T> {
    /// Wrap `payload` in a fresh block, installing the slot's own durable
    /// share: counts start at `(0, 1)`.
    pub fn new(payload: T) -> Self {
        let block = Block::alloc(payload, 0, 1);
        AtomicSlot {
            cell: WideCell::new(0, block.as_ptr()),
        }
    }

    /// The empty slot: `eph_out = 0`, block pointer null.
    pub fn null() -> Self {
        AtomicSlot {
            cell: WideCell::new(0, ptr::null_mut()),
        }
    }

    pub fn is_null(&self) -> bool {
        self.peek_block().is_none()
    }

    /// Share `pinned`'s block with a new slot: bumps the block's durable
    /// count by one. `eph_out` starts at zero.
    pub fn from_pinned(pinned: &Pinned<T>) -> Self {
        match pinned.block() {
            Some(block) => {
                Block::adjust_relaxed(block, 0, 1);
                AtomicSlot {
                    cell: WideCell::new(0, block.as_ptr()),
                }
            }
            None => AtomicSlot::null(),
        }
    }

    /// Build a new, independently-owned slot holding whatever `source`
    /// currently points at.
    ///
    /// Implemented as `source.pin()` followed by adopting the resulting
    /// handle's durable share directly: `pin` has already migrated one
    /// ephemeral reservation into a durable share on the block (see
    /// [`AtomicSlot::pin`]), so this slot simply inherits that share instead
    /// of running a second migration.
    pub fn snapshot(source: &AtomicSlot<T>) -> Self {
        let pinned = source.pin();
        match pinned.into_raw() {
            Some(block) => AtomicSlot {
                cell: WideCell::new(0, block.as_ptr()),
            },
            None => AtomicSlot::null(),
        }
    }

    /// Advisory, non-pinning read of the currently-installed block pointer.
    pub(crate) fn peek_block(&self) -> Option<NonNull<Block<T>>> {
        let (_, ptr) = self.cell.load(Relaxed);
        NonNull::new(ptr)
    }

    /// Acquire a durable share on whatever block this slot currently points
    /// at, returning an empty handle if the slot is null.
    ///
    /// Two atomic steps, per `SPEC_FULL.md` §4.3: first, a CAS loop bumps
    /// `eph_out` by one without touching `block` (`Acquire`, standing in for
    /// the dependent load from slot to block — see §5/§9). Second, the
    /// reservation is migrated onto the block's durable count via
    /// `Block::adjust(-1, +1)` (`AcqRel`).
    pub fn pin(&self) -> Pinned<T> {
        loop {
            let ll = self.cell.load_linked(Acquire);
            let Some(block) = NonNull::new(ll.ptr()) else {
                return Pinned::empty();
            };
            let next_eph_out = ll.tag().wrapping_add(1);
            match ll.store_conditional(next_eph_out, block.as_ptr(), Acquire, Acquire) {
                Ok(()) => {
                    let reached_zero = Block::adjust(block, -1, 1);
                    debug_assert!(
                        !reached_zero,
                        "a pinned slot's block cannot reach (0, 0) while the slot still holds a share"
                    );
                    return Pinned::from_raw(block);
                }
                Err(_) => continue,
            }
        }
    }

    /// Unconditionally exchange this slot's `(eph_out, block)` pair with
    /// `local`'s. `local` is assumed not concurrently shared (its own side
    /// of the exchange is a plain, non-atomic-in-spirit read/write), per the
    /// open-question resolution in `SPEC_FULL.md` §9: `swap` is the
    /// one-side-local operation, `cas` is the fully-conditional one.
    pub fn swap(&self, local: &mut AtomicSlot<T>) {
        let (local_tag, local_ptr) = local.cell.load(Relaxed);
        let (self_tag, self_ptr) = self.cell.exchange(local_tag, local_ptr, Ordering::AcqRel);
        local.cell.exchange(self_tag, self_ptr, Relaxed);
    }

    /// Compare-and-swap keyed on block identity: succeeds iff this slot's
    /// current block equals `expected`'s, regardless of `eph_out`.
    ///
    /// On success, installs `desired`'s block with a fresh `eph_out = 0`,
    /// and writes this slot's previous `(eph_out, block)` pair back into
    /// `desired` so the caller can release it by dropping `desired`. On
    /// failure, `desired` is left untouched and this returns `false`.
    pub fn cas(&self, expected: &Pinned<T>, desired: &mut AtomicSlot<T>) -> bool {
        let expected_ptr = expected.block().map_or(ptr::null_mut(), |b| b.as_ptr());
        loop {
            let ll = self.cell.load_linked(Acquire);
            if ll.ptr() != expected_ptr {
                return false;
            }
            let old_tag = ll.tag();
            let old_ptr = ll.ptr();
            let (_, desired_ptr) = desired.cell.load(Relaxed);
            match ll.store_conditional(0, desired_ptr, Ordering::Release, Acquire) {
                Ok(()) => {
                    desired.cell.exchange(old_tag, old_ptr, Relaxed);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        let (eph_out, ptr) = self.cell.load(Relaxed);
        if let Some(block) = NonNull::new(ptr) {
            if Block::adjust(block, eph_out as i32, -1) {
                unsafe { Block::destroy_or_recycle(block) };
            }
        }
    }
}

impl<T> Default for AtomicSlot<T> {
    fn default() -> Self {
        AtomicSlot::null()
    }
}

impl<T> fmt::Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (eph_out, ptr) = self.cell.load(Relaxed);
        f.debug_struct("AtomicSlot")
            .field("eph_out", &eph_out)
            .field("block", &ptr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_then_pin_yields_durable_handle() {
        let slot = AtomicSlot::new(42u32);
        let pinned = slot.pin();
        assert_eq!(*pinned, 42);
        drop(pinned);
        drop(slot);
    }

    #[test]
    fn null_slot_pin_is_empty() {
        let slot: AtomicSlot<u32> = AtomicSlot::null();
        let pinned = slot.pin();
        assert!(pinned.is_empty());
    }

    #[test]
    fn cas_succeeds_on_matching_expected_and_fails_on_stale() {
        let slot = AtomicSlot::new(1u32);
        let old = slot.pin();

        let mut desired = AtomicSlot::new(2u32);
        assert!(slot.cas(&old, &mut desired));
        // `desired` now holds the slot's previous pair (block for 1u32) for
        // the caller to release.
        assert_eq!(*desired.pin(), 1);

        let mut stale_desired = AtomicSlot::new(3u32);
        assert!(!slot.cas(&old, &mut stale_desired));
        assert_eq!(*stale_desired.pin(), 3);
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = AtomicSlot::new(1u32);
        let mut b = AtomicSlot::new(2u32);
        a.swap(&mut b);
        assert_eq!(*a.pin(), 2);
        assert_eq!(*b.pin(), 1);
    }

    #[test]
    fn from_pinned_shares_block_with_source() {
        let source = AtomicSlot::new(9u32);
        let pinned = source.pin();
        let alias = AtomicSlot::from_pinned(&pinned);
        assert!(alias.peek_block() == source.peek_block());
        assert_eq!(*alias.pin(), 9);
    }

    #[test]
    fn snapshot_creates_independently_owned_slot() {
        let source = AtomicSlot::new(5u32);
        let copy = AtomicSlot::snapshot(&source);
        assert_eq!(*copy.pin(), 5);
        drop(source);
        assert_eq!(*copy.pin(), 5);
    }
}
