//! [`Pinned`]: a single-owner handle holding a durable share on a [`Block`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::block::Block;
use crate::pool::Recycler;
use crate::slot::AtomicSlot;

/// A single-owner handle that keeps its referenced payload alive for as long
/// as the handle lives.
///
/// Grounded on `pleco_arc::Arc`/`darc::Rc`'s `Clone`/`Drop`/`Deref` shape: a
/// `Relaxed` increment on clone, an `AcqRel` decrement on drop that only
/// destroys on the zero transition. `Pinned` is intentionally `!Send` and
/// `!Sync` — moving one across threads without external synchronization is a
/// programmer error this type does not attempt to detect at runtime (see
/// `SPEC_FULL.md` §7).
pub struct Pinned<T> {
    block: Option<NonNull<Block<T>>>,
    _not_send_sync: std::marker::PhantomData<*const ()>,
}

impl<T> Pinned<T> {
    /// Wrap `payload` in a fresh block with counts `(0, 1)` — the creator's
    /// own durable share.
    pub fn new(payload: T) -> Self {
        let block = Block::alloc(payload, 0, 1);
        Pinned {
            block: Some(block),
            _not_send_sync: std::marker::PhantomData,
        }
    }

    /// The empty handle: holds nothing, dereferences to `None`/panics.
    pub fn empty() -> Self {
        Pinned {
            block: None,
            _not_send_sync: std::marker::PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    /// Re-initialize a block just retrieved from a pool and wrap it,
    /// resetting its counts to `(0, 1)`.
    pub fn from_recycled(block: NonNull<Block<T>>, payload: T) -> Self {
        unsafe { Block::reset(block, payload, 0, 1) };
        Pinned {
            block: Some(block),
            _not_send_sync: std::marker::PhantomData,
        }
    }

    pub(crate) fn from_raw(block: NonNull<Block<T>>) -> Self {
        Pinned {
            block: Some(block),
            _not_send_sync: std::marker::PhantomData,
        }
    }

    pub(crate) fn block(&self) -> Option<NonNull<Block<T>>> {
        self.block
    }

    pub(crate) fn into_raw(mut self) -> Option<NonNull<Block<T>>> {
        self.block.take()
    }

    /// Non-panicking dereference, for callers that prefer `Option` over
    /// `Deref`'s panic-on-empty behavior (`SPEC_FULL.md` §7 leaves this
    /// choice open; this crate offers both).
    pub fn get(&self) -> Option<&T> {
        self.block.map(|b| unsafe { Block::payload(b) })
    }

    /// Set the block's recycling hook. Not synchronized: callers must not
    /// race this against another thread observing the same block (normally
    /// called once, before the handle's block is ever published into a
    /// shared `AtomicSlot`).
    pub fn set_recycler(&self, recycler: Arc<dyn Recycler<T> + Send + Sync>) {
        if let Some(block) = self.block {
            Block::set_recycler(block, recycler);
        }
    }

    pub fn recycler(&self) -> Option<Arc<dyn Recycler<T> + Send + Sync>> {
        self.block.and_then(Block::recycler)
    }

    /// Advisory, racy comparison of this handle's block against the block
    /// currently observable through `slot`, without pinning it. Meaningful
    /// only when both sides are known quiescent (`SPEC_FULL.md` §4.2).
    pub fn is_same_slot(&self, slot: &AtomicSlot<T>) -> bool {
        slot.peek_block() == self.block
    }
}

impl<T> Clone for Pinned<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            Block::adjust_relaxed(block, 0, 1);
        }
        Pinned {
            block: self.block,
            _not_send_sync: std::marker::PhantomData,
        }
    }
}

impl<T> Drop for Pinned<T> {
    fn drop(&mut self) {
        if let Some(block) = self.block {
            if Block::adjust(block, 0, -1) {
                unsafe { Block::destroy_or_recycle(block) };
            }
        }
    }
}

impl<T> std::ops::Deref for Pinned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("dereferenced an empty Pinned handle")
    }
}

impl<T> PartialEq for Pinned<T> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl<T> Eq for Pinned<T> {}

impl<T: fmt::Debug> fmt::Debug for Pinned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(payload) => f.debug_tuple("Pinned").field(payload).finish(),
            None => f.write_str("Pinned(empty)"),
        }
    }
}

impl<T> From<T> for Pinned<T> {
    fn from(payload: T) -> Self {
        Pinned::new(payload)
    }
}
