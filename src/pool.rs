//! Recycling hook and a ready-made lock-free pool implementation.
//!
//! The distilled spec only requires the hook mechanism (`Recycler`); this
//! module also ships [`Pool`], a Treiber stack of retired [`Block`]s
//! threaded through the block's own intrusive link field, grounded on the
//! teacher's `epoch::garbage::ConcBag` (itself a Treiber stack of garbage
//! bags).

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

#[cfg(feature = "logging")]
use log::trace;

use crate::block::Block;
use crate::pinned::Pinned;

/// Receives a [`Block`] in lieu of deallocation once its counts reach zero.
///
/// `recycle` is called exactly once per block, synchronously, from the
/// releasing thread, with the payload already dropped (see `SPEC_FULL.md`
/// §9's Open Question resolution) — every implementation can assume a block
/// with a dead payload slot, never a live one.
pub trait Recycler<T>: Send + Sync {
    /// Take ownership of `block` for reuse instead of deallocation.
    ///
    /// # Safety
    /// `block`'s counts have just reached `(0, 0)` and its payload has
    /// already been dropped; the caller (this crate's internals) will not
    /// touch `block` again. Implementations must not re-publish `block`
    /// into an `AtomicSlot` still referenced by the calling thread without
    /// additional synchronization.
    fn recycle(&self, block: NonNull<Block<T>>);
}

/// Configuration for a [`Pool`], modeled on the teacher's
/// `mem::epoch::Options` chained-builder style.
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Advisory hint for how many retired blocks callers expect this pool
    /// to hold in steady state; used only for the `len`/`is_likely_empty`
    /// diagnostics, never to pre-allocate (the pool is a simple intrusive
    /// free list and has nothing to pre-allocate).
    pub capacity_hint: usize,
}

impl PoolOptions {
    pub fn new() -> Self {
        PoolOptions { capacity_hint: 0 }
    }

    pub fn with_capacity_hint(mut self, hint: usize) -> Self {
        self.capacity_hint = hint;
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions::new()
    }
}

/// A lock-free pool of retired [`Block<T>`]s, reusing their allocation for
/// the next payload of the same type instead of deallocating.
///
/// Push and pop are both the classic Treiber stack shape from
/// `epoch::garbage::ConcBag::insert`/`collect`: a CAS loop on the head
/// pointer, with the block's own `link` field standing in for `ConcBag`'s
/// intrusive `Node::next`.
pub struct Pool<T> {
    head: AtomicPtr<Block<T>>,
    len: AtomicUsize,
    options: PoolOptions,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Pool::with_options(PoolOptions::default())
    }

    pub fn with_options(options: PoolOptions) -> Self {
        Pool {
            head: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
            options,
            _marker: PhantomData,
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Number of blocks currently retired in the pool. Advisory only: the
    /// count can be stale the instant it's read under contention.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a retired block off the pool, if any, leaving it un-initialized
    /// (its payload slot is empty; callers must [`Block::reset`] it before
    /// publishing).
    pub(crate) fn take(&self) -> Option<NonNull<Block<T>>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let block = NonNull::new(head)?;
            let next = unsafe { Block::link(block) }.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    #[cfg(feature = "logging")]
                    trace!("pool reuse: block {:p}", block.as_ptr());
                    return Some(block);
                }
                Err(actual) => head = actual,
            }
        }
    }

    fn push(&self, block: NonNull<Block<T>>) {
        let link = unsafe { Block::link(block) };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, block.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Obtain a handle to `payload`, reusing a retired block from this pool
    /// when one is available instead of allocating, and pointing the
    /// returned handle's recycling hook back at this pool.
    ///
    /// The hook holds only a [`Weak`] reference back to this pool (see
    /// [`WeakPoolRecycler`]): a block retired into the pool must not keep the
    /// pool itself alive, or the pool's strong count would never reach zero
    /// while any block it vended is sitting retired, and `Pool::drop` would
    /// never run.
    pub fn checkout(self: &Arc<Self>, payload: T) -> Pinned<T> {
        let pinned = match self.take() {
            Some(block) => Pinned::from_recycled(block, payload),
            None => Pinned::new(payload),
        };
        let hook = WeakPoolRecycler { pool: Arc::downgrade(self) };
        pinned.set_recycler(Arc::new(hook) as Arc<dyn Recycler<T> + Send + Sync>);
        pinned
    }
}

/// A [`Recycler`] that reaches its [`Pool`] through a [`Weak`] handle, so
/// that retired blocks don't keep the pool itself alive. If the pool has
/// already been dropped by the time a block is released, the block is
/// deallocated directly instead of being pushed onto a free list nobody can
/// ever drain.
struct WeakPoolRecycler<T> {
    pool: Weak<Pool<T>>,
}

impl<T: Send> Recycler<T> for WeakPoolRecycler<T> {
    fn recycle(&self, block: NonNull<Block<T>>) {
        match self.pool.upgrade() {
            Some(pool) => pool.push(block),
            None => unsafe { drop(Box::from_raw(block.as_ptr())) },
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}

impl<T: Send> Recycler<T> for Pool<T> {
    fn recycle(&self, block: NonNull<Block<T>>) {
        #[cfg(feature = "logging")]
        trace!("pool retire: block {:p}", block.as_ptr());
        self.push(block);
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        while let Some(block) = self.take() {
            // The blocks held here have a dead payload slot already (per
            // the recycler contract); only the allocation itself needs
            // freeing.
            unsafe { drop(Box::from_raw(block.as_ptr())) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_then_take_reuses_same_allocation() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new());
        // u32 has no destructor, so it's safe to treat this block as if its
        // payload had already been dropped (the real contract `Recycler`
        // implementations see) without an explicit drop step.
        let block = Block::alloc(0u32, 0, 0);
        pool.push(block);
        assert_eq!(pool.len(), 1);

        let taken = pool.take().unwrap();
        assert_eq!(taken, block);
        assert_eq!(pool.len(), 0);
        unsafe { Block::reset(taken, 7u32, 1, 0) };
        assert_eq!(Block::counts(taken), (1, 0));
        unsafe { Block::destroy_or_recycle(taken) };
    }

    #[test]
    fn empty_pool_take_returns_none() {
        let pool: Pool<u32> = Pool::new();
        assert!(pool.take().is_none());
    }
}
