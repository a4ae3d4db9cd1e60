//! # A lock-free stack with hazard pointer reclamation
//!
//! `ConcurrentStack` is a Treiber stack whose `pop` frees nodes without a
//! global pause.  Before a thread dereferences the head it publishes the
//! head's address in a hazard slot; a thread that detaches a node checks every
//! slot and either frees the node on the spot or parks it on a retirement
//! list that is drained after each later pop.
//!
//! The pieces, bottom up:
//!
//! - [`hazard::HazardSlotTable`]: a fixed number of slots, shared through
//!   an `Arc`, plus the retirement list of every stack built on the table.
//! - [`hazard::HazardGuard`]: one claimed slot.  `pop` caches one per thread.
//! - [`retire::RetirementList`]: detached nodes waiting for their last
//!   observer.
//! - [`stack::ConcurrentStack`]: push, pop, empty.
use std::marker::PhantomData;

// AtomicCell falls back to a lock for types that do not fit a native atomic.
// Every Atom in this crate wraps a single pointer in a u64, which always fits.
use crossbeam_utils::atomic::AtomicCell;

pub mod hazard;
pub mod retire;
pub mod stack;

/// A word of shared state, read and written as a `T` but stored as a `U`.
pub struct Atom<T, U> {
    union: PhantomData<T>,
    inner: AtomicCell<U>,
}

impl<T, U> Default for Atom<T, U>
where
    U: Default + Send,
{
    fn default() -> Self {
        assert!(std::mem::size_of::<T>() <= std::mem::size_of::<U>());
        Self {
            union: Default::default(),
            inner: Default::default(),
        }
    }
}

// T is only ever a raw pointer wrapper here.  Whoever reads through the
// pointer is responsible for keeping its target alive.
unsafe impl<T, U> Sync for Atom<T, U> {}
unsafe impl<T, U> Send for Atom<T, U> {}

/// Compare-and-swap retry loop over an [`Atom`].
///
/// Loads the word, reinterprets it as a `T`, and hands a copy to `func`.
/// `func` returns `(bool, R)`: when the flag is false the loop stops without
/// writing and returns `R`; when it is true the loop tries to install the
/// modified copy, and on success returns `R`.  A failed install reloads the
/// word and calls `func` again.
///
/// Returning `(false, value)` from a lambda that reads its argument is the
/// way to take a snapshot of the word.
///
/// # Safety
///
/// 1. `func` must not have side effects outside its argument and must not
/// crash when handed stale input, because it runs once per attempt.
///
/// 2. Nothing `func` observes may escape unless the attempt that observed it
/// is the one that returns.  Return it through `R` instead.
///
/// 3. Read set equivalence: if the swap succeeds, everything `func` read must
/// still be current.  The swap only checks the bits of the word.  For a stack
/// whose lambda reads `(*head).next`, that means the head node must not have
/// been freed and reused in race.  `ConcurrentStack` guarantees it by holding
/// a hazard slot on the head for the whole attempt, so the address cannot be
/// recycled while the lambda runs.
pub unsafe fn atomic_try_update<T, U, F, R>(state: &Atom<T, U>, func: F) -> R
where
    F: Fn(&mut T) -> (bool, R),
    U: Copy + Eq,
{
    let mut old = state.inner.load();
    let mut newval = old;
    loop {
        let newval_ptr: *mut U = &mut newval;
        let res;
        unsafe {
            let newval_ptr: *mut T = newval_ptr as *mut T;
            res = func(&mut *newval_ptr);
            if !res.0 {
                return res.1;
            }
        }
        match state.inner.compare_exchange(old, newval) {
            Ok(_) => return res.1,
            Err(val) => {
                old = val;
                newval = old;
            }
        }
    }
}
