//! Retired objects waiting for their last hazard to clear.
//!
//! The list is a push-only stack of entries that is drained all at once:
//! `drain_reclaimable` swaps the head for null, destroys what nobody protects,
//! and pushes the rest back for a later sweep.  Both operations are the
//! `push`/`pop_all` pair of a plain Treiber stack, which needs no hazard
//! protection of its own because nothing ever reads an entry that another
//! thread could free.
use std::{
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{atomic_try_update, Atom};

/// Something that can be parked on a [`RetirementList`].
///
/// Retired objects are heap allocations created with `Box`.  Once no hazard
/// slot names an object, the list calls `destroy` exactly once and then
/// releases the allocation.
pub trait Reclaim: Send {
    /// Last chance to observe the object before it is dropped.
    fn destroy(&mut self) {}
}

struct RetiredEntry {
    address: *const (),
    object: *mut dyn Reclaim,
    next: *mut RetiredEntry,
}

impl RetiredEntry {
    /// # Safety
    ///
    /// `entry` came from `Box::into_raw` and is not linked anywhere.  Its
    /// object is not referenced by any hazard slot.
    unsafe fn reclaim(entry: *mut RetiredEntry) {
        let entry = Box::from_raw(entry);
        (*entry.object).destroy();
        drop(Box::from_raw(entry.object));
    }
}

struct RetiredHead {
    entry: *mut RetiredEntry,
}

pub struct RetirementList {
    head: Atom<RetiredHead, u64>,
    pending: AtomicUsize,
}

impl Default for RetirementList {
    fn default() -> Self {
        Self {
            head: Default::default(),
            pending: AtomicUsize::new(0),
        }
    }
}

impl RetirementList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Takes ownership of `object` and parks it until a drain finds it
    /// unprotected.
    ///
    /// # Safety
    ///
    /// `object` must come from `Box::into_raw`, must already be unreachable
    /// for new readers, and must not be retired twice.
    pub unsafe fn retire<R>(&self, object: *mut R)
    where
        R: Reclaim + 'static,
    {
        let object: *mut dyn Reclaim = object;
        let entry = Box::into_raw(Box::new(RetiredEntry {
            address: object as *const (),
            object,
            next: null_mut(),
        }));
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.push_entry(entry);
    }

    fn push_entry(&self, entry: *mut RetiredEntry) {
        unsafe {
            atomic_try_update(&self.head, |head: &mut RetiredHead| {
                (*entry).next = head.entry;
                head.entry = entry;
                (true, ())
            });
        }
    }

    fn take_all(&self) -> *mut RetiredEntry {
        unsafe {
            atomic_try_update(&self.head, |head: &mut RetiredHead| {
                let ret = head.entry;
                if ret.is_null() {
                    (false, ret)
                } else {
                    head.entry = null_mut();
                    (true, ret)
                }
            })
        }
    }

    /// Destroys every retired object for which `is_hazarded` returns false
    /// and re-retires the others.  Returns how many objects were destroyed.
    pub fn drain_reclaimable<F>(&self, mut is_hazarded: F) -> usize
    where
        F: FnMut(*const ()) -> bool,
    {
        let mut current = self.take_all();
        let mut reclaimed = 0;
        while !current.is_null() {
            // We own the detached chain, so reading and relinking it is safe.
            let (next, address) = unsafe { ((*current).next, (*current).address) };
            if is_hazarded(address) {
                self.push_entry(current);
            } else {
                unsafe { RetiredEntry::reclaim(current) };
                reclaimed += 1;
            }
            current = next;
        }
        if reclaimed > 0 {
            self.pending.fetch_sub(reclaimed, Ordering::Relaxed);
            trace!("reclaimed {reclaimed} retired objects");
        }
        reclaimed
    }

    pub fn is_empty(&self) -> bool {
        unsafe {
            atomic_try_update(&self.head, |head: &mut RetiredHead| {
                (false, head.entry.is_null())
            })
        }
    }

    /// Number of objects retired but not yet destroyed.  Only a snapshot
    /// while other threads retire or drain.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

// Entries are only touched by the thread that linked them or the thread that
// took the whole chain, and every retired object is Send.
unsafe impl Send for RetirementList {}
unsafe impl Sync for RetirementList {}

impl Drop for RetirementList {
    fn drop(&mut self) {
        let remaining = self.drain_reclaimable(|_| false);
        if remaining > 0 {
            trace!("destroyed {remaining} retired objects on drop");
        }
    }
}
