//! Hazard slots: the registry of addresses that threads are about to read.
//!
//! A `HazardSlotTable` holds a fixed number of slots.  A thread claims a slot
//! by swapping its `ThreadId` into the slot's owner, and from then on it is
//! the only writer of that slot's protected cell.  Any thread may scan all
//! cells to find out whether an address is still being read.
//!
//! The table is shared explicitly through an `Arc`.  Stacks that share a
//! table also share its retirement list, so a pop on any of them helps
//! reclaim nodes retired by the others.
use std::{
    cell::RefCell,
    error::Error,
    fmt::{self, Display},
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ptr::{self, null_mut},
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc, OnceLock, Weak,
    },
    thread::{self, ThreadId},
};

use crossbeam_utils::{atomic::AtomicCell, CachePadded};
use log::{debug, trace, warn};

use crate::retire::{Reclaim, RetirementList};

/// Slot count of `HazardSlotTable::new()` and of the global table.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum HazardError {
    /// Every slot is owned by some live guard.  The table is sized for fewer
    /// concurrent threads than are using it.
    SlotsExhausted,
}

impl Error for HazardError {}

impl Display for HazardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

struct HazardSlot {
    owner: AtomicCell<Option<ThreadId>>,
    protected: AtomicPtr<()>,
}

impl Default for HazardSlot {
    fn default() -> Self {
        Self {
            owner: AtomicCell::new(None),
            protected: AtomicPtr::new(null_mut()),
        }
    }
}

pub struct HazardSlotTable {
    slots: Box<[CachePadded<HazardSlot>]>,
    retired: RetirementList,
}

static GLOBAL: OnceLock<Arc<HazardSlotTable>> = OnceLock::new();

impl HazardSlotTable {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A table with room for `capacity` concurrently live guards.
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "a hazard slot table needs at least one slot");
        debug!("creating hazard slot table with {capacity} slots");
        Arc::new(Self {
            slots: (0..capacity).map(|_| Default::default()).collect(),
            retired: RetirementList::new(),
        })
    }

    /// The process-wide table, created on first use and never dropped.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(Self::new).clone()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims an unowned slot for the calling thread.
    ///
    /// Returns `SlotsExhausted` if every slot is owned.  This is not retried:
    /// a slot only frees up when some guard is dropped.
    ///
    /// Guards returned here are explicit, caller-managed context for
    /// [`ConcurrentStack::pop_with`](crate::stack::ConcurrentStack::pop_with).
    /// They sit outside the one-guard-per-thread cache that
    /// [`ConcurrentStack::pop`](crate::stack::ConcurrentStack::pop) uses, so
    /// each call claims another slot, even on a thread that already holds
    /// one.
    pub fn acquire(self: &Arc<Self>) -> Result<HazardGuard, HazardError> {
        let me = thread::current().id();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.owner.load().is_some() {
                continue;
            }
            if slot.owner.compare_exchange(None, Some(me)).is_ok() {
                trace!("{me:?} claimed hazard slot {index}");
                return Ok(HazardGuard::new(self.clone(), index));
            }
        }
        warn!("{me:?} found all {} hazard slots claimed", self.slots.len());
        Err(HazardError::SlotsExhausted)
    }

    /// True if any slot currently protects `address`.
    pub fn is_protected<P>(&self, address: *const P) -> bool {
        let address = address as *mut ();
        self.slots
            .iter()
            .any(|slot| slot.protected.load(Ordering::SeqCst) == address)
    }

    /// Number of slots that are owned by a guard right now.
    pub fn claimed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner.load().is_some())
            .count()
    }

    /// Parks `object` on this table's retirement list.
    ///
    /// # Safety
    ///
    /// Same contract as [`RetirementList::retire`].
    pub unsafe fn retire<R>(&self, object: *mut R)
    where
        R: Reclaim + 'static,
    {
        self.retired.retire(object);
    }

    /// Destroys every retired object that no slot protects.  Returns how many
    /// were destroyed.
    pub fn reclaim(&self) -> usize {
        self.retired.drain_reclaimable(|address| self.is_protected(address))
    }

    pub fn retired(&self) -> &RetirementList {
        &self.retired
    }

    fn slot(&self, index: usize) -> &HazardSlot {
        &self.slots[index]
    }

    fn release(&self, index: usize) {
        let slot = self.slot(index);
        slot.protected.store(null_mut(), Ordering::SeqCst);
        slot.owner.store(None);
        trace!("released hazard slot {index}");
    }
}

/// A claimed hazard slot.
///
/// Dropping the guard clears its protected cell and gives the slot back.
/// The guard is tied to the thread that claimed it, so it is neither `Send`
/// nor `Sync`.
pub struct HazardGuard {
    table: Arc<HazardSlotTable>,
    index: usize,
    _not_send: PhantomData<*mut ()>,
}

impl HazardGuard {
    fn new(table: Arc<HazardSlotTable>, index: usize) -> Self {
        Self {
            table,
            index,
            _not_send: PhantomData,
        }
    }

    /// Publishes `ptr` as being read by this thread.  Callers must re-check
    /// that `ptr` is still reachable after publishing it and before reading
    /// through it.
    pub fn set_protected<P>(&self, ptr: *const P) {
        self.table
            .slot(self.index)
            .protected
            .store(ptr as *mut (), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.table
            .slot(self.index)
            .protected
            .store(null_mut(), Ordering::SeqCst);
    }

    pub fn protected(&self) -> *const () {
        self.table.slot(self.index).protected.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> &Arc<HazardSlotTable> {
        &self.table
    }

    pub fn belongs_to(&self, table: &Arc<HazardSlotTable>) -> bool {
        Arc::ptr_eq(&self.table, table)
    }

    /// Hands the slot to the thread-local cache without releasing it.  The
    /// strong reference comes back separately so the caller decides where it
    /// is dropped.
    fn into_cached(self) -> (CachedSlot, Arc<HazardSlotTable>) {
        let this = ManuallyDrop::new(self);
        // `this` is never dropped, so the Arc is moved out exactly once.
        let table = unsafe { ptr::read(&this.table) };
        let cached = CachedSlot {
            table: Arc::downgrade(&table),
            index: this.index,
        };
        (cached, table)
    }
}

impl fmt::Debug for HazardGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardGuard")
            .field("index", &self.index)
            .field("protected", &self.protected())
            .finish()
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}

/// A slot parked in the thread-local cache between pops.
///
/// The cache only holds a `Weak`, so a table whose stacks and handles are all
/// gone is freed even though this thread still nominally owns a slot in it.
struct CachedSlot {
    table: Weak<HazardSlotTable>,
    index: usize,
}

impl CachedSlot {
    fn is_for(&self, table: &Arc<HazardSlotTable>) -> bool {
        // The Weak keeps the allocation, so a live table cannot reuse the
        // address of one this entry still points at.
        ptr::eq(self.table.as_ptr(), Arc::as_ptr(table))
    }

    fn into_guard(mut self, table: Arc<HazardSlotTable>) -> HazardGuard {
        // Disarm our Drop: the slot now belongs to the guard.
        drop(mem::take(&mut self.table));
        HazardGuard::new(table, self.index)
    }
}

impl Drop for CachedSlot {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.release(self.index);
        }
    }
}

thread_local! {
    static LOCAL_GUARDS: RefCell<Vec<CachedSlot>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with this thread's guard for `table`, claiming one on first use.
///
/// The guard is lent out of the thread-local cache for the duration of `f`,
/// so a nested call on the same thread (say, from a destructor run by `f`)
/// claims its own slot instead of overwriting the outer one's cell.  During
/// thread teardown, when the cache is gone, a temporary guard is used.
/// Entries for tables that have been dropped are pruned on every lookup.
pub(crate) fn with_local_guard<F, R>(
    table: &Arc<HazardSlotTable>,
    f: F,
) -> Result<R, HazardError>
where
    F: FnOnce(&HazardGuard) -> R,
{
    let cached = LOCAL_GUARDS
        .try_with(|slots| {
            let mut slots = slots.borrow_mut();
            // Dead entries have nothing to release, so dropping them here
            // cannot reenter the cache.
            slots.retain(|slot| slot.table.strong_count() > 0);
            let pos = slots.iter().position(|slot| slot.is_for(table))?;
            Some(slots.swap_remove(pos))
        })
        .ok()
        .flatten();
    let guard = match cached {
        Some(slot) => slot.into_guard(table.clone()),
        None => table.acquire()?,
    };
    let ret = f(&guard);
    let (cached, strong) = guard.into_cached();
    let mut spare = Some(cached);
    _ = LOCAL_GUARDS.try_with(|slots| {
        let mut slots = slots.borrow_mut();
        if !slots.iter().any(|slot| slot.is_for(table)) {
            slots.extend(spare.take());
        }
    });
    // A nested call already cached a slot for this table, or the cache is
    // gone.  Release ours outside the borrow; the same goes for the strong
    // reference, which may be the last one.
    drop(spare);
    drop(strong);
    Ok(ret)
}
