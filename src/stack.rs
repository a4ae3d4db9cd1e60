//! # A lock-free stack with hazard pointer reclamation
//!
//! Treiber's stack pushes by swinging `head` to a new node, and pops by
//! swinging `head` from a node to its `next`.  The pop is the hard part: it
//! has to read `(*head).next`, and in race the head may have been popped,
//! freed, and its address reused by a fresh push.  The compare and swap would
//! then succeed against a semantically different node (the "ABA problem"),
//! or the read itself would touch freed memory.
//!
//! `ConcurrentStack` closes both holes with a hazard slot.  A popping thread
//! publishes the head it is about to read and then checks that the head has
//! not moved; from that point on nobody frees the node, so its address cannot
//! be recycled either.  The thread that detaches a node scans the slot table:
//! if nobody names the node it is freed immediately, otherwise it is retired
//! and freed by a later pop.
//!
//! Each node carries a state tag recording who owns it.  Every hand-off is a
//! compare and swap on the tag, so a node that is freed twice or retired
//! while still linked trips a panic instead of corrupting the heap.
use std::{
    cell::UnsafeCell,
    ptr::null_mut,
    sync::{
        atomic::{fence, AtomicUsize, Ordering},
        Arc,
    },
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    atomic_try_update,
    hazard::{with_local_guard, HazardError, HazardGuard, HazardSlotTable},
    retire::Reclaim,
    Atom,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
enum NodeState {
    LiveInStack = 0,
    Detached,
    PendingReclaim,
    Freed,
}

struct StackNode<T> {
    value: UnsafeCell<Option<T>>,
    next: *mut StackNode<T>,
    state: AtomicUsize,
}

impl<T> StackNode<T> {
    fn transition(&self, from: NodeState, to: NodeState) {
        let swapped =
            self.state
                .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire);
        if let Err(actual) = swapped {
            match NodeState::try_from(actual) {
                Ok(actual) => panic!("stack node moved {from:?} -> {to:?} while {actual:?}"),
                Err(_) => panic!("torn stack node state {actual}"),
            }
        }
    }

    /// # Safety
    ///
    /// `node` came from `Box::into_raw`, is owned by the caller in state
    /// `from`, and no hazard slot names it.
    unsafe fn free(node: *mut StackNode<T>, from: NodeState) {
        (*node).transition(from, NodeState::Freed);
        drop(Box::from_raw(node));
    }
}

// A node is only shared between threads as a pointer that is read, never
// written, by anyone but its owner.
unsafe impl<T: Send> Send for StackNode<T> {}

impl<T: Send> Reclaim for StackNode<T> {
    fn destroy(&mut self) {
        self.transition(NodeState::PendingReclaim, NodeState::Freed);
    }
}

struct Head<T> {
    node: *mut StackNode<T>,
}

pub struct ConcurrentStack<T>
where
    T: Send + 'static,
{
    head: Atom<Head<T>, u64>,
    table: Arc<HazardSlotTable>,
}

impl<T> Default for ConcurrentStack<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::with_table(HazardSlotTable::global())
    }
}

impl<T> ConcurrentStack<T>
where
    T: Send + 'static,
{
    /// An empty stack on the process-wide hazard slot table.
    pub fn new() -> Self {
        Default::default()
    }

    /// An empty stack whose pops claim slots in, and retire nodes to, `table`.
    pub fn with_table(table: Arc<HazardSlotTable>) -> Self {
        Self {
            head: Default::default(),
            table,
        }
    }

    pub fn table(&self) -> &Arc<HazardSlotTable> {
        &self.table
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(StackNode {
            value: UnsafeCell::new(Some(value)),
            next: null_mut(),
            state: AtomicUsize::new(NodeState::LiveInStack.into()),
        }));

        unsafe {
            atomic_try_update(&self.head, |head: &mut Head<T>| {
                (*node).next = head.node;
                head.node = node;
                (true, ())
            });
        }
    }

    /// Pops the top value using this thread's cached hazard guard.
    ///
    /// Returns `SlotsExhausted` if this thread has no guard for the stack's
    /// table yet and every slot is taken.
    pub fn pop(&self) -> Result<Option<T>, HazardError> {
        with_local_guard(&self.table, |guard| self.pop_with(guard))
    }

    /// Pops the top value, publishing reads through `guard`.
    ///
    /// Panics if `guard` was acquired from a different table.
    pub fn pop_with(&self, guard: &HazardGuard) -> Option<T> {
        assert!(
            guard.belongs_to(&self.table),
            "hazard guard belongs to a different slot table"
        );
        let mut candidate = self.load_head();
        let node = loop {
            // Publishing and checking that the head is still current are two
            // steps.  Only once they agree may we read through `candidate`.
            loop {
                guard.set_protected(candidate);
                fence(Ordering::SeqCst);
                let current = self.load_head();
                if current == candidate {
                    break;
                }
                candidate = current;
            }
            if candidate.is_null() {
                guard.clear();
                return None;
            }
            let detached = unsafe {
                atomic_try_update(&self.head, |head: &mut Head<T>| {
                    if head.node != candidate {
                        (false, Err(head.node))
                    } else {
                        head.node = (*candidate).next;
                        (true, Ok(()))
                    }
                })
            };
            match detached {
                Ok(()) => break candidate,
                Err(current) => candidate = current,
            }
        };
        guard.clear();

        // The stack no longer reaches `node`, and we won the swap, so the
        // value is ours.  Other threads may still be reading `next`.
        let value = unsafe {
            (*node).transition(NodeState::LiveInStack, NodeState::Detached);
            (*(*node).value.get()).take()
        };
        #[cfg(test)]
        tests::widen_detach_window();

        fence(Ordering::SeqCst);
        if self.table.is_protected(node) {
            unsafe {
                (*node).transition(NodeState::Detached, NodeState::PendingReclaim);
                self.table.retire(node);
            }
        } else {
            unsafe { StackNode::free(node, NodeState::Detached) };
        }
        self.table.reclaim();
        value
    }

    /// True if the stack was empty at the moment of the call.
    pub fn empty(&self) -> bool {
        self.load_head().is_null()
    }

    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    fn load_head(&self) -> *mut StackNode<T> {
        unsafe { atomic_try_update(&self.head, |head: &mut Head<T>| (false, head.node)) }
    }
}

impl<T> Drop for ConcurrentStack<T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        // No pop can be running, so every slot that named one of our nodes
        // has been cleared.
        let mut node = self.load_head();
        while !node.is_null() {
            let next = unsafe { (*node).next };
            unsafe { StackNode::free(node, NodeState::LiveInStack) };
            node = next;
        }
    }
}
