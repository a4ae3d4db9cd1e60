use std::{
    sync::{mpsc, Arc, Barrier},
    thread,
};

use hazard_stack::{
    hazard::{HazardError, HazardSlotTable, DEFAULT_CAPACITY},
    stack::ConcurrentStack,
};

const K: usize = 4;

#[test]
fn test_slots_exhausted_across_threads() {
    let table = HazardSlotTable::with_capacity(K);
    let held = Barrier::new(K + 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let (released_tx, released_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        for _ in 0..K {
            let table = &table;
            let held = &held;
            let release_rx = &release_rx;
            let released_tx = released_tx.clone();
            s.spawn(move || {
                let guard = table.acquire().unwrap();
                held.wait();
                release_rx.lock().unwrap().recv().unwrap();
                drop(guard);
                released_tx.send(()).unwrap();
            });
        }
        held.wait();
        assert_eq!(table.claimed(), K);
        assert_eq!(table.acquire().unwrap_err(), HazardError::SlotsExhausted);

        // Let exactly one holder go; its slot becomes available.
        release_tx.send(()).unwrap();
        released_rx.recv().unwrap();
        let guard = table.acquire().unwrap();
        assert_eq!(table.claimed(), K);
        drop(guard);

        for _ in 1..K {
            release_tx.send(()).unwrap();
        }
    });
    assert_eq!(table.claimed(), 0);
}

#[test]
fn test_slots_exhausted_single_thread() {
    let table = HazardSlotTable::with_capacity(K);
    let mut guards: Vec<_> = (0..K).map(|_| table.acquire().unwrap()).collect();
    assert!(matches!(table.acquire(), Err(HazardError::SlotsExhausted)));
    guards.pop();
    let again = table.acquire().unwrap();
    assert_eq!(table.claimed(), K);
    drop(again);
    drop(guards);
    assert_eq!(table.claimed(), 0);
}

#[test]
fn test_pop_surfaces_exhaustion() {
    let table = HazardSlotTable::with_capacity(1);
    let stack = ConcurrentStack::with_table(table.clone());
    stack.push(1);
    let holder = table.acquire().unwrap();
    assert_eq!(stack.pop(), Err(HazardError::SlotsExhausted));
    assert!(!stack.empty());
    drop(holder);
    assert_eq!(stack.pop(), Ok(Some(1)));
}

#[test]
fn test_protect_and_clear() {
    let table = HazardSlotTable::with_capacity(2);
    let value = 17u64;
    let guard = table.acquire().unwrap();
    assert!(!table.is_protected(&value as *const u64));

    guard.set_protected(&value as *const u64);
    assert!(table.is_protected(&value as *const u64));
    assert_eq!(guard.protected(), &value as *const u64 as *const ());

    guard.clear();
    assert!(!table.is_protected(&value as *const u64));

    guard.set_protected(&value as *const u64);
    drop(guard);
    assert!(!table.is_protected(&value as *const u64));
}

#[test]
fn test_guard_is_reused_per_thread() {
    let table = HazardSlotTable::with_capacity(K);
    let stack = ConcurrentStack::with_table(table.clone());
    let worker = {
        let table = table.clone();
        thread::spawn(move || {
            let stack = ConcurrentStack::with_table(table.clone());
            for i in 0..1000 {
                stack.push(i);
                stack.pop().unwrap();
            }
            assert_eq!(table.claimed(), 1);
        })
    };
    worker.join().unwrap();
    // The cached guard is released when its thread exits.
    assert_eq!(table.claimed(), 0);

    stack.push(1);
    stack.pop().unwrap();
    stack.pop().unwrap();
    assert_eq!(table.claimed(), 1);
}

#[test]
fn test_dropped_tables_are_freed() {
    let mut weak_tables = vec![];
    for i in 0..1000 {
        let table = HazardSlotTable::with_capacity(1);
        let stack = ConcurrentStack::with_table(table.clone());
        stack.push(i);
        assert_eq!(stack.pop().unwrap(), Some(i));
        assert_eq!(table.claimed(), 1);
        weak_tables.push(Arc::downgrade(&table));
    }
    // This thread's cached guards must not keep any of them alive.
    let alive = weak_tables.iter().filter(|w| w.upgrade().is_some()).count();
    assert_eq!(alive, 0);

    // A live table keeps reusing one cached slot, and the cache holds no
    // strong reference to it.
    let table = HazardSlotTable::with_capacity(1);
    let stack = ConcurrentStack::with_table(table.clone());
    for i in 0..10 {
        stack.push(i);
        stack.pop().unwrap();
    }
    assert_eq!(table.claimed(), 1);
    assert_eq!(Arc::strong_count(&table), 2);
}

#[test]
fn test_capacity() {
    assert_eq!(HazardSlotTable::new().capacity(), DEFAULT_CAPACITY);
    assert_eq!(HazardSlotTable::with_capacity(3).capacity(), 3);
    assert_eq!(HazardError::SlotsExhausted.to_string(), "SlotsExhausted");
}

#[test]
#[should_panic(expected = "at least one slot")]
fn test_zero_capacity() {
    HazardSlotTable::with_capacity(0);
}
