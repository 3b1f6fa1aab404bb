/// Pooling & the process-wide string-intern table (spec §5).
///
/// Call frames, iterator objects, and char-boxed `RuntimeValue`s are
/// pooled per VM instance; the process-wide interned-string table is the
/// one thing independent VM instances share, and must tolerate concurrent
/// inserts. Grounded on `gc.rs`'s `BumpArena`/pool bookkeeping pattern,
/// generalized away from a tracing collector — ownership here is plain
/// `Rc` reference counting, not GC (design note §9).

use std::rc::Rc;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Canonical, deduplicated copies of identifier/string-literal text,
/// shared by every VM instance in the process (spec §5). Thread-safe for
/// concurrent inserts via `dashmap`, matching the teacher's choice of
/// `dashmap::DashMap` for its own shared tables (`core/value.rs`).
pub static STRING_INTERN_POOL: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Intern `s`, returning the canonical shared copy. A VM materializes its
/// own per-register `Rc<str>` from this when a register needs to hold the
/// string — the intern table dedups storage for compile-time names, not
/// every runtime string value (those still allocate normally; spec §5
/// only requires the *name* table be shared and thread-safe).
pub fn intern(s: &str) -> Arc<str> {
    if let Some(existing) = STRING_INTERN_POOL.get(s) {
        return existing.clone();
    }
    let arc: Arc<str> = Arc::from(s);
    STRING_INTERN_POOL.insert(s.to_string(), arc.clone());
    arc
}

pub fn intern_count() -> usize {
    STRING_INTERN_POOL.len()
}

/// A bounded, grow-on-demand free list for a pooled `T` (spec §5: "the
/// pool is bounded and grows on demand"). Used per VM instance for call
/// frames and iterator objects — never shared across VMs, so no locking.
pub struct Pool<T> {
    free: Vec<T>,
    cap: usize,
}

impl<T> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Pool { free: Vec::with_capacity(cap.min(64)), cap }
    }

    /// Take a pooled instance if one is free, resetting it via `reset`;
    /// otherwise build a fresh one via `build`.
    pub fn acquire(&mut self, build: impl FnOnce() -> T, reset: impl FnOnce(&mut T)) -> T {
        if let Some(mut item) = self.free.pop() {
            reset(&mut item);
            item
        } else {
            build()
        }
    }

    /// Return an instance to the pool if there's room; otherwise drop it.
    pub fn release(&mut self, item: T) {
        if self.free.len() < self.cap {
            self.free.push(item);
        }
    }

    pub fn live_free_count(&self) -> usize {
        self.free.len()
    }
}

/// Try to reclaim a register's current object before it's overwritten
/// (spec §5: `TryReturnRegisterReferenceToPool`). Only uniquely-owned
/// objects (`Rc::strong_count == 1`) can be safely recycled — anything
/// still aliased (e.g. captured by a closure, or shared via `ref`) is
/// simply dropped normally when the last `Rc` goes away.
pub fn try_reclaim<T>(rc: Rc<T>, pool: &mut Pool<Rc<T>>) {
    if Rc::strong_count(&rc) == 1 {
        pool.release(rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_text_returns_the_same_allocation() {
        let a = intern("fib__unique_test_marker");
        let b = intern("fib__unique_test_marker");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn pool_reuses_released_items_before_building_new_ones() {
        let mut pool: Pool<Vec<i32>> = Pool::new(4);
        let v = pool.acquire(Vec::new, |v: &mut Vec<i32>| v.clear());
        pool.release(v);
        assert_eq!(pool.live_free_count(), 1);
        let reused = pool.acquire(|| panic!("should have reused the freed item"), |v: &mut Vec<i32>| v.clear());
        assert!(reused.is_empty());
    }

    #[test]
    fn pool_respects_its_capacity_bound() {
        let mut pool: Pool<i32> = Pool::new(1);
        pool.release(1);
        pool.release(2);
        assert_eq!(pool.live_free_count(), 1);
    }
}
