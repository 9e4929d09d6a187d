//! Opaque operation handles and the generation-tagged slot table behind them.
//!
//! Every deferred operation (timer, lookup, pending connect) is identified by
//! a two-word handle: a slot index plus a generation counter. Generations make
//! stale handles inert — cancelling a handle whose slot has been reused
//! returns false instead of touching the new occupant. All bookkeeping sits
//! behind a single mutex per table.

use std::sync::Mutex;

macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name {
            index: u64,
            generation: u64,
        }

        impl $name {
            /// A handle that refers to nothing; cancelling it returns false.
            pub const INVALID: $name = $name {
                index: 0,
                generation: 0,
            };

            pub(crate) fn from_parts(index: u64, generation: u64) -> Self {
                $name { index, generation }
            }

            pub(crate) fn parts(&self) -> (u64, u64) {
                (self.index, self.generation)
            }
        }
    };
}

define_handle! {
    /// Identifies a deferred task scheduled with `run_at`/`run_after`.
    TaskHandle
}

define_handle! {
    /// Identifies an in-flight DNS lookup.
    LookupHandle
}

define_handle! {
    /// Identifies an outstanding connection attempt.
    ConnectionHandle
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

struct SlabInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

/// Mutex-guarded slot table with per-slot generation counters.
pub(crate) struct HandleSlab<T> {
    inner: Mutex<SlabInner<T>>,
}

impl<T> HandleSlab<T> {
    pub(crate) fn new() -> Self {
        HandleSlab {
            inner: Mutex::new(SlabInner {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Stores `value`, returning its `(index, generation)` identity.
    pub(crate) fn insert(&self, value: T) -> (u64, u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index];
            slot.generation += 1;
            slot.value = Some(value);
            (index as u64, slot.generation)
        } else {
            let index = inner.slots.len();
            inner.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            (index as u64, 1)
        }
    }

    /// Claims and removes the value identified by `(index, generation)`.
    ///
    /// Returns `None` for stale generations, unknown indices, or entries that
    /// were already claimed — the caller that gets `Some` owns the completion.
    pub(crate) fn take(&self, index: u64, generation: u64) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        inner.free.push(index as usize);
        inner.live -= 1;
        Some(value)
    }

    /// Runs `f` against a live entry, if it is still present.
    pub(crate) fn with_mut<R>(
        &self,
        index: u64,
        generation: u64,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut().map(f)
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_take_roundtrip() {
        let slab = HandleSlab::new();
        let (i, g) = slab.insert("a");
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.take(i, g), Some("a"));
        assert!(slab.is_empty());
    }

    #[test]
    fn test_double_take_fails() {
        let slab = HandleSlab::new();
        let (i, g) = slab.insert("a");
        assert_eq!(slab.take(i, g), Some("a"));
        assert_eq!(slab.take(i, g), None);
    }

    #[test]
    fn test_stale_generation_is_inert() {
        let slab = HandleSlab::new();
        let (i1, g1) = slab.insert("first");
        assert_eq!(slab.take(i1, g1), Some("first"));
        // Slot reuse bumps the generation.
        let (i2, g2) = slab.insert("second");
        assert_eq!(i1, i2);
        assert_ne!(g1, g2);
        assert_eq!(slab.take(i1, g1), None);
        assert_eq!(slab.take(i2, g2), Some("second"));
    }

    #[test]
    fn test_invalid_handle_never_matches() {
        let slab: HandleSlab<&str> = HandleSlab::new();
        let (index, generation) = TaskHandle::INVALID.parts();
        assert_eq!(slab.take(index, generation), None);
        slab.insert("x");
        assert_eq!(slab.take(index, generation), None);
    }

    #[test]
    fn test_with_mut_updates_live_entry() {
        let slab = HandleSlab::new();
        let (i, g) = slab.insert(1u32);
        assert_eq!(slab.with_mut(i, g, |v| *v = 7), Some(()));
        assert_eq!(slab.take(i, g), Some(7));
        assert_eq!(slab.with_mut(i, g, |v| *v = 9), None);
    }

    #[test]
    fn test_unknown_index() {
        let slab: HandleSlab<&str> = HandleSlab::new();
        assert_eq!(slab.take(99, 1), None);
    }

    #[test]
    fn test_handles_are_distinct_types() {
        let task = TaskHandle::from_parts(1, 1);
        let lookup = LookupHandle::from_parts(1, 1);
        assert_eq!(task.parts(), lookup.parts());
        assert_eq!(TaskHandle::INVALID.parts(), (0, 0));
        assert_eq!(ConnectionHandle::INVALID.parts(), (0, 0));
    }
}
