//! Weak references from a connection to its dependents.
//!
//! A connection tracks open readers, commands and nested transactions without
//! keeping them alive. When the connection is deactivated every dependent
//! still alive is told so, and the tracker is emptied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

const LOCK_POLL: Duration = Duration::from_millis(100);
const DEFAULT_CAPACITY: usize = 20;
const SHRINK_ABOVE: usize = 100;

/// An object that wants to hear when its parent connection goes away.
pub trait Dependent: Send + Sync + 'static {
    /// Called once per deactivation with the tag the dependent was added under.
    fn on_parent_deactivated(&self, tag: i32);
}

struct Slot {
    tag: i32,
    target: Weak<dyn Dependent>,
}

impl Slot {
    fn live(&self) -> Option<Arc<dyn Dependent>> {
        self.target.upgrade()
    }
}

struct Slots {
    items: Vec<Option<Slot>>,
    used: usize,
    count: usize,
}

impl Slots {
    fn new() -> Self {
        Self {
            items: Self::empty(DEFAULT_CAPACITY),
            used: 0,
            count: 0,
        }
    }

    fn empty(capacity: usize) -> Vec<Option<Slot>> {
        std::iter::repeat_with(|| None).take(capacity).collect()
    }

    fn place(&mut self, slot: Slot) {
        if let Some(free) = self.items[..self.used].iter_mut().find(|s| s.is_none()) {
            *free = Some(slot);
        } else if self.used < self.items.len() {
            self.items[self.used] = Some(slot);
            self.used += 1;
        } else if let Some(dead) = self.items[..self.used]
            .iter_mut()
            .find(|s| matches!(s, Some(slot) if slot.live().is_none()))
        {
            // Replaces an occupied slot; the count is unchanged.
            *dead = Some(slot);
            return;
        } else {
            let doubled = self.items.len() * 2;
            self.items.resize_with(doubled, || None);
            self.items[self.used] = Some(slot);
            self.used += 1;
        }
        self.count += 1;
    }
}

/// Concurrent collection of weak, tagged references to dependents.
pub struct ReferenceTracker {
    slots: Mutex<Slots>,
    notifying: AtomicBool,
}

impl Default for ReferenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReferenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTracker")
            .field("notifying", &self.notifying.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReferenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::new()),
            notifying: AtomicBool::new(false),
        }
    }

    /// Register a dependent under `tag` without keeping it alive.
    ///
    /// Dropped if a notification pass is running: the tracker is being
    /// emptied because its owner is going away.
    pub fn add<T: Dependent>(&self, target: &Arc<T>, tag: i32) {
        let target: Weak<dyn Dependent> = Arc::downgrade(target) as Weak<dyn Dependent>;
        match self.lock_unless_notifying() {
            Some(mut slots) => slots.place(Slot { tag, target }),
            None => tracing::trace!(tag, "dependent added during notification, ignored"),
        }
    }

    /// Remove the first live entry pointing at `target`.
    ///
    /// Does nothing if the target is not tracked or a notification pass is
    /// running.
    pub fn remove<T: Dependent + ?Sized>(&self, target: &Arc<T>) {
        let Some(mut slots) = self.lock_unless_notifying() else {
            return;
        };
        if slots.count == 0 {
            return;
        }
        let used = slots.used;
        let found = slots.items[..used].iter_mut().find(|slot| match slot {
            Some(slot) => slot
                .live()
                .is_some_and(|live| std::ptr::addr_eq(Arc::as_ptr(&live), Arc::as_ptr(target))),
            None => false,
        });
        if let Some(slot) = found {
            *slot = None;
            slots.count -= 1;
        }
    }

    /// Find the first live dependent with `tag` that satisfies `predicate`.
    pub fn find<F>(&self, tag: i32, predicate: F) -> Option<Arc<dyn Dependent>>
    where
        F: Fn(&dyn Dependent) -> bool,
    {
        let slots = self.lock_unless_notifying()?;
        if slots.count == 0 {
            return None;
        }
        slots.items[..slots.used]
            .iter()
            .flatten()
            .filter(|slot| slot.tag == tag)
            .filter_map(Slot::live)
            .find(|live| predicate(live.as_ref()))
    }

    /// Tell every live dependent its parent is going away, then empty the
    /// tracker.
    ///
    /// Concurrent `remove`/`find` calls give up instead of waiting while the
    /// pass runs.
    pub fn notify_all_and_clear(&self) {
        let Some(mut slots) = self.lock_unless_notifying() else {
            return;
        };
        self.notifying.store(true, Ordering::Release);

        let mut live = Vec::with_capacity(slots.count);
        if slots.count > 0 {
            let used = slots.used;
            for slot in slots.items[..used].iter_mut() {
                if let Some(target) = slot.take().and_then(|s| s.live().map(|t| (s.tag, t))) {
                    live.push(target);
                }
            }
            slots.count = 0;
        }
        if slots.items.len() > SHRINK_ABOVE {
            *slots = Slots::new();
        }
        drop(slots);

        for (tag, target) in &live {
            target.on_parent_deactivated(*tag);
        }
        self.notifying.store(false, Ordering::Release);
    }

    /// Number of live tracked dependents.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.items[..slots.used]
            .iter()
            .flatten()
            .filter(|slot| slot.live().is_some())
            .count()
    }

    /// Check if no live dependents are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the backing storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().items.len()
    }

    fn lock_unless_notifying(&self) -> Option<MutexGuard<'_, Slots>> {
        while !self.notifying.load(Ordering::Acquire) {
            if let Some(guard) = self.slots.try_lock_for(LOCK_POLL) {
                return Some(guard);
            }
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    struct Reader {
        name: &'static str,
        notified_with: AtomicI32,
    }

    impl Reader {
        fn named(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                notified_with: AtomicI32::new(0),
            })
        }

        fn tag(&self) -> i32 {
            self.notified_with.load(Ordering::SeqCst)
        }
    }

    impl Dependent for Reader {
        fn on_parent_deactivated(&self, tag: i32) {
            self.notified_with.store(tag, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notify_reaches_live_entries_only() {
        let tracker = ReferenceTracker::new();
        let kept = Reader::named("kept");
        let dropped = Reader::named("dropped");
        tracker.add(&kept, 1);
        tracker.add(&dropped, 2);
        drop(dropped);

        assert_eq!(tracker.len(), 1);
        tracker.notify_all_and_clear();

        assert_eq!(kept.tag(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_first_match() {
        let tracker = ReferenceTracker::new();
        let a = Reader::named("a");
        let b = Reader::named("b");
        tracker.add(&a, 1);
        tracker.add(&b, 1);

        tracker.remove(&a);
        tracker.notify_all_and_clear();

        assert_eq!(a.tag(), 0);
        assert_eq!(b.tag(), 1);
    }

    #[test]
    fn test_remove_untracked_is_noop() {
        let tracker = ReferenceTracker::new();
        let a = Reader::named("a");
        tracker.remove(&a);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_find_filters_by_tag_then_predicate() {
        let tracker = ReferenceTracker::new();
        let a = Reader::named("a");
        let b = Reader::named("b");
        let c = Reader::named("c");
        tracker.add(&a, 1);
        tracker.add(&b, 2);
        tracker.add(&c, 2);

        let hit = tracker
            .find(2, |d| std::ptr::addr_eq(d as *const dyn Dependent, Arc::as_ptr(&c)))
            .unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&hit), Arc::as_ptr(&c)));
        assert!(tracker.find(3, |_| true).is_none());
        assert!(tracker.find(1, |_| false).is_none());
        assert_eq!(b.name, "b");
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let tracker = ReferenceTracker::new();
        let readers: Vec<_> = (0..DEFAULT_CAPACITY).map(|_| Reader::named("r")).collect();
        for reader in &readers {
            tracker.add(reader, 1);
        }
        tracker.remove(&readers[3]);
        let extra = Reader::named("extra");
        tracker.add(&extra, 1);

        assert_eq!(tracker.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_dead_slots_are_reused_before_growing() {
        let tracker = ReferenceTracker::new();
        for _ in 0..DEFAULT_CAPACITY {
            let reader = Reader::named("temp");
            tracker.add(&reader, 1);
        }
        let kept = Reader::named("kept");
        tracker.add(&kept, 1);

        assert_eq!(tracker.capacity(), DEFAULT_CAPACITY);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.slots.lock().count, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_grows_and_shrinks_after_burst() {
        let tracker = ReferenceTracker::new();
        let readers: Vec<_> = (0..150).map(|_| Reader::named("r")).collect();
        for reader in &readers {
            tracker.add(reader, 5);
        }
        assert!(tracker.capacity() >= 150);
        assert_eq!(tracker.len(), 150);

        tracker.notify_all_and_clear();

        assert_eq!(tracker.capacity(), DEFAULT_CAPACITY);
        assert!(readers.iter().all(|r| r.tag() == 5));
    }

    #[test]
    fn test_add_during_notification_is_dropped() {
        struct Spawning {
            tracker: Arc<ReferenceTracker>,
            child: Arc<Reader>,
        }

        impl Dependent for Spawning {
            fn on_parent_deactivated(&self, _tag: i32) {
                self.tracker.add(&self.child, 2);
            }
        }

        let tracker = Arc::new(ReferenceTracker::new());
        let parent = Arc::new(Spawning {
            tracker: Arc::clone(&tracker),
            child: Reader::named("child"),
        });
        tracker.add(&parent, 1);

        tracker.notify_all_and_clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.slots.lock().count, 0);
    }

    #[test]
    fn test_dependent_may_touch_tracker_during_notification() {
        struct SelfRemoving {
            tracker: Arc<ReferenceTracker>,
            me: Mutex<Option<Arc<SelfRemoving>>>,
        }

        impl Dependent for SelfRemoving {
            fn on_parent_deactivated(&self, _tag: i32) {
                if let Some(me) = self.me.lock().take() {
                    self.tracker.remove(&me);
                    assert!(self.tracker.find(1, |_| true).is_none());
                }
            }
        }

        let tracker = Arc::new(ReferenceTracker::new());
        let dependent = Arc::new(SelfRemoving {
            tracker: Arc::clone(&tracker),
            me: Mutex::new(None),
        });
        *dependent.me.lock() = Some(Arc::clone(&dependent));
        tracker.add(&dependent, 1);

        tracker.notify_all_and_clear();
        assert!(tracker.is_empty());
    }
}
