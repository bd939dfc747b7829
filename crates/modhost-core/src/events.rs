//! Timed events and the event lock.
//!
//! Events are polled by the host loop through
//! [`Runtime::tick`](crate::runtime::Runtime::tick). Extensions may
//! schedule their own events; the loader schedules retries of deferred
//! unloads here as well.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::extension::ExtensionId;
use crate::registry::Registries;

/// Function run by an extension event.
pub type EventFn = fn(&mut Registries);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

#[derive(Debug, Clone, Copy)]
pub enum EventAction {
    Call(EventFn),
    /// Retry a deferred unload.
    RetryUnload(ExtensionId),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub owner: Option<ExtensionId>,
    pub every: Duration,
    pub next_run: Instant,
    /// Runs left; `None` repeats forever.
    pub remaining: Option<u32>,
    pub action: EventAction,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<EventHandle, Event>,
    next: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` every `every`, `count` times (`None`: forever).
    pub fn add(
        &mut self,
        name: impl Into<String>,
        every: Duration,
        count: Option<u32>,
        action: EventAction,
        owner: Option<ExtensionId>,
        now: Instant,
    ) -> EventHandle {
        self.next += 1;
        let handle = EventHandle(self.next);
        self.events.insert(
            handle,
            Event {
                name: name.into(),
                owner,
                every,
                next_run: now + every,
                remaining: count,
                action,
            },
        );
        handle
    }

    /// Schedule a repeating unload retry for `id`, reusing an existing one.
    pub fn schedule_unload_retry(&mut self, id: ExtensionId, every: Duration, now: Instant) -> EventHandle {
        if let Some(handle) = self.unload_retry(id) {
            return handle;
        }
        self.add(
            "e_unload_module_delayed",
            every,
            None,
            EventAction::RetryUnload(id),
            None,
            now,
        )
    }

    pub fn unload_retry(&self, id: ExtensionId) -> Option<EventHandle> {
        self.events
            .iter()
            .find(|(_, e)| matches!(e.action, EventAction::RetryUnload(x) if x == id))
            .map(|(h, _)| *h)
    }

    pub fn cancel_unload_retry(&mut self, id: ExtensionId) -> bool {
        match self.unload_retry(id) {
            Some(handle) => self.cancel(handle),
            None => false,
        }
    }

    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.events.remove(&handle).is_some()
    }

    pub fn get(&self, handle: EventHandle) -> Option<&Event> {
        self.events.get(&handle)
    }

    /// Take every event due at `now`, rescheduling repeating ones.
    pub fn due(&mut self, now: Instant) -> Vec<(EventHandle, EventAction)> {
        let mut due = Vec::new();
        let mut finished = Vec::new();
        for (handle, event) in self.events.iter_mut() {
            if event.next_run > now {
                continue;
            }
            due.push((*handle, event.action));
            event.next_run = now + event.every;
            if let Some(remaining) = event.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    finished.push(*handle);
                }
            }
        }
        for handle in finished {
            self.events.remove(&handle);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Reentrant token held while registries are being mutated in bulk.
///
/// Events are not run while any guard is alive.
#[derive(Debug, Clone, Default)]
pub struct EventLock(Arc<AtomicUsize>);

impl EventLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> EventLockGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        EventLockGuard(self.0.clone())
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }
}

#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct EventLockGuard(Arc<AtomicUsize>);

impl Drop for EventLockGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Registries) {}

    #[test]
    fn test_due_and_count() {
        let mut queue = EventQueue::new();
        let start = Instant::now();
        let every = Duration::from_secs(5);
        let once = queue.add("once", every, Some(1), EventAction::Call(noop), None, start);
        let forever = queue.add("forever", every, None, EventAction::Call(noop), None, start);

        assert!(queue.due(start).is_empty());
        let due = queue.due(start + every);
        assert_eq!(due.len(), 2);
        assert!(queue.get(once).is_none());
        assert!(queue.get(forever).is_some());

        assert!(queue.due(start + every).is_empty());
        assert_eq!(queue.due(start + every * 2).len(), 1);
    }

    #[test]
    fn test_unload_retry_is_deduplicated() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        let id = ExtensionId::new(4);
        let a = queue.schedule_unload_retry(id, Duration::from_secs(1), now);
        let b = queue.schedule_unload_retry(id, Duration::from_secs(1), now);
        assert_eq!(a, b);
        assert_eq!(queue.len(), 1);
        assert!(queue.cancel_unload_retry(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_lock_is_reentrant() {
        let lock = EventLock::new();
        assert!(!lock.is_held());
        let outer = lock.acquire();
        let inner = lock.acquire();
        drop(inner);
        assert!(lock.is_held());
        drop(outer);
        assert!(!lock.is_held());
    }
}
