//! Completion queue.
//!
//! Every tagged batch registers one pending completion when it is submitted
//! and posts exactly one [`Event`] when it finishes. Callers drain events
//! with [`CompletionQueue::next`] or one of its non-blocking variants.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-opaque token returned verbatim with a batch's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The tag the batch was submitted with.
    pub tag: Tag,
    /// Whether every operation in the batch succeeded.
    pub ok: bool,
}

/// Result of waiting on the queue with a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStatus {
    Event(Event),
    /// The queue is shut down and fully drained.
    Shutdown,
    Timeout,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    /// Registered completions not yet posted.
    outstanding: usize,
    shutdown: bool,
}

impl QueueState {
    fn drained(&self) -> bool {
        self.shutdown && self.outstanding == 0 && self.events.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// A thread-safe completion queue. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct CompletionQueue {
    inner: Arc<Inner>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until an event is available.
    ///
    /// Returns `None` once the queue is shut down and every registered
    /// completion has been delivered.
    pub fn next(&self) -> Option<Event> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.drained() {
                return None;
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// Wait up to `timeout` for an event.
    pub fn next_timeout(&self, timeout: Duration) -> NextStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return NextStatus::Event(event);
            }
            if state.drained() {
                return NextStatus::Shutdown;
            }
            if self
                .inner
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.events.pop_front() {
                    Some(event) => NextStatus::Event(event),
                    None => NextStatus::Timeout,
                };
            }
        }
    }

    /// Pop an event if one is ready.
    pub fn try_next(&self) -> Option<Event> {
        self.inner.state.lock().events.pop_front()
    }

    /// Stop accepting registrations. Pending completions are still delivered.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Number of registered completions that have not been posted yet.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Number of events ready to be retrieved.
    pub fn pending_events(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    pub(crate) fn register(&self) {
        let mut state = self.inner.state.lock();
        assert!(!state.shutdown, "batch submitted to a shut down completion queue");
        state.outstanding += 1;
    }

    pub(crate) fn post(&self, event: Event) {
        let mut state = self.inner.state.lock();
        assert!(
            state.outstanding > 0,
            "completion posted for tag {:?} without a registration",
            event.tag
        );
        state.outstanding -= 1;
        state.events.push_back(event);
        self.inner.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_events_delivered_in_post_order() {
        let cq = CompletionQueue::new();
        cq.register();
        cq.register();
        cq.post(Event { tag: Tag::new(1), ok: true });
        cq.post(Event { tag: Tag::new(2), ok: false });

        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(1), ok: true }));
        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(2), ok: false }));
        assert_eq!(cq.try_next(), None);
        assert_eq!(cq.outstanding(), 0);
    }

    #[test]
    fn test_next_timeout_without_events() {
        let cq = CompletionQueue::new();
        assert_eq!(
            cq.next_timeout(Duration::from_millis(5)),
            NextStatus::Timeout
        );
    }

    #[test]
    fn test_shutdown_drains_outstanding_first() {
        let cq = CompletionQueue::new();
        cq.register();
        cq.shutdown();
        assert!(cq.is_shutdown());
        assert_eq!(
            cq.next_timeout(Duration::from_millis(5)),
            NextStatus::Timeout
        );

        cq.post(Event { tag: Tag::new(7), ok: true });
        assert_eq!(cq.next(), Some(Event { tag: Tag::new(7), ok: true }));
        assert_eq!(cq.next(), None);
        assert_eq!(cq.next_timeout(Duration::from_millis(5)), NextStatus::Shutdown);
    }

    #[test]
    fn test_next_wakes_on_post_from_other_thread() {
        let cq = CompletionQueue::new();
        cq.register();

        let poster = cq.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            poster.post(Event { tag: Tag::new(3), ok: true });
        });

        assert_eq!(cq.next(), Some(Event { tag: Tag::new(3), ok: true }));
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "without a registration")]
    fn test_unregistered_post_is_a_fault() {
        CompletionQueue::new().post(Event { tag: Tag::new(1), ok: true });
    }

    #[test]
    #[should_panic(expected = "shut down completion queue")]
    fn test_register_after_shutdown_is_a_fault() {
        let cq = CompletionQueue::new();
        cq.shutdown();
        cq.register();
    }
}
