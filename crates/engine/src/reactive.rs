//! Replay-last publish/subscribe primitive.
//!
//! [`ReplaySubject`] holds the most recent value and fans every new value out
//! to two kinds of listeners:
//!
//! - async [`Subscription`]s, each backed by an unbounded Tokio channel that
//!   first receives the latest value and then every later publish, in order;
//! - synchronous observers registered with [`ReplaySubject::observe`] or
//!   [`ReplaySubject::observe_changes`], invoked on the publishing task.
//!
//! Observers are always invoked after the internal lock is released, so an
//! observer may read or publish to any subject (including this one).
//! Completing a subject ends every subscription and drops every observer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

type ObserverFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Recovers the guard from a poisoned mutex.
///
/// A panic inside an observer must not wedge every later publish on the same
/// subject, so poisoning is ignored throughout the engine.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SubjectState<T> {
    latest: T,
    closed: bool,
    next_listener_id: u64,
    subscribers: Vec<(u64, UnboundedSender<T>)>,
    observers: Vec<(u64, ObserverFn<T>)>,
}

impl<T> SubjectState<T> {
    fn allocate_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }
}

/// Hot value stream with replay of the latest value.
pub struct ReplaySubject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
}

impl<T> Clone for ReplaySubject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReplaySubject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("ReplaySubject")
            .field("latest", &state.latest)
            .field("closed", &state.closed)
            .field("subscribers", &state.subscribers.len())
            .field("observers", &state.observers.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> ReplaySubject<T> {
    /// Creates a subject seeded with `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                latest: initial,
                closed: false,
                next_listener_id: 0,
                subscribers: Vec::new(),
                observers: Vec::new(),
            })),
        }
    }

    /// Returns a clone of the most recent value.
    pub fn latest(&self) -> T {
        lock_unpoisoned(&self.state).latest.clone()
    }

    /// Returns true once [`complete`](Self::complete) has been called.
    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }

    /// Number of live subscriptions and observers.
    pub fn listener_count(&self) -> usize {
        let state = lock_unpoisoned(&self.state);
        state.subscribers.len() + state.observers.len()
    }

    /// Stores `value` and delivers it to every listener.
    ///
    /// Returns `false` (and drops the value) when the subject is completed.
    pub fn publish(&self, value: T) -> bool {
        let observers = {
            let mut state = lock_unpoisoned(&self.state);
            if state.closed {
                return false;
            }
            state.latest = value.clone();
            state.subscribers.retain(|(_, sender)| sender.send(value.clone()).is_ok());
            state.observers.iter().map(|(_, observer)| Arc::clone(observer)).collect::<Vec<_>>()
        };
        for observer in observers {
            observer(&value);
        }
        true
    }

    /// Opens an async subscription that starts with the latest value.
    ///
    /// Subscribing to a completed subject yields a subscription that is
    /// already at end-of-stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = lock_unpoisoned(&self.state);
        let id = state.allocate_id();
        if !state.closed {
            let _ = sender.send(state.latest.clone());
            state.subscribers.push((id, sender));
        }
        Subscription {
            id,
            receiver,
            subject: Arc::downgrade(&self.state),
        }
    }

    /// Registers a synchronous observer and immediately replays the latest value to it.
    pub fn observe<F>(&self, observer: F) -> ObserverGuard
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let observer: ObserverFn<T> = Arc::new(observer);
        let (guard, replay) = self.register_observer(Arc::clone(&observer));
        if let Some(latest) = replay {
            observer(&latest);
        }
        guard
    }

    /// Registers a synchronous observer that only sees values published from now on.
    pub fn observe_changes<F>(&self, observer: F) -> ObserverGuard
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_observer(Arc::new(observer)).0
    }

    fn register_observer(&self, observer: ObserverFn<T>) -> (ObserverGuard, Option<T>) {
        let mut state = lock_unpoisoned(&self.state);
        if state.closed {
            return (ObserverGuard::detached(), None);
        }
        let id = state.allocate_id();
        state.observers.push((id, observer));
        let latest = state.latest.clone();
        drop(state);

        let weak = Arc::downgrade(&self.state);
        let guard = ObserverGuard {
            detach: Some(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    lock_unpoisoned(&state).observers.retain(|(observer_id, _)| *observer_id != id);
                }
            })),
        };
        (guard, Some(latest))
    }

    /// Ends every subscription and drops every observer; later publishes are ignored.
    pub fn complete(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.closed = true;
        state.subscribers.clear();
        state.observers.clear();
    }
}

/// Async receiving side of a [`ReplaySubject`].
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// removes it from the subject.
pub struct Subscription<T> {
    id: u64,
    receiver: UnboundedReceiver<T>,
    subject: Weak<Mutex<SubjectState<T>>>,
}

impl<T> Subscription<T> {
    /// Waits for the next value; `None` once the subject is completed or dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns the next buffered value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Returns every value currently buffered.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.receiver.try_recv() {
            values.push(value);
        }
        values
    }

    /// Detaches from the subject.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(state) = self.subject.upgrade() {
            let mut state = lock_unpoisoned(&state);
            state.subscribers.retain(|(subscriber_id, _)| *subscriber_id != self.id);
        }
    }
}

/// Keeps a synchronous observer registered until dropped.
#[must_use = "dropping the guard unregisters the observer"]
pub struct ObserverGuard {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ObserverGuard {
    fn detached() -> Self {
        Self { detach: None }
    }

    /// Unregisters the observer now.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for ObserverGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGuard").field("attached", &self.detach.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn late_subscribers_receive_latest_value_first() {
        let subject = ReplaySubject::new(1);
        subject.publish(2);
        subject.publish(3);

        let mut subscription = subject.subscribe();
        assert_eq!(subscription.recv().await, Some(3));

        subject.publish(4);
        subject.publish(5);
        assert_eq!(subscription.drain(), vec![4, 5]);
    }

    #[tokio::test]
    async fn complete_ends_subscriptions() {
        let subject = ReplaySubject::new("seed".to_string());
        let mut subscription = subject.subscribe();
        assert_eq!(subscription.recv().await.as_deref(), Some("seed"));

        subject.complete();
        assert_eq!(subscription.recv().await, None);
        assert!(!subject.publish("ignored".to_string()));
        assert_eq!(subject.latest(), "seed");
    }

    #[test]
    fn observers_replay_and_stop_after_guard_drop() {
        let subject = ReplaySubject::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let guard = subject.observe(move |value| sink.lock().unwrap().push(*value));

        subject.publish(11);
        drop(guard);
        subject.publish(12);

        assert_eq!(*seen.lock().unwrap(), vec![10, 11]);
        assert_eq!(subject.listener_count(), 0);
    }

    #[test]
    fn change_observers_skip_replay() {
        let subject = ReplaySubject::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _guard = subject.observe_changes(move |value| sink.lock().unwrap().push(*value));

        subject.publish(1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn observers_may_publish_to_other_subjects() {
        let source = ReplaySubject::new(1);
        let doubled = ReplaySubject::new(0);
        let target = doubled.clone();
        let _guard = source.observe(move |value| {
            target.publish(value * 2);
        });

        source.publish(21);
        assert_eq!(doubled.latest(), 42);
    }

    #[test]
    fn dropped_subscriptions_are_removed() {
        let subject = ReplaySubject::new(0);
        let subscription = subject.subscribe();
        assert_eq!(subject.listener_count(), 1);
        subscription.unsubscribe();
        assert_eq!(subject.listener_count(), 0);
    }
}
