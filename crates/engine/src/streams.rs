//! Per-field value and repeating-count streams.
//!
//! The registry is the single substrate through which field values flow: the
//! data store publishes into it, UI components and expression evaluators read
//! from it. Streams are created lazily on first access and torn down
//! explicitly, either one at a time when a field leaves the tree or all at
//! once when a quote is reset.

use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::debug;

use crate::{field_paths::is_same_or_descendant, reactive::{ReplaySubject, lock_unpoisoned}};

#[derive(Default)]
struct RegistryState {
    values: IndexMap<String, ReplaySubject<Value>>,
    counts: IndexMap<String, ReplaySubject<usize>>,
}

/// Registry of live field value and repeating-count streams.
#[derive(Clone, Default)]
pub struct FieldValueStreamRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for FieldValueStreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("FieldValueStreamRegistry")
            .field("value_streams", &state.values.len())
            .field("count_streams", &state.counts.len())
            .finish()
    }
}

impl FieldValueStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stream for `path`, creating it seeded with `initial_value`
    /// (or `null`) when it does not exist yet.
    pub fn field_value_stream(&self, path: &str, initial_value: Option<Value>) -> ReplaySubject<Value> {
        let mut state = lock_unpoisoned(&self.state);
        state
            .values
            .entry(path.to_string())
            .or_insert_with(|| {
                debug!(path = %path, "creating field value stream");
                ReplaySubject::new(initial_value.unwrap_or(Value::Null))
            })
            .clone()
    }

    /// Publishes `value` on the stream for `path`, creating it when needed.
    ///
    /// Returns true when the stream was created by this call. Publishing an
    /// unchanged value is skipped so observers only see real changes.
    pub fn publish_field_value(&self, path: &str, value: Value) -> bool {
        let (subject, created) = {
            let mut state = lock_unpoisoned(&self.state);
            match state.values.get(path) {
                Some(subject) => (subject.clone(), false),
                None => {
                    debug!(path = %path, "creating field value stream");
                    let subject = ReplaySubject::new(value.clone());
                    state.values.insert(path.to_string(), subject.clone());
                    (subject, true)
                }
            }
        };
        if !created && subject.latest() != value {
            subject.publish(value);
        }
        created
    }

    /// Latest value published for `path`, without creating a stream.
    pub fn latest_value(&self, path: &str) -> Option<Value> {
        let subject = lock_unpoisoned(&self.state).values.get(path).cloned();
        subject.map(|subject| subject.latest())
    }

    /// Returns the element-count stream for the array at `path`, creating it at zero.
    pub fn repeating_count_stream(&self, path: &str) -> ReplaySubject<usize> {
        let mut state = lock_unpoisoned(&self.state);
        state
            .counts
            .entry(path.to_string())
            .or_insert_with(|| ReplaySubject::new(0))
            .clone()
    }

    /// Publishes the element count of the array at `path`.
    pub fn publish_repeating_count(&self, path: &str, count: usize) {
        let subject = {
            let mut state = lock_unpoisoned(&self.state);
            match state.counts.get(path) {
                Some(subject) => subject.clone(),
                None => {
                    state.counts.insert(path.to_string(), ReplaySubject::new(count));
                    return;
                }
            }
        };
        if subject.latest() != count {
            subject.publish(count);
        }
    }

    /// Every path that currently has a live value stream.
    pub fn all_field_paths(&self) -> IndexSet<String> {
        lock_unpoisoned(&self.state).values.keys().cloned().collect()
    }

    /// Returns true when `path` has a live value stream.
    pub fn contains(&self, path: &str) -> bool {
        lock_unpoisoned(&self.state).values.contains_key(path)
    }

    /// Tears down the value stream for `path`; returns true when one existed.
    pub fn remove_field_value_subject(&self, path: &str) -> bool {
        let removed = lock_unpoisoned(&self.state).values.shift_remove(path);
        match removed {
            Some(subject) => {
                subject.complete();
                debug!(path = %path, "disposed field value stream");
                true
            }
            None => false,
        }
    }

    /// Tears down every value and count stream at or beneath `path`.
    ///
    /// Returns the value-stream paths that were removed.
    pub fn remove_streams_under(&self, path: &str) -> Vec<String> {
        let (values, counts) = {
            let mut state = lock_unpoisoned(&self.state);
            let value_paths = state
                .values
                .keys()
                .filter(|candidate| is_same_or_descendant(candidate, path))
                .cloned()
                .collect::<Vec<_>>();
            let count_paths = state
                .counts
                .keys()
                .filter(|candidate| is_same_or_descendant(candidate, path))
                .cloned()
                .collect::<Vec<_>>();
            let values = value_paths
                .into_iter()
                .filter_map(|key| state.values.shift_remove(&key).map(|subject| (key, subject)))
                .collect::<Vec<_>>();
            let counts = count_paths
                .into_iter()
                .filter_map(|key| state.counts.shift_remove(&key))
                .collect::<Vec<_>>();
            (values, counts)
        };
        for subject in counts {
            subject.complete();
        }
        values
            .into_iter()
            .map(|(key, subject)| {
                subject.complete();
                key
            })
            .collect()
    }

    /// Tears down every stream (quote resume reset).
    pub fn delete_all_field_value_subjects(&self) {
        let (values, counts) = {
            let mut state = lock_unpoisoned(&self.state);
            (std::mem::take(&mut state.values), std::mem::take(&mut state.counts))
        };
        debug!(
            value_streams = values.len(),
            count_streams = counts.len(),
            "deleting all field value streams"
        );
        for subject in values.into_values() {
            subject.complete();
        }
        for subject in counts.into_values() {
            subject.complete();
        }
    }
}
