//! Path-addressable form data store.
//!
//! The store keeps two trees side by side: `working`, which retains values of
//! fields that are currently hidden, and `strict`, which only holds fields that
//! are currently relevant. Every mutation is a command processed to completion
//! before the next one starts; a command issued from inside an observer
//! callback (for example an expression writing a computed field) is queued and
//! processed right after the current one, so merge traversals never
//! interleave.
//!
//! Processing a command runs in two phases: the trees are updated under the
//! state lock and the resulting effects (stream publishes, bus messages) are
//! collected; the effects are then emitted with no lock held.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map as JsonMap, Value};
use tracing::{debug, warn};

use crate::configuration::ConfigurationProvider;
use crate::field_paths::{
    FieldPathError, PathSegment, format_field_path, is_same_or_descendant, join_index, join_key, parse_field_path,
    remove_value_at, scalar_leaves, set_value_at, value_at, value_at_mut,
};
use crate::messaging::{EngineMessage, MessageBus};
use crate::reactive::lock_unpoisoned;
use crate::streams::FieldValueStreamRegistry;

/// Selects which of the two form trees a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Working,
    Strict,
}

enum StoreCommand {
    Merge(Value),
    Assign {
        path: String,
        segments: Vec<PathSegment>,
        value: Value,
    },
    Hide {
        path: String,
        segments: Vec<PathSegment>,
    },
    Show {
        path: String,
        segments: Vec<PathSegment>,
    },
    Remove {
        path: String,
        segments: Vec<PathSegment>,
    },
    Clear,
}

enum Effect {
    Value(String, Value),
    Count(String, usize),
    PathAdded(String),
    PathRemoved(String),
    DisposeLeaf(String),
    DisposeUnder(String),
    DisposeAll,
}

enum MergeEvent {
    Leaf(String, Value),
    Count(String, usize),
}

struct StoreState {
    working: Value,
    strict: Value,
    overwrite: Option<Value>,
    known_paths: IndexSet<String>,
    hidden: IndexMap<String, Vec<PathSegment>>,
    pending: VecDeque<StoreCommand>,
    draining: bool,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            working: empty_tree(),
            strict: empty_tree(),
            overwrite: None,
            known_paths: IndexSet::new(),
            hidden: IndexMap::new(),
            pending: VecDeque::new(),
            draining: false,
        }
    }
}

/// Session-wide form data model.
#[derive(Clone)]
pub struct FormDataStore {
    state: Arc<Mutex<StoreState>>,
    registry: FieldValueStreamRegistry,
    bus: MessageBus,
}

impl std::fmt::Debug for FormDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("FormDataStore")
            .field("known_paths", &state.known_paths.len())
            .field("hidden", &state.hidden.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl FormDataStore {
    pub fn new(registry: FieldValueStreamRegistry, bus: MessageBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            registry,
            bus,
        }
    }

    /// Stream registry the store publishes into.
    pub fn registry(&self) -> &FieldValueStreamRegistry {
        &self.registry
    }

    /// Deep-merges `partial` (then the overwrite data) into both trees.
    ///
    /// A `null` partial is a no-op; a non-object partial is ignored with a warning.
    pub fn apply(&self, partial: &Value) {
        if partial.is_null() {
            return;
        }
        self.submit(StoreCommand::Merge(partial.clone()));
    }

    /// Writes a single field value addressed by `path`.
    pub fn apply_field_value(&self, path: &str, value: Value) -> Result<(), FieldPathError> {
        let segments = parse_field_path(path)?;
        self.submit(StoreCommand::Assign {
            path: format_field_path(&segments),
            segments,
            value,
        });
        Ok(())
    }

    /// Seeds the store from the product configuration's initial form model.
    pub fn apply_initial_form_model_from_configuration(&self, configuration: &dyn ConfigurationProvider) {
        self.set_overwrite_form_data(configuration.overwrite_form_data());
        self.apply(&configuration.initial_form_model());
    }

    /// Replaces the data merged last on every apply.
    pub fn set_overwrite_form_data(&self, overwrite: Option<Value>) {
        lock_unpoisoned(&self.state).overwrite = overwrite.filter(|value| !value.is_null());
    }

    /// Resets both trees and tears down every stream without per-field removal events.
    pub fn clear(&self) {
        self.submit(StoreCommand::Clear);
    }

    /// Drops `path` from the strict tree; the working tree keeps its value.
    pub fn hide_field(&self, path: &str) -> Result<(), FieldPathError> {
        let segments = parse_field_path(path)?;
        self.submit(StoreCommand::Hide {
            path: format_field_path(&segments),
            segments,
        });
        Ok(())
    }

    /// Restores the working value of `path` into the strict tree.
    pub fn show_field(&self, path: &str) -> Result<(), FieldPathError> {
        let segments = parse_field_path(path)?;
        self.submit(StoreCommand::Show {
            path: format_field_path(&segments),
            segments,
        });
        Ok(())
    }

    /// Removes `path` (a leaf or a whole branch) from both trees.
    ///
    /// Removing an array element shifts later elements down; their streams are
    /// republished with the shifted values and streams past the new end are
    /// disposed.
    pub fn remove_field(&self, path: &str) -> Result<(), FieldPathError> {
        let segments = parse_field_path(path)?;
        self.submit(StoreCommand::Remove {
            path: format_field_path(&segments),
            segments,
        });
        Ok(())
    }

    /// Snapshot of the working tree.
    pub fn working(&self) -> Value {
        lock_unpoisoned(&self.state).working.clone()
    }

    /// Snapshot of the strict tree.
    pub fn strict(&self) -> Value {
        lock_unpoisoned(&self.state).strict.clone()
    }

    /// Reads the value at `path` in the chosen tree.
    pub fn value_at(&self, path: &str, kind: ModelKind) -> Result<Option<Value>, FieldPathError> {
        let segments = parse_field_path(path)?;
        let state = lock_unpoisoned(&self.state);
        let tree = match kind {
            ModelKind::Working => &state.working,
            ModelKind::Strict => &state.strict,
        };
        Ok(value_at(tree, &segments).cloned())
    }

    /// Every leaf path seen since the last [`clear`](Self::clear).
    pub fn field_paths(&self) -> IndexSet<String> {
        lock_unpoisoned(&self.state).known_paths.clone()
    }

    /// Returns true when `path` or one of its ancestors is hidden.
    pub fn is_hidden(&self, path: &str) -> bool {
        let state = lock_unpoisoned(&self.state);
        state.hidden.keys().any(|hidden| is_same_or_descendant(path, hidden))
    }

    fn submit(&self, command: StoreCommand) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.pending.push_back(command);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let _guard = DrainGuard { state: &self.state };
        loop {
            let effects = {
                let mut state = lock_unpoisoned(&self.state);
                let Some(command) = state.pending.pop_front() else {
                    state.draining = false;
                    break;
                };
                state.execute(command)
            };
            self.emit(effects);
        }
    }

    fn emit(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Value(path, value) => {
                    self.registry.publish_field_value(&path, value);
                }
                Effect::Count(path, count) => self.registry.publish_repeating_count(&path, count),
                Effect::PathAdded(path) => self.bus.publish(EngineMessage::FieldPathAdded { path }),
                Effect::PathRemoved(path) => self.bus.publish(EngineMessage::FieldPathRemoved { path }),
                Effect::DisposeLeaf(path) => {
                    self.registry.remove_field_value_subject(&path);
                }
                Effect::DisposeUnder(path) => {
                    self.registry.remove_streams_under(&path);
                }
                Effect::DisposeAll => self.registry.delete_all_field_value_subjects(),
            }
        }
    }
}

struct DrainGuard<'a> {
    state: &'a Mutex<StoreState>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        // An observer panicked mid-drain; let the next command restart draining.
        if std::thread::panicking() {
            lock_unpoisoned(self.state).draining = false;
        }
    }
}

impl StoreState {
    fn execute(&mut self, command: StoreCommand) -> Vec<Effect> {
        match command {
            StoreCommand::Merge(partial) => self.merge(&partial),
            StoreCommand::Assign { path, segments, value } => self.assign(&path, &segments, value),
            StoreCommand::Hide { path, segments } => {
                hide_in(&mut self.strict, &segments);
                debug!(path = %path, "hid field");
                self.hidden.insert(path, segments);
                Vec::new()
            }
            StoreCommand::Show { path, segments } => {
                self.hidden.retain(|hidden, _| !is_same_or_descendant(hidden, &path));
                if let Some(value) = value_at(&self.working, &segments).cloned() {
                    set_value_at(&mut self.strict, &segments, value);
                }
                debug!(path = %path, "showed field");
                Vec::new()
            }
            StoreCommand::Remove { path, segments } => self.remove(&path, &segments),
            StoreCommand::Clear => {
                self.working = empty_tree();
                self.strict = empty_tree();
                self.known_paths.clear();
                self.hidden.clear();
                debug!("cleared form data");
                vec![Effect::DisposeAll]
            }
        }
    }

    fn merge(&mut self, partial: &Value) -> Vec<Effect> {
        if !partial.is_object() {
            warn!(kind = json_kind(partial), "ignoring non-object form data partial");
            return Vec::new();
        }

        let mut events = Vec::new();
        merge_value(&mut self.working, partial, "", &mut events);
        merge_value(&mut self.strict, partial, "", &mut Vec::new());
        if let Some(overwrite) = self.overwrite.clone() {
            merge_value(&mut self.working, &overwrite, "", &mut events);
            merge_value(&mut self.strict, &overwrite, "", &mut Vec::new());
        }
        self.reapply_hidden();

        let effects = self.effects_from(events);
        debug!(effects = effects.len(), known_paths = self.known_paths.len(), "applied form data");
        effects
    }

    fn assign(&mut self, path: &str, segments: &[PathSegment], value: Value) -> Vec<Effect> {
        if value.is_null() && matches!(value_at(&self.working, segments), Some(Value::Object(_) | Value::Array(_))) {
            return Vec::new();
        }

        let mut events = Vec::new();
        for (position, segment) in segments.iter().enumerate() {
            if let PathSegment::Index(index) = segment {
                let array_path = format_field_path(&segments[..position]);
                let existing = value_at(&self.working, &segments[..position])
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                events.push(MergeEvent::Count(array_path, existing.max(index + 1)));
            }
        }

        write_merged(&mut self.working, segments, &value, path, &mut events);
        let hidden = self.hidden.keys().any(|hidden| is_same_or_descendant(path, hidden));
        if !hidden {
            write_merged(&mut self.strict, segments, &value, path, &mut Vec::new());
        }
        self.effects_from(events)
    }

    fn remove(&mut self, path: &str, segments: &[PathSegment]) -> Vec<Effect> {
        let Some((last, parents)) = segments.split_last() else {
            return Vec::new();
        };

        match last {
            PathSegment::Index(index) => {
                let array_path = format_field_path(parents);
                let Some(old_array) = value_at(&self.working, parents).filter(|value| value.is_array()).cloned() else {
                    debug!(path = %path, "remove_field: no array at parent path");
                    return Vec::new();
                };
                let old_length = old_array.as_array().map_or(0, Vec::len);
                if *index >= old_length {
                    debug!(path = %path, "remove_field: index past the end");
                    return Vec::new();
                }

                remove_value_at(&mut self.working, segments);
                remove_value_at(&mut self.strict, segments);
                let new_array = value_at(&self.working, parents).cloned().unwrap_or(Value::Null);
                let new_length = old_length - 1;

                let old_leaves = scalar_leaves(&old_array, &array_path);
                let new_leaves = scalar_leaves(&new_array, &array_path);
                let surviving = new_leaves.iter().map(|(leaf, _)| leaf.as_str()).collect::<IndexSet<_>>();

                let mut effects = vec![Effect::DisposeUnder(join_index(&array_path, new_length))];
                for (leaf, _) in &old_leaves {
                    if !surviving.contains(leaf.as_str()) {
                        effects.push(Effect::DisposeLeaf(leaf.clone()));
                        effects.push(Effect::PathRemoved(leaf.clone()));
                        self.known_paths.shift_remove(leaf);
                    }
                }
                effects.push(Effect::Count(array_path.clone(), new_length));
                for (nested_path, count) in array_counts(&new_array, &array_path) {
                    if nested_path != array_path {
                        effects.push(Effect::Count(nested_path, count));
                    }
                }
                effects.extend(new_leaves.into_iter().map(|(leaf, value)| Effect::Value(leaf, value)));
                self.prune_hidden();
                debug!(path = %path, remaining = new_length, "removed repeating instance");
                effects
            }
            PathSegment::Key(_) => {
                let Some(removed) = remove_value_at(&mut self.working, segments) else {
                    debug!(path = %path, "remove_field: nothing stored at path");
                    return Vec::new();
                };
                remove_value_at(&mut self.strict, segments);

                let mut effects = vec![Effect::DisposeUnder(path.to_string())];
                for (leaf, _) in scalar_leaves(&removed, path) {
                    self.known_paths.shift_remove(&leaf);
                    effects.push(Effect::PathRemoved(leaf));
                }
                self.prune_hidden();
                debug!(path = %path, "removed field");
                effects
            }
        }
    }

    fn effects_from(&mut self, events: Vec<MergeEvent>) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(events.len());
        for event in events {
            match event {
                MergeEvent::Leaf(path, value) => {
                    let first_appearance = self.known_paths.insert(path.clone());
                    effects.push(Effect::Value(path.clone(), value));
                    if first_appearance {
                        effects.push(Effect::PathAdded(path));
                    }
                }
                MergeEvent::Count(path, count) => effects.push(Effect::Count(path, count)),
            }
        }
        effects
    }

    fn reapply_hidden(&mut self) {
        for segments in self.hidden.values() {
            hide_in(&mut self.strict, segments);
        }
    }

    fn prune_hidden(&mut self) {
        let working = &self.working;
        self.hidden.retain(|_, segments| value_at(working, segments).is_some());
    }
}

/// Deep-merges `partial` into `target`, recording every scalar leaf written
/// and every array traversed.
fn merge_value(target: &mut Value, partial: &Value, path: &str, events: &mut Vec<MergeEvent>) {
    match partial {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(JsonMap::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    let child = map.entry(key.clone()).or_insert(Value::Null);
                    merge_value(child, value, &join_key(path, key), events);
                }
            }
        }
        Value::Array(items) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Value::Array(existing) = target {
                if existing.len() < items.len() {
                    existing.resize(items.len(), Value::Null);
                }
                events.push(MergeEvent::Count(path.to_string(), existing.len()));
                for (index, value) in items.iter().enumerate() {
                    merge_value(&mut existing[index], value, &join_index(path, index), events);
                }
            }
        }
        // Null never deletes a branch.
        Value::Null if target.is_object() || target.is_array() => {}
        scalar => {
            *target = scalar.clone();
            events.push(MergeEvent::Leaf(path.to_string(), scalar.clone()));
        }
    }
}

fn write_merged(tree: &mut Value, segments: &[PathSegment], value: &Value, path: &str, events: &mut Vec<MergeEvent>) {
    if value_at(tree, segments).is_none() {
        set_value_at(tree, segments, Value::Null);
    }
    if let Some(slot) = value_at_mut(tree, segments) {
        merge_value(slot, value, path, events);
    }
}

fn hide_in(strict: &mut Value, segments: &[PathSegment]) {
    match segments.last() {
        Some(PathSegment::Index(_)) => {
            // Keep positions stable for the remaining elements.
            if let Some(slot) = value_at_mut(strict, segments) {
                *slot = Value::Null;
            }
        }
        Some(PathSegment::Key(_)) => {
            remove_value_at(strict, segments);
        }
        None => {}
    }
}

fn array_counts(value: &Value, path: &str) -> Vec<(String, usize)> {
    let mut counts = Vec::new();
    collect_array_counts(value, path, &mut counts);
    counts
}

fn collect_array_counts(value: &Value, path: &str, counts: &mut Vec<(String, usize)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                collect_array_counts(nested, &join_key(path, key), counts);
            }
        }
        Value::Array(items) => {
            counts.push((path.to_string(), items.len()));
            for (index, nested) in items.iter().enumerate() {
                collect_array_counts(nested, &join_index(path, index), counts);
            }
        }
        _ => {}
    }
}

fn empty_tree() -> Value {
    Value::Object(JsonMap::new())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
