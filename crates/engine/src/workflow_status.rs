//! Tracks user-triggered actions and navigations that are in flight.
//!
//! Front-ends gate buttons and step transitions on the two boolean streams
//! exposed here. Both streams only publish on real transitions, so repeated
//! `start_navigation` calls with the same name do not cause flicker.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use crate::reactive::{ReplaySubject, lock_unpoisoned};

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Action names in start order; the same name may appear more than once.
    pub actions_in_progress: Vec<String>,
    pub current_navigation_action_name: Option<String>,
    pub workflow_step_change_in_progress: bool,
    pub is_navigating_out: bool,
}

/// Shared coordinator handle.
#[derive(Debug, Clone)]
pub struct WorkflowStatusCoordinator {
    state: Arc<Mutex<WorkflowStatus>>,
    navigation_in_progress: ReplaySubject<bool>,
    actions_in_progress: ReplaySubject<bool>,
}

impl Default for WorkflowStatusCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStatusCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkflowStatus::default())),
            navigation_in_progress: ReplaySubject::new(false),
            actions_in_progress: ReplaySubject::new(false),
        }
    }

    /// Emits `true` when a navigation starts and `false` when it stops.
    pub fn navigation_in_progress(&self) -> ReplaySubject<bool> {
        self.navigation_in_progress.clone()
    }

    /// Emits whether at least one action is in progress, on every change.
    pub fn actions_in_progress(&self) -> ReplaySubject<bool> {
        self.actions_in_progress.clone()
    }

    /// Marks `action_name` as the navigation in progress.
    ///
    /// Starting the navigation that is already current does nothing. Starting a
    /// different one while another is running replaces the name without a
    /// broadcast, since "navigation in progress" did not change.
    pub fn start_navigation(&self, action_name: &str) {
        let started = {
            let mut state = lock_unpoisoned(&self.state);
            match state.current_navigation_action_name.as_deref() {
                Some(current) if current == action_name => return,
                current => {
                    let started = current.is_none();
                    state.current_navigation_action_name = Some(action_name.to_string());
                    started
                }
            }
        };
        debug!(action = %action_name, "navigation started");
        if started {
            self.navigation_in_progress.publish(true);
        }
    }

    pub fn stop_navigation(&self) {
        let stopped = lock_unpoisoned(&self.state).current_navigation_action_name.take();
        if let Some(action_name) = stopped {
            debug!(action = %action_name, "navigation stopped");
            self.navigation_in_progress.publish(false);
        }
    }

    pub fn current_navigation(&self) -> Option<String> {
        lock_unpoisoned(&self.state).current_navigation_action_name.clone()
    }

    pub fn add_action_in_progress(&self, action_name: &str) {
        lock_unpoisoned(&self.state).actions_in_progress.push(action_name.to_string());
        debug!(action = %action_name, "action started");
        self.actions_in_progress.publish(true);
    }

    /// Removes one occurrence of `action_name`.
    pub fn remove_action_in_progress(&self, action_name: &str) {
        let remaining = {
            let mut state = lock_unpoisoned(&self.state);
            let Some(position) = state.actions_in_progress.iter().position(|name| name == action_name) else {
                return;
            };
            state.actions_in_progress.remove(position);
            !state.actions_in_progress.is_empty()
        };
        debug!(action = %action_name, remaining, "action finished");
        self.actions_in_progress.publish(remaining);
    }

    pub fn clear_actions_in_progress(&self) {
        let had_actions = {
            let mut state = lock_unpoisoned(&self.state);
            let had_actions = !state.actions_in_progress.is_empty();
            state.actions_in_progress.clear();
            had_actions
        };
        if had_actions {
            self.actions_in_progress.publish(false);
        }
    }

    pub fn is_action_in_progress(&self, action_name: &str) -> bool {
        lock_unpoisoned(&self.state)
            .actions_in_progress
            .iter()
            .any(|name| name == action_name)
    }

    pub fn set_workflow_step_change_in_progress(&self, in_progress: bool) {
        lock_unpoisoned(&self.state).workflow_step_change_in_progress = in_progress;
    }

    pub fn set_navigating_out(&self, navigating_out: bool) {
        lock_unpoisoned(&self.state).is_navigating_out = navigating_out;
    }

    pub fn snapshot(&self) -> WorkflowStatus {
        lock_unpoisoned(&self.state).clone()
    }

    /// Returns the UI to an interactive state after an unhandled failure.
    pub fn reset_after_error(&self) {
        self.clear_actions_in_progress();
        self.stop_navigation();
        let mut state = lock_unpoisoned(&self.state);
        state.workflow_step_change_in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_broadcasts_only_on_transitions() {
        let coordinator = WorkflowStatusCoordinator::new();
        let mut updates = coordinator.navigation_in_progress().subscribe();
        assert_eq!(updates.drain(), vec![false]);

        coordinator.start_navigation("next");
        coordinator.start_navigation("next");
        coordinator.start_navigation("back");
        assert_eq!(updates.drain(), vec![true]);
        assert_eq!(coordinator.current_navigation().as_deref(), Some("back"));

        coordinator.stop_navigation();
        coordinator.stop_navigation();
        assert_eq!(updates.drain(), vec![false]);
    }

    #[test]
    fn duplicate_actions_are_removed_one_at_a_time() {
        let coordinator = WorkflowStatusCoordinator::new();
        let mut updates = coordinator.actions_in_progress().subscribe();
        updates.drain();

        coordinator.add_action_in_progress("save");
        coordinator.add_action_in_progress("save");
        coordinator.remove_action_in_progress("save");
        assert!(coordinator.is_action_in_progress("save"));
        coordinator.remove_action_in_progress("save");
        coordinator.remove_action_in_progress("save");

        assert_eq!(updates.drain(), vec![true, true, true, false]);
        assert!(coordinator.snapshot().actions_in_progress.is_empty());
    }

    #[test]
    fn reset_restores_an_interactive_state() {
        let coordinator = WorkflowStatusCoordinator::new();
        coordinator.add_action_in_progress("submit");
        coordinator.start_navigation("next");
        coordinator.set_workflow_step_change_in_progress(true);
        coordinator.set_navigating_out(true);

        coordinator.reset_after_error();

        let snapshot = coordinator.snapshot();
        assert!(snapshot.actions_in_progress.is_empty());
        assert!(snapshot.current_navigation_action_name.is_none());
        assert!(!snapshot.workflow_step_change_in_progress);
        assert!(snapshot.is_navigating_out);
        assert!(!coordinator.navigation_in_progress().latest());
        assert!(!coordinator.actions_in_progress().latest());
    }
}
