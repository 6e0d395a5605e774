//! Operation instructions.
//!
//! An instruction is a request to run one named operation. The caller builds
//! it and hands it to the scheduler, which from then on owns every status
//! transition. Callers observe progress through the status stream or by
//! awaiting [`OperationInstruction::wait_for_terminal`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quoteflow_types::OperationStatus;
use serde_json::Value;

use super::{OperationError, OperationId};
use crate::reactive::{ObserverGuard, ReplaySubject, Subscription, lock_unpoisoned};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

struct InstructionState {
    status: OperationStatus,
    result: Option<Result<Value, OperationError>>,
}

struct InstructionInner {
    id: OperationId,
    name: String,
    background: bool,
    arguments: Value,
    state: Mutex<InstructionState>,
    updates: ReplaySubject<OperationStatus>,
    dispatched: AtomicBool,
}

/// Shared handle to one operation request.
#[derive(Clone)]
pub struct OperationInstruction {
    inner: Arc<InstructionInner>,
}

impl std::fmt::Debug for OperationInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationInstruction")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("background", &self.inner.background)
            .field("status", &self.status())
            .finish()
    }
}

impl OperationInstruction {
    /// A blocking instruction.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self::with_background(name, arguments, false)
    }

    /// A background (priority) instruction.
    pub fn background(name: impl Into<String>, arguments: Value) -> Self {
        Self::with_background(name, arguments, true)
    }

    pub fn with_background(name: impl Into<String>, arguments: Value, background: bool) -> Self {
        Self {
            inner: Arc::new(InstructionInner {
                id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                background,
                arguments,
                state: Mutex::new(InstructionState {
                    status: OperationStatus::NotStarted,
                    result: None,
                }),
                updates: ReplaySubject::new(OperationStatus::NotStarted),
                dispatched: AtomicBool::new(false),
            }),
        }
    }

    /// Monotonic identifier; later instructions have larger ids.
    pub fn id(&self) -> OperationId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_background(&self) -> bool {
        self.inner.background
    }

    pub fn arguments(&self) -> &Value {
        &self.inner.arguments
    }

    pub fn status(&self) -> OperationStatus {
        lock_unpoisoned(&self.inner.state).status
    }

    /// Value or error the operation finished with, once terminal.
    pub fn result(&self) -> Option<Result<Value, OperationError>> {
        lock_unpoisoned(&self.inner.state).result.clone()
    }

    /// Subscribes to status changes, starting with the current status.
    pub fn status_updates(&self) -> Subscription<OperationStatus> {
        self.inner.updates.subscribe()
    }

    /// Observes status changes synchronously, starting with the current status.
    pub fn observe_status<F>(&self, observer: F) -> ObserverGuard
    where
        F: Fn(&OperationStatus) + Send + Sync + 'static,
    {
        self.inner.updates.observe(observer)
    }

    /// Resolves once the instruction reaches a terminal status.
    pub async fn wait_for_terminal(&self) -> OperationStatus {
        let mut updates = self.status_updates();
        while let Some(status) = updates.recv().await {
            if status.is_terminal() {
                return status;
            }
        }
        self.status()
    }

    /// Marks the instruction as handed to a scheduler; false when it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.inner.dispatched.swap(true, Ordering::AcqRel)
    }

    /// Applies a legal transition; returns false and changes nothing otherwise.
    pub(crate) fn transition(&self, next: OperationStatus) -> bool {
        self.finish_with(next, None)
    }

    /// Applies a legal transition and records the final result in one step.
    pub(crate) fn finish_with(&self, next: OperationStatus, result: Option<Result<Value, OperationError>>) -> bool {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if !state.status.can_transition_to(next) {
                return false;
            }
            state.status = next;
            if result.is_some() {
                state.result = result;
            }
        }
        self.inner.updates.publish(next);
        if next.is_terminal() {
            self.inner.updates.complete();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_monotonically() {
        let first = OperationInstruction::new("save", json!({}));
        let second = OperationInstruction::background("formUpdate", json!({}));
        assert!(second.id() > first.id());
        assert!(second.is_background());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let instruction = OperationInstruction::new("bind", Value::Null);
        assert!(!instruction.transition(OperationStatus::Completed));
        assert!(instruction.transition(OperationStatus::Started));
        assert!(instruction.finish_with(OperationStatus::Completed, Some(Ok(json!("ok")))));
        assert!(!instruction.transition(OperationStatus::Aborted));
        assert_eq!(instruction.status(), OperationStatus::Completed);
        assert_eq!(instruction.result(), Some(Ok(json!("ok"))));
    }

    #[tokio::test]
    async fn waiting_resolves_with_the_terminal_status() {
        let instruction = OperationInstruction::new("bind", Value::Null);
        let waiter = instruction.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_terminal().await });
        tokio::task::yield_now().await;

        instruction.transition(OperationStatus::Aborted);
        assert_eq!(handle.await.expect("join"), OperationStatus::Aborted);
    }

    #[test]
    fn claiming_happens_once() {
        let instruction = OperationInstruction::new("save", Value::Null);
        assert!(instruction.claim());
        assert!(!instruction.claim());
    }
}
