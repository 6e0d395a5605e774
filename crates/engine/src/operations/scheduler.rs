//! Operation instruction scheduler.
//!
//! Two lanes share one runtime:
//!
//! - **background** instructions start as soon as they are dispatched, run
//!   concurrently and are tracked as priority operations;
//! - **blocking** instructions run one at a time through a single execution
//!   slot, in arrival order.
//!
//! A blocking instruction additionally waits for background instructions that
//! were dispatched before it, so a form sync issued ahead of a bind always lands
//! first. Background instructions dispatched later never delay it.
//!
//! The slot is released exactly once per instruction, whether it completes,
//! fails or is aborted, and the next queued instruction starts immediately.
//! Scheduler state is only touched under its lock; status transitions and bus
//! notifications happen after the lock is released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use quoteflow_types::OperationStatus;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::instruction::OperationInstruction;
use super::status::OperationStatusRegistry;
use super::{Operation, OperationError, OperationFactory, OperationId, OperationRequest};
use crate::messaging::{EngineMessage, MessageBus};
use crate::reactive::lock_unpoisoned;

/// How new instructions treat blocking work that is still queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Append behind everything already queued.
    #[default]
    Queue,
    /// Abort every queued, not yet started blocking instruction first.
    Preempt,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Operations whose success triggers a context reload.
    pub reload_after: Vec<String>,
}

/// Reloads context entities that depend on an operation's outcome.
#[async_trait]
pub trait ContextReloader: Send + Sync {
    async fn reload(&self, operation_name: &str, result: &Value) -> anyhow::Result<()>;
}

/// An instruction tagged with the order in which it was dispatched.
struct QueuedInstruction {
    sequence: u64,
    instruction: OperationInstruction,
}

struct RunningInstruction {
    sequence: u64,
    instruction: OperationInstruction,
    abort: Option<AbortHandle>,
    /// The operation has returned; only the context reload may still be running.
    settled: bool,
}

impl RunningInstruction {
    fn new(sequence: u64, instruction: OperationInstruction) -> Self {
        Self {
            sequence,
            instruction,
            abort: None,
            settled: false,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    next_sequence: u64,
    queue: VecDeque<QueuedInstruction>,
    executing: Option<RunningInstruction>,
    background: IndexMap<OperationId, RunningInstruction>,
}

impl SchedulerState {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.executing.is_none() && self.background.is_empty()
    }

    fn running_mut(&mut self, id: OperationId) -> Option<&mut RunningInstruction> {
        if let Some(running) = self.background.get_mut(&id) {
            return Some(running);
        }
        self.executing.as_mut().filter(|running| running.instruction.id() == id)
    }
}

struct SchedulerInner {
    factory: Arc<dyn OperationFactory>,
    status: OperationStatusRegistry,
    bus: MessageBus,
    reloader: Option<Arc<dyn ContextReloader>>,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    changed: Notify,
}

/// Runs operation instructions against a pluggable factory.
#[derive(Clone)]
pub struct OperationScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for OperationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.inner.state);
        f.debug_struct("OperationScheduler")
            .field("queued", &state.queue.len())
            .field("executing", &state.executing.as_ref().map(|running| running.instruction.id()))
            .field("background", &state.background.len())
            .finish()
    }
}

impl OperationScheduler {
    pub fn new(
        factory: Arc<dyn OperationFactory>,
        status: OperationStatusRegistry,
        bus: MessageBus,
        reloader: Option<Arc<dyn ContextReloader>>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                factory,
                status,
                bus,
                reloader,
                settings,
                state: Mutex::new(SchedulerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn status_registry(&self) -> &OperationStatusRegistry {
        &self.inner.status
    }

    /// Hands `instruction` to the scheduler.
    ///
    /// Must be called from within a Tokio runtime. An instruction can only be
    /// dispatched once; repeated dispatches are ignored.
    pub fn dispatch(&self, instruction: OperationInstruction) {
        if !instruction.claim() || instruction.status() != OperationStatus::NotStarted {
            warn!(
                operation = %instruction.name(),
                operation_id = instruction.id(),
                "ignoring instruction that was already dispatched"
            );
            return;
        }

        if instruction.is_background() {
            {
                let mut state = lock_unpoisoned(&self.inner.state);
                let sequence = state.next_sequence();
                state
                    .background
                    .insert(instruction.id(), RunningInstruction::new(sequence, instruction.clone()));
                self.inner.status.add_priority(instruction.id(), instruction.name());
            }
            debug!(operation = %instruction.name(), operation_id = instruction.id(), "starting background operation");
            self.start(instruction);
        } else {
            {
                let mut state = lock_unpoisoned(&self.inner.state);
                let sequence = state.next_sequence();
                state.queue.push_back(QueuedInstruction {
                    sequence,
                    instruction: instruction.clone(),
                });
            }
            debug!(operation = %instruction.name(), operation_id = instruction.id(), "queued blocking operation");
            self.pump();
        }
    }

    /// Dispatches every instruction in order.
    pub fn execute_instructions(&self, instructions: Vec<OperationInstruction>) {
        self.execute_instructions_with(instructions, DispatchMode::Queue);
    }

    /// Dispatches every instruction in order, optionally preempting queued blocking work.
    pub fn execute_instructions_with(&self, instructions: Vec<OperationInstruction>, mode: DispatchMode) {
        if mode == DispatchMode::Preempt {
            let preempted = std::mem::take(&mut lock_unpoisoned(&self.inner.state).queue);
            for QueuedInstruction { instruction, .. } in preempted {
                info!(operation = %instruction.name(), operation_id = instruction.id(), "preempting queued operation");
                self.finish(&instruction, OperationStatus::Aborted, Err(OperationError::Aborted));
            }
            self.inner.changed.notify_waiters();
        }
        for instruction in instructions {
            self.dispatch(instruction);
        }
    }

    /// Aborts `instruction` if it has not finished; returns whether it was aborted.
    ///
    /// Aborting a started blocking instruction releases the slot and starts the
    /// next queued one, exactly as a completion would. An instruction whose
    /// operation has already returned cannot be aborted; it finishes once its
    /// context reload is done.
    pub fn abort(&self, instruction: &OperationInstruction) -> bool {
        let id = instruction.id();
        let handle = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.running_mut(id).is_some_and(|running| running.settled) {
                debug!(operation = %instruction.name(), operation_id = id, "operation already returned; not aborting");
                return false;
            }
            if let Some(position) = state.queue.iter().position(|queued| queued.instruction.id() == id) {
                state.queue.remove(position);
                None
            } else if let Some(running) = state.background.shift_remove(&id) {
                self.inner.status.remove_priority(id);
                running.abort
            } else if state.executing.as_ref().is_some_and(|running| running.instruction.id() == id) {
                self.inner.status.clear_executing(id);
                state.executing.take().and_then(|running| running.abort)
            } else {
                None
            }
        };

        if let Some(handle) = handle {
            handle.abort();
        }
        let aborted = self.finish(instruction, OperationStatus::Aborted, Err(OperationError::Aborted));
        if aborted {
            info!(operation = %instruction.name(), operation_id = id, "aborted operation");
        }
        self.pump();
        self.inner.changed.notify_waiters();
        aborted
    }

    /// Aborts every queued or running instruction whose name is in `names`.
    pub fn abort_named(&self, names: &[&str]) -> usize {
        let targets = {
            let state = lock_unpoisoned(&self.inner.state);
            state
                .queue
                .iter()
                .map(|queued| &queued.instruction)
                .chain(state.executing.iter().map(|running| &running.instruction))
                .chain(state.background.values().map(|running| &running.instruction))
                .filter(|instruction| names.contains(&instruction.name()))
                .cloned()
                .collect::<Vec<_>>()
        };
        targets.iter().filter(|instruction| self.abort(instruction)).count()
    }

    /// True when nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        lock_unpoisoned(&self.inner.state).is_idle()
    }

    /// Instructions waiting for the blocking slot, in order.
    pub fn queued(&self) -> Vec<OperationInstruction> {
        lock_unpoisoned(&self.inner.state)
            .queue
            .iter()
            .map(|queued| queued.instruction.clone())
            .collect()
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_until_idle(&self) {
        loop {
            let changed = self.inner.changed.notified();
            if self.is_idle() {
                return;
            }
            changed.await;
        }
    }

    /// Starts the head of the blocking queue when the slot is free.
    fn pump(&self) {
        let next = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.executing.is_some() {
                return;
            }
            let Some(front) = state.queue.front() else {
                return;
            };
            let (front_sequence, front_id) = (front.sequence, front.instruction.id());
            if state.background.values().any(|running| running.sequence < front_sequence) {
                debug!(operation_id = front_id, "blocking operation waiting for earlier background work");
                return;
            }
            let Some(QueuedInstruction { sequence, instruction: next }) = state.queue.pop_front() else {
                return;
            };
            state.executing = Some(RunningInstruction::new(sequence, next.clone()));
            self.inner.status.set_executing(next.id(), next.name());
            next
        };
        debug!(operation = %next.name(), operation_id = next.id(), "starting blocking operation");
        self.start(next);
    }

    fn start(&self, instruction: OperationInstruction) {
        if !self.transition(&instruction, OperationStatus::Started) {
            // Aborted between being scheduled and starting; the abort already released it.
            return;
        }
        let operation = self.inner.factory.create(instruction.name());
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(instruction, operation).await });
    }

    async fn run(&self, instruction: OperationInstruction, operation: Option<Arc<dyn Operation>>) {
        let outcome = match operation {
            Some(operation) => {
                let request = OperationRequest {
                    operation_id: instruction.id(),
                    name: instruction.name().to_string(),
                    arguments: instruction.arguments().clone(),
                };
                let task = tokio::spawn(async move { operation.execute(request).await });
                self.attach_abort_handle(instruction.id(), task.abort_handle());
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(join_error) if join_error.is_cancelled() => return,
                    Err(join_error) => Err(OperationError::failed(format!("operation panicked: {join_error}"))),
                };
                if !self.settle(instruction.id()) {
                    // Aborted after the operation returned but before it was settled.
                    return;
                }
                outcome
            }
            None => Err(OperationError::unknown(instruction.name())),
        };

        let status = match &outcome {
            Ok(value) => {
                self.reload_if_configured(&instruction, value).await;
                OperationStatus::Completed
            }
            Err(error) => {
                warn!(operation = %instruction.name(), operation_id = instruction.id(), error = %error, "operation failed");
                OperationStatus::Failed
            }
        };
        self.finish(&instruction, status, outcome);
        self.release(&instruction);
    }

    fn attach_abort_handle(&self, id: OperationId, handle: AbortHandle) {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.running_mut(id) {
            Some(running) => running.abort = Some(handle),
            // Aborted while the task was being spawned.
            None => handle.abort(),
        }
    }

    /// Marks a running instruction as past the point where it can be aborted.
    fn settle(&self, id: OperationId) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        match state.running_mut(id) {
            Some(running) => {
                running.settled = true;
                running.abort = None;
                true
            }
            None => false,
        }
    }

    async fn reload_if_configured(&self, instruction: &OperationInstruction, result: &Value) {
        let Some(reloader) = &self.inner.reloader else {
            return;
        };
        if !self.inner.settings.reload_after.iter().any(|name| name == instruction.name()) {
            return;
        }
        if let Err(reload_error) = reloader.reload(instruction.name(), result).await {
            error!(
                operation = %instruction.name(),
                operation_id = instruction.id(),
                error = %reload_error,
                "context reload failed"
            );
        }
    }

    fn release(&self, instruction: &OperationInstruction) {
        let id = instruction.id();
        let released = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if instruction.is_background() {
                let removed = state.background.shift_remove(&id).is_some();
                if removed {
                    self.inner.status.remove_priority(id);
                }
                removed
            } else if state.executing.as_ref().is_some_and(|running| running.instruction.id() == id) {
                state.executing = None;
                self.inner.status.clear_executing(id);
                true
            } else {
                false
            }
        };
        if released {
            debug!(operation = %instruction.name(), operation_id = id, "released operation");
        }
        self.pump();
        self.inner.changed.notify_waiters();
    }

    fn transition(&self, instruction: &OperationInstruction, status: OperationStatus) -> bool {
        let changed = instruction.transition(status);
        if changed {
            self.announce(instruction, status);
        }
        changed
    }

    fn finish(&self, instruction: &OperationInstruction, status: OperationStatus, result: Result<Value, OperationError>) -> bool {
        let changed = instruction.finish_with(status, Some(result));
        if changed {
            self.announce(instruction, status);
        }
        changed
    }

    fn announce(&self, instruction: &OperationInstruction, status: OperationStatus) {
        debug!(operation = %instruction.name(), operation_id = instruction.id(), %status, "operation status changed");
        self.inner.bus.publish(EngineMessage::OperationStatusChanged {
            operation_id: instruction.id(),
            name: instruction.name().to_string(),
            status,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::StaticOperationFactory;
    use serde_json::json;

    fn scheduler(factory: StaticOperationFactory) -> OperationScheduler {
        OperationScheduler::new(
            Arc::new(factory),
            OperationStatusRegistry::default(),
            MessageBus::default(),
            None,
            SchedulerSettings::default(),
        )
    }

    #[tokio::test]
    async fn unknown_operations_fail_and_free_the_slot() {
        let scheduler = scheduler(StaticOperationFactory::new().register_fn("save", |_| async { Ok(json!("saved")) }));
        let missing = OperationInstruction::new("missing", Value::Null);
        let save = OperationInstruction::new("save", Value::Null);
        scheduler.execute_instructions(vec![missing.clone(), save.clone()]);
        scheduler.wait_until_idle().await;

        assert_eq!(missing.status(), OperationStatus::Failed);
        assert!(matches!(missing.result(), Some(Err(OperationError::Unknown { .. }))));
        assert_eq!(save.status(), OperationStatus::Completed);
        assert_eq!(save.result(), Some(Ok(json!("saved"))));
    }

    #[tokio::test]
    async fn dispatching_twice_is_ignored() {
        let scheduler = scheduler(StaticOperationFactory::new().register_fn("save", |_| async { Ok(Value::Null) }));
        let save = OperationInstruction::new("save", Value::Null);
        scheduler.dispatch(save.clone());
        scheduler.dispatch(save.clone());
        scheduler.wait_until_idle().await;
        assert_eq!(save.status(), OperationStatus::Completed);
    }

    #[tokio::test]
    async fn aborting_before_dispatch_marks_the_instruction() {
        let scheduler = scheduler(StaticOperationFactory::new());
        let instruction = OperationInstruction::new("save", Value::Null);
        assert!(scheduler.abort(&instruction));
        assert_eq!(instruction.status(), OperationStatus::Aborted);
        assert!(!scheduler.abort(&instruction));
    }
}
