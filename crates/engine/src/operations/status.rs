//! Process-wide record of in-flight operations.
//!
//! The scheduler writes here; expressions and front-ends read from here. This
//! keeps "is something running?" queries free of any dependency on the
//! scheduler itself.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::OperationId;
use crate::reactive::lock_unpoisoned;

/// The blocking instruction currently holding the execution slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutingInstruction {
    pub id: OperationId,
    pub name: String,
}

#[derive(Debug, Default)]
struct StatusState {
    executing: Option<ExecutingInstruction>,
    priority: IndexMap<OperationId, String>,
}

/// Cloneable handle onto the operation status record.
#[derive(Debug, Clone)]
pub struct OperationStatusRegistry {
    state: Arc<Mutex<StatusState>>,
    calculation_operation: Arc<str>,
}

impl OperationStatusRegistry {
    /// Creates a registry; `calculation_operation` names the operation that maps to priority work.
    pub fn new(calculation_operation: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StatusState::default())),
            calculation_operation: Arc::from(calculation_operation.into()),
        }
    }

    pub fn calculation_operation(&self) -> &str {
        &self.calculation_operation
    }

    /// Answers "is an operation in progress?".
    ///
    /// - no name: a blocking instruction is executing or any priority operation is in flight;
    /// - the calculation operation: any priority operation is in flight;
    /// - any other name: the executing blocking instruction has that name.
    pub fn is_operation_in_progress(&self, name: Option<&str>) -> bool {
        let state = lock_unpoisoned(&self.state);
        match name {
            None => state.executing.is_some() || !state.priority.is_empty(),
            Some(name) if name == &*self.calculation_operation => !state.priority.is_empty(),
            Some(name) => state.executing.as_ref().is_some_and(|executing| executing.name == name),
        }
    }

    pub fn executing_instruction(&self) -> Option<ExecutingInstruction> {
        lock_unpoisoned(&self.state).executing.clone()
    }

    /// Names of in-flight priority operations, oldest first.
    pub fn priority_operations_in_progress(&self) -> Vec<(OperationId, String)> {
        lock_unpoisoned(&self.state)
            .priority
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub(crate) fn set_executing(&self, id: OperationId, name: &str) {
        lock_unpoisoned(&self.state).executing = Some(ExecutingInstruction {
            id,
            name: name.to_string(),
        });
    }

    /// Clears the executing record if it still belongs to `id`.
    pub(crate) fn clear_executing(&self, id: OperationId) {
        let mut state = lock_unpoisoned(&self.state);
        if state.executing.as_ref().is_some_and(|executing| executing.id == id) {
            state.executing = None;
        }
    }

    pub(crate) fn add_priority(&self, id: OperationId, name: &str) {
        lock_unpoisoned(&self.state).priority.insert(id, name.to_string());
    }

    pub(crate) fn remove_priority(&self, id: OperationId) {
        lock_unpoisoned(&self.state).priority.shift_remove(&id);
    }
}

impl Default for OperationStatusRegistry {
    fn default() -> Self {
        Self::new(crate::configuration::DEFAULT_CALCULATION_OPERATION)
    }
}
