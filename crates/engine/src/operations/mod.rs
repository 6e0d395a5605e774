//! Operation orchestration.
//!
//! Side-effecting workflow steps (save, calculate, bind, submit) are modeled as
//! named operations. An [`OperationFactory`] resolves a name to an executable
//! [`Operation`]; the [`scheduler::OperationScheduler`] runs
//! [`instruction::OperationInstruction`]s against those implementations with
//! background-versus-blocking semantics and records progress in the
//! [`status::OperationStatusRegistry`].

pub mod instruction;
pub mod scheduler;
pub mod status;
pub mod transport;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

pub use instruction::OperationInstruction;
pub use scheduler::{ContextReloader, DispatchMode, OperationScheduler, SchedulerSettings};
pub use status::{ExecutingInstruction, OperationStatusRegistry};
pub use transport::{EchoOperationFactory, HttpTransport, Transport, TransportError, TransportOperationFactory};

/// Monotonic identifier assigned to every instruction.
pub type OperationId = u64;

/// Everything an operation implementation receives.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation_id: OperationId,
    pub name: String,
    pub arguments: Value,
}

/// Why an operation did not complete.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OperationError {
    #[error("no implementation registered for operation '{name}'")]
    Unknown { name: String },

    #[error("operation failed: {message}")]
    Failed { message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("operation was aborted")]
    Aborted,
}

impl OperationError {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::Unknown { name: name.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// An executable unit behind an operation name.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn execute(&self, request: OperationRequest) -> Result<Value, OperationError>;
}

/// Resolves operation names to implementations.
pub trait OperationFactory: Send + Sync {
    fn create(&self, name: &str) -> Option<Arc<dyn Operation>>;
}

/// Adapts an async closure into an [`Operation`].
pub struct FnOperation<F> {
    function: F,
}

impl<F> FnOperation<F> {
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(OperationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, OperationError>> + Send,
{
    async fn execute(&self, request: OperationRequest) -> Result<Value, OperationError> {
        (self.function)(request).await
    }
}

/// Factory backed by a fixed name → implementation table.
#[derive(Default, Clone)]
pub struct StaticOperationFactory {
    operations: IndexMap<String, Arc<dyn Operation>>,
}

impl StaticOperationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        self.operations.insert(name.into(), operation);
        self
    }

    /// Registers an async closure under `name`.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(OperationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OperationError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnOperation::new(function)))
    }
}

impl OperationFactory for StaticOperationFactory {
    fn create(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }
}

impl std::fmt::Debug for StaticOperationFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticOperationFactory")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}
