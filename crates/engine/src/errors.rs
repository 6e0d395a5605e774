//! Engine-wide error type and the global error handler.
//!
//! Component errors stay specific where they are raised. When a failure
//! reaches the user-facing boundary it is wrapped in [`EngineError`] and given
//! to the [`ErrorHandler`], which resets the workflow status so the UI becomes
//! interactive again and republishes the failure for alerting.

use chrono::{DateTime, Utc};
use quoteflow_types::ConfigurationError;
use thiserror::Error;
use tracing::error;

use crate::expression::ExpressionError;
use crate::field_paths::FieldPathError;
use crate::metadata::TagIndexError;
use crate::operations::OperationError;
use crate::reactive::ReplaySubject;
use crate::workflow_status::WorkflowStatusCoordinator;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("operation '{name}' failed: {source}")]
    Operation {
        name: String,
        #[source]
        source: OperationError,
    },

    #[error(transparent)]
    TagIndex(#[from] TagIndexError),

    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

impl EngineError {
    pub fn operation(name: impl Into<String>, source: OperationError) -> Self {
        Self::Operation {
            name: name.into(),
            source,
        }
    }

    /// Short category label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Expression(_) => "expression",
            Self::Operation { .. } => "operation",
            Self::TagIndex(_) => "tag_index",
            Self::FieldPath(_) => "field_path",
        }
    }
}

/// What the handler publishes for every intercepted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Global sink for user-facing failures.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    workflow_status: WorkflowStatusCoordinator,
    reports: ReplaySubject<Option<ErrorReport>>,
}

impl ErrorHandler {
    pub fn new(workflow_status: WorkflowStatusCoordinator) -> Self {
        Self {
            workflow_status,
            reports: ReplaySubject::new(None),
        }
    }

    /// Logs `error`, resets the workflow status and publishes a report.
    pub fn handle(&self, error: &EngineError) -> ErrorReport {
        error!(kind = error.kind(), error = %error, "engine error");
        self.workflow_status.reset_after_error();
        let report = ErrorReport {
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        };
        self.reports.publish(Some(report.clone()));
        report
    }

    /// Latest report first (`None` until something failed), then every later one.
    pub fn reports(&self) -> ReplaySubject<Option<ErrorReport>> {
        self.reports.clone()
    }
}
