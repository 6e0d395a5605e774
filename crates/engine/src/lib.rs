//! # Quoteflow Engine
//!
//! Reactive form-value engine and operation scheduler for dynamically
//! configured insurance quote forms.
//!
//! ## Key Features
//!
//! - **Form data store**: deep-merges partial form updates into a working and a
//!   strict model and publishes one value stream per scalar leaf
//! - **Tag index**: keeps every live field path indexed under the tags its
//!   configured question carries
//! - **Expressions**: a small embedded language re-evaluated whenever a
//!   declared dependency field changes
//! - **Operation scheduling**: background operations run concurrently, blocking
//!   operations share a single execution slot
//! - **Workflow status**: tracks in-flight actions and navigations, with a reset
//!   for error recovery
//!
//! ## Usage
//!
//! ```rust
//! use quoteflow_engine::EngineContext;
//! use quoteflow_types::ProductConfiguration;
//! use serde_json::json;
//!
//! let context = EngineContext::builder(ProductConfiguration::empty()).build();
//! context.store().apply(&json!({ "driver": { "age": 42 } }));
//!
//! let age = context.registry().field_value_stream("driver.age", None);
//! assert_eq!(age.latest(), json!(42));
//! ```
//!
//! ## Architecture
//!
//! - **`store`** / **`streams`**: the form model and its per-field streams
//! - **`metadata`**: question metadata lookups and the tag index
//! - **`expression`**: lexer, parser, interpreter and reactive evaluators
//! - **`operations`**: instructions, the scheduler, status registry and transport
//! - **`workflow_status`** / **`errors`**: UI gating and the global error handler
//! - **`messaging`**: named notification channels shared by the components
//! - **`context`**: the per-session object that wires everything together

pub mod configuration;
pub mod context;
pub mod errors;
pub mod expression;
pub mod field_paths;
pub mod messaging;
pub mod metadata;
pub mod operations;
pub mod reactive;
pub mod store;
pub mod streams;
pub mod workflow_status;

pub use configuration::{ConfigurationProvider, EngineSettings, load_product_configuration, load_settings, parse_product_configuration};
pub use context::{EngineContext, EngineContextBuilder};
pub use errors::{EngineError, ErrorHandler, ErrorReport};
pub use expression::{Capabilities, EvaluationOutcome, ExpressionDefinition, ExpressionError, ExpressionEvaluator, ExpressionRuntime};
pub use field_paths::FieldPathError;
pub use messaging::{EngineMessage, MessageBus, MessageChannel};
pub use metadata::{FieldMetadataIndex, TagIndexError};
pub use operations::{
    ContextReloader, DispatchMode, EchoOperationFactory, HttpTransport, Operation, OperationError, OperationFactory,
    OperationInstruction, OperationRequest, OperationScheduler, OperationStatusRegistry, StaticOperationFactory, Transport,
    TransportError, TransportOperationFactory,
};
pub use reactive::{ObserverGuard, ReplaySubject, Subscription};
pub use store::{FormDataStore, ModelKind};
pub use streams::FieldValueStreamRegistry;
pub use workflow_status::{WorkflowStatus, WorkflowStatusCoordinator};
