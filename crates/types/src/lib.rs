//! Shared type definitions for the Quoteflow form engine.
//!
//! The types in this crate describe data that arrives from outside the engine:
//! downloaded product configuration (questions, tags, operation endpoints) and
//! the small vocabulary shared between the engine and its front-ends, such as
//! operation statuses.

pub mod operation;
pub mod product;

pub use operation::OperationStatus;
pub use product::{
    ConfigurationError, HttpVerb, OperationDefinition, ProductConfiguration, QuestionDefinition, QuestionMetadata,
    SUPPORTED_CONFIGURATION_VERSION, validation::validate_product_configuration,
};
