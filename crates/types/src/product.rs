//! Downloaded product configuration.
//!
//! A product configuration describes one insurance form: the questions it asks
//! (with their tags and displayability), the initial form model seeded into the
//! data store, optional overwrite data that always wins on merge, and the named
//! operations the workflow can trigger. The schema is deliberately loose since
//! products are authored and hot-reloaded independently of the engine.

pub mod validation;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

/// The only configuration schema version understood by this engine.
pub const SUPPORTED_CONFIGURATION_VERSION: u32 = 1;

/// Root of a downloaded product configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductConfiguration {
    /// Schema version; see [`SUPPORTED_CONFIGURATION_VERSION`].
    pub version: u32,
    /// Optional product identifier used in logs.
    #[serde(default)]
    pub product: Option<String>,
    /// Top-level questions keyed by their form-model key.
    #[serde(default)]
    pub questions: IndexMap<String, QuestionDefinition>,
    /// Form model applied when a new quote starts.
    #[serde(default = "empty_form_model")]
    pub initial_form_model: Value,
    /// Data merged last on every apply.
    #[serde(default)]
    pub overwrite_form_data: Option<Value>,
    /// Operation endpoints keyed by operation name.
    #[serde(default)]
    pub operations: IndexMap<String, OperationDefinition>,
}

/// A single question as declared by the product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDefinition {
    /// Declared field type, e.g. `text`, `number`, `repeating`.
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    /// Semantic tags used for set-based lookups.
    #[serde(default)]
    pub tags: IndexSet<String>,
    /// Whether the field is ever shown to the user.
    #[serde(default = "default_displayable")]
    pub displayable: bool,
    /// Child questions of a repeating group, keyed by their path inside one instance.
    #[serde(default)]
    pub questions: IndexMap<String, QuestionDefinition>,
}

/// Metadata the engine derives from a question definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionMetadata {
    pub field_type: String,
    pub tags: IndexSet<String>,
    pub displayable: bool,
}

impl From<&QuestionDefinition> for QuestionMetadata {
    fn from(definition: &QuestionDefinition) -> Self {
        Self {
            field_type: definition.field_type.clone(),
            tags: definition.tags.clone(),
            displayable: definition.displayable,
        }
    }
}

/// HTTP verb used by transport-backed operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Endpoint description for a named operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationDefinition {
    pub verb: HttpVerb,
    /// Path template; `{name}` placeholders are filled from request arguments.
    pub path: String,
    /// Default background-execution flag for instructions created from this definition.
    #[serde(default)]
    pub background: bool,
}

/// Errors raised while loading or validating a product configuration.
///
/// These are non-recoverable for the load attempt that produced them.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unsupported configuration version {found}; expected {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid question key '{key}': {reason}")]
    InvalidQuestionKey { key: String, reason: String },

    #[error("invalid operation '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    #[error("invalid form model: {reason}")]
    InvalidFormModel { reason: String },

    #[error("could not read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration: {reason}")]
    Parse { reason: String },
}

impl ConfigurationError {
    pub fn invalid_question_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuestionKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse { reason: reason.into() }
    }
}

impl ProductConfiguration {
    /// Creates an empty configuration at the supported version.
    pub fn empty() -> Self {
        Self {
            version: SUPPORTED_CONFIGURATION_VERSION,
            product: None,
            questions: IndexMap::new(),
            initial_form_model: empty_form_model(),
            overwrite_form_data: None,
            operations: IndexMap::new(),
        }
    }

    /// Plain question metadata for a top-level key.
    pub fn question_metadata(&self, key: &str) -> Option<QuestionMetadata> {
        self.questions.get(key).map(QuestionMetadata::from)
    }

    /// Metadata for a field nested inside a repeating group.
    ///
    /// `sub_path` is the remainder of the field path after the group key and
    /// instance index, e.g. `address.suburb` for `riskItems[2].address.suburb`.
    /// Index segments inside `sub_path` are ignored. A group that declares no
    /// child questions lends its own metadata to every leaf beneath it.
    pub fn repeating_question_metadata(&self, key: &str, sub_path: &str) -> Option<QuestionMetadata> {
        let group = self.questions.get(key)?;
        if group.questions.is_empty() {
            return Some(QuestionMetadata::from(group));
        }

        let mut current = group;
        for segment in sub_path.split('.').filter(|segment| !segment.is_empty()) {
            let name = segment.split('[').next().unwrap_or(segment);
            current = current.questions.get(name)?;
        }
        Some(QuestionMetadata::from(current))
    }

    /// Returns every tag declared anywhere in the configuration.
    pub fn declared_tags(&self) -> IndexSet<String> {
        fn collect(questions: &IndexMap<String, QuestionDefinition>, tags: &mut IndexSet<String>) {
            for question in questions.values() {
                tags.extend(question.tags.iter().cloned());
                collect(&question.questions, tags);
            }
        }
        let mut tags = IndexSet::new();
        collect(&self.questions, &mut tags);
        tags
    }
}

impl Default for ProductConfiguration {
    fn default() -> Self {
        Self::empty()
    }
}

fn empty_form_model() -> Value {
    Value::Object(JsonMap::new())
}

fn default_field_type() -> String {
    "text".to_string()
}

fn default_displayable() -> bool {
    true
}
