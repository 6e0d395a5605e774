//! Structural validation for downloaded product configuration.
//!
//! Validation runs once per load attempt; a failure rejects the whole
//! configuration rather than letting a partially valid product reach the
//! engine.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ConfigurationError, ProductConfiguration, QuestionDefinition, SUPPORTED_CONFIGURATION_VERSION};
use indexmap::IndexMap;

static QUESTION_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid question key pattern"));

/// Validate a product configuration before it is handed to the engine.
pub fn validate_product_configuration(configuration: &ProductConfiguration) -> Result<(), ConfigurationError> {
    if configuration.version != SUPPORTED_CONFIGURATION_VERSION {
        return Err(ConfigurationError::UnsupportedVersion {
            found: configuration.version,
            supported: SUPPORTED_CONFIGURATION_VERSION,
        });
    }

    validate_questions(&configuration.questions)?;

    if !configuration.initial_form_model.is_object() {
        return Err(ConfigurationError::InvalidFormModel {
            reason: "initialFormModel must be an object".to_string(),
        });
    }
    if let Some(overwrite) = &configuration.overwrite_form_data
        && !overwrite.is_object()
    {
        return Err(ConfigurationError::InvalidFormModel {
            reason: "overwriteFormData must be an object when present".to_string(),
        });
    }

    for (name, operation) in &configuration.operations {
        if name.trim().is_empty() {
            return Err(ConfigurationError::invalid_operation(name, "operation name cannot be empty"));
        }
        if !operation.path.starts_with('/') {
            return Err(ConfigurationError::invalid_operation(name, "path must start with '/'"));
        }
    }

    Ok(())
}

fn validate_questions(questions: &IndexMap<String, QuestionDefinition>) -> Result<(), ConfigurationError> {
    for (key, question) in questions {
        if !QUESTION_KEY_PATTERN.is_match(key) {
            return Err(ConfigurationError::invalid_question_key(
                key,
                "keys must start with a letter or underscore and contain only letters, digits, '_' or '-'",
            ));
        }
        if question.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(ConfigurationError::invalid_question_key(key, "tags cannot be empty"));
        }
        validate_questions(&question.questions)?;
    }
    Ok(())
}
