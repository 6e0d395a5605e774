//! Configuration collaborators.
//!
//! Two layers are handled here:
//!
//! - the downloaded product configuration, reached through the
//!   [`ConfigurationProvider`] trait so the engine never depends on how a
//!   product was fetched, and loaded from disk with
//!   [`load_product_configuration`];
//! - engine settings ([`EngineSettings`]), a small JSON file under the user's
//!   configuration directory that tunes scheduler and index behavior.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dirs_next::{config_dir, home_dir};
use quoteflow_types::{ConfigurationError, ProductConfiguration, QuestionMetadata, validate_product_configuration};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::messaging::DEFAULT_MESSAGE_CAPACITY;

/// Environment variable overriding the engine settings file location.
pub const SETTINGS_PATH_ENV: &str = "QUOTEFLOW_SETTINGS_PATH";

/// File name of the engine settings inside the configuration directory.
pub const SETTINGS_FILE_NAME: &str = "engine.json";

/// Operation name treated as the calculation operation unless configured otherwise.
pub const DEFAULT_CALCULATION_OPERATION: &str = "calculate";

/// Read-only view of the product configuration the engine consumes.
pub trait ConfigurationProvider: Send + Sync {
    /// Metadata for a top-level question key.
    fn question_metadata(&self, key: &str) -> Option<QuestionMetadata>;

    /// Metadata for a leaf nested inside the repeating group `key`.
    fn repeating_question_metadata(&self, key: &str, sub_path: &str) -> Option<QuestionMetadata>;

    /// Form model seeded when a quote starts.
    fn initial_form_model(&self) -> Value;

    /// Data merged last on every apply, if any.
    fn overwrite_form_data(&self) -> Option<Value>;

    /// Product identifier for logs and notifications.
    fn product_name(&self) -> Option<String> {
        None
    }
}

impl ConfigurationProvider for ProductConfiguration {
    fn question_metadata(&self, key: &str) -> Option<QuestionMetadata> {
        ProductConfiguration::question_metadata(self, key)
    }

    fn repeating_question_metadata(&self, key: &str, sub_path: &str) -> Option<QuestionMetadata> {
        ProductConfiguration::repeating_question_metadata(self, key, sub_path)
    }

    fn initial_form_model(&self) -> Value {
        self.initial_form_model.clone()
    }

    fn overwrite_form_data(&self) -> Option<Value> {
        self.overwrite_form_data.clone()
    }

    fn product_name(&self) -> Option<String> {
        self.product.clone()
    }
}

/// Parses a product configuration from YAML or JSON text and validates it.
///
/// JSON is a subset of YAML, so a single YAML parse accepts both.
pub fn parse_product_configuration(content: &str) -> Result<ProductConfiguration, ConfigurationError> {
    let configuration: ProductConfiguration =
        serde_yaml::from_str(content).map_err(|error| ConfigurationError::parse(error.to_string()))?;
    validate_product_configuration(&configuration)?;
    Ok(configuration)
}

/// Reads, parses and validates the product configuration stored at `path`.
pub fn load_product_configuration(path: &Path) -> Result<ProductConfiguration, ConfigurationError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let configuration = parse_product_configuration(&content)?;
    info!(
        path = %path.display(),
        product = configuration.product.as_deref().unwrap_or("unnamed"),
        questions = configuration.questions.len(),
        "loaded product configuration"
    );
    Ok(configuration)
}

/// Tunables for a single engine session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    /// Operation whose in-flight state `is_operation_in_progress` maps to priority work.
    pub calculation_operation: String,
    /// Operations that trigger a context reload after completing successfully.
    pub reload_after: Vec<String>,
    /// Wires tag-index pruning to "field path removed" notifications.
    pub prune_tags_on_field_removal: bool,
    /// Capacity of the async message feed.
    pub message_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            calculation_operation: DEFAULT_CALCULATION_OPERATION.to_string(),
            reload_after: Vec::new(),
            prune_tags_on_field_removal: false,
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
        }
    }
}

/// Returns the engine settings path, honoring [`SETTINGS_PATH_ENV`].
pub fn default_settings_path() -> PathBuf {
    if let Ok(path) = env::var(SETTINGS_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(path.trim());
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quoteflow")
        .join(SETTINGS_FILE_NAME)
}

/// Loads engine settings from the default path, falling back to defaults when absent.
pub fn load_settings() -> anyhow::Result<EngineSettings> {
    load_settings_from_path(&default_settings_path())
}

/// Loads engine settings from `path`, falling back to defaults when the file does not exist.
pub fn load_settings_from_path(path: &Path) -> anyhow::Result<EngineSettings> {
    if !path.exists() {
        debug!(path = %path.display(), "no engine settings file; using defaults");
        return Ok(EngineSettings::default());
    }

    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read engine settings {}", path.display()))?;
    let settings: EngineSettings =
        serde_json::from_str(&content).with_context(|| format!("failed to parse engine settings {}", path.display()))?;
    Ok(settings)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
version: 1
product: motor
questions:
  drivers:
    type: repeating
    tags: [driver]
initialFormModel:
  drivers: []
overwriteFormData:
  channel: web
"#;

    #[test]
    fn provider_exposes_form_models() {
        let configuration = parse_product_configuration(SAMPLE).expect("valid configuration");
        let provider: &dyn ConfigurationProvider = &configuration;
        assert_eq!(provider.initial_form_model(), serde_json::json!({ "drivers": [] }));
        assert_eq!(provider.overwrite_form_data(), Some(serde_json::json!({ "channel": "web" })));
        assert_eq!(provider.product_name().as_deref(), Some("motor"));
        assert!(provider.repeating_question_metadata("drivers", "name").is_some());
    }

    #[test]
    fn json_configurations_are_accepted() {
        let configuration = parse_product_configuration(r#"{"version": 1, "questions": {"age": {"type": "number"}}}"#)
            .expect("json configuration");
        assert_eq!(configuration.question_metadata("age").unwrap().field_type, "number");
    }

    #[test]
    fn unsupported_versions_fail_the_load() {
        let error = parse_product_configuration("version: 3").unwrap_err();
        assert!(matches!(error, ConfigurationError::UnsupportedVersion { found: 3, .. }));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write sample");
        let configuration = load_product_configuration(file.path()).expect("load");
        assert_eq!(configuration.product.as_deref(), Some("motor"));

        let missing = load_product_configuration(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigurationError::Io { .. }));
    }

    #[test]
    fn settings_path_honors_environment_override() {
        temp_env::with_var(SETTINGS_PATH_ENV, Some("/tmp/quoteflow/custom.json"), || {
            assert_eq!(default_settings_path(), PathBuf::from("/tmp/quoteflow/custom.json"));
        });
        temp_env::with_var(SETTINGS_PATH_ENV, None::<&str>, || {
            assert!(default_settings_path().ends_with("quoteflow/engine.json"));
        });
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("temp dir");
        let settings = load_settings_from_path(&directory.path().join("engine.json")).expect("defaults");
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.calculation_operation, "calculate");
    }

    #[test]
    fn partial_settings_keep_defaults_for_missing_keys() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("engine.json");
        fs::write(&path, r#"{"reloadAfter": ["bind"], "pruneTagsOnFieldRemoval": true}"#).expect("write settings");

        let settings = load_settings_from_path(&path).expect("settings");
        assert_eq!(settings.reload_after, vec!["bind".to_string()]);
        assert!(settings.prune_tags_on_field_removal);
        assert_eq!(settings.message_capacity, DEFAULT_MESSAGE_CAPACITY);
    }
}
