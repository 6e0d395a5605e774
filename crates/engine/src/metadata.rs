//! Field metadata lookups and the tag index.
//!
//! Metadata comes from the product configuration and is resolved per field
//! path: a nested path such as `riskItems[2].address.suburb` is cut at the
//! first `.` into the top-level key (`riskItems`, index stripped) and the
//! remainder, which is looked up among the repeating group's child questions.
//!
//! The tag index maps each tag to the set of live field paths carrying it. It
//! is maintained incrementally from "field path added" notifications and from
//! the explicit tag update entry points used by configuration hot reloads.

use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};
use quoteflow_types::QuestionMetadata;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::configuration::ConfigurationProvider;
use crate::field_paths::split_top_level_key;
use crate::messaging::{EngineMessage, HandlerId, MessageBus, MessageChannel};
use crate::reactive::lock_unpoisoned;
use crate::streams::FieldValueStreamRegistry;

/// Integrity violations of the tag index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagIndexError {
    #[error("tag '{tag}' is not indexed; cannot remove it from '{path}'")]
    UnknownTag { tag: String, path: String },

    #[error("field path '{path}' is not associated with tag '{tag}'")]
    MissingAssociation { tag: String, path: String },
}

struct IndexState {
    configuration: Arc<dyn ConfigurationProvider>,
    tags: IndexMap<String, IndexSet<String>>,
}

/// Field metadata resolver and tag → field path index.
#[derive(Clone)]
pub struct FieldMetadataIndex {
    state: Arc<Mutex<IndexState>>,
    registry: FieldValueStreamRegistry,
    bus: MessageBus,
}

impl std::fmt::Debug for FieldMetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("FieldMetadataIndex").field("tags", &state.tags.len()).finish()
    }
}

impl FieldMetadataIndex {
    pub fn new(configuration: Arc<dyn ConfigurationProvider>, registry: FieldValueStreamRegistry, bus: MessageBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(IndexState {
                configuration,
                tags: IndexMap::new(),
            })),
            registry,
            bus,
        }
    }

    /// Subscribes the index to field path notifications on the bus.
    ///
    /// Pruning on "field path removed" is only wired when `prune_on_removal` is set.
    pub fn attach(&self, prune_on_removal: bool) -> Vec<HandlerId> {
        let mut handlers = Vec::new();
        let index = self.clone();
        handlers.push(self.bus.subscribe(MessageChannel::FieldPathAdded, move |message| {
            if let EngineMessage::FieldPathAdded { path } = message {
                index.on_field_path_added(path);
            }
        }));
        if prune_on_removal {
            let index = self.clone();
            handlers.push(self.bus.subscribe(MessageChannel::FieldPathRemoved, move |message| {
                if let EngineMessage::FieldPathRemoved { path } = message {
                    index.on_field_path_removed(path);
                }
            }));
        }
        handlers
    }

    /// Live field paths carrying `tag`; empty when the tag is unknown.
    pub fn field_paths_with_tag(&self, tag: &str) -> IndexSet<String> {
        lock_unpoisoned(&self.state).tags.get(tag).cloned().unwrap_or_default()
    }

    /// Live field paths not carrying `tag`.
    pub fn field_paths_without_tag(&self, tag: &str) -> IndexSet<String> {
        let tagged = self.field_paths_with_tag(tag);
        self.registry
            .all_field_paths()
            .into_iter()
            .filter(|path| !tagged.contains(path))
            .collect()
    }

    /// Configuration metadata for the question behind `path`.
    pub fn metadata_for_field(&self, path: &str) -> Option<QuestionMetadata> {
        let configuration = Arc::clone(&lock_unpoisoned(&self.state).configuration);
        resolve_metadata(configuration.as_ref(), path)
    }

    /// Whether the field is ever shown; fields without metadata are displayable.
    pub fn is_field_displayable(&self, path: &str) -> bool {
        self.metadata_for_field(path).is_none_or(|metadata| metadata.displayable)
    }

    /// Indexes a newly appeared field under each of its tags.
    pub fn on_field_path_added(&self, path: &str) {
        let Some(metadata) = self.metadata_for_field(path) else {
            return;
        };
        if metadata.tags.is_empty() {
            return;
        }
        let mut state = lock_unpoisoned(&self.state);
        for tag in &metadata.tags {
            state.tags.entry(tag.clone()).or_default().insert(path.to_string());
        }
        debug!(path = %path, tags = metadata.tags.len(), "indexed field tags");
    }

    /// Drops `path` from every tag set.
    pub fn on_field_path_removed(&self, path: &str) {
        let mut state = lock_unpoisoned(&self.state);
        for paths in state.tags.values_mut() {
            paths.shift_remove(path);
        }
        state.tags.retain(|_, paths| !paths.is_empty());
        debug!(path = %path, "pruned field from tag index");
    }

    /// Associates `tags` with a live field.
    ///
    /// A path that is not live is ignored, as is any tag the field's metadata
    /// does not list.
    pub fn on_tags_added_to_field<I, S>(&self, path: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.registry.contains(path) {
            debug!(path = %path, "ignoring tag addition for a field that is not live");
            return;
        }
        let declared = self.metadata_for_field(path).map(|metadata| metadata.tags).unwrap_or_default();
        let mut state = lock_unpoisoned(&self.state);
        for tag in tags {
            let tag = tag.into();
            if !declared.contains(&tag) {
                warn!(path = %path, tag = %tag, "ignoring tag the field's metadata does not declare");
                continue;
            }
            state.tags.entry(tag).or_default().insert(path.to_string());
        }
    }

    /// Removes the `tags` associations of `path`.
    ///
    /// Every association must exist; otherwise nothing is removed and the
    /// violation is reported.
    pub fn on_tags_removed_from_field<I, S>(&self, path: &str, tags: I) -> Result<(), TagIndexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect::<Vec<String>>();
        let mut state = lock_unpoisoned(&self.state);
        for tag in &tags {
            let violation = match state.tags.get(tag) {
                None => Some(TagIndexError::UnknownTag {
                    tag: tag.clone(),
                    path: path.to_string(),
                }),
                Some(paths) if !paths.contains(path) => Some(TagIndexError::MissingAssociation {
                    tag: tag.clone(),
                    path: path.to_string(),
                }),
                Some(_) => None,
            };
            if let Some(violation) = violation {
                error!(path = %path, tag = %tag, error = %violation, "tag index integrity violation");
                return Err(violation);
            }
        }

        for tag in &tags {
            if let Some(paths) = state.tags.get_mut(tag) {
                paths.shift_remove(path);
                if paths.is_empty() {
                    state.tags.shift_remove(tag);
                }
            }
        }
        Ok(())
    }

    /// Swaps in a reloaded configuration and re-tags every live field.
    pub fn replace_configuration(&self, configuration: Arc<dyn ConfigurationProvider>) -> Result<(), TagIndexError> {
        let previous = Arc::clone(&lock_unpoisoned(&self.state).configuration);
        let live_paths = self.registry.all_field_paths();

        let mut changes = Vec::new();
        for path in &live_paths {
            let old_tags = resolve_metadata(previous.as_ref(), path).map(|metadata| metadata.tags).unwrap_or_default();
            let new_tags = resolve_metadata(configuration.as_ref(), path)
                .map(|metadata| metadata.tags)
                .unwrap_or_default();
            if old_tags != new_tags {
                changes.push((path.clone(), old_tags, new_tags));
            }
        }

        lock_unpoisoned(&self.state).configuration = Arc::clone(&configuration);

        for (path, old_tags, new_tags) in &changes {
            let indexed = old_tags
                .difference(new_tags)
                .filter(|tag| self.field_paths_with_tag(tag).contains(path))
                .cloned()
                .collect::<Vec<_>>();
            self.on_tags_removed_from_field(path, indexed)?;
            self.on_tags_added_to_field(path, new_tags.difference(old_tags).cloned());
        }

        info!(changed_fields = changes.len(), "configuration updated");
        self.bus.publish(EngineMessage::ConfigurationUpdated {
            product: configuration.product_name(),
        });
        Ok(())
    }

    /// The configuration currently used for lookups.
    pub fn configuration(&self) -> Arc<dyn ConfigurationProvider> {
        Arc::clone(&lock_unpoisoned(&self.state).configuration)
    }
}

fn resolve_metadata(configuration: &dyn ConfigurationProvider, path: &str) -> Option<QuestionMetadata> {
    match split_top_level_key(path) {
        (key, Some(sub_path)) => configuration.repeating_question_metadata(key, sub_path),
        (key, None) => configuration.question_metadata(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::parse_product_configuration;
    use serde_json::json;

    const CONFIGURATION: &str = r#"
version: 1
questions:
  x:
    tags: [visibleInSummary]
  y:
    tags: [visibleInSummary, contact]
  secret:
    displayable: false
  riskItems:
    type: repeating
    questions:
      suburb:
        tags: [address]
"#;

    fn index() -> (FieldMetadataIndex, FieldValueStreamRegistry, MessageBus) {
        let configuration = parse_product_configuration(CONFIGURATION).expect("configuration");
        let registry = FieldValueStreamRegistry::new();
        let bus = MessageBus::default();
        let index = FieldMetadataIndex::new(Arc::new(configuration), registry.clone(), bus.clone());
        (index, registry, bus)
    }

    fn go_live(index: &FieldMetadataIndex, registry: &FieldValueStreamRegistry, path: &str) {
        registry.publish_field_value(path, json!(null));
        index.on_field_path_added(path);
    }

    #[test]
    fn nested_paths_resolve_through_repeating_groups() {
        let (index, _, _) = index();
        let metadata = index.metadata_for_field("riskItems[3].suburb").expect("metadata");
        assert!(metadata.tags.contains("address"));
        assert_eq!(index.metadata_for_field("riskItems[0]").unwrap().field_type, "repeating");
        assert!(!index.is_field_displayable("secret"));
        assert!(index.is_field_displayable("unknownField"));
    }

    #[test]
    fn added_paths_are_indexed_by_tag() {
        let (index, registry, _) = index();
        for path in ["x", "y", "secret", "riskItems[0].suburb"] {
            go_live(&index, &registry, path);
        }
        assert_eq!(index.field_paths_with_tag("visibleInSummary"), IndexSet::from(["x".to_string(), "y".to_string()]));
        assert_eq!(index.field_paths_with_tag("address"), IndexSet::from(["riskItems[0].suburb".to_string()]));
        assert!(index.field_paths_with_tag("nope").is_empty());

        let without = index.field_paths_without_tag("visibleInSummary");
        assert_eq!(without, IndexSet::from(["secret".to_string(), "riskItems[0].suburb".to_string()]));
    }

    #[test]
    fn removing_missing_associations_fails_loudly() {
        let (index, registry, _) = index();
        go_live(&index, &registry, "x");
        go_live(&index, &registry, "y");

        assert!(index.on_tags_removed_from_field("x", ["visibleInSummary"]).is_ok());
        assert_eq!(index.field_paths_with_tag("visibleInSummary"), IndexSet::from(["y".to_string()]));
        assert_eq!(
            index.on_tags_removed_from_field("x", ["visibleInSummary"]),
            Err(TagIndexError::MissingAssociation {
                tag: "visibleInSummary".into(),
                path: "x".into()
            })
        );
        assert!(matches!(
            index.on_tags_removed_from_field("y", ["never"]),
            Err(TagIndexError::UnknownTag { .. })
        ));
    }

    #[test]
    fn tags_for_fields_that_are_not_live_are_ignored() {
        let (index, _, _) = index();
        index.on_tags_added_to_field("ghost", ["contact"]);
        assert!(index.field_paths_with_tag("contact").is_empty());
    }

    #[test]
    fn undeclared_tags_are_not_indexed() {
        let (index, registry, _) = index();
        go_live(&index, &registry, "x");
        index.on_tags_removed_from_field("x", ["visibleInSummary"]).expect("indexed");

        index.on_tags_added_to_field("x", ["bogus", "visibleInSummary"]);
        assert!(index.field_paths_with_tag("bogus").is_empty());
        assert_eq!(index.field_paths_with_tag("visibleInSummary"), IndexSet::from(["x".to_string()]));
    }

    #[test]
    fn removal_pruning_is_opt_in() {
        let (index, registry, bus) = index();
        index.attach(false);
        registry.publish_field_value("x", json!(1));
        bus.publish(EngineMessage::FieldPathAdded { path: "x".into() });
        bus.publish(EngineMessage::FieldPathRemoved { path: "x".into() });
        assert!(index.field_paths_with_tag("visibleInSummary").contains("x"));

        let (pruning, registry, bus) = self::index();
        pruning.attach(true);
        registry.publish_field_value("x", json!(1));
        bus.publish(EngineMessage::FieldPathAdded { path: "x".into() });
        bus.publish(EngineMessage::FieldPathRemoved { path: "x".into() });
        assert!(pruning.field_paths_with_tag("visibleInSummary").is_empty());
    }

    #[test]
    fn replacing_configuration_moves_tags() {
        let (index, registry, bus) = index();
        let updates = bus.listen();
        go_live(&index, &registry, "x");
        go_live(&index, &registry, "y");

        let reloaded = parse_product_configuration(
            r#"
version: 1
product: reloaded
questions:
  x:
    tags: [contact]
  y:
    tags: [visibleInSummary, contact]
"#,
        )
        .expect("reloaded configuration");
        index.replace_configuration(Arc::new(reloaded)).expect("replace");

        assert_eq!(index.field_paths_with_tag("visibleInSummary"), IndexSet::from(["y".to_string()]));
        assert!(index.field_paths_with_tag("contact").contains("x"));
        assert_eq!(updates.len(), 1);
    }
}
