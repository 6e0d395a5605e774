use indexmap::IndexSet;
use quoteflow_engine::{EngineContext, EngineSettings, TagIndexError, parse_product_configuration};
use quoteflow_types::ProductConfiguration;
use serde_json::json;

fn fixture() -> ProductConfiguration {
    parse_product_configuration(include_str!("data/home_product.yaml")).expect("parse fixture configuration")
}

fn sorted(paths: IndexSet<String>) -> Vec<String> {
    let mut paths = paths.into_iter().collect::<Vec<_>>();
    paths.sort();
    paths
}

fn assert_index_consistent(context: &EngineContext) {
    let metadata = context.metadata();
    for tag in fixture().declared_tags().into_iter().chain(["bogus".to_string()]) {
        for path in metadata.field_paths_with_tag(&tag) {
            let tags = metadata.metadata_for_field(&path).map(|metadata| metadata.tags).unwrap_or_default();
            assert!(tags.contains(&tag), "{path} is indexed under {tag} but its metadata does not carry it");
        }
    }
}

#[test]
fn index_stays_consistent_across_adds_and_removals() {
    let settings = EngineSettings {
        prune_tags_on_field_removal: true,
        ..EngineSettings::default()
    };
    let context = EngineContext::builder(fixture()).settings(settings).build();
    assert_index_consistent(&context);

    context.store().apply(&json!({
        "riskItems": [
            { "description": "TV", "address": { "suburb": "Carlton" } },
            { "description": "Bike", "address": { "suburb": "Fitzroy" } }
        ]
    }));
    assert_index_consistent(&context);
    assert_eq!(
        sorted(context.metadata().field_paths_with_tag("location")),
        vec!["riskItems[0].address.suburb", "riskItems[1].address.suburb"]
    );

    context.store().remove_field("riskItems[1]").expect("valid path");
    assert_index_consistent(&context);
    assert_eq!(
        sorted(context.metadata().field_paths_with_tag("location")),
        vec!["riskItems[0].address.suburb"]
    );

    context.store().remove_field("y").expect("valid path");
    assert_index_consistent(&context);
    assert!(!context.metadata().field_paths_with_tag("rating").contains("y"));

    context.metadata().on_tags_added_to_field("x", ["bogus", "rating"]);
    context.metadata().on_tags_added_to_field("riskItems[0].description", ["location"]);
    assert_index_consistent(&context);
    assert!(context.metadata().field_paths_with_tag("bogus").is_empty());
}

#[test]
fn removed_instances_keep_their_tags_unless_pruning_is_enabled() {
    let context = EngineContext::builder(fixture()).build();
    context.store().apply(&json!({
        "riskItems": [{ "description": "TV" }, { "description": "Bike" }]
    }));
    context.store().remove_field("riskItems[1]").expect("valid path");

    assert!(context.metadata().field_paths_with_tag("visibleInSummary").contains("riskItems[1].description"));
}

#[test]
fn tag_removal_for_a_removed_field_fails_loudly_the_second_time() {
    let context = EngineContext::builder(fixture()).build();
    assert_eq!(sorted(context.metadata().field_paths_with_tag("visibleInSummary")), vec!["x", "y"]);

    context.store().remove_field("x").expect("valid path");
    context
        .metadata()
        .on_tags_removed_from_field("x", ["visibleInSummary"])
        .expect("first removal succeeds");
    assert_eq!(sorted(context.metadata().field_paths_with_tag("visibleInSummary")), vec!["y"]);

    let error = context
        .metadata()
        .on_tags_removed_from_field("x", ["visibleInSummary"])
        .expect_err("second removal must fail");
    assert_eq!(
        error,
        TagIndexError::MissingAssociation {
            tag: "visibleInSummary".into(),
            path: "x".into(),
        }
    );
}

#[test]
fn untagged_and_hidden_questions_are_reported() {
    let context = EngineContext::builder(fixture()).build();

    let without = context.metadata().field_paths_without_tag("visibleInSummary");
    assert!(without.contains("total"));
    assert!(without.contains("policyNumber"));
    assert!(!without.contains("x"));

    assert!(!context.metadata().is_field_displayable("policyNumber"));
    assert!(context.metadata().is_field_displayable("total"));
    assert!(context.metadata().is_field_displayable("notConfigured"));
}

#[test]
fn reloading_the_configuration_retags_live_fields() {
    let mut context = EngineContext::builder(fixture()).build();
    let mut reloaded = fixture();
    if let Some(question) = reloaded.questions.get_mut("total") {
        question.tags = ["visibleInSummary".to_string()].into_iter().collect();
    }
    if let Some(question) = reloaded.questions.get_mut("x") {
        question.tags.clear();
    }

    context.replace_configuration(reloaded).expect("reload succeeds");

    assert_eq!(sorted(context.metadata().field_paths_with_tag("visibleInSummary")), vec!["total", "y"]);
    assert_eq!(sorted(context.metadata().field_paths_with_tag("rating")), vec!["y"]);
}
