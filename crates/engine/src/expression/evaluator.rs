//! Live expression evaluators.
//!
//! An evaluator owns one compiled expression, watches its dependency field
//! streams and republishes an [`EvaluationOutcome`] every time any of them
//! changes. Watching goes through weak references, so a dependency stream never
//! keeps an evaluator alive; dropping or disposing the evaluator detaches it.
//!
//! Dependency streams that are torn down (a field leaving the tree, a quote
//! reset) stop notifying; evaluators are expected to be recreated with the
//! fields that own them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};
use tracing::{debug, warn};

use super::capabilities::Capabilities;
use super::interpreter::{Scope, evaluate};
use super::parser::{Expr, parse};
use super::{ExpressionError, ExpressionErrorKind};
use crate::field_paths::{PathSegment, parse_field_path, set_value_at};
use crate::reactive::{ObserverGuard, ReplaySubject, Subscription, lock_unpoisoned};
use crate::streams::FieldValueStreamRegistry;

/// Expression text plus the field paths it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionDefinition {
    pub source: String,
    pub dependencies: Vec<String>,
}

impl ExpressionDefinition {
    pub fn new<I, S>(source: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of the most recent evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// Not evaluated yet.
    Pending,
    Value(Value),
    /// The latest evaluation failed; the result is invalid until a later one succeeds.
    Failed(ExpressionError),
}

impl EvaluationOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Factory for evaluators bound to one stream registry.
#[derive(Debug, Clone)]
pub struct ExpressionRuntime {
    registry: FieldValueStreamRegistry,
}

impl ExpressionRuntime {
    pub fn new(registry: FieldValueStreamRegistry) -> Self {
        Self { registry }
    }

    /// Compiles `definition` and starts watching its dependencies.
    ///
    /// The evaluator runs once immediately so its result stream holds a
    /// current outcome.
    pub fn create_evaluator(
        &self,
        definition: ExpressionDefinition,
        capabilities: Capabilities,
    ) -> Result<ExpressionEvaluator, ExpressionError> {
        let ExpressionDefinition { source, dependencies } = definition;
        let program = parse(&source).map_err(|error| ExpressionError::new(source.as_str(), IndexMap::new(), error))?;
        let dependencies = dependencies
            .into_iter()
            .map(|path| parse_field_path(&path).map(|segments| (path, segments)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| ExpressionError::new(source.as_str(), IndexMap::new(), error))?;

        let shared = Arc::new(EvaluatorShared {
            source,
            dependencies,
            program: Mutex::new(Some(Arc::new(program))),
            capabilities,
            registry: self.registry.clone(),
            results: ReplaySubject::new(EvaluationOutcome::Pending),
            last_valid: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let watchers = shared
            .dependencies
            .iter()
            .map(|(path, _)| {
                let weak: Weak<EvaluatorShared> = Arc::downgrade(&shared);
                self.registry.field_value_stream(path, None).observe_changes(move |_| {
                    if let Some(shared) = weak.upgrade() {
                        shared.refresh();
                    }
                })
            })
            .collect::<Vec<_>>();
        *lock_unpoisoned(&shared.watchers) = watchers;

        debug!(source = %shared.source, dependencies = shared.dependencies.len(), "created expression evaluator");
        shared.refresh();
        Ok(ExpressionEvaluator { shared })
    }
}

struct EvaluatorShared {
    source: String,
    dependencies: Vec<(String, Vec<PathSegment>)>,
    program: Mutex<Option<Arc<Expr>>>,
    capabilities: Capabilities,
    registry: FieldValueStreamRegistry,
    results: ReplaySubject<EvaluationOutcome>,
    last_valid: Mutex<Option<Value>>,
    watchers: Mutex<Vec<ObserverGuard>>,
    disposed: AtomicBool,
}

impl EvaluatorShared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> (Value, IndexMap<String, Value>) {
        let mut tree = Value::Object(JsonMap::new());
        let mut arguments = IndexMap::new();
        for (path, segments) in &self.dependencies {
            let value = self.registry.latest_value(path).unwrap_or(Value::Null);
            set_value_at(&mut tree, segments, value.clone());
            arguments.insert(path.clone(), value);
        }
        (tree, arguments)
    }

    fn evaluate(&self) -> Result<Value, ExpressionError> {
        let program = lock_unpoisoned(&self.program).clone();
        let Some(program) = program.filter(|_| !self.is_disposed()) else {
            return Err(ExpressionError::new(
                self.source.as_str(),
                IndexMap::new(),
                ExpressionErrorKind::Disposed,
            ));
        };
        let (snapshot, arguments) = self.snapshot();
        let scope = Scope::new(&snapshot, &self.capabilities);
        evaluate(&program, &scope).map_err(|error| ExpressionError::new(self.source.as_str(), arguments, error))
    }

    fn refresh(&self) {
        if self.is_disposed() {
            return;
        }
        let outcome = match self.evaluate() {
            Ok(value) => {
                *lock_unpoisoned(&self.last_valid) = Some(value.clone());
                EvaluationOutcome::Value(value)
            }
            Err(error) => {
                warn!(source = %self.source, error = %error.kind, "expression evaluation failed");
                EvaluationOutcome::Failed(error)
            }
        };
        self.results.publish(outcome);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *lock_unpoisoned(&self.watchers));
        drop(watchers);
        lock_unpoisoned(&self.program).take();
        self.results.complete();
        debug!(source = %self.source, "disposed expression evaluator");
    }
}

/// A compiled expression watching its dependencies.
///
/// Dropping the evaluator disposes it.
pub struct ExpressionEvaluator {
    shared: Arc<EvaluatorShared>,
}

impl std::fmt::Debug for ExpressionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEvaluator")
            .field("source", &self.shared.source)
            .field("disposed", &self.shared.is_disposed())
            .finish()
    }
}

impl ExpressionEvaluator {
    /// Expression text this evaluator was compiled from.
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Dependency paths in declaration order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.shared.dependencies.iter().map(|(path, _)| path.as_str())
    }

    /// Evaluates against the current dependency values without publishing.
    pub fn evaluate(&self) -> Result<Value, ExpressionError> {
        self.shared.evaluate()
    }

    /// Subscribes to outcomes, starting with the latest one.
    pub fn results(&self) -> Subscription<EvaluationOutcome> {
        self.shared.results.subscribe()
    }

    /// Observes outcomes synchronously, starting with the latest one.
    pub fn observe<F>(&self, observer: F) -> ObserverGuard
    where
        F: Fn(&EvaluationOutcome) + Send + Sync + 'static,
    {
        self.shared.results.observe(observer)
    }

    pub fn latest_outcome(&self) -> EvaluationOutcome {
        self.shared.results.latest()
    }

    /// The most recent successful result, which survives later failures.
    pub fn last_valid_value(&self) -> Option<Value> {
        lock_unpoisoned(&self.shared.last_valid).clone()
    }

    /// Detaches from dependencies, drops the compiled expression and ends the result stream.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}

impl Drop for ExpressionEvaluator {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::EvaluationError;
    use serde_json::json;

    fn runtime() -> (ExpressionRuntime, FieldValueStreamRegistry) {
        let registry = FieldValueStreamRegistry::new();
        (ExpressionRuntime::new(registry.clone()), registry)
    }

    #[test]
    fn reevaluates_when_a_dependency_changes() {
        let (runtime, registry) = runtime();
        registry.publish_field_value("price", json!(10));
        let evaluator = runtime
            .create_evaluator(ExpressionDefinition::new("price * qty", ["price", "qty"]), Capabilities::standard())
            .expect("evaluator");
        assert!(matches!(evaluator.latest_outcome(), EvaluationOutcome::Failed(_)));

        registry.publish_field_value("qty", json!(3));
        assert_eq!(evaluator.latest_outcome(), EvaluationOutcome::Value(json!(30)));
    }

    #[test]
    fn failures_carry_source_and_arguments() {
        let (runtime, registry) = runtime();
        registry.publish_field_value("total", json!("abc"));
        let evaluator = runtime
            .create_evaluator(ExpressionDefinition::new("total * 2", ["total"]), Capabilities::standard())
            .expect("evaluator");

        let error = evaluator.evaluate().unwrap_err();
        assert_eq!(error.source_text, "total * 2");
        assert_eq!(error.arguments.get("total"), Some(&json!("abc")));
        assert!(matches!(error.kind, ExpressionErrorKind::Evaluation(EvaluationError::TypeMismatch { .. })));
        assert!(error.to_string().contains("total * 2"));
    }

    #[test]
    fn compile_errors_are_reported_up_front() {
        let (runtime, _) = runtime();
        let error = runtime
            .create_evaluator(ExpressionDefinition::new("total *", ["total"]), Capabilities::standard())
            .unwrap_err();
        assert!(matches!(error.kind, ExpressionErrorKind::Syntax(_)));

        let error = runtime
            .create_evaluator(ExpressionDefinition::new("1", ["bad..path"]), Capabilities::standard())
            .unwrap_err();
        assert!(matches!(error.kind, ExpressionErrorKind::InvalidDependency(_)));
    }

    #[test]
    fn nested_dependencies_are_assembled_into_a_tree() {
        let (runtime, registry) = runtime();
        registry.publish_field_value("drivers[0].age", json!(30));
        registry.publish_field_value("drivers[1].age", json!(40));
        let evaluator = runtime
            .create_evaluator(
                ExpressionDefinition::new("drivers[0].age + drivers[1].age", ["drivers[0].age", "drivers[1].age"]),
                Capabilities::standard(),
            )
            .expect("evaluator");
        assert_eq!(evaluator.evaluate().unwrap(), json!(70));
    }

    #[tokio::test]
    async fn disposal_stops_further_results() {
        let (runtime, registry) = runtime();
        registry.publish_field_value("a", json!(1));
        let evaluator = runtime
            .create_evaluator(ExpressionDefinition::new("a + 1", ["a"]), Capabilities::standard())
            .expect("evaluator");
        let mut results = evaluator.results();
        assert_eq!(results.recv().await, Some(EvaluationOutcome::Value(json!(2))));

        evaluator.dispose();
        registry.publish_field_value("a", json!(5));
        assert_eq!(results.recv().await, None);
        assert!(evaluator.is_disposed());
        assert!(matches!(evaluator.evaluate().unwrap_err().kind, ExpressionErrorKind::Disposed));
        assert_eq!(registry.field_value_stream("a", None).listener_count(), 0);
    }

    #[test]
    fn dropping_an_evaluator_detaches_it() {
        let (runtime, registry) = runtime();
        let evaluator = runtime
            .create_evaluator(ExpressionDefinition::new("a", ["a"]), Capabilities::standard())
            .expect("evaluator");
        let stream = registry.field_value_stream("a", None);
        assert_eq!(stream.listener_count(), 1);
        drop(evaluator);
        assert_eq!(stream.listener_count(), 0);
    }
}
