//! Per-session engine context.
//!
//! Every component of a form session is constructed here, once, and handed
//! out by reference. Nothing in the engine reaches for a global; two contexts
//! in the same process never share state.

use std::sync::Arc;

use quoteflow_types::ProductConfiguration;
use tracing::info;

use crate::configuration::{ConfigurationProvider, EngineSettings};
use crate::errors::{EngineError, ErrorHandler, ErrorReport};
use crate::expression::{Capabilities, ExpressionDefinition, ExpressionError, ExpressionEvaluator, ExpressionRuntime};
use crate::messaging::{EngineMessage, HandlerId, MessageBus};
use crate::metadata::FieldMetadataIndex;
use crate::operations::{
    ContextReloader, EchoOperationFactory, OperationFactory, OperationInstruction, OperationScheduler,
    OperationStatusRegistry, SchedulerSettings, Transport, TransportOperationFactory,
};
use crate::store::FormDataStore;
use crate::streams::FieldValueStreamRegistry;
use crate::workflow_status::WorkflowStatusCoordinator;

enum FactorySource {
    Echo,
    Factory(Arc<dyn OperationFactory>),
    Transport(Arc<dyn Transport>),
}

/// Collects the collaborators for an [`EngineContext`].
pub struct EngineContextBuilder {
    configuration: Arc<ProductConfiguration>,
    factory: FactorySource,
    reloader: Option<Arc<dyn ContextReloader>>,
    settings: EngineSettings,
}

impl EngineContextBuilder {
    /// Uses `factory` to resolve operation names.
    pub fn operation_factory(mut self, factory: Arc<dyn OperationFactory>) -> Self {
        self.factory = FactorySource::Factory(factory);
        self
    }

    /// Resolves operations from the configuration's `operations` table through `transport`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.factory = FactorySource::Transport(transport);
        self
    }

    pub fn context_reloader(mut self, reloader: Arc<dyn ContextReloader>) -> Self {
        self.reloader = Some(reloader);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wires every component and seeds the store from the configuration.
    pub fn build(self) -> EngineContext {
        let Self {
            configuration,
            factory,
            reloader,
            settings,
        } = self;

        let bus = MessageBus::new(settings.message_capacity);
        let registry = FieldValueStreamRegistry::new();
        let store = FormDataStore::new(registry.clone(), bus.clone());
        let provider: Arc<dyn ConfigurationProvider> = configuration.clone();
        let metadata = FieldMetadataIndex::new(Arc::clone(&provider), registry.clone(), bus.clone());
        let metadata_handlers = metadata.attach(settings.prune_tags_on_field_removal);

        let status = OperationStatusRegistry::new(settings.calculation_operation.clone());
        let factory: Arc<dyn OperationFactory> = match factory {
            FactorySource::Echo => Arc::new(EchoOperationFactory),
            FactorySource::Factory(factory) => factory,
            FactorySource::Transport(transport) => {
                Arc::new(TransportOperationFactory::from_configuration(&configuration, transport))
            }
        };
        let scheduler = OperationScheduler::new(
            factory,
            status.clone(),
            bus.clone(),
            reloader,
            SchedulerSettings {
                reload_after: settings.reload_after.clone(),
            },
        );

        let workflow_status = WorkflowStatusCoordinator::new();
        let error_handler = ErrorHandler::new(workflow_status.clone());
        let expressions = ExpressionRuntime::new(registry.clone());

        store.apply_initial_form_model_from_configuration(provider.as_ref());
        info!(
            product = configuration.product.as_deref().unwrap_or("unnamed"),
            fields = registry.all_field_paths().len(),
            "engine context ready"
        );
        bus.publish(EngineMessage::ConfigurationLoaded {
            product: configuration.product.clone(),
        });

        EngineContext {
            configuration,
            settings,
            bus,
            registry,
            store,
            metadata,
            metadata_handlers,
            status,
            scheduler,
            workflow_status,
            error_handler,
            expressions,
        }
    }
}

/// One form session.
pub struct EngineContext {
    configuration: Arc<ProductConfiguration>,
    settings: EngineSettings,
    bus: MessageBus,
    registry: FieldValueStreamRegistry,
    store: FormDataStore,
    metadata: FieldMetadataIndex,
    metadata_handlers: Vec<HandlerId>,
    status: OperationStatusRegistry,
    scheduler: OperationScheduler,
    workflow_status: WorkflowStatusCoordinator,
    error_handler: ErrorHandler,
    expressions: ExpressionRuntime,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("product", &self.configuration.product)
            .field("settings", &self.settings)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl EngineContext {
    /// Starts a builder with the echo operation factory and default settings.
    pub fn builder(configuration: ProductConfiguration) -> EngineContextBuilder {
        EngineContextBuilder {
            configuration: Arc::new(configuration),
            factory: FactorySource::Echo,
            reloader: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn configuration(&self) -> &ProductConfiguration {
        &self.configuration
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &FieldValueStreamRegistry {
        &self.registry
    }

    pub fn store(&self) -> &FormDataStore {
        &self.store
    }

    pub fn metadata(&self) -> &FieldMetadataIndex {
        &self.metadata
    }

    pub fn status(&self) -> &OperationStatusRegistry {
        &self.status
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    pub fn workflow_status(&self) -> &WorkflowStatusCoordinator {
        &self.workflow_status
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    pub fn expressions(&self) -> &ExpressionRuntime {
        &self.expressions
    }

    /// Capabilities every expression in this session may call.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::standard().with_operation_status(self.status.clone())
    }

    /// Creates an evaluator with the session capabilities.
    pub fn create_evaluator(&self, definition: ExpressionDefinition) -> Result<ExpressionEvaluator, ExpressionError> {
        self.expressions.create_evaluator(definition, self.capabilities())
    }

    /// Builds an instruction, taking the background flag from the configured operation when present.
    pub fn instruction(&self, name: &str, arguments: serde_json::Value) -> OperationInstruction {
        let background = self
            .configuration
            .operations
            .get(name)
            .is_some_and(|definition| definition.background);
        OperationInstruction::with_background(name, arguments, background)
    }

    pub fn dispatch(&self, instruction: OperationInstruction) {
        self.scheduler.dispatch(instruction);
    }

    /// Swaps in a reloaded product configuration.
    ///
    /// Tags of live fields are re-indexed and the new overwrite data applies to
    /// later merges. Operation definitions keep the factory chosen at build time.
    pub fn replace_configuration(&mut self, configuration: ProductConfiguration) -> Result<(), EngineError> {
        let configuration = Arc::new(configuration);
        let provider: Arc<dyn ConfigurationProvider> = configuration.clone();
        self.store.set_overwrite_form_data(provider.overwrite_form_data());
        self.metadata.replace_configuration(provider)?;
        self.configuration = configuration;
        Ok(())
    }

    pub fn handle_error(&self, error: &EngineError) -> ErrorReport {
        self.error_handler.handle(error)
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        for handler in self.metadata_handlers.drain(..) {
            self.bus.unsubscribe(handler);
        }
    }
}
