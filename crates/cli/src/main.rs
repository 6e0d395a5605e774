use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use quoteflow_engine::{
    EngineContext, EngineError, EngineSettings, EvaluationOutcome, ExpressionDefinition, HttpTransport, ModelKind,
    OperationInstruction, load_product_configuration, load_settings,
};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "quoteflow")]
#[command(version, about = "Inspect product configurations and drive the Quoteflow form engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every live field with its value, tags and displayability
    Inspect {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Print the fields carrying a tag and the fields that do not
    Tags {
        #[command(flatten)]
        session: SessionArgs,

        /// Tag to look up
        #[arg(long)]
        tag: String,
    },

    /// Evaluate an expression against the form data
    Eval {
        #[command(flatten)]
        session: SessionArgs,

        /// Expression text
        #[arg(long)]
        expression: String,

        /// Field path the expression reads (repeatable)
        #[arg(long = "dependency")]
        dependencies: Vec<String>,
    },

    /// Dispatch operations through the scheduler and print their final statuses
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Backend base URL; operations are echoed locally when omitted
        #[arg(long)]
        base_url: Option<String>,

        /// JSON arguments for every operation; defaults to the strict form model
        #[arg(long)]
        arguments: Option<String>,

        /// Operations to run, as `name` or `name:background`
        #[arg(required = true)]
        operations: Vec<String>,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Product configuration (YAML or JSON)
    #[arg(long)]
    config: PathBuf,

    /// Form data to apply after the initial form model (YAML or JSON)
    #[arg(long)]
    form: Option<PathBuf>,

    /// Engine settings file; defaults to the user configuration directory
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { session } => {
            let context = open_session(&session, None)?;
            print_json(&inspect(&context)?)
        }
        Commands::Tags { session, tag } => {
            let context = open_session(&session, None)?;
            let metadata = context.metadata();
            print_json(&json!({
                "tag": tag,
                "with": metadata.field_paths_with_tag(&tag),
                "without": metadata.field_paths_without_tag(&tag),
            }))
        }
        Commands::Eval {
            session,
            expression,
            dependencies,
        } => {
            let context = open_session(&session, None)?;
            let evaluator = context
                .create_evaluator(ExpressionDefinition::new(expression, dependencies))
                .map_err(EngineError::from)?;
            match evaluator.latest_outcome() {
                EvaluationOutcome::Value(value) => print_json(&value),
                EvaluationOutcome::Failed(error) => {
                    context.handle_error(&EngineError::from(error.clone()));
                    Err(error).context("expression evaluation failed")
                }
                EvaluationOutcome::Pending => bail!("expression was not evaluated"),
            }
        }
        Commands::Run {
            session,
            base_url,
            arguments,
            operations,
        } => {
            let context = open_session(&session, base_url.as_deref())?;
            run_operations(&context, arguments.as_deref(), &operations).await
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_session(session: &SessionArgs, base_url: Option<&str>) -> Result<EngineContext> {
    let configuration = load_product_configuration(&session.config)
        .with_context(|| format!("failed to load product configuration {}", session.config.display()))?;
    let settings = match &session.settings {
        Some(path) => quoteflow_engine::configuration::load_settings_from_path(path)?,
        None => settings_or_default(load_settings()),
    };

    let mut builder = EngineContext::builder(configuration).settings(settings);
    if let Some(base_url) = base_url {
        let transport = HttpTransport::new(base_url).with_context(|| format!("invalid base url '{base_url}'"))?;
        builder = builder.transport(Arc::new(transport));
    }
    let context = builder.build();

    if let Some(form) = &session.form {
        context.store().apply(&read_document(form)?);
    }
    Ok(context)
}

fn settings_or_default(loaded: Result<EngineSettings>) -> EngineSettings {
    loaded.unwrap_or_else(|error| {
        warn!(error = %format!("{error:#}"), "ignoring unreadable engine settings; using defaults");
        EngineSettings::default()
    })
}

fn read_document(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str::<Value>(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn inspect(context: &EngineContext) -> Result<Value> {
    let mut fields = Vec::new();
    for path in context.store().field_paths() {
        let metadata = context.metadata().metadata_for_field(&path);
        fields.push(json!({
            "path": path,
            "value": context.store().value_at(&path, ModelKind::Working)?,
            "type": metadata.as_ref().map(|metadata| metadata.field_type.clone()),
            "tags": metadata.map(|metadata| metadata.tags).unwrap_or_default(),
            "displayable": context.metadata().is_field_displayable(&path),
            "hidden": context.store().is_hidden(&path),
        }));
    }
    Ok(json!({
        "product": context.configuration().product,
        "fields": fields,
    }))
}

/// Splits `name` or `name:background` into the operation name and an explicit background flag.
fn parse_operation(spec: &str) -> Result<(&str, Option<bool>)> {
    let (name, background) = match spec.split_once(':') {
        Some((name, "background")) => (name, Some(true)),
        Some((name, "blocking")) => (name, Some(false)),
        Some((_, mode)) => bail!("unknown execution mode '{mode}' in '{spec}'; use background or blocking"),
        None => (spec, None),
    };
    if name.trim().is_empty() {
        bail!("operation name cannot be empty in '{spec}'");
    }
    Ok((name, background))
}

async fn run_operations(context: &EngineContext, arguments: Option<&str>, operations: &[String]) -> Result<()> {
    let arguments = match arguments {
        Some(text) => serde_json::from_str::<Value>(text).context("--arguments must be valid JSON")?,
        None => context.store().strict(),
    };

    let mut instructions = Vec::with_capacity(operations.len());
    for spec in operations {
        let (name, background) = parse_operation(spec)?;
        let instruction = match background {
            Some(background) => OperationInstruction::with_background(name, arguments.clone(), background),
            None => context.instruction(name, arguments.clone()),
        };
        instructions.push(instruction);
    }

    let workflow_status = context.workflow_status();
    workflow_status.add_action_in_progress("run");
    info!(operations = instructions.len(), "dispatching operations");
    context.scheduler().execute_instructions(instructions.clone());
    context.scheduler().wait_until_idle().await;
    workflow_status.remove_action_in_progress("run");

    let mut failed = 0usize;
    let mut report = Vec::with_capacity(instructions.len());
    for instruction in &instructions {
        let (result, error) = match instruction.result() {
            Some(Ok(value)) => (value, None),
            Some(Err(error)) => {
                failed += 1;
                context.handle_error(&EngineError::operation(instruction.name(), error.clone()));
                (Value::Null, Some(error.to_string()))
            }
            None => (Value::Null, None),
        };
        report.push(json!({
            "id": instruction.id(),
            "name": instruction.name(),
            "background": instruction.is_background(),
            "status": instruction.status().to_string(),
            "result": result,
            "error": error,
        }));
    }
    print_json(&Value::Array(report))?;

    if failed > 0 {
        bail!("{failed} of {} operations did not complete", instructions.len());
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
