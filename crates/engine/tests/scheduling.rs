use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quoteflow_engine::operations::{OperationScheduler, OperationStatusRegistry, SchedulerSettings};
use quoteflow_engine::{
    ContextReloader, DispatchMode, EngineMessage, MessageBus, MessageChannel, OperationError, OperationInstruction,
    StaticOperationFactory,
};
use quoteflow_types::OperationStatus;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

type Outcome = Result<Value, OperationError>;

/// Operations that block until the test releases them by name.
#[derive(Clone, Default)]
struct Gates {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<Outcome>>>>,
}

impl Gates {
    fn factory(&self, names: &[&str]) -> StaticOperationFactory {
        names.iter().fold(StaticOperationFactory::new(), |factory, name| {
            let gates = self.clone();
            factory.register_fn(*name, move |request| {
                let gates = gates.clone();
                async move { gates.wait(request.name).await }
            })
        })
    }

    async fn wait(&self, name: String) -> Outcome {
        let (sender, receiver) = oneshot::channel();
        self.waiting.lock().expect("gates lock").insert(name, sender);
        receiver.await.unwrap_or(Err(OperationError::Aborted))
    }

    async fn release(&self, name: &str, outcome: Outcome) {
        let released = async {
            loop {
                let sender = self.waiting.lock().expect("gates lock").remove(name);
                if let Some(sender) = sender {
                    let _ = sender.send(outcome);
                    return;
                }
                tokio::task::yield_now().await;
            }
        };
        timeout(WAIT_LIMIT, released).await.expect("operation never started");
    }
}

fn scheduler_with(gates: &Gates, names: &[&str]) -> (OperationScheduler, MessageBus) {
    let bus = MessageBus::default();
    let scheduler = OperationScheduler::new(
        Arc::new(gates.factory(names)),
        OperationStatusRegistry::default(),
        bus.clone(),
        None,
        SchedulerSettings::default(),
    );
    (scheduler, bus)
}

async fn wait_for(instruction: &OperationInstruction, expected: OperationStatus) {
    let mut updates = instruction.status_updates();
    let reached = async {
        while let Some(status) = updates.recv().await {
            if status == expected {
                return true;
            }
        }
        false
    };
    let reached = timeout(WAIT_LIMIT, reached).await.expect("timed out waiting for status");
    assert!(reached, "{} finished as {} instead of {expected}", instruction.name(), instruction.status());
}

#[tokio::test]
async fn blocking_work_waits_for_earlier_background_work() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["formUpdate", "bind"]);
    let form_update = OperationInstruction::background("formUpdate", json!({}));
    let bind = OperationInstruction::new("bind", json!({}));

    scheduler.execute_instructions(vec![form_update.clone(), bind.clone()]);
    assert_eq!(form_update.status(), OperationStatus::Started);
    assert_eq!(bind.status(), OperationStatus::NotStarted);

    gates.release("formUpdate", Ok(json!("synced"))).await;
    wait_for(&bind, OperationStatus::Started).await;
    assert_eq!(form_update.status(), OperationStatus::Completed);

    gates.release("bind", Ok(json!("bound"))).await;
    wait_for(&bind, OperationStatus::Completed).await;
    scheduler.wait_until_idle().await;
}

#[tokio::test]
async fn background_work_dispatched_later_never_delays_blocking_work() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["telemetry", "save", "submit"]);
    // Created first, dispatched last.
    let telemetry = OperationInstruction::background("telemetry", Value::Null);
    let save = OperationInstruction::new("save", Value::Null);
    let submit = OperationInstruction::new("submit", Value::Null);

    scheduler.execute_instructions(vec![save.clone(), submit.clone(), telemetry.clone()]);
    assert_eq!(save.status(), OperationStatus::Started);
    assert_eq!(telemetry.status(), OperationStatus::Started);

    gates.release("save", Ok(Value::Null)).await;
    wait_for(&submit, OperationStatus::Started).await;
    assert_eq!(telemetry.status(), OperationStatus::Started);

    gates.release("submit", Ok(Value::Null)).await;
    wait_for(&submit, OperationStatus::Completed).await;
    gates.release("telemetry", Ok(Value::Null)).await;
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");
}

#[tokio::test]
async fn background_work_starts_beside_a_running_blocking_instruction() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["bind", "calculate"]);
    let bind = OperationInstruction::new("bind", Value::Null);
    let calculate = OperationInstruction::background("calculate", Value::Null);

    scheduler.dispatch(bind.clone());
    assert_eq!(bind.status(), OperationStatus::Started);
    scheduler.dispatch(calculate.clone());

    assert_eq!(calculate.status(), OperationStatus::Started);
    assert_eq!(bind.status(), OperationStatus::Started);
    assert!(scheduler.status_registry().is_operation_in_progress(Some("calculate")));
    assert!(scheduler.status_registry().is_operation_in_progress(Some("bind")));

    gates.release("calculate", Ok(Value::Null)).await;
    wait_for(&calculate, OperationStatus::Completed).await;
    assert_eq!(bind.status(), OperationStatus::Started);

    gates.release("bind", Ok(Value::Null)).await;
    scheduler.wait_until_idle().await;
    assert!(!scheduler.status_registry().is_operation_in_progress(None));
}

#[tokio::test]
async fn at_most_one_blocking_instruction_is_started() {
    let gates = Gates::default();
    let names = ["save", "calculate", "bind", "formUpdate", "submit"];
    let (scheduler, bus) = scheduler_with(&gates, &names);

    let instructions = vec![
        OperationInstruction::new("save", Value::Null),
        OperationInstruction::background("calculate", Value::Null),
        OperationInstruction::new("bind", Value::Null),
        OperationInstruction::background("formUpdate", Value::Null),
        OperationInstruction::new("submit", Value::Null),
    ];
    let background = instructions
        .iter()
        .filter(|instruction| instruction.is_background())
        .map(OperationInstruction::id)
        .collect::<HashSet<_>>();

    let started = Arc::new(Mutex::new((HashSet::new(), 0usize, Vec::new())));
    let tracker = Arc::clone(&started);
    bus.subscribe(MessageChannel::OperationLifecycle, move |message| {
        let EngineMessage::OperationStatusChanged {
            operation_id,
            name,
            status,
            ..
        } = message
        else {
            return;
        };
        if background.contains(operation_id) {
            return;
        }
        let mut tracker = tracker.lock().expect("tracker lock");
        match status {
            OperationStatus::Started => {
                tracker.0.insert(*operation_id);
                let active = tracker.0.len();
                tracker.1 = tracker.1.max(active);
                tracker.2.push(name.clone());
            }
            status if status.is_terminal() => {
                tracker.0.remove(operation_id);
            }
            _ => {}
        }
    });

    scheduler.execute_instructions(instructions.clone());
    for name in ["formUpdate", "save", "calculate", "bind", "submit"] {
        gates.release(name, Ok(json!(name))).await;
    }
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");

    let tracker = started.lock().expect("tracker lock");
    assert_eq!(tracker.1, 1);
    assert_eq!(tracker.2, vec!["save", "bind", "submit"]);
    assert!(
        instructions
            .iter()
            .all(|instruction| instruction.status() == OperationStatus::Completed)
    );
}

#[tokio::test]
async fn failures_and_aborts_release_the_slot() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["save", "bind", "submit"]);
    let save = OperationInstruction::new("save", Value::Null);
    let bind = OperationInstruction::new("bind", Value::Null);
    let submit = OperationInstruction::new("submit", Value::Null);
    scheduler.execute_instructions(vec![save.clone(), bind.clone(), submit.clone()]);

    gates.release("save", Err(OperationError::failed("backend unavailable"))).await;
    wait_for(&bind, OperationStatus::Started).await;
    assert_eq!(save.status(), OperationStatus::Failed);
    assert_eq!(save.result(), Some(Err(OperationError::failed("backend unavailable"))));

    assert!(scheduler.abort(&bind));
    assert_eq!(bind.status(), OperationStatus::Aborted);
    assert_eq!(bind.result(), Some(Err(OperationError::Aborted)));
    assert_eq!(submit.status(), OperationStatus::Started);
    assert!(!scheduler.abort(&bind));

    gates.release("submit", Ok(Value::Null)).await;
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");
    assert_eq!(submit.status(), OperationStatus::Completed);
    assert_eq!(bind.status(), OperationStatus::Aborted);
}

#[tokio::test]
async fn preempting_aborts_queued_blocking_work() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["bind", "save", "submit", "next"]);
    let bind = OperationInstruction::new("bind", Value::Null);
    let save = OperationInstruction::new("save", Value::Null);
    let submit = OperationInstruction::new("submit", Value::Null);
    scheduler.execute_instructions(vec![bind.clone(), save.clone(), submit.clone()]);

    let next = OperationInstruction::new("next", Value::Null);
    scheduler.execute_instructions_with(vec![next.clone()], DispatchMode::Preempt);

    assert_eq!(save.status(), OperationStatus::Aborted);
    assert_eq!(submit.status(), OperationStatus::Aborted);
    assert_eq!(bind.status(), OperationStatus::Started);
    assert_eq!(next.status(), OperationStatus::NotStarted);
    assert_eq!(scheduler.queued().len(), 1);

    gates.release("bind", Ok(Value::Null)).await;
    gates.release("next", Ok(Value::Null)).await;
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");
    assert_eq!(next.status(), OperationStatus::Completed);
}

#[tokio::test]
async fn superseding_navigation_aborts_named_operations() {
    let gates = Gates::default();
    let (scheduler, _bus) = scheduler_with(&gates, &["calculate", "bind", "save"]);
    let calculate = OperationInstruction::background("calculate", Value::Null);
    let bind = OperationInstruction::new("bind", Value::Null);
    let save = OperationInstruction::new("save", Value::Null);
    scheduler.execute_instructions(vec![calculate.clone(), bind.clone(), save.clone()]);

    let aborted = scheduler.abort_named(&["calculate", "bind"]);

    assert_eq!(aborted, 2);
    assert_eq!(calculate.status(), OperationStatus::Aborted);
    assert_eq!(bind.status(), OperationStatus::Aborted);
    assert_eq!(save.status(), OperationStatus::Started);
    assert!(!scheduler.status_registry().is_operation_in_progress(Some("calculate")));

    gates.release("save", Ok(Value::Null)).await;
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");
}

#[derive(Default)]
struct RecordingReloader {
    calls: Mutex<Vec<(String, Value)>>,
    fail: bool,
}

#[async_trait]
impl ContextReloader for RecordingReloader {
    async fn reload(&self, operation_name: &str, result: &Value) -> anyhow::Result<()> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((operation_name.to_string(), result.clone()));
        if self.fail {
            anyhow::bail!("reload endpoint unavailable");
        }
        Ok(())
    }
}

/// Holds every reload open until the test lets it finish.
struct GatedReloader {
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl ContextReloader for GatedReloader {
    async fn reload(&self, _operation_name: &str, _result: &Value) -> anyhow::Result<()> {
        let entered = self.entered.lock().expect("entered lock").take();
        if let Some(entered) = entered {
            let _ = entered.send(());
        }
        let release = self.release.lock().await.take();
        if let Some(release) = release {
            let _ = release.await;
        }
        Ok(())
    }
}

fn reloading_scheduler(reloader: Arc<dyn ContextReloader>) -> OperationScheduler {
    let factory = StaticOperationFactory::new()
        .register_fn("bind", |_| async { Ok(json!({ "quoteId": "Q-1" })) })
        .register_fn("save", |_| async { Ok(Value::Null) })
        .register_fn("submit", |_| async { Err(OperationError::failed("declined")) });
    OperationScheduler::new(
        Arc::new(factory),
        OperationStatusRegistry::default(),
        MessageBus::default(),
        Some(reloader),
        SchedulerSettings {
            reload_after: vec!["bind".into(), "submit".into()],
        },
    )
}

#[tokio::test]
async fn configured_operations_reload_context_after_success() {
    let reloader = Arc::new(RecordingReloader::default());
    let scheduler = reloading_scheduler(Arc::<RecordingReloader>::clone(&reloader));
    let bind = OperationInstruction::new("bind", Value::Null);
    let save = OperationInstruction::new("save", Value::Null);
    let submit = OperationInstruction::new("submit", Value::Null);

    scheduler.execute_instructions(vec![bind.clone(), save.clone(), submit.clone()]);
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");

    assert_eq!(submit.status(), OperationStatus::Failed);
    let calls = reloader.calls.lock().expect("calls lock");
    assert_eq!(*calls, vec![("bind".to_string(), json!({ "quoteId": "Q-1" }))]);
}

#[tokio::test]
async fn reload_failures_do_not_fail_the_operation() {
    let reloader = Arc::new(RecordingReloader {
        fail: true,
        ..RecordingReloader::default()
    });
    let scheduler = reloading_scheduler(Arc::<RecordingReloader>::clone(&reloader));
    let bind = OperationInstruction::new("bind", Value::Null);

    scheduler.dispatch(bind.clone());
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");

    assert_eq!(bind.status(), OperationStatus::Completed);
    assert_eq!(reloader.calls.lock().expect("calls lock").len(), 1);
}

#[tokio::test]
async fn aborting_during_the_context_reload_keeps_the_slot() {
    let (entered, reload_started) = oneshot::channel();
    let (finish_reload, release) = oneshot::channel();
    let reloader = Arc::new(GatedReloader {
        entered: Mutex::new(Some(entered)),
        release: tokio::sync::Mutex::new(Some(release)),
    });
    let scheduler = reloading_scheduler(reloader);
    let bind = OperationInstruction::new("bind", Value::Null);
    let save = OperationInstruction::new("save", Value::Null);

    scheduler.execute_instructions(vec![bind.clone(), save.clone()]);
    timeout(WAIT_LIMIT, reload_started)
        .await
        .expect("reload never started")
        .expect("reloader signals");

    assert!(!scheduler.abort(&bind));
    assert_eq!(bind.status(), OperationStatus::Started);
    assert_eq!(save.status(), OperationStatus::NotStarted);

    finish_reload.send(()).expect("reload is waiting");
    timeout(WAIT_LIMIT, scheduler.wait_until_idle()).await.expect("scheduler drains");
    assert_eq!(bind.status(), OperationStatus::Completed);
    assert_eq!(bind.result(), Some(Ok(json!({ "quoteId": "Q-1" }))));
    assert_eq!(save.status(), OperationStatus::Completed);
}
