//! The engine controller: the canonical lifecycle state machine, the plan
//! registry, and the orchestration of one run.
//!
//! ```text
//! idle ──start──▶ running ──stop──▶ stopping ──(all done)──▶ completed
//!                 │                    │
//!                 │                    └──force_stop──▶ completed
//!                 └──fatal error─────────────────────▶ error
//!                              reset (completed/error) ──▶ idle
//! ```
//!
//! At most one run exists per [`Runner`]; all run-scoped state (schedulers,
//! users, statistics, CSV cursors) is created at `start_test` and torn down
//! when the run finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use uuid::Uuid;

use crate::aggregator::{self, LiveStats};
use crate::client::Dispatcher;
use crate::data::CsvBank;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventBus};
use crate::executor::GroupScheduler;
use crate::plan::TestPlan;
use crate::report::{ProgressSnapshot, TimeBucket};
use crate::vars::ScopeLayers;
use crate::{CRATE_NAME, RESULT_QUEUE_CAPACITY};

/// Current lifecycle state of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    Stopping,
    Completed,
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Running => "running",
            EngineStatus::Stopping => "stopping",
            EngineStatus::Completed => "completed",
            EngineStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status kind plus live counters, as returned by `status()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct StatusReport {
    pub status: EngineStatus,
    pub completed_requests: u64,
    pub total_errors: u64,
    pub active_vus: u32,
    pub elapsed_ms: u64,
}

/// First-error-wins fatal latch shared across a run's tasks. Tripping it
/// requests an immediate teardown and drives the controller to `Error`.
#[derive(Debug, Clone, Default)]
pub(crate) struct FatalSignal {
    token: CancellationToken,
    message: Arc<Mutex<Option<String>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, message: &str) {
        {
            let mut slot = self.message.lock().expect("fatal lock poisoned");
            if slot.is_none() {
                event!(target: CRATE_NAME, Level::ERROR, %message, "fatal engine error");
                *slot = Some(message.to_string());
            }
        }
        self.token.cancel();
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().expect("fatal lock poisoned").clone()
    }

    pub async fn tripped(&self) {
        self.token.cancelled().await
    }
}

// Everything the controller keeps while a run exists. Retained after
// completion so results()/time_series() stay answerable until reset().
#[derive(Clone)]
struct RunHandles {
    stop: CancellationToken,
    kill: CancellationToken,
    fatal: FatalSignal,
    stats: Arc<Mutex<LiveStats>>,
    active_vus: Arc<AtomicU32>,
}

struct ControllerState {
    status: EngineStatus,
    last_error: Option<String>,
    run: Option<RunHandles>,
}

/// The engine's control surface. Hosts register plans, start and stop runs,
/// poll status, and subscribe to the event stream.
pub struct Runner {
    plans: Mutex<HashMap<Uuid, TestPlan>>,
    state: Arc<Mutex<ControllerState>>,
    bus: EventBus,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            state: Arc::new(Mutex::new(ControllerState {
                status: EngineStatus::Idle,
                last_error: None,
                run: None,
            })),
            bus: EventBus::new(),
        }
    }

    /// Validate and store a plan so `start_test` can find it by id.
    pub fn register_plan(&self, plan: TestPlan) -> Result<(), EngineError> {
        plan.validate()?;
        self.plans
            .lock()
            .expect("plan registry poisoned")
            .insert(plan.id, plan);
        Ok(())
    }

    pub fn remove_plan(&self, plan_id: Uuid) -> Option<TestPlan> {
        self.plans
            .lock()
            .expect("plan registry poisoned")
            .remove(&plan_id)
    }

    /// Subscribe to the engine event stream. Events published before the
    /// subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Start executing a registered plan. Returns as soon as the run is
    /// spawned; progress arrives through the event stream. Must be called
    /// within a tokio runtime.
    pub fn start_test(&self, plan_id: Uuid) -> Result<(), EngineError> {
        let plan = self
            .plans
            .lock()
            .expect("plan registry poisoned")
            .get(&plan_id)
            .cloned()
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        plan.validate()?;
        if !plan.thread_groups.iter().any(|g| g.is_runnable()) {
            return Err(EngineError::PlanEmpty);
        }

        let dispatcher = Dispatcher::new()?;

        let run = {
            let mut state = self.state.lock().expect("controller state poisoned");
            if state.status != EngineStatus::Idle {
                return Err(EngineError::AlreadyRunning);
            }
            let run = RunHandles {
                stop: CancellationToken::new(),
                kill: CancellationToken::new(),
                fatal: FatalSignal::new(),
                stats: Arc::new(Mutex::new(LiveStats::new())),
                active_vus: Arc::new(AtomicU32::new(0)),
            };
            state.status = EngineStatus::Running;
            state.last_error = None;
            state.run = Some(run.clone());
            // Published while holding the state lock so subscribers observe
            // status transitions in state-machine order.
            self.bus.publish(EngineEvent::Status {
                status: EngineStatus::Running,
            });
            run
        };

        event!(target: CRATE_NAME, Level::INFO, plan = %plan.name, %plan_id, "test starting");

        tokio::spawn(execute_plan(
            plan,
            run,
            dispatcher,
            self.bus.clone(),
            Arc::clone(&self.state),
        ));
        Ok(())
    }

    /// Request cooperative shutdown: no new iterations begin, in-flight
    /// requests get a bounded grace window.
    pub fn stop_test(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().expect("controller state poisoned");
            if state.status != EngineStatus::Running {
                return Err(EngineError::NotRunning);
            }
            state.status = EngineStatus::Stopping;
            let run = state.run.clone().expect("running state always has run handles");
            run.stop.cancel();
            self.bus.publish(EngineEvent::Status {
                status: EngineStatus::Stopping,
            });
            self.bus.publish(EngineEvent::Progress(snapshot_of(&run)));
        }
        event!(target: CRATE_NAME, Level::INFO, "test stopping");
        Ok(())
    }

    /// Drop in-flight work immediately. The run still winds down through the
    /// normal completion path, publishing whatever was aggregated.
    pub fn force_stop_test(&self) -> Result<(), EngineError> {
        let run = {
            let state = self.state.lock().expect("controller state poisoned");
            if !matches!(state.status, EngineStatus::Running | EngineStatus::Stopping) {
                return Err(EngineError::NotRunning);
            }
            state.run.clone()
        };
        let run = run.expect("running state always has run handles");
        event!(target: CRATE_NAME, Level::INFO, "test force-stopped");
        run.stop.cancel();
        run.kill.cancel();
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        let state = self.state.lock().expect("controller state poisoned");
        let snapshot = state.run.as_ref().map(snapshot_of).unwrap_or_default();
        StatusReport {
            status: state.status,
            completed_requests: snapshot.completed_requests,
            total_errors: snapshot.total_errors,
            active_vus: snapshot.active_vus,
            elapsed_ms: snapshot.elapsed_ms,
        }
    }

    /// Latest progress snapshot of the current (or most recent) run.
    pub fn results(&self) -> ProgressSnapshot {
        let state = self.state.lock().expect("controller state poisoned");
        state.run.as_ref().map(snapshot_of).unwrap_or_default()
    }

    /// Per-second series of the current (or most recent) run.
    pub fn time_series(&self) -> Vec<TimeBucket> {
        let state = self.state.lock().expect("controller state poisoned");
        state
            .run
            .as_ref()
            .map(|run| run.stats.lock().expect("stats lock poisoned").time_series())
            .unwrap_or_default()
    }

    /// Message of the fatal error that moved the engine to `Error`, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("controller state poisoned")
            .last_error
            .clone()
    }

    /// Clear the finished run and return to `Idle`.
    pub fn reset(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().expect("controller state poisoned");
            if !matches!(state.status, EngineStatus::Completed | EngineStatus::Error) {
                return Err(EngineError::InvalidState(format!(
                    "reset is only valid in completed or error, not {}",
                    state.status
                )));
            }
            state.status = EngineStatus::Idle;
            state.last_error = None;
            state.run = None;
            self.bus.publish(EngineEvent::Status {
                status: EngineStatus::Idle,
            });
        }
        Ok(())
    }
}

fn snapshot_of(run: &RunHandles) -> ProgressSnapshot {
    run.stats
        .lock()
        .expect("stats lock poisoned")
        .snapshot(run.active_vus.load(Ordering::Relaxed))
}

// One run, start to finish: spawn the aggregator and one scheduler per
// runnable group, wait for them, then publish the terminal events and move
// the state machine to its final state.
async fn execute_plan(
    plan: TestPlan,
    run: RunHandles,
    dispatcher: Dispatcher,
    bus: EventBus,
    state: Arc<Mutex<ControllerState>>,
) {
    let plan_id = plan.id;
    let plan_name = plan.name.clone();

    let bank = CsvBank::new(&plan.csv_data_sources);
    let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);
    let aggregator = tokio::spawn(aggregator::run(
        results_rx,
        Arc::clone(&run.stats),
        Arc::clone(&run.active_vus),
        bus.clone(),
    ));

    let mut schedulers: JoinSet<()> = JoinSet::new();
    for group in plan.thread_groups.iter().filter(|g| g.is_runnable()) {
        let scheduler = GroupScheduler {
            plan_id,
            group: group.clone(),
            layers: ScopeLayers::new(&plan, group),
            bank: Arc::clone(&bank),
            dispatcher: dispatcher.clone(),
            results: results_tx.clone(),
            stop: run.stop.clone(),
            kill: run.kill.clone(),
            fatal: run.fatal.clone(),
            active_vus: Arc::clone(&run.active_vus),
        };
        schedulers.spawn(scheduler.run());
    }
    // The aggregator's queue closes once every scheduler clone is gone.
    drop(results_tx);

    let mut fatal_seen = false;
    loop {
        tokio::select! {
            joined = schedulers.join_next() => match joined {
                None => break,
                Some(Err(e)) if e.is_panic() => {
                    run.fatal.trip("thread group scheduler panicked");
                    run.kill.cancel();
                }
                Some(_) => {}
            },
            _ = run.fatal.tripped(), if !fatal_seen => {
                fatal_seen = true;
                run.kill.cancel();
            }
        }
    }

    // All senders are gone; the aggregator drains the queue and exits.
    let _ = aggregator.await;

    let failure = run.fatal.message();
    let final_status = if failure.is_some() {
        EngineStatus::Error
    } else {
        EngineStatus::Completed
    };
    let summary = {
        let mut stats = run.stats.lock().expect("stats lock poisoned");
        stats.finish();
        stats.tick_rate();
        stats.summary(plan_id, plan_name)
    };
    event!(
        target: CRATE_NAME,
        Level::INFO,
        status = %final_status,
        total = summary.total_requests,
        failed = summary.failed_requests,
        "test finished"
    );
    {
        let mut state = state.lock().expect("controller state poisoned");
        state.status = final_status;
        state.last_error = failure;
        bus.publish(EngineEvent::Progress(snapshot_of(&run)));
        bus.publish(EngineEvent::Status {
            status: final_status,
        });
        bus.publish(EngineEvent::Complete(Box::new(summary)));
    }
}
