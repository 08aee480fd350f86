//! Simulation engine
//!
//! Owns every tracked athlete and the background tick loop that advances
//! them. The command surface (`start`, `stop`, `snapshot`, ...) is plain
//! synchronous calls that never wait on a tick; the loop runs as a task on
//! the tokio runtime captured at construction.
//!
//! # Loop lifecycle
//!
//! ```text
//! Stopped --start()--> Running --halt() / last athlete stopped--> Stopped
//!                         |
//!                         +--task panicked--> Failed --start()--> Running
//! ```
//!
//! Each tick takes a copy of all states, advances them outside the lock,
//! then writes the results back in one critical section, so a snapshot
//! reader always sees a whole tick or none of it. An athlete whose update
//! fails keeps its previous state; the others still advance. Results for an
//! athlete that was stopped, or stopped and started again, while the tick
//! was running are dropped.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::SimulatorConfig;
use crate::error::{Result, SimulationError, TwinError};
use crate::models::{AthleteSnapshot, AthleteState, TickEvent};
use crate::physiology::{AthleteModel, PhysiologyModel, TickContext};
use crate::publisher::{NullPublisher, TickPublisher};
use crate::risk::RiskEvaluator;

/// State of the background tick loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum LoopStatus {
    Stopped,
    Running,
    /// The loop task died; tracking is halted until the next `start`
    Failed(String),
}

/// Outcome of a single tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Athletes whose state was advanced and written back
    pub advanced: Vec<String>,

    /// Athletes left at their previous state, with the reason
    pub failed: Vec<(String, SimulationError)>,

    /// Events accepted by the publisher
    pub published: usize,
}

/// Builder for [`SimulationEngine`]
pub struct EngineBuilder {
    config: SimulatorConfig,
    publisher: Arc<dyn TickPublisher>,
    model: Option<Arc<dyn AthleteModel>>,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            publisher: Arc::new(NullPublisher),
            model: None,
            runtime: None,
        }
    }

    /// Where tick events go
    pub fn publisher(mut self, publisher: Arc<dyn TickPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Replace the physiological model
    pub fn model(mut self, model: Arc<dyn AthleteModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Runtime that hosts the tick loop (defaults to the current one)
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<SimulationEngine> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| TwinError::Runtime(e.to_string()))?,
        };
        let model = self.model.unwrap_or_else(|| {
            Arc::new(PhysiologyModel::new(
                self.config.model.clone(),
                self.config.sleep.clone(),
            ))
        });
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (status_tx, _) = watch::channel(LoopStatus::Stopped);

        let shared = Arc::new(Shared {
            athletes: RwLock::new(HashMap::new()),
            incarnations: AtomicU64::new(0),
            ticker: Mutex::new(rng),
            model,
            evaluator: RiskEvaluator::new(self.config.risk_rules.clone()),
            publisher: self.publisher,
            tick_interval: self.config.tick_interval(),
            control: Mutex::new(LoopControl::default()),
            status_tx,
        });

        Ok(SimulationEngine {
            inner: Arc::new(EngineInner { shared, runtime }),
        })
    }
}

/// Tracks athletes and publishes their evolving state
///
/// Cheap to clone; all clones drive the same loop. The loop is halted when
/// the last clone is dropped.
#[derive(Clone)]
pub struct SimulationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shared.halt();
    }
}

impl SimulationEngine {
    /// Engine on the current tokio runtime
    pub fn new(config: SimulatorConfig, publisher: Arc<dyn TickPublisher>) -> Result<Self> {
        EngineBuilder::new(config).publisher(publisher).build()
    }

    pub fn builder(config: SimulatorConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Begin tracking an athlete with baseline values and make sure the loop runs
    ///
    /// Calling it again for a tracked athlete keeps the accumulated state.
    pub fn start(&self, athlete_id: impl Into<String>) -> Result<()> {
        let athlete_id = athlete_id.into();
        {
            let mut athletes = self.inner.shared.write_athletes();
            if athletes.contains_key(&athlete_id) {
                debug!(athlete_id = %athlete_id, "Athlete already tracked");
            } else {
                let tracked = Tracked {
                    incarnation: self.inner.shared.incarnations.fetch_add(1, Ordering::Relaxed),
                    state: AthleteState::baseline(Utc::now()),
                };
                athletes.insert(athlete_id.clone(), tracked);
                info!(athlete_id = %athlete_id, tracked = athletes.len(), "Started tracking athlete");
            }
        }
        self.inner.shared.ensure_running(&self.inner.runtime);
        Ok(())
    }

    /// Stop tracking an athlete and discard its state
    pub fn stop(&self, athlete_id: &str) -> Result<()> {
        let remaining = {
            let mut athletes = self.inner.shared.write_athletes();
            if athletes.remove(athlete_id).is_none() {
                return Err(TwinError::not_tracked(athlete_id));
            }
            athletes.len()
        };
        info!(athlete_id = %athlete_id, remaining, "Stopped tracking athlete");

        if remaining == 0 {
            self.inner.shared.halt_if_idle();
        }
        Ok(())
    }

    /// Rounded view of the athlete as of the last completed tick
    pub fn snapshot(&self, athlete_id: &str) -> Result<AthleteSnapshot> {
        self.inner
            .shared
            .read_athletes()
            .get(athlete_id)
            .map(|tracked| tracked.state.snapshot())
            .ok_or_else(|| TwinError::not_tracked(athlete_id))
    }

    /// Full unrounded state as of the last completed tick
    pub fn state(&self, athlete_id: &str) -> Result<AthleteState> {
        self.inner
            .shared
            .read_athletes()
            .get(athlete_id)
            .map(|tracked| tracked.state.clone())
            .ok_or_else(|| TwinError::not_tracked(athlete_id))
    }

    /// IDs of all tracked athletes, sorted
    pub fn tracked_athletes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.shared.read_athletes().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracked(&self, athlete_id: &str) -> bool {
        self.inner.shared.read_athletes().contains_key(athlete_id)
    }

    /// Stop the loop but keep every athlete's state; `start` resumes it
    pub fn halt(&self) {
        self.inner.shared.halt();
    }

    pub fn status(&self) -> LoopStatus {
        self.inner.shared.status_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == LoopStatus::Running
    }

    /// Error with the failure reason if the loop task died
    pub fn ensure_healthy(&self) -> Result<()> {
        match self.status() {
            LoopStatus::Failed(reason) => Err(TwinError::LoopFailure(reason)),
            _ => Ok(()),
        }
    }

    /// Watch loop status changes, including failures
    pub fn subscribe_status(&self) -> watch::Receiver<LoopStatus> {
        self.inner.shared.status_tx.subscribe()
    }

    /// Advance every athlete to `now` right away
    ///
    /// This is what the loop runs on each interval. Ticks never overlap: a
    /// concurrent call waits for the running one to finish.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        self.inner.shared.tick_at(now)
    }

    pub fn tick_interval(&self) -> Duration {
        self.inner.shared.tick_interval
    }
}

#[derive(Default)]
struct LoopControl {
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
}

/// One tracked athlete; `incarnation` changes every time tracking starts anew
struct Tracked {
    incarnation: u64,
    state: AthleteState,
}

/// Marks the loop stopped when its task is dropped without exiting itself
struct LoopGuard {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        // after a panic the supervisor replaces this with Failed
        self.shared.loop_exited(self.generation);
    }
}

struct Shared {
    athletes: RwLock<HashMap<String, Tracked>>,
    incarnations: AtomicU64,
    /// Held for a whole tick; also serializes ticks
    ticker: Mutex<StdRng>,
    model: Arc<dyn AthleteModel>,
    evaluator: RiskEvaluator,
    publisher: Arc<dyn TickPublisher>,
    tick_interval: Duration,
    control: Mutex<LoopControl>,
    status_tx: watch::Sender<LoopStatus>,
}

impl Shared {
    fn read_athletes(&self) -> RwLockReadGuard<'_, HashMap<String, Tracked>> {
        self.athletes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_athletes(&self) -> RwLockWriteGuard<'_, HashMap<String, Tracked>> {
        self.athletes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, LoopControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(self: &Arc<Self>, runtime: &Handle) {
        let mut control = self.control();
        if control.shutdown.is_some() {
            return;
        }

        control.generation += 1;
        let generation = control.generation;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        control.shutdown = Some(shutdown_tx);
        self.status_tx.send_replace(LoopStatus::Running);

        let guard = LoopGuard {
            shared: Arc::clone(self),
            generation,
        };
        let looped = Arc::clone(self);
        let task = runtime.spawn(
            async move {
                let _guard = guard;
                looped.run_loop(generation, shutdown_rx).await;
            }
            .instrument(info_span!("tick_loop", generation)),
        );

        let supervised = Arc::clone(self);
        runtime.spawn(async move {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    supervised.loop_failed(generation, panic_message(e.into_panic().as_ref()));
                }
                Err(_) => supervised.loop_exited(generation),
            }
        });
        info!(generation, interval_ms = self.tick_interval.as_millis() as u64, "Tick loop started");
    }

    async fn run_loop(self: Arc<Self>, generation: u64, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; the first update is one interval out
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.keep_running(generation) {
                        break;
                    }
                    let report = self.tick_at(Utc::now());
                    trace!(
                        advanced = report.advanced.len(),
                        failed = report.failed.len(),
                        published = report.published,
                        "Tick complete"
                    );
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }
        info!("Tick loop exited");
    }

    /// Whether loop `generation` should tick again; stops it when nobody is tracked
    fn keep_running(&self, generation: u64) -> bool {
        let mut control = self.control();
        if control.generation != generation || control.shutdown.is_none() {
            return false;
        }
        if self.read_athletes().is_empty() {
            control.shutdown = None;
            self.status_tx.send_replace(LoopStatus::Stopped);
            debug!("No athletes tracked, stopping tick loop");
            return false;
        }
        true
    }

    fn halt(&self) {
        let mut control = self.control();
        if let Some(shutdown) = control.shutdown.take() {
            // the loop may already be gone
            let _ = shutdown.send(());
            self.status_tx.send_replace(LoopStatus::Stopped);
            info!(generation = control.generation, "Tick loop halted");
        }
    }

    fn halt_if_idle(&self) {
        let mut control = self.control();
        if control.shutdown.is_some() && self.read_athletes().is_empty() {
            if let Some(shutdown) = control.shutdown.take() {
                let _ = shutdown.send(());
            }
            self.status_tx.send_replace(LoopStatus::Stopped);
            debug!("Last athlete stopped, tick loop halting");
        }
    }

    fn loop_failed(&self, generation: u64, reason: String) {
        let mut control = self.control();
        if control.generation != generation {
            return;
        }
        control.shutdown = None;
        error!(generation, reason = %reason, "Tick loop failed; tracking halted");
        self.status_tx.send_replace(LoopStatus::Failed(reason));
    }

    /// Loop task went away without halt or failure (runtime shutdown, abort)
    fn loop_exited(&self, generation: u64) {
        let mut control = self.control();
        if control.generation == generation && control.shutdown.take().is_some() {
            self.status_tx.send_replace(LoopStatus::Stopped);
            warn!(generation, "Tick loop task ended without halt");
        }
    }

    fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut rng = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        let current: Vec<(String, u64, AthleteState)> = self
            .read_athletes()
            .iter()
            .map(|(id, tracked)| (id.clone(), tracked.incarnation, tracked.state.clone()))
            .collect();

        let mut report = TickReport::default();
        let mut updates = Vec::with_capacity(current.len());

        for (athlete_id, incarnation, state) in current {
            let ctx = TickContext::between(state.last_tick_at, now);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.model.advance(&athlete_id, &state, &ctx, &mut *rng)
            }))
            .unwrap_or_else(|payload| {
                Err(SimulationError::Panicked {
                    athlete_id: athlete_id.clone(),
                    reason: panic_message(payload.as_ref()),
                })
            });

            match outcome {
                Ok(next) => {
                    let risks = self.evaluator.evaluate(&next);
                    updates.push((athlete_id, incarnation, next, risks));
                }
                Err(e) => {
                    error!(
                        athlete_id = %athlete_id,
                        elapsed_secs = ctx.elapsed_secs,
                        error = %e,
                        "Failed to advance athlete, keeping previous state"
                    );
                    report.failed.push((athlete_id, e));
                }
            }
        }

        let mut events = Vec::with_capacity(updates.len());
        {
            let mut athletes = self.write_athletes();
            for (athlete_id, incarnation, next, risks) in updates {
                let slot = match athletes.get_mut(&athlete_id) {
                    Some(tracked) if tracked.incarnation == incarnation => tracked,
                    _ => {
                        debug!(athlete_id = %athlete_id, "Athlete stopped during tick, update dropped");
                        continue;
                    }
                };
                events.push(TickEvent::new(athlete_id.clone(), &next, risks));
                slot.state = next;
                report.advanced.push(athlete_id);
            }
        }
        drop(rng);

        for event in events {
            let athlete_id = event.athlete_id.clone();
            match self.publisher.publish(event) {
                Ok(()) => report.published += 1,
                Err(e) => debug!(athlete_id = %athlete_id, error = %e, "Tick event not delivered"),
            }
        }

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), advanced = report.advanced.len(), "Tick completed with failures");
        }
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
