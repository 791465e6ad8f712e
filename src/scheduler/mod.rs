//! Experiment scheduler
//!
//! The [`Scheduler`] owns the variables, routines and alarms of one experiment and drives
//! them through time. In the default synchronous mode every iteration is:
//!
//! 1. read experiment time from the pausable [`Clock`]
//! 2. fan out routine updates against the pre-iteration snapshot (barrier)
//! 3. commit the admitted assignments, sequential per routine and concurrent across
//!    routines (barrier)
//! 4. fan out variable refreshes, then evaluate expressions in dependency order (barrier)
//! 5. evaluate alarms against the fresh snapshot and dispatch protocols on transitions
//! 6. publish the [`State`] to sinks and, throttled by `plot_interval`, to live watchers
//! 7. sleep out the rest of `step_interval`
//!
//! Lifecycle commands from a [`SchedulerHandle`] are applied only between iterations.
//! Failures are recorded as [`Diagnostic`]s on the published state; only an exhausted
//! channel on a critical knob (or on any variable with `fatal_errors`), a `terminate`
//! alarm, the global `end` or an explicit terminate ends the run.
//!
//! While `Stopped`, routines are idle and only the variables alarm conditions read are
//! still polled; other meters, remotes and expressions are published without a value,
//! so a stop alarm can observe its condition clearing.
//!
//! The asynchronous mode (`async = true`) replaces steps 2-4 with independent loops per
//! routine and per instrument-backed variable; see [`concurrent`].

mod access;
mod clock;
mod concurrent;
mod pool;
mod sink;
mod state;

pub use access::{Claims, RemoteAccess};
pub use clock::Clock;
pub use pool::WorkerPool;
pub use sink::{MemorySink, StateSink};
pub use state::{Diagnostic, Lifecycle, State};

use crate::alarm::{Alarm, AlarmTransition, Protocol};
use crate::config::SchedulerSettings;
use crate::core::Value;
use crate::error::{AppResult, DaqError};
use crate::routine::{Assignment, Routine};
use crate::variable::{Variable, VariableSet};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

const CONTROL_QUEUE_DEPTH: usize = 32;

/// Lifecycle requests accepted between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Hold,
    Resume,
    Stop,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// `terminate()` was called
    Requested,
    /// The global `end` setting elapsed
    EndReached,
    /// Every routine went inert
    RoutinesComplete,
    /// An alarm with a terminate protocol triggered
    Alarm(String),
    /// A fatal commit or refresh failure
    Failure(String),
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub reason: TerminateReason,
    /// Runcard to build and start next, from a terminate alarm
    pub follow_up: Option<String>,
    pub iterations: u64,
    pub final_state: Arc<State>,
}

/// Cloneable control and monitoring handle for a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control_tx: mpsc::Sender<Control>,
    live: watch::Receiver<Arc<State>>,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl SchedulerHandle {
    async fn send(&self, control: Control) -> AppResult<()> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| DaqError::ChannelClosed("scheduler".to_string()))
    }

    pub async fn hold(&self) -> AppResult<()> {
        self.send(Control::Hold).await
    }

    /// Returns to `Running`, releasing every alarm latch.
    pub async fn resume(&self) -> AppResult<()> {
        self.send(Control::Resume).await
    }

    pub async fn stop(&self) -> AppResult<()> {
        self.send(Control::Stop).await
    }

    pub async fn terminate(&self) -> AppResult<()> {
        self.send(Control::Terminate).await
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Waits until the scheduler reaches `target`.
    pub async fn wait_for(&self, target: Lifecycle) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.clone();
        let reached = lifecycle.wait_for(|current| *current == target).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(DaqError::ChannelClosed("scheduler".to_string()))
        }
    }

    /// Live state, updated no more often than `plot_interval`.
    pub fn subscribe(&self) -> watch::Receiver<Arc<State>> {
        self.live.clone()
    }

    pub fn latest(&self) -> Arc<State> {
        self.live.borrow().clone()
    }
}

fn severity(lifecycle: Lifecycle) -> u8 {
    match lifecycle {
        Lifecycle::Running => 0,
        Lifecycle::Holding => 1,
        Lifecycle::Stopped => 2,
        Lifecycle::Terminated => 3,
    }
}

/// Lifecycle state machine, alarm latches and the experiment clock.
#[derive(Debug)]
struct Supervisor {
    lifecycle: Lifecycle,
    clock: Arc<Clock>,
    lifecycle_tx: watch::Sender<Lifecycle>,
    /// Lifecycle to restore once every latching alarm has cleared
    alarm_prior: Option<Lifecycle>,
    /// Alarms that release their latch when cleared
    auto_latched: HashSet<String>,
    /// Alarms that need an explicit resume
    manual_latched: HashSet<String>,
    reason: Option<TerminateReason>,
    follow_up: Option<String>,
}

impl Supervisor {
    fn new() -> Self {
        let (lifecycle_tx, _) = watch::channel(Lifecycle::Running);
        Self {
            lifecycle: Lifecycle::Running,
            clock: Arc::new(Clock::new()),
            lifecycle_tx,
            alarm_prior: None,
            auto_latched: HashSet::new(),
            manual_latched: HashSet::new(),
            reason: None,
            follow_up: None,
        }
    }

    fn is_terminated(&self) -> bool {
        self.lifecycle == Lifecycle::Terminated
    }

    fn transition(&mut self, next: Lifecycle) {
        if self.lifecycle == next || self.is_terminated() {
            return;
        }
        info!(from = %self.lifecycle, to = %next, "Lifecycle transition");
        self.lifecycle = next;
        if next.clock_runs() {
            self.clock.resume();
        } else {
            self.clock.pause();
        }
        self.lifecycle_tx.send_replace(next);
    }

    fn terminate(&mut self, reason: TerminateReason, follow_up: Option<String>) {
        if self.is_terminated() {
            return;
        }
        match &reason {
            TerminateReason::Failure(message) => error!(reason = %message, "Terminating run"),
            other => info!(reason = ?other, "Terminating run"),
        }
        self.reason = Some(reason);
        self.follow_up = follow_up;
        self.transition(Lifecycle::Terminated);
    }

    /// Moves to `target` if it is more restrictive than the current lifecycle.
    fn restrict(&mut self, target: Lifecycle) {
        if severity(target) > severity(self.lifecycle) {
            self.transition(target);
        }
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Hold | Control::Stop => {
                let target = if control == Control::Hold {
                    Lifecycle::Holding
                } else {
                    Lifecycle::Stopped
                };
                if self.alarm_prior.is_some() {
                    // takes effect once the latching alarms clear
                    self.alarm_prior = Some(target);
                }
                if control == Control::Hold && self.lifecycle == Lifecycle::Stopped {
                    warn!("Hold requested while stopped; ignoring");
                    return;
                }
                self.restrict(target);
            }
            Control::Resume => {
                self.auto_latched.clear();
                self.manual_latched.clear();
                self.alarm_prior = None;
                self.transition(Lifecycle::Running);
            }
            Control::Terminate => self.terminate(TerminateReason::Requested, None),
        }
    }

    fn latch(&mut self, alarm: &str, target: Lifecycle, auto_release: bool) {
        if self.is_terminated() {
            return;
        }
        if self.alarm_prior.is_none() {
            self.alarm_prior = Some(self.lifecycle);
        }
        if auto_release {
            self.auto_latched.insert(alarm.to_string());
        } else {
            self.manual_latched.insert(alarm.to_string());
        }
        self.restrict(target);
    }

    fn alarm_triggered(&mut self, alarm: &str, protocol: &Protocol) {
        match protocol {
            Protocol::None => {}
            Protocol::Hold => self.latch(alarm, Lifecycle::Holding, true),
            Protocol::Stop => self.latch(alarm, Lifecycle::Stopped, true),
            Protocol::Check => self.latch(alarm, Lifecycle::Stopped, false),
            Protocol::Terminate { follow_up } => {
                self.terminate(TerminateReason::Alarm(alarm.to_string()), follow_up.clone())
            }
        }
    }

    fn alarm_cleared(&mut self, alarm: &str) {
        if !self.auto_latched.remove(alarm) {
            return;
        }
        if self.auto_latched.is_empty() && self.manual_latched.is_empty() {
            if let Some(prior) = self.alarm_prior.take() {
                info!(alarm, restore = %prior, "Alarms cleared");
                self.transition(prior);
            }
        }
    }
}

/// Next due times for the periodic sink and live-state work.
#[derive(Debug)]
struct Cadence {
    flush_at: Instant,
    split_at: Option<Instant>,
    last_plot: Option<Instant>,
}

impl Cadence {
    fn new(settings: &SchedulerSettings) -> Self {
        let now = Instant::now();
        Self {
            flush_at: now + settings.save_interval,
            split_at: settings.split_interval.map(|d| now + d),
            last_plot: None,
        }
    }
}

/// Drives one experiment from initialization to teardown.
pub struct Scheduler {
    settings: SchedulerSettings,
    variables: Arc<VariableSet>,
    routines: Vec<Arc<Mutex<Routine>>>,
    alarms: Vec<Alarm>,
    /// Variables alarm conditions read, with their expression inputs
    watched: Arc<HashSet<String>>,
    pool: WorkerPool,
    claims: Arc<Claims>,
    sinks: Vec<Box<dyn StateSink>>,
    supervisor: Supervisor,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    live_tx: watch::Sender<Arc<State>>,
    latest: Arc<State>,
    run_id: Uuid,
    iteration: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", &self.run_id)
            .field("lifecycle", &self.supervisor.lifecycle)
            .field("variables", &self.variables.len())
            .field("routines", &self.routines.len())
            .field("alarms", &self.alarms.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validates the experiment graph: routine and alarm references must name existing
    /// variables, routine targets must be settable kinds, names must be unique.
    pub fn new(
        settings: SchedulerSettings,
        variables: VariableSet,
        routines: Vec<Routine>,
        alarms: Vec<Alarm>,
    ) -> AppResult<Self> {
        if settings.step_interval.is_zero() {
            return Err(DaqError::Configuration(
                "step interval must be positive".to_string(),
            ));
        }

        let mut routine_names = HashSet::new();
        for routine in &routines {
            if !routine_names.insert(routine.name()) {
                return Err(DaqError::Configuration(format!(
                    "duplicate routine name '{}'",
                    routine.name()
                )));
            }
            for name in routine.referenced_variables() {
                if variables.get(name).is_none() {
                    return Err(DaqError::Configuration(format!(
                        "routine '{}' refers to unknown variable '{}'",
                        routine.name(),
                        name
                    )));
                }
            }
            for knob in routine.knobs() {
                if let Some(variable) = variables.get(knob) {
                    if matches!(variable.as_ref(), Variable::Meter(_) | Variable::Expression(_)) {
                        return Err(DaqError::NotSettable(knob.to_string()));
                    }
                }
            }
        }

        let mut alarm_names = HashSet::new();
        for alarm in &alarms {
            if !alarm_names.insert(alarm.name()) {
                return Err(DaqError::Configuration(format!(
                    "duplicate alarm name '{}'",
                    alarm.name()
                )));
            }
            if let Some(unknown) = alarm.variables().find(|v| variables.get(v).is_none()) {
                return Err(DaqError::Configuration(format!(
                    "alarm '{}' refers to unknown variable '{}'",
                    alarm.name(),
                    unknown
                )));
            }
        }

        let watched = Arc::new(variables.closure(alarms.iter().flat_map(|a| a.variables())));
        let run_id = Uuid::new_v4();
        let latest = Arc::new(State::initial(run_id, variables.names()));
        let (live_tx, _) = watch::channel(latest.clone());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);

        Ok(Self {
            pool: WorkerPool::new(settings.workers),
            settings,
            variables: Arc::new(variables),
            routines: routines
                .into_iter()
                .map(|r| Arc::new(Mutex::new(r)))
                .collect(),
            alarms,
            watched,
            claims: Arc::new(Claims::default()),
            sinks: Vec::new(),
            supervisor: Supervisor::new(),
            control_tx,
            control_rx,
            live_tx,
            latest,
            run_id,
            iteration: 0,
        })
    }

    pub fn with_sink(mut self, sink: impl StateSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn variables(&self) -> &Arc<VariableSet> {
        &self.variables
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control_tx: self.control_tx.clone(),
            live: self.live_tx.subscribe(),
            lifecycle: self.supervisor.lifecycle_tx.subscribe(),
        }
    }

    /// Entry point for socket servers and other external writers.
    pub fn access(&self) -> RemoteAccess {
        RemoteAccess::new(self.variables.clone(), self.claims.clone())
    }

    /// Runs the experiment to completion.
    ///
    /// Instruments are connected (presets applied) first and torn down (postsets
    /// applied) last, whatever ends the run.
    pub async fn run(mut self) -> AppResult<RunOutcome> {
        info!(
            run_id = %self.run_id,
            variables = self.variables.len(),
            routines = self.routines.len(),
            alarms = self.alarms.len(),
            mode = if self.settings.async_mode { "async" } else { "sync" },
            "Starting experiment"
        );

        if let Err(err) = self.variables.initialize().await {
            error!(error = %err, "Experiment initialization failed");
            self.supervisor.terminate(TerminateReason::Failure(err.to_string()), None);
            self.teardown().await;
            return Err(err);
        }

        self.latest = Arc::new(State {
            values: self.cached_values(),
            ..(*self.latest).clone()
        });
        self.supervisor.clock.resume();
        if self.settings.async_mode {
            concurrent::run(&mut self).await;
        } else {
            self.run_sync().await;
        }
        self.teardown().await;

        let outcome = RunOutcome {
            run_id: self.run_id,
            reason: self
                .supervisor
                .reason
                .clone()
                .unwrap_or(TerminateReason::Requested),
            follow_up: self.supervisor.follow_up.clone(),
            iterations: self.iteration,
            final_state: self.latest.clone(),
        };
        info!(run_id = %self.run_id, reason = ?outcome.reason, iterations = outcome.iterations, "Experiment finished");
        Ok(outcome)
    }

    async fn run_sync(&mut self) {
        let mut cadence = Cadence::new(&self.settings);
        loop {
            let started = tokio::time::Instant::now();
            if self.between_iterations() {
                break;
            }

            let state = self.iterate().await;
            self.publish(state, &mut cadence);
            if self.check_completion() {
                break;
            }

            tokio::time::sleep_until(started + self.settings.step_interval).await;
        }
    }

    /// Applies queued controls and the global end. True once terminated.
    fn between_iterations(&mut self) -> bool {
        while let Ok(control) = self.control_rx.try_recv() {
            self.supervisor.apply(control);
        }
        if let Some(end) = self.settings.end {
            if self.supervisor.clock.elapsed() >= end {
                self.supervisor.terminate(TerminateReason::EndReached, None);
            }
        }
        self.supervisor.is_terminated()
    }

    /// True once terminated, terminating first if every routine has gone inert.
    fn check_completion(&mut self) -> bool {
        if self.settings.end_with_routines
            && !self.routines.is_empty()
            && self.routines.iter().all(|r| r.lock().is_terminal())
        {
            self.supervisor.terminate(TerminateReason::RoutinesComplete, None);
        }
        self.supervisor.is_terminated()
    }

    async fn iterate(&mut self) -> State {
        let time = self.supervisor.clock.seconds();
        let mut diagnostics = Vec::new();

        if self.supervisor.lifecycle == Lifecycle::Running {
            let view = Arc::new(State {
                time,
                ..(*self.latest).clone()
            });
            let batches = self.update_routines(view, &mut diagnostics).await;
            self.commit(batches, &mut diagnostics).await;
        }

        let values = if self.supervisor.lifecycle == Lifecycle::Stopped {
            let watched = self.watched.clone();
            self.refresh(Some(&*watched), &mut diagnostics).await
        } else {
            self.refresh(None, &mut diagnostics).await
        };

        self.snapshot(time, values, diagnostics)
    }

    /// Numbers the next state, then evaluates alarms against it.
    fn snapshot(
        &mut self,
        time: f64,
        values: Vec<(String, Option<Value>)>,
        diagnostics: Vec<Diagnostic>,
    ) -> State {
        self.iteration += 1;
        let mut state = State {
            run_id: self.run_id,
            iteration: self.iteration,
            time,
            timestamp: Utc::now(),
            lifecycle: self.supervisor.lifecycle,
            values,
            diagnostics,
        };
        self.evaluate_alarms(&mut state);
        state.lifecycle = self.supervisor.lifecycle;
        state
    }

    /// Routine fan-out; returns admitted assignments per routine.
    async fn update_routines(
        &mut self,
        view: Arc<State>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<(String, Vec<Assignment>)> {
        let jobs = self
            .routines
            .iter()
            .map(|routine| {
                let routine = routine.clone();
                let view = view.clone();
                async move {
                    let mut routine = routine.lock();
                    let result = routine.update(&view);
                    (routine.name().to_string(), result, routine.is_terminal())
                }
                .boxed()
            })
            .collect();

        let mut batches = Vec::new();
        for outcome in self.pool.run(jobs).await {
            match outcome {
                Ok((name, result, terminal)) => {
                    if let Some(assignments) =
                        self.admit(&name, result, terminal, diagnostics)
                    {
                        batches.push((name, assignments));
                    }
                }
                Err(err) => diagnostics.push(Diagnostic::new("scheduler", err)),
            }
        }
        batches
    }

    /// Applies knob ownership to one routine's update result. A routine that has just
    /// gone inert gets its final assignments admitted before its claims are released.
    fn admit(
        &self,
        routine: &str,
        result: AppResult<Option<Vec<Assignment>>>,
        terminal: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Vec<Assignment>> {
        let admitted = match result {
            Ok(Some(assignments)) => {
                let admitted = self.claims.admit(routine, assignments, diagnostics);
                (!admitted.is_empty()).then_some(admitted)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(routine, error = %err, "Routine update failed");
                diagnostics.push(Diagnostic::new(routine, err));
                None
            }
        };
        if terminal {
            self.claims.release(routine);
        }
        admitted
    }

    async fn commit(
        &mut self,
        batches: Vec<(String, Vec<Assignment>)>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let jobs = batches
            .into_iter()
            .map(|(_, assignments)| commit_assignments(self.variables.clone(), assignments).boxed())
            .collect();

        for outcome in self.pool.run(jobs).await {
            match outcome {
                Ok(results) => {
                    for (knob, result) in results {
                        if let Err(err) = result {
                            self.record_failure(&knob, err, diagnostics);
                        }
                    }
                }
                Err(err) => diagnostics.push(Diagnostic::new("scheduler", err)),
            }
        }
    }

    /// Records a variable failure; terminates if it is fatal.
    fn record_failure(&mut self, variable: &str, err: DaqError, diagnostics: &mut Vec<Diagnostic>) {
        if is_fatal(&self.settings, self.variables.get(variable), &err) {
            self.supervisor
                .terminate(TerminateReason::Failure(format!("{}: {}", variable, err)), None);
        } else {
            warn!(variable, error = %err, "Variable operation failed");
        }
        diagnostics.push(Diagnostic::new(variable, err));
    }

    fn cached_values(&self) -> Vec<(String, Option<Value>)> {
        self.variables
            .iter()
            .map(|v| (v.name().to_string(), v.cached()))
            .collect()
    }

    /// Refresh fan-out over every non-expression variable, then expressions in order.
    ///
    /// With `watched`, instrument and remote reads and expression evaluations are limited
    /// to the named variables; the rest come back without a value.
    async fn refresh(
        &mut self,
        watched: Option<&HashSet<String>>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<(String, Option<Value>)> {
        let direct: Vec<Arc<Variable>> = self
            .variables
            .iter()
            .filter(|v| !v.is_expression() && polled(v, watched))
            .cloned()
            .collect();
        let jobs = direct
            .iter()
            .map(|variable| {
                let variable = variable.clone();
                async move { variable.get().await }.boxed()
            })
            .collect();
        let results = self.pool.run(jobs).await;

        let mut fresh: HashMap<String, Option<Value>> = HashMap::with_capacity(self.variables.len());
        for (variable, outcome) in direct.iter().zip(results) {
            let value = match outcome {
                Ok(Ok(value)) => Some(value),
                Ok(Err(DaqError::NoValue(_))) => None,
                Ok(Err(err)) => {
                    self.record_failure(variable.name(), err, diagnostics);
                    None
                }
                Err(err) => {
                    diagnostics.push(Diagnostic::new(variable.name(), err));
                    None
                }
            };
            fresh.insert(variable.name().to_string(), value);
        }

        fresh.extend(evaluate_expressions(&self.variables, watched, diagnostics));
        self.variables
            .iter()
            .map(|v| {
                let value = fresh.remove(v.name()).flatten();
                (v.name().to_string(), value)
            })
            .collect()
    }

    fn evaluate_alarms(&mut self, state: &mut State) {
        for alarm in &mut self.alarms {
            let (transition, error) = alarm.evaluate(state);
            if let Some(err) = error {
                state.diagnostics.push(Diagnostic::new(alarm.name(), err));
            }
            match transition {
                AlarmTransition::Triggered => {
                    self.supervisor.alarm_triggered(alarm.name(), alarm.protocol())
                }
                AlarmTransition::Cleared => self.supervisor.alarm_cleared(alarm.name()),
                AlarmTransition::Unchanged => {}
            }
        }
    }

    fn publish(&mut self, state: State, cadence: &mut Cadence) {
        let state = Arc::new(state);
        for sink in &mut self.sinks {
            if let Err(err) = sink.record(&state) {
                error!(error = %err, "Sink failed to record state");
            }
        }

        let now = Instant::now();
        if now >= cadence.flush_at {
            for sink in &mut self.sinks {
                if let Err(err) = sink.flush() {
                    error!(error = %err, "Sink flush failed");
                }
            }
            cadence.flush_at = now + self.settings.save_interval;
        }
        if let (Some(split_at), Some(every)) = (cadence.split_at, self.settings.split_interval) {
            if now >= split_at {
                for sink in &mut self.sinks {
                    if let Err(err) = sink.split() {
                        error!(error = %err, "Sink split failed");
                    }
                }
                cadence.split_at = Some(now + every);
            }
        }
        let plot_due = cadence
            .last_plot
            .map_or(true, |last| now.duration_since(last) >= self.settings.plot_interval);
        if plot_due || self.supervisor.is_terminated() {
            self.live_tx.send_replace(state.clone());
            cadence.last_plot = Some(now);
        }
        self.latest = state;
    }

    async fn teardown(&mut self) {
        self.supervisor.terminate(TerminateReason::Requested, None);
        for sink in &mut self.sinks {
            if let Err(err) = sink.close() {
                error!(error = %err, "Sink close failed");
            }
        }
        if let Err(err) = self.variables.shutdown().await {
            error!(error = %err, "Teardown reported errors");
        }
        self.live_tx.send_replace(self.latest.clone());
    }
}

async fn commit_assignments(
    variables: Arc<VariableSet>,
    assignments: Vec<Assignment>,
) -> Vec<(String, AppResult<Value>)> {
    let mut results = Vec::with_capacity(assignments.len());
    for (knob, value) in assignments {
        let result = match variables.get(&knob) {
            Some(variable) => variable.set(value).await,
            None => Err(DaqError::Configuration(format!("unknown knob '{}'", knob))),
        };
        results.push((knob, result));
    }
    results
}

/// Whether `variable` is read under the `watched` restriction.
fn polled(variable: &Variable, watched: Option<&HashSet<String>>) -> bool {
    match watched {
        Some(watched) => {
            !(variable.performs_io() || variable.is_expression()) || watched.contains(variable.name())
        }
        None => true,
    }
}

fn evaluate_expressions(
    variables: &VariableSet,
    watched: Option<&HashSet<String>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<(String, Option<Value>)> {
    variables
        .expressions_in_order()
        .filter(|variable| polled(variable, watched))
        .map(|variable| {
            let value = match &**variable {
                Variable::Expression(expression) => match expression.evaluate() {
                    Ok(value) => Some(value),
                    Err(err) => {
                        diagnostics.push(Diagnostic::new(variable.name(), err));
                        None
                    }
                },
                _ => variable.cached(),
            };
            (variable.name().to_string(), value)
        })
        .collect()
}

fn is_fatal(settings: &SchedulerSettings, variable: Option<&Arc<Variable>>, err: &DaqError) -> bool {
    err.is_communication()
        && (settings.fatal_errors || variable.map_or(false, |v| v.is_critical()))
}

/// Builds schedulers from runcard references; implemented by the experiment loader.
pub trait RuncardLoader: Send {
    fn load(&mut self, runcard: &str) -> AppResult<Scheduler>;
}

/// Runs `first`, then every follow-up experiment its terminate alarms name.
pub async fn run_chain(
    first: Scheduler,
    loader: &mut dyn RuncardLoader,
) -> AppResult<Vec<RunOutcome>> {
    let mut outcomes = Vec::new();
    let mut next = Some(first);
    while let Some(scheduler) = next.take() {
        let outcome = scheduler.run().await?;
        if let Some(runcard) = &outcome.follow_up {
            info!(runcard = %runcard, "Starting follow-up experiment");
            next = Some(loader.load(runcard)?);
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
