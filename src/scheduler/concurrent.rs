//! Asynchronous scheduling.
//!
//! Each routine and each instrument-backed variable runs its own loop on the step
//! interval. Routine loops read the latest published snapshot; variable loops refresh
//! caches. The main loop composes states from the caches, evaluates expressions and
//! alarms, and publishes. There is no per-iteration barrier, so values within one state
//! may come from different moments. While stopped, only the variables alarm conditions
//! read keep refreshing.

use super::{
    commit_assignments, evaluate_expressions, is_fatal, polled, Cadence, Claims, Clock, Diagnostic,
    Lifecycle, Scheduler, State, TerminateReason,
};
use crate::config::SchedulerSettings;
use crate::core::Value;
use crate::error::DaqError;
use crate::routine::Routine;
use crate::variable::{Variable, VariableSet};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// State shared between the main loop and the worker loops.
#[derive(Clone)]
struct Shared {
    settings: SchedulerSettings,
    variables: Arc<VariableSet>,
    claims: Arc<Claims>,
    clock: Arc<Clock>,
    latest: Arc<Mutex<Arc<State>>>,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
    watched: Arc<HashSet<String>>,
    failures: mpsc::UnboundedSender<String>,
}

impl Shared {
    fn report(&self, source: &str, err: DaqError) {
        if is_fatal(&self.settings, self.variables.get(source), &err) {
            let message = format!("{}: {}", source, err);
            if self.failures.send(message).is_err() {
                warn!(source, "Fatal failure reported after the run ended");
            }
        } else {
            warn!(source, error = %err, "Variable operation failed");
        }
        self.diagnostics.lock().push(Diagnostic::new(source, err));
    }
}

/// Waits for the next tick. Returns the lifecycle to act under, or `None` once
/// terminated.
async fn next_tick(
    ticker: &mut tokio::time::Interval,
    lifecycle: &mut watch::Receiver<Lifecycle>,
) -> Option<Lifecycle> {
    loop {
        tokio::select! {
            _ = ticker.tick() => break,
            changed = lifecycle.changed() => {
                if changed.is_err() {
                    return None;
                }
                if *lifecycle.borrow() == Lifecycle::Terminated {
                    return None;
                }
            }
        }
    }
    let current = *lifecycle.borrow();
    (current != Lifecycle::Terminated).then_some(current)
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn variable_loop(
    shared: Shared,
    variable: Arc<Variable>,
    mut lifecycle: watch::Receiver<Lifecycle>,
) {
    let mut ticker = ticker(shared.settings.step_interval);
    while let Some(current) = next_tick(&mut ticker, &mut lifecycle).await {
        if current == Lifecycle::Stopped && !shared.watched.contains(variable.name()) {
            continue;
        }
        match variable.get().await {
            Ok(_) | Err(DaqError::NoValue(_)) => {}
            Err(err) => shared.report(variable.name(), err),
        }
    }
    debug!(variable = %variable.name(), "Refresh loop exited");
}

async fn routine_loop(
    shared: Shared,
    routine: Arc<Mutex<Routine>>,
    mut lifecycle: watch::Receiver<Lifecycle>,
) {
    let mut ticker = ticker(shared.settings.step_interval);
    while let Some(current) = next_tick(&mut ticker, &mut lifecycle).await {
        if current != Lifecycle::Running {
            continue;
        }
        let view = {
            let latest = shared.latest.lock().clone();
            State {
                time: shared.clock.seconds(),
                ..(*latest).clone()
            }
        };
        let (name, result, terminal) = {
            let mut routine = routine.lock();
            let result = routine.update(&view);
            (routine.name().to_string(), result, routine.is_terminal())
        };
        let assignments = match result {
            Ok(Some(assignments)) => {
                let mut dropped = Vec::new();
                let admitted = shared.claims.admit(&name, assignments, &mut dropped);
                shared.diagnostics.lock().extend(dropped);
                admitted
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(routine = %name, error = %err, "Routine update failed");
                shared.diagnostics.lock().push(Diagnostic::new(&name, err));
                Vec::new()
            }
        };
        if terminal {
            shared.claims.release(&name);
        }
        for (knob, result) in commit_assignments(shared.variables.clone(), assignments).await {
            if let Err(err) = result {
                shared.report(&knob, err);
            }
        }
        if terminal {
            break;
        }
    }
    debug!("Routine loop exited");
}

/// Cached values for direct variables, fresh evaluations for expressions. With
/// `watched`, unwatched meters, remotes and expressions are left without a value.
fn compose(
    variables: &VariableSet,
    watched: Option<&HashSet<String>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<(String, Option<Value>)> {
    let mut evaluated: HashMap<String, Option<Value>> =
        evaluate_expressions(variables, watched, diagnostics)
            .into_iter()
            .collect();
    variables
        .iter()
        .map(|v| {
            let value = if v.is_expression() {
                evaluated.remove(v.name()).flatten()
            } else if polled(v, watched) {
                v.cached()
            } else {
                None
            };
            (v.name().to_string(), value)
        })
        .collect()
}

pub(super) async fn run(scheduler: &mut Scheduler) {
    let (failures, mut failure_rx) = mpsc::unbounded_channel();
    let shared = Shared {
        settings: scheduler.settings.clone(),
        variables: scheduler.variables.clone(),
        claims: scheduler.claims.clone(),
        clock: scheduler.supervisor.clock.clone(),
        latest: Arc::new(Mutex::new(scheduler.latest.clone())),
        diagnostics: Arc::new(Mutex::new(Vec::new())),
        watched: scheduler.watched.clone(),
        failures,
    };

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for variable in scheduler.variables.iter().filter(|v| v.performs_io()) {
        handles.push(tokio::spawn(variable_loop(
            shared.clone(),
            variable.clone(),
            scheduler.supervisor.lifecycle_tx.subscribe(),
        )));
    }
    for routine in &scheduler.routines {
        handles.push(tokio::spawn(routine_loop(
            shared.clone(),
            routine.clone(),
            scheduler.supervisor.lifecycle_tx.subscribe(),
        )));
    }

    let mut cadence = Cadence::new(&scheduler.settings);
    loop {
        let started = tokio::time::Instant::now();
        while let Ok(message) = failure_rx.try_recv() {
            scheduler
                .supervisor
                .terminate(TerminateReason::Failure(message), None);
        }
        if scheduler.between_iterations() {
            break;
        }

        let time = scheduler.supervisor.clock.seconds();
        let mut diagnostics = std::mem::take(&mut *shared.diagnostics.lock());
        let watched = (scheduler.supervisor.lifecycle == Lifecycle::Stopped)
            .then(|| scheduler.watched.clone());
        let values = compose(&scheduler.variables, watched.as_deref(), &mut diagnostics);
        let state = scheduler.snapshot(time, values, diagnostics);
        scheduler.publish(state, &mut cadence);
        *shared.latest.lock() = scheduler.latest.clone();

        if scheduler.check_completion() {
            break;
        }
        tokio::time::sleep_until(started + scheduler.settings.step_interval).await;
    }

    for result in futures::future::join_all(handles).await {
        if let Err(err) = result {
            error!(error = %err, "Worker loop failed");
        }
    }
}
