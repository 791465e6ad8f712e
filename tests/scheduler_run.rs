//! End-to-end scheduler runs against simulated instruments.

use daq_engine::adapters::{ChannelHandle, MockTransport};
use daq_engine::alarm::{Alarm, Protocol};
use daq_engine::config::SchedulerSettings;
use daq_engine::core::Value;
use daq_engine::error::{AppResult, DaqError};
use daq_engine::error_recovery::RetryPolicy;
use daq_engine::instrument::Instrument;
use daq_engine::routine::{Routine, Sequence, Set, Setpoint, Trajectory, Window};
use daq_engine::scheduler::{
    run_chain, Lifecycle, MemorySink, RuncardLoader, Scheduler, TerminateReason,
};
use daq_engine::variable::{Expression, Knob, Meter, Parameter, Variable, VariableSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn settings(step_ms: u64) -> SchedulerSettings {
    SchedulerSettings {
        step_interval: Duration::from_millis(step_ms),
        plot_interval: Duration::ZERO,
        ..SchedulerSettings::default()
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        max_reconnects: 1,
        timeout: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(1),
    }
}

fn supply(mock: &MockTransport) -> Arc<Instrument> {
    let channel = ChannelHandle::spawn("supply", mock.clone(), fast_policy());
    Instrument::builder("supply", channel)
        .knob("voltage", "VOLT {value}", None)
        .meter("current", "CURR?")
        .postset("voltage", 0.0)
        .build()
        .unwrap()
}

fn count_calls(mock: &MockTransport, prefix: &str) -> usize {
    mock.call_log().iter().filter(|c| c.starts_with(prefix)).count()
}

fn sequence_routine(interval: f64, end: f64) -> Routine {
    let steps = vec![Setpoint::from(1.0), Setpoint::from(2.0), Setpoint::from(3.0)];
    Routine::new(
        "steps",
        Trajectory::Sequence(Sequence::new(interval, [("v", steps)]).unwrap()),
    )
    .with_window(Window::new(0.0, end).unwrap())
}

fn power_variables(instrument: Arc<Instrument>) -> VariableSet {
    VariableSet::new(vec![
        Variable::from(Knob::new("v", instrument.clone(), "voltage").unwrap()),
        Variable::from(Meter::new("i", instrument, "current").unwrap()),
        Variable::from(Expression::new("p", "a * b", [("a", "v"), ("b", "i")]).unwrap()),
    ])
    .unwrap()
}

async fn run_sequence(async_mode: bool) {
    let mock = MockTransport::new("supply");
    mock.set_register("CURR", "0.5");
    let sink = MemorySink::new();
    let settings = SchedulerSettings {
        async_mode,
        ..settings(10)
    };
    let scheduler = Scheduler::new(
        settings,
        power_variables(supply(&mock)),
        vec![sequence_routine(0.05, 0.3)],
        Vec::new(),
    )
    .unwrap()
    .with_sink(sink.clone());

    let outcome = timeout(Duration::from_secs(5), scheduler.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.reason, TerminateReason::RoutinesComplete);
    assert!(outcome.follow_up.is_none());

    let states = sink.states();
    assert!(!states.is_empty());
    assert_eq!(states.len() as u64, outcome.iterations);
    for pair in states.windows(2) {
        assert!(pair[1].iteration > pair[0].iteration);
        assert!(pair[1].time >= pair[0].time);
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    let last = states.last().unwrap();
    assert_eq!(last.value_f64("v"), Some(3.0));
    assert_eq!(last.value_f64("i"), Some(0.5));
    assert_eq!(last.value_f64("p"), Some(1.5));

    // postset applied at teardown
    assert_eq!(mock.register("VOLT").as_deref(), Some("0"));
    assert!(!mock.is_connected());
}

#[tokio::test]
async fn synchronous_run_completes_with_routines() {
    run_sequence(false).await;
}

#[tokio::test]
async fn asynchronous_run_completes_with_routines() {
    run_sequence(true).await;
}

#[tokio::test]
async fn hold_alarm_suppresses_routines_but_keeps_refreshing() {
    let mock = MockTransport::new("bench");
    mock.set_register("RATIO", "0.9");
    let channel = ChannelHandle::spawn("bench", mock.clone(), fast_policy());
    let instrument = Instrument::builder("bench", channel)
        .knob("output", "OUT {value}", None)
        .meter("ratio", "RATIO?")
        .build()
        .unwrap();
    let variables = VariableSet::new(vec![
        Variable::from(Knob::new("k", instrument.clone(), "output").unwrap()),
        Variable::from(Meter::new("m", instrument, "ratio").unwrap()),
        Variable::from(Expression::new("r", "x", [("x", "m")]).unwrap()),
    ])
    .unwrap();
    let routine = Routine::new(
        "drive",
        Trajectory::Set(Set::new([("k", Setpoint::from(1.0))]).unwrap()),
    );
    let alarm = Alarm::new("ratio high", "r > 1", [("r", "r")], Protocol::Hold).unwrap();
    let sink = MemorySink::new();
    let scheduler = Scheduler::new(settings(10), variables, vec![routine], vec![alarm])
        .unwrap()
        .with_sink(sink.clone());
    let handle = scheduler.handle();
    let run = tokio::spawn(scheduler.run());

    sleep(Duration::from_millis(100)).await;
    assert!(count_calls(&mock, "write OUT") > 0);
    mock.set_register("RATIO", "1.1");
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Holding))
        .await
        .unwrap()
        .unwrap();

    let writes = count_calls(&mock, "write OUT");
    let reads = count_calls(&mock, "query RATIO?");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(count_calls(&mock, "write OUT"), writes);
    assert!(count_calls(&mock, "query RATIO?") > reads);

    mock.set_register("RATIO", "0.9");
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Running))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(count_calls(&mock, "write OUT") > writes);

    handle.terminate().await.unwrap();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminateReason::Requested);

    let lifecycles: Vec<Lifecycle> = sink.states().iter().map(|s| s.lifecycle).collect();
    let holds = lifecycles
        .windows(2)
        .filter(|w| w[0] == Lifecycle::Running && w[1] == Lifecycle::Holding)
        .count();
    assert_eq!(holds, 1);
}

fn oven(mock: &MockTransport) -> VariableSet {
    let channel = ChannelHandle::spawn("oven", mock.clone(), fast_policy());
    let instrument = Instrument::builder("oven", channel)
        .knob("output", "OUT {value}", None)
        .meter("temperature", "TEMP?")
        .meter("pressure", "PRES?")
        .build()
        .unwrap();
    VariableSet::new(vec![
        Variable::from(Knob::new("k", instrument.clone(), "output").unwrap()),
        Variable::from(Meter::new("temp", instrument.clone(), "temperature").unwrap()),
        Variable::from(Meter::new("pres", instrument, "pressure").unwrap()),
    ])
    .unwrap()
}

fn heater() -> Routine {
    Routine::new(
        "heat",
        Trajectory::Set(Set::new([("k", Setpoint::from(1.0))]).unwrap()),
    )
}

async fn stop_alarm_resumes_when_cleared(async_mode: bool) {
    let mock = MockTransport::new("oven");
    mock.set_register("TEMP", "0.5");
    mock.set_register("PRES", "1.0");
    let alarm = Alarm::new("too hot", "x > 1", [("x", "temp")], Protocol::Stop).unwrap();
    let settings = SchedulerSettings {
        async_mode,
        ..settings(10)
    };
    let scheduler = Scheduler::new(settings, oven(&mock), vec![heater()], vec![alarm]).unwrap();
    let handle = scheduler.handle();
    let run = tokio::spawn(scheduler.run());

    sleep(Duration::from_millis(60)).await;
    mock.set_register("TEMP", "2.0");
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Stopped))
        .await
        .unwrap()
        .unwrap();

    sleep(Duration::from_millis(30)).await;
    let writes = count_calls(&mock, "write OUT");
    let pressure_reads = count_calls(&mock, "query PRES?");
    let temperature_reads = count_calls(&mock, "query TEMP?");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(count_calls(&mock, "write OUT"), writes);
    assert_eq!(count_calls(&mock, "query PRES?"), pressure_reads);
    assert!(count_calls(&mock, "query TEMP?") > temperature_reads);
    let stopped = handle.latest();
    assert_eq!(stopped.lifecycle, Lifecycle::Stopped);
    assert_eq!(stopped.value_f64("temp"), Some(2.0));
    assert_eq!(stopped.value("pres"), None);

    mock.set_register("TEMP", "0.5");
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Running))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(count_calls(&mock, "write OUT") > writes);
    assert!(count_calls(&mock, "query PRES?") > pressure_reads);
    assert_eq!(handle.latest().value_f64("temp"), Some(0.5));

    handle.terminate().await.unwrap();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminateReason::Requested);
}

#[tokio::test]
async fn stop_alarm_polls_its_condition_and_resumes() {
    stop_alarm_resumes_when_cleared(false).await;
}

#[tokio::test]
async fn stop_alarm_resumes_in_asynchronous_mode() {
    stop_alarm_resumes_when_cleared(true).await;
}

#[tokio::test]
async fn check_alarm_waits_for_explicit_resume() {
    let variables = VariableSet::new(vec![Variable::from(Parameter::new("fault", false))]).unwrap();
    let alarm = Alarm::new("interlock", "f", [("f", "fault")], Protocol::Check).unwrap();
    let scheduler = Scheduler::new(settings(10), variables, Vec::new(), vec![alarm]).unwrap();
    let handle = scheduler.handle();
    let access = scheduler.access();
    let run = tokio::spawn(scheduler.run());

    sleep(Duration::from_millis(30)).await;
    access.set("fault", Value::Boolean(true)).await.unwrap();
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Stopped))
        .await
        .unwrap()
        .unwrap();

    access.set("fault", Value::Boolean(false)).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
    assert_eq!(handle.latest().value("fault"), Some(&Value::Boolean(false)));

    handle.resume().await.unwrap();
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Running))
        .await
        .unwrap()
        .unwrap();

    handle.terminate().await.unwrap();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminateReason::Requested);
}

#[tokio::test]
async fn unreadable_alarm_condition_counts_as_clear() {
    let mock = MockTransport::new("oven");
    mock.set_register("TEMP", "2.0");
    mock.set_register("PRES", "1.0");
    let alarm = Alarm::new("too hot", "x > 1", [("x", "temp")], Protocol::Hold).unwrap();
    let sink = MemorySink::new();
    let scheduler = Scheduler::new(settings(10), oven(&mock), Vec::new(), vec![alarm])
        .unwrap()
        .with_sink(sink.clone());
    let handle = scheduler.handle();
    let run = tokio::spawn(scheduler.run());

    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Holding))
        .await
        .unwrap()
        .unwrap();
    mock.set_always_fail(true);
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Running))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    handle.terminate().await.unwrap();
    run.await.unwrap().unwrap();
    let states = sink.states();
    assert!(states
        .iter()
        .any(|s| s.value("temp").is_none() && s.diagnostics_for("too hot").count() == 1));
    let lifecycles: Vec<Lifecycle> = states.iter().map(|s| s.lifecycle).collect();
    assert!(lifecycles
        .windows(2)
        .any(|w| w[0] == Lifecycle::Holding && w[1] == Lifecycle::Running));
}

#[tokio::test]
async fn held_run_freezes_experiment_time() {
    let variables = VariableSet::new(vec![Variable::from(Parameter::new("setpoint", 1.0))]).unwrap();
    let sink = MemorySink::new();
    let scheduler = Scheduler::new(settings(10), variables, Vec::new(), Vec::new())
        .unwrap()
        .with_sink(sink.clone());
    let handle = scheduler.handle();
    let run = tokio::spawn(scheduler.run());

    sleep(Duration::from_millis(50)).await;
    handle.hold().await.unwrap();
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Holding))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(30)).await;
    let frozen = handle.latest().time;
    sleep(Duration::from_millis(80)).await;
    assert_eq!(handle.latest().time, frozen);
    assert_eq!(handle.latest().lifecycle, Lifecycle::Holding);

    handle.resume().await.unwrap();
    timeout(Duration::from_secs(2), handle.wait_for(Lifecycle::Running))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(handle.latest().time > frozen);

    handle.terminate().await.unwrap();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminateReason::Requested);
    assert!(handle.hold().await.is_err());
    assert!(!sink.is_empty());
}

#[tokio::test]
async fn critical_knob_failure_terminates_run() {
    let mock = MockTransport::new("supply");
    let instrument = supply(&mock);
    let variables = VariableSet::new(vec![Variable::from(
        Knob::new("v", instrument, "voltage").unwrap().critical(),
    )])
    .unwrap();
    let routine = Routine::new(
        "drive",
        Trajectory::Set(Set::new([("v", Setpoint::from(5.0))]).unwrap()),
    );
    mock.set_always_fail(true);
    let scheduler = Scheduler::new(settings(10), variables, vec![routine], Vec::new()).unwrap();

    let outcome = timeout(Duration::from_secs(5), scheduler.run())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome.reason, TerminateReason::Failure(_)));
}

#[tokio::test]
async fn meter_failures_become_diagnostics() {
    let mock = MockTransport::new("supply");
    let instrument = supply(&mock);
    let variables = VariableSet::new(vec![Variable::from(
        Meter::new("i", instrument, "current").unwrap(),
    )])
    .unwrap();
    mock.set_always_fail(true);
    let sink = MemorySink::new();
    let settings = SchedulerSettings {
        end: Some(Duration::from_millis(80)),
        ..settings(10)
    };
    let scheduler = Scheduler::new(settings, variables, Vec::new(), Vec::new())
        .unwrap()
        .with_sink(sink.clone());

    let outcome = timeout(Duration::from_secs(5), scheduler.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.reason, TerminateReason::EndReached);
    let states = sink.states();
    assert!(states.len() > 1);
    assert!(states.iter().all(|s| s.value("i").is_none()));
    assert!(states.iter().all(|s| s.diagnostics_for("i").count() == 1));
}

#[tokio::test]
async fn first_routine_keeps_control_of_a_knob() {
    let variables = VariableSet::new(vec![Variable::from(Parameter::new("level", 0.0))]).unwrap();
    let first = Routine::new(
        "first",
        Trajectory::Set(Set::new([("level", Setpoint::from(1.0))]).unwrap()),
    );
    let second = Routine::new(
        "second",
        Trajectory::Set(Set::new([("level", Setpoint::from(2.0))]).unwrap()),
    );
    let sink = MemorySink::new();
    let settings = SchedulerSettings {
        end: Some(Duration::from_millis(60)),
        ..settings(10)
    };
    let scheduler = Scheduler::new(settings, variables, vec![first, second], Vec::new())
        .unwrap()
        .with_sink(sink.clone());
    let access = scheduler.access();

    scheduler.run().await.unwrap();
    let states = sink.states();
    assert!(states.iter().all(|s| s.value_f64("level") == Some(1.0)));
    assert!(states.iter().any(|s| s.diagnostics_for("second").count() > 0));
    assert_eq!(access.get("level").unwrap().as_f64(), Some(1.0));
}

struct FollowUps {
    loaded: Vec<String>,
}

impl RuncardLoader for FollowUps {
    fn load(&mut self, runcard: &str) -> AppResult<Scheduler> {
        self.loaded.push(runcard.to_string());
        let variables = VariableSet::new(vec![Variable::from(Parameter::new("x", 0.0))])?;
        let settings = SchedulerSettings {
            end: Some(Duration::from_millis(30)),
            ..settings(10)
        };
        Scheduler::new(settings, variables, Vec::new(), Vec::new())
    }
}

#[tokio::test]
async fn terminate_alarm_chains_follow_up_experiment() {
    let variables = VariableSet::new(vec![Variable::from(Parameter::new("done", true))]).unwrap();
    let alarm = Alarm::new(
        "finished",
        "flag",
        [("flag", "done")],
        Protocol::Terminate {
            follow_up: Some("cooldown.toml".to_string()),
        },
    )
    .unwrap();
    let first = Scheduler::new(settings(10), variables, Vec::new(), vec![alarm]).unwrap();
    let mut loader = FollowUps { loaded: Vec::new() };

    let outcomes = timeout(Duration::from_secs(5), run_chain(first, &mut loader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].reason, TerminateReason::Alarm("finished".to_string()));
    assert_eq!(outcomes[0].follow_up.as_deref(), Some("cooldown.toml"));
    assert_eq!(outcomes[1].reason, TerminateReason::EndReached);
    assert_eq!(loader.loaded, vec!["cooldown.toml".to_string()]);
}

#[test]
fn routine_targets_must_be_settable() {
    let unknown = VariableSet::new(vec![Variable::from(Parameter::new("x", 0.0))]).unwrap();
    let routine = Routine::new(
        "drive",
        Trajectory::Set(Set::new([("missing", Setpoint::from(1.0))]).unwrap()),
    );
    assert!(matches!(
        Scheduler::new(settings(10), unknown, vec![routine], Vec::new()),
        Err(DaqError::Configuration(_))
    ));

    let computed = VariableSet::new(vec![
        Variable::from(Parameter::new("x", 0.0)),
        Variable::from(Expression::new("y", "a + 1", [("a", "x")]).unwrap()),
    ])
    .unwrap();
    let routine = Routine::new(
        "drive",
        Trajectory::Set(Set::new([("y", Setpoint::from(1.0))]).unwrap()),
    );
    assert!(matches!(
        Scheduler::new(settings(10), computed, vec![routine], Vec::new()),
        Err(DaqError::NotSettable(_))
    ));
}
