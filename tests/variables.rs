//! Variable behaviour against simulated instruments and a remote engine.

use daq_engine::adapters::{ChannelHandle, MockTransport, TcpTransport};
use daq_engine::config::SchedulerSettings;
use daq_engine::core::Value;
use daq_engine::error::DaqError;
use daq_engine::error_recovery::RetryPolicy;
use daq_engine::instrument::Instrument;
use daq_engine::scheduler::Scheduler;
use daq_engine::server::SocketServer;
use daq_engine::variable::{Expression, Knob, Limits, Meter, Parameter, Remote, Variable, VariableSet};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn supply(mock: &MockTransport) -> std::sync::Arc<Instrument> {
    let channel = ChannelHandle::spawn("supply", mock.clone(), RetryPolicy::default());
    Instrument::builder("supply", channel)
        .knob("voltage", "VOLT {value}", None)
        .meter("current", "CURR?")
        .build()
        .unwrap()
}

#[tokio::test]
async fn knob_commits_nearest_bound() {
    let mock = MockTransport::new("supply");
    let instrument = supply(&mock);
    let knob = Variable::from(
        Knob::new("v", instrument, "voltage")
            .unwrap()
            .with_limits(Limits::new(Some(0.0), Some(10.0)).unwrap()),
    );

    assert_eq!(knob.set(Value::Float(15.0)).await.unwrap(), Value::Float(10.0));
    assert_eq!(knob.cached(), Some(Value::Float(10.0)));
    assert_eq!(mock.register("VOLT").as_deref(), Some("10"));

    assert_eq!(knob.set(Value::Float(-3.0)).await.unwrap(), Value::Float(0.0));
    assert_eq!(knob.get().await.unwrap(), Value::Float(0.0));

    assert_eq!(knob.set(Value::Float(4.5)).await.unwrap(), Value::Float(4.5));
}

#[tokio::test]
async fn expression_evaluation_does_no_io() {
    let mock = MockTransport::new("supply");
    mock.set_register("CURR", "0.5");
    let instrument = supply(&mock);
    let variables = VariableSet::new(vec![
        Variable::from(Parameter::new("v", 2.0)),
        Variable::from(Meter::new("i", instrument, "current").unwrap()),
        Variable::from(Expression::new("p", "a * b", [("a", "v"), ("b", "i")]).unwrap()),
    ])
    .unwrap();

    variables.get("i").unwrap().get().await.unwrap();
    let attempts = mock.attempts();

    let expression = variables.get("p").unwrap();
    let first = expression.get().await.unwrap();
    let second = expression.get().await.unwrap();
    assert_eq!(first, Value::Float(1.0));
    assert_eq!(first, second);
    assert_eq!(mock.attempts(), attempts);
}

#[tokio::test]
async fn meters_and_expressions_refuse_writes() {
    let mock = MockTransport::new("supply");
    let instrument = supply(&mock);
    let meter = Variable::from(Meter::new("i", instrument, "current").unwrap());
    assert!(matches!(
        meter.set(Value::Float(1.0)).await,
        Err(DaqError::NotSettable(_))
    ));
    assert_eq!(mock.attempts(), 0);
}

#[tokio::test]
async fn expression_cycles_rejected_at_build() {
    let result = VariableSet::new(vec![
        Variable::from(Expression::new("a", "x + 1", [("x", "b")]).unwrap()),
        Variable::from(Expression::new("b", "y * 2", [("y", "a")]).unwrap()),
    ]);
    assert!(matches!(result, Err(DaqError::Expression(_))));
}

#[tokio::test]
async fn remote_variable_round_trip_through_socket_server() {
    let served = VariableSet::new(vec![
        Variable::from(Parameter::new("gain", 1.5)),
        Variable::from(Expression::new("double", "g * 2", [("g", "gain")]).unwrap()),
    ])
    .unwrap();
    let scheduler = Scheduler::new(SchedulerSettings::default(), served, Vec::new(), Vec::new()).unwrap();
    let access = scheduler.access();
    let server = SocketServer::bind("127.0.0.1:0", access.clone())
        .await
        .unwrap()
        .spawn()
        .unwrap();
    let address = server.local_addr().to_string();

    let policy = RetryPolicy {
        max_attempts: 2,
        max_reconnects: 1,
        timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(10),
    };
    let remote = |name: &str, alias: &str| {
        let channel = ChannelHandle::spawn(name, TcpTransport::new(address.clone()), policy.clone());
        Variable::from(Remote::new(name, alias, channel))
    };
    let proxies = VariableSet::new(vec![remote("g", "gain"), remote("d", "double")]).unwrap();
    assert_ok!(proxies.initialize().await);

    let gain = proxies.get("g").unwrap();
    assert!(gain.is_settable());
    assert_eq!(gain.get().await.unwrap(), Value::Float(1.5));
    assert_eq!(gain.set(Value::Float(2.5)).await.unwrap(), Value::Float(2.5));
    assert_eq!(access.get("gain").unwrap(), Value::Float(2.5));
    assert_eq!(gain.cached(), Some(Value::Float(2.5)));

    let double = proxies.get("d").unwrap();
    assert!(!double.is_settable());
    assert!(matches!(
        double.set(Value::Float(1.0)).await,
        Err(DaqError::NotSettable(_))
    ));

    assert_ok!(proxies.shutdown().await);
    assert_ok!(server.shutdown().await);
    assert_err!(gain.get().await);
}
