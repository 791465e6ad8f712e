//! Channel retry, reconnect and serialization behaviour.

use daq_engine::adapters::{ChannelHandle, MockTransport};
use daq_engine::error::DaqError;
use daq_engine::error_recovery::RetryPolicy;
use daq_engine::instrument::Instrument;
use daq_engine::variable::{Knob, Meter, Variable};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn policy(max_attempts: u32, max_reconnects: u32, timeout: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        max_reconnects,
        timeout,
        reconnect_delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn exhausted_channel_reports_every_attempt_and_reconnect() {
    let mock = MockTransport::new("dead");
    mock.set_always_fail(true);
    let channel = ChannelHandle::spawn(
        "dead",
        mock.clone(),
        policy(3, 2, Duration::from_millis(200)),
    );

    let result = channel.query("VOLT?", None).await;
    match result {
        Err(DaqError::Communication {
            channel,
            attempts,
            reconnects,
            ..
        }) => {
            assert_eq!(channel, "dead");
            assert_eq!(attempts, 6);
            assert_eq!(reconnects, 2);
        }
        other => panic!("expected communication error, got {:?}", other),
    }
    assert_eq!(mock.attempts(), 6);
    assert_eq!(mock.connects(), 2);
    assert_eq!(mock.disconnects(), 2);
}

#[tokio::test]
async fn timeouts_count_as_failed_attempts() {
    let mock = MockTransport::new("slow").with_latency(Duration::from_millis(200));
    let channel = ChannelHandle::spawn("slow", mock.clone(), policy(2, 1, Duration::from_millis(20)));

    match channel.write("VOLT 1").await {
        Err(DaqError::Communication { attempts, last, .. }) => {
            assert_eq!(attempts, 2);
            assert!(last.contains("timed out"), "last error was {}", last);
        }
        other => panic!("expected communication error, got {:?}", other),
    }
}

#[tokio::test]
async fn recovered_operation_after_reconnect() {
    let mock = MockTransport::new("flaky");
    mock.set_register("CURR", "0.25");
    mock.fail_next(2);
    let channel = ChannelHandle::spawn("flaky", mock.clone(), policy(2, 2, Duration::from_millis(200)));

    assert_eq!(channel.query("CURR?", None).await.unwrap(), "0.25");
    assert_eq!(mock.attempts(), 3);
    assert_eq!(mock.connects(), 1);
}

#[tokio::test]
async fn variables_on_one_channel_never_overlap() {
    let mock = MockTransport::new("shared").with_latency(Duration::from_millis(2));
    mock.set_register("CURR", "0.5");
    let channel = ChannelHandle::spawn("shared", mock.clone(), policy(3, 1, Duration::from_secs(1)));
    let instrument = Instrument::builder("supply", channel)
        .knob("voltage", "VOLT {value}", None)
        .meter("current", "CURR?")
        .build()
        .unwrap();
    instrument.connect().await.unwrap();

    let knob = Arc::new(Variable::from(Knob::new("v", instrument.clone(), "voltage").unwrap()));
    let meter = Arc::new(Variable::from(Meter::new("i", instrument.clone(), "current").unwrap()));

    let calls = (0..20).map(|n| {
        let knob = knob.clone();
        let meter = meter.clone();
        tokio::spawn(async move {
            if n % 2 == 0 {
                knob.set((n as f64).into()).await
            } else {
                meter.get().await
            }
        })
    });
    for result in join_all(calls).await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(mock.peak_in_flight(), 1);
    assert_eq!(mock.attempts(), 20);
    let volt = mock.register("VOLT").unwrap();
    assert!(volt.parse::<f64>().is_ok(), "corrupted register value {:?}", volt);
}
