//! Channels and hardware objects wired through the dispatcher.

mod common;

use common::{ints, Recorder, RecordingSink, ScriptedTransport};
use futures::FutureExt;
use hwo_core::{
    Channel, ChannelOptions, EventDispatcher, EventLoop, HardwareObject, HardwareObjectSignal,
    HardwareObjectState, HwoError, ObserverId, PollEventKind, PollExpression, PollRequest,
    PollerRegistry, SampleChangerRule, StateAggregator, TimeoutPolicy, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Fixture {
    transport: Arc<ScriptedTransport>,
    registry: PollerRegistry,
    dispatcher: EventDispatcher,
    events: EventLoop,
}

impl Fixture {
    fn new(device: &str) -> Self {
        let dispatcher = EventDispatcher::new();
        let events = dispatcher.create_context("test");
        Self {
            transport: ScriptedTransport::new(device),
            registry: PollerRegistry::from_current().unwrap(),
            dispatcher,
            events,
        }
    }

    fn channel(&self, name: &str, attribute: &str, options: ChannelOptions) -> Channel {
        Channel::new(
            name,
            attribute,
            self.transport.as_transport(),
            options,
            self.dispatcher.clone(),
            self.registry.clone(),
        )
    }

    fn device(&self) -> hwo_core::DeviceId {
        self.transport.as_transport().device().clone()
    }
}

fn drain_signals(rx: &mut broadcast::Receiver<HardwareObjectSignal>) -> Vec<HardwareObjectSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

fn global_states(signals: &[HardwareObjectSignal]) -> Vec<String> {
    signals
        .iter()
        .filter_map(|s| match s {
            HardwareObjectSignal::GlobalStateChanged { global } => Some(global.status.clone()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Channel
// =============================================================================

#[tokio::test(start_paused = true)]
async fn subscribing_twice_delivers_once() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.script("Position", vec![Value::Int(1), Value::Int(2)]);
    let channel = fx.channel("position", "Position", ChannelOptions::polled(ms(100)));
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();

    channel.subscribe(id).unwrap();
    channel.subscribe(id).unwrap();
    assert_eq!(channel.subscriber_count(), 1);
    assert!(channel.is_polling());

    sleep(ms(150)).await;
    fx.events.drain();
    assert_eq!(
        recorder.events(),
        vec![(PollEventKind::Update, "position".to_string(), Value::Int(2))]
    );
    assert_eq!(channel.last_value(), Some(Value::Int(2)));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_is_safe_and_releases_the_poller() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1i64);
    let channel = fx.channel("position", "Position", ChannelOptions::polled(ms(100)));
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();

    channel.subscribe(id).unwrap();
    assert_eq!(fx.registry.poller_count(&fx.device()), 1);

    assert!(channel.unsubscribe(id));
    assert!(!channel.unsubscribe(id));
    assert_eq!(fx.registry.poller_count(&fx.device()), 0);
    assert!(!channel.is_polling());

    channel.subscribe(id).unwrap();
    assert_eq!(fx.registry.poller_count(&fx.device()), 1);
}

#[tokio::test(start_paused = true)]
async fn command_channel_reads_through_its_template() {
    let fx = Fixture::new("mock://sc");
    fx.transport.set("Powered", true);
    let options = ChannelOptions::polled(ms(100))
        .with_expression(hwo_core::PollExpression::command(r#"read("Powered")"#).unwrap());
    let channel = fx.channel("powered", "powered", options);

    assert_eq!(channel.read().await.unwrap(), Value::Bool(true));
    assert_eq!(channel.last_value(), Some(Value::Bool(true)));
}

#[tokio::test(start_paused = true)]
async fn channels_on_one_device_share_a_poller() {
    let fx = Fixture::new("mock://sc");
    fx.transport.set("State", "ON");
    fx.transport.set("Powered", true);
    let state = fx.channel("state", "State", ChannelOptions::polled(ms(100)));
    let powered = fx.channel("powered", "Powered", ChannelOptions::polled(ms(300)));
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();

    state.subscribe(id).unwrap();
    powered.subscribe(id).unwrap();

    let poller = fx.registry.poller(&fx.device()).unwrap();
    assert_eq!(fx.registry.poller_count(&fx.device()), 1);
    assert_eq!(poller.observer_count(), 2);
    assert_eq!(poller.interval(), Some(ms(100)));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_channel_tears_down_polling() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1i64);
    let channel = fx.channel("position", "Position", ChannelOptions::polled(ms(100)));
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();

    drop(channel);
    assert_eq!(fx.registry.poller_count(&fx.device()), 0);
}

#[tokio::test(start_paused = true)]
async fn dead_subscriber_is_dropped_silently_and_poller_stops() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1i64);
    let channel = fx.channel(
        "position",
        "Position",
        ChannelOptions::polled(ms(100)).with_compare(true),
    );
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();

    sleep(ms(50)).await;
    drop(recorder);
    sleep(ms(100)).await;

    assert_eq!(fx.events.drain(), 0);
    assert_eq!(channel.subscriber_count(), 0);
    assert_eq!(fx.registry.poller_count(&fx.device()), 0);
}

#[tokio::test(start_paused = true)]
async fn dead_subscriber_without_compare_stops_polling() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1i64);
    let channel = fx.channel("position", "Position", ChannelOptions::polled(ms(100)));
    let recorder = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &recorder, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();

    // Unchanged values are never delivered, so only the liveness check can
    // notice the subscriber is gone.
    sleep(ms(50)).await;
    drop(recorder);
    sleep(ms(100)).await;

    assert_eq!(fx.events.drain(), 0);
    assert_eq!(channel.subscriber_count(), 0);
    assert_eq!(fx.registry.poller_count(&fx.device()), 0);
    assert_eq!(fx.transport.reads("Position"), 1);

    // A later subscriber starts polling again.
    let again = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &again, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();
    assert!(channel.is_polling());
}

#[tokio::test(start_paused = true)]
async fn resubscribe_while_pruning_keeps_polling() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.script("Position", ints(&[1, 2, 3, 4, 5, 6]));
    let channel = fx.channel("position", "Position", ChannelOptions::polled(ms(100)));
    let first = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &first, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();

    // A slow neighbour keeps each tick busy for 50 ms after the channel.
    let slow = RecordingSink::new();
    let expression = PollExpression::custom("slow", |_| {
        async {
            sleep(ms(50)).await;
            Ok(Value::Int(0))
        }
        .boxed()
    });
    fx.registry
        .poll(
            &fx.transport.as_transport(),
            PollRequest::new(ObserverId::allocate(), slow.clone(), expression)
                .with_interval(ms(100)),
        )
        .unwrap();

    // The tick at 200 ms finds the channel dead and prunes it at 250 ms;
    // the new subscriber arrives in between.
    sleep(ms(120)).await;
    drop(first);
    sleep(ms(100)).await;

    let second = Recorder::new();
    let id = fx
        .dispatcher
        .register(fx.events.id(), &second, Recorder::on_event)
        .unwrap();
    channel.subscribe(id).unwrap();

    sleep(ms(330)).await;
    fx.events.drain();

    assert!(channel.is_polling());
    assert_eq!(fx.registry.poller_count(&fx.device()), 1);
    assert_eq!(
        second.events(),
        vec![
            (PollEventKind::Update, "position".to_string(), Value::Int(4)),
            (PollEventKind::Update, "position".to_string(), Value::Int(5)),
        ]
    );
}

// =============================================================================
// HardwareObject
// =============================================================================

fn actuator(fx: &Fixture, compare: bool) -> HardwareObject {
    let position = fx.channel(
        "position",
        "Position",
        ChannelOptions::polled(ms(100)).with_compare(compare),
    );
    let state = fx.channel("state", "State", ChannelOptions::polled(ms(100)));
    HardwareObject::builder("phi")
        .channel(position, TimeoutPolicy::Confirm)
        .channel(state, TimeoutPolicy::Confirm)
        .value_channel("position")
        .state_channel("state")
        .build(&fx.dispatcher, fx.events.id())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn init_emits_current_value_and_state_once() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    fx.transport.set("State", "ON");
    let phi = actuator(&fx, false);
    let mut rx = phi.subscribe();

    phi.init().await.unwrap();

    assert_eq!(phi.state(), HardwareObjectState::Ready);
    assert_eq!(
        drain_signals(&mut rx),
        vec![
            HardwareObjectSignal::ValueChanged {
                value: Value::Float(1.0)
            },
            HardwareObjectSignal::StateChanged {
                state: HardwareObjectState::Ready
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn updates_become_signals() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    fx.transport.set("State", "ON");
    let phi = actuator(&fx, true);
    phi.init().await.unwrap();
    let mut rx = phi.subscribe();

    // t=0 primes both channels, t=100 confirms the position.
    sleep(ms(150)).await;
    fx.events.drain();
    assert_eq!(
        drain_signals(&mut rx),
        vec![HardwareObjectSignal::ValueConfirmed {
            value: Value::Float(1.0)
        }]
    );

    fx.transport.set("Position", 2.0);
    fx.transport.set("State", "MOVING");
    sleep(ms(100)).await;
    fx.events.drain();
    let signals = drain_signals(&mut rx);
    assert!(signals.contains(&HardwareObjectSignal::ValueChanged {
        value: Value::Float(2.0)
    }));
    assert!(signals.contains(&HardwareObjectSignal::StateChanged {
        state: HardwareObjectState::Busy
    }));
    assert_eq!(signals.len(), 2);
    assert_eq!(phi.state(), HardwareObjectState::Busy);

    // Same raw state again: no duplicate stateChanged.
    sleep(ms(100)).await;
    fx.events.drain();
    assert!(drain_signals(&mut rx)
        .iter()
        .all(|s| !matches!(s, HardwareObjectSignal::StateChanged { .. })));
}

#[tokio::test(start_paused = true)]
async fn warn_policy_does_not_emit_confirmation() {
    let mut fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    let position = fx.channel(
        "position",
        "Position",
        ChannelOptions::polled(ms(100)).with_compare(true),
    );
    let phi = HardwareObject::builder("phi")
        .channel(position, TimeoutPolicy::Warn)
        .value_channel("position")
        .build(&fx.dispatcher, fx.events.id())
        .unwrap();
    let mut rx = phi.subscribe();

    sleep(ms(350)).await;
    fx.events.drain();
    assert!(drain_signals(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn get_value_uses_fresh_cache_then_reads() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    let position = fx.channel("position", "Position", ChannelOptions::default());
    let phi = HardwareObject::builder("phi")
        .channel(position, TimeoutPolicy::Confirm)
        .value_channel("position")
        .freshness(ms(1000))
        .build(&fx.dispatcher, fx.events.id())
        .unwrap();
    phi.init().await.unwrap();
    assert_eq!(fx.transport.reads("Position"), 1);

    assert_eq!(phi.get_value().await.unwrap(), Value::Float(1.0));
    assert_eq!(fx.transport.reads("Position"), 1, "fresh cache, no read");

    sleep(ms(1500)).await;
    fx.transport.set("Position", 2.0);
    assert_eq!(phi.get_value().await.unwrap(), Value::Float(2.0));
    assert_eq!(fx.transport.reads("Position"), 2);
}

#[tokio::test(start_paused = true)]
async fn get_value_degrades_to_last_known_value() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    let position = fx.channel("position", "Position", ChannelOptions::default());
    let phi = HardwareObject::builder("phi")
        .channel(position, TimeoutPolicy::Confirm)
        .value_channel("position")
        .freshness(ms(100))
        .build(&fx.dispatcher, fx.events.id())
        .unwrap();

    fx.transport.set_failing(true);
    let err = phi.get_value().await.unwrap_err();
    assert!(err.is_recoverable(), "no cache yet, error surfaces");

    fx.transport.set_failing(false);
    phi.init().await.unwrap();
    fx.transport.set_failing(true);
    sleep(ms(500)).await;
    assert_eq!(phi.get_value().await.unwrap(), Value::Float(1.0));
}

#[tokio::test(start_paused = true)]
async fn set_value_writes_through_the_value_channel() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    let phi = actuator(&fx, false);

    phi.set_value(Value::Float(3.5)).await.unwrap();
    assert_eq!(
        fx.transport.writes(),
        vec![("Position".to_string(), Value::Float(3.5))]
    );

    fx.transport.set_failing(true);
    assert!(phi.set_value(Value::Float(4.0)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_object_releases_everything() {
    let fx = Fixture::new("mock://phi");
    fx.transport.set("Position", 1.0);
    fx.transport.set("State", "ON");
    let phi = actuator(&fx, true);
    assert_eq!(fx.registry.poller_count(&fx.device()), 1);
    assert_eq!(fx.dispatcher.observer_count(), 1);

    drop(phi);
    assert_eq!(fx.registry.poller_count(&fx.device()), 0);
    assert_eq!(fx.dispatcher.observer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn builder_rejects_unknown_channels() {
    let fx = Fixture::new("mock://phi");
    let position = fx.channel("position", "Position", ChannelOptions::default());
    let err = HardwareObject::builder("phi")
        .channel(position, TimeoutPolicy::Confirm)
        .value_channel("nope")
        .build(&fx.dispatcher, fx.events.id())
        .unwrap_err();
    assert!(matches!(err, HwoError::NotFound(_)));
}

// =============================================================================
// Composite state
// =============================================================================

fn sample_changer(fx: &Fixture) -> HardwareObject {
    let mut builder = HardwareObject::builder("sc")
        .aggregator(StateAggregator::new(Box::new(SampleChangerRule)))
        .state_channel("state");
    for (name, attribute) in [("state", "State"), ("powered", "Powered"), ("running", "Running")] {
        builder = builder.channel(
            fx.channel(name, attribute, ChannelOptions::polled(ms(100))),
            TimeoutPolicy::Confirm,
        );
    }
    builder.build(&fx.dispatcher, fx.events.id()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn composite_status_follows_priority_order() {
    let mut fx = Fixture::new("mock://sc");
    fx.transport.set("State", "ON");
    fx.transport.set("Powered", true);
    fx.transport.set("Running", true);
    let sc = sample_changer(&fx);
    let mut rx = sc.subscribe();

    sc.init().await.unwrap();
    assert_eq!(global_states(&drain_signals(&mut rx)), vec!["MOVING"]);

    // Priming tick.
    sleep(ms(50)).await;
    fx.events.drain();
    assert!(drain_signals(&mut rx).is_empty());

    fx.transport.set("Running", false);
    sleep(ms(100)).await;
    fx.events.drain();
    let signals = drain_signals(&mut rx);
    assert_eq!(global_states(&signals), vec!["READY"]);

    fx.transport.set("Powered", false);
    sleep(ms(100)).await;
    fx.events.drain();
    let signals = drain_signals(&mut rx);
    assert_eq!(global_states(&signals), vec!["DISABLED"]);

    let HardwareObjectSignal::GlobalStateChanged { global } = &signals[0] else {
        panic!("expected a composite snapshot, got {signals:?}");
    };
    assert_eq!(global.state["state"], Value::from("ON"));
    assert_eq!(global.state["powered"], Value::Bool(false));
    assert_eq!(global.state["running"], Value::Bool(false));
    assert!(global.allows("powerOn"));
}

#[tokio::test(start_paused = true)]
async fn raw_state_change_updates_state_and_composite() {
    let mut fx = Fixture::new("mock://sc");
    fx.transport.set("State", "ON");
    fx.transport.set("Powered", true);
    fx.transport.set("Running", false);
    let sc = sample_changer(&fx);
    sc.init().await.unwrap();
    let mut rx = sc.subscribe();

    sleep(ms(50)).await;
    fx.transport.set("State", "FAULT");
    sleep(ms(100)).await;
    fx.events.drain();

    let signals = drain_signals(&mut rx);
    assert_eq!(global_states(&signals), vec!["FAULT"]);
    assert!(signals.contains(&HardwareObjectSignal::StateChanged {
        state: HardwareObjectState::Fault
    }));
    assert_eq!(sc.global_state().unwrap().status, "FAULT");
}
