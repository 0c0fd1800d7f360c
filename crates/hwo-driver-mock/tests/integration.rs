//! Mock transport driving the real poller machinery.

use hwo_core::{
    Delivery, ObserverId, PollEvent, PollEventKind, PollExpression, PollRequest, PollSink,
    PollerRegistry, StopReason, Transport, TransportFactory, Value,
};
use hwo_driver_mock::{ErrorConfig, ErrorScenario, MockTransport, MockTransportFactory, ScriptStep};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct Collect {
    events: Mutex<Vec<(PollEventKind, Value)>>,
}

impl PollSink for Collect {
    fn deliver(&self, event: PollEvent) -> Delivery {
        self.events.lock().push((event.kind, event.value));
        Delivery::Queued
    }

    fn is_alive(&self) -> bool {
        true
    }
}

fn poll(registry: &PollerRegistry, transport: &Arc<dyn Transport>, sink: &Arc<Collect>, attribute: &str) {
    registry
        .poll(
            transport,
            PollRequest::new(
                ObserverId::allocate(),
                sink.clone(),
                PollExpression::attribute(attribute),
            )
            .with_interval(Duration::from_millis(100))
            .with_compare(true),
        )
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn scripted_errors_are_skipped_by_the_poller() {
    let mock = MockTransport::new("mock://phi");
    mock.script(
        "Position",
        [
            ScriptStep::Value(Value::Int(1)),
            ScriptStep::TransportError,
            ScriptStep::ProtocolError,
            ScriptStep::Value(Value::Int(2)),
        ],
    );
    let transport: Arc<dyn Transport> = Arc::new(mock);
    let registry = PollerRegistry::from_current().unwrap();
    let sink = Arc::new(Collect::default());
    poll(&registry, &transport, &sink, "Position");

    // 0: prime 1, 100: transport error, 200: protocol error, 300: update 2.
    sleep(Duration::from_millis(350)).await;
    assert_eq!(
        *sink.events.lock(),
        vec![(PollEventKind::Update, Value::Int(2))]
    );
}

#[tokio::test(start_paused = true)]
async fn communication_loss_stops_the_poller() {
    let mock = MockTransport::new("mock://sc")
        .with_errors(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read",
            count: 2,
        }));
    mock.set("Powered", true);
    let transport: Arc<dyn Transport> = Arc::new(mock);
    let registry = PollerRegistry::from_current().unwrap();
    let sink = Arc::new(Collect::default());
    poll(&registry, &transport, &sink, "Powered");

    let device = transport.device().clone();
    let poller = registry.poller(&device).unwrap();
    sleep(Duration::from_millis(350)).await;
    assert!(poller.is_running(), "protocol failures keep the poller alive");

    let lossy = MockTransport::new("mock://lossy")
        .with_errors(ErrorConfig::scenario(ErrorScenario::CommunicationLoss));
    lossy.set("Powered", true);
    let lossy: Arc<dyn Transport> = Arc::new(lossy);
    poll(&registry, &lossy, &sink, "Powered");
    let lossy_poller = registry.poller(lossy.device()).unwrap();

    assert_eq!(lossy_poller.stopped().await, StopReason::Disconnected);
    assert_eq!(registry.poller_count(lossy.device()), 0);
    assert_eq!(registry.poller_count(&device), 1);
}

#[tokio::test(start_paused = true)]
async fn factory_transport_polls_repeating_scripts() {
    let options: toml::Value = toml::from_str(
        r#"
        repeat_scripts = true
        scripts = { State = ["ON", "MOVING"] }
        "#,
    )
    .unwrap();
    let transport = MockTransportFactory
        .connect("mock://sc".into(), Some(options))
        .await
        .unwrap();
    let registry = PollerRegistry::from_current().unwrap();
    let sink = Arc::new(Collect::default());
    poll(&registry, &transport, &sink, "State");

    sleep(Duration::from_millis(350)).await;
    assert_eq!(
        *sink.events.lock(),
        vec![
            (PollEventKind::Update, Value::from("MOVING")),
            (PollEventKind::Update, Value::from("ON")),
            (PollEventKind::Update, Value::from("MOVING")),
        ]
    );
}
