//! Shared fixtures for hwo-core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hwo_core::{
    Delivery, DeviceId, HwoError, HwoResult, PollEvent, PollEventKind, PollSink, Transport, Value,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Transport whose reads follow per-attribute scripts. The last scripted value
/// sticks; unscripted attributes return whatever `set` stored.
pub struct ScriptedTransport {
    device: DeviceId,
    values: Mutex<HashMap<String, Value>>,
    scripts: Mutex<HashMap<String, VecDeque<Value>>>,
    reads: Mutex<HashMap<String, u64>>,
    writes: Mutex<Vec<(String, Value)>>,
    connected: AtomicBool,
    failing: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(device: &str) -> Arc<Self> {
        Arc::new(Self {
            device: DeviceId::new(device),
            values: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set(&self, attribute: &str, value: impl Into<Value>) {
        self.scripts.lock().remove(attribute);
        self.values.lock().insert(attribute.to_string(), value.into());
    }

    pub fn script(&self, attribute: &str, values: impl IntoIterator<Item = Value>) {
        self.scripts
            .lock()
            .insert(attribute.to_string(), values.into_iter().collect());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every read fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self, attribute: &str) -> u64 {
        self.reads.lock().get(attribute).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().clone()
    }

    pub fn as_transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        self.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn read(&self, attribute: &str) -> HwoResult<Value> {
        *self.reads.lock().entry(attribute.to_string()).or_insert(0) += 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(HwoError::transport(self.device.as_str(), "link down"));
        }

        let scripted = {
            let mut scripts = self.scripts.lock();
            scripts.get_mut(attribute).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };
        if let Some(value) = scripted {
            return Ok(value);
        }
        self.values
            .lock()
            .get(attribute)
            .cloned()
            .ok_or_else(|| HwoError::protocol(self.device.as_str(), format!("no attribute {attribute}")))
    }

    async fn write(&self, attribute: &str, value: Value) -> HwoResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HwoError::transport(self.device.as_str(), "link down"));
        }
        self.writes.lock().push((attribute.to_string(), value.clone()));
        self.set(attribute, value);
        Ok(())
    }

    async fn execute(&self, command: &str, args: &[Value]) -> HwoResult<Value> {
        match (command, args) {
            ("read", [Value::Str(attribute)]) => self.read(attribute).await,
            _ => Err(HwoError::protocol(
                self.device.as_str(),
                format!("unknown command {command}"),
            )),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Sink that records events directly on the poller task.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PollEvent>>,
    dead: AtomicBool,
    delivered: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(PollEventKind, Value)> {
        self.events
            .lock()
            .iter()
            .map(|e| (e.kind, e.value.clone()))
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl PollSink for RecordingSink {
    fn deliver(&self, event: PollEvent) -> Delivery {
        if self.dead.load(Ordering::SeqCst) {
            return Delivery::Dropped;
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(event);
        Delivery::Queued
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }
}

/// Observer registered through the dispatcher as a bound method.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<PollEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_event(&self, event: &PollEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    pub fn events(&self) -> Vec<(PollEventKind, String, Value)> {
        self.events
            .lock()
            .iter()
            .map(|e| (e.kind, e.source.clone(), e.value.clone()))
            .collect()
    }
}

pub fn update(v: impl Into<Value>) -> (PollEventKind, Value) {
    (PollEventKind::Update, v.into())
}

pub fn timeout(v: impl Into<Value>) -> (PollEventKind, Value) {
    (PollEventKind::Timeout, v.into())
}

pub fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Int).collect()
}

/// Route `tracing` output through the test harness; `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
