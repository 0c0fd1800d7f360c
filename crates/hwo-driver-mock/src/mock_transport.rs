//! Simulated device transport.
//!
//! Holds an attribute table in memory. Reads can be scripted per attribute: a
//! script is a queue of steps consumed one per read, after which the last value
//! sticks (or the script restarts, with `repeat`). Connection loss, latency,
//! float jitter and error injection are all configurable.

use crate::common::{ErrorConfig, MockRng};
use async_trait::async_trait;
use hwo_core::{DeviceId, HwoError, HwoResult, Transport, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// One scripted read result.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Return this value.
    Value(Value),
    /// Fail with a transient transport error.
    TransportError,
    /// Fail with a protocol error.
    ProtocolError,
}

impl From<Value> for ScriptStep {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<ScriptStep>,
    original: Vec<ScriptStep>,
    repeat: bool,
}

#[derive(Debug, Default)]
struct MockState {
    attributes: HashMap<String, Value>,
    scripts: HashMap<String, Script>,
    commands: HashMap<String, Value>,
    reads: HashMap<String, u64>,
    writes: Vec<(String, Value)>,
}

/// In-memory [`Transport`].
#[derive(Debug)]
pub struct MockTransport {
    device: DeviceId,
    state: Mutex<MockState>,
    connected: AtomicBool,
    errors: ErrorConfig,
    rng: MockRng,
    jitter: f64,
    latency: Option<Duration>,
}

impl MockTransport {
    /// Empty, connected transport for `device`.
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
            state: Mutex::new(MockState::default()),
            connected: AtomicBool::new(true),
            errors: ErrorConfig::none(),
            rng: MockRng::new(None),
            jitter: 0.0,
            latency: None,
        }
    }

    /// Inject errors.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Multiply float reads by `1 ± fraction`, drawn from a seeded RNG.
    pub fn with_jitter(mut self, fraction: f64, seed: Option<u64>) -> Self {
        self.jitter = fraction;
        self.rng = MockRng::new(seed);
        self
    }

    /// Delay every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set an attribute and drop any script on it.
    pub fn set(&self, attribute: impl Into<String>, value: impl Into<Value>) {
        let attribute = attribute.into();
        let mut state = self.state.lock();
        state.scripts.remove(&attribute);
        state.attributes.insert(attribute, value.into());
    }

    /// Queue read results for `attribute`. The last value sticks once the
    /// queue runs dry.
    pub fn script<I, S>(&self, attribute: impl Into<String>, steps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        self.install_script(attribute.into(), steps, false);
    }

    /// Like [`script`](Self::script) but restarts from the top when empty.
    pub fn script_repeating<I, S>(&self, attribute: impl Into<String>, steps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        self.install_script(attribute.into(), steps, true);
    }

    fn install_script<I, S>(&self, attribute: String, steps: I, repeat: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        let original: Vec<ScriptStep> = steps.into_iter().map(Into::into).collect();
        self.state.lock().scripts.insert(
            attribute,
            Script {
                steps: original.iter().cloned().collect(),
                original,
                repeat,
            },
        );
    }

    /// Define the result of a device command.
    pub fn set_command(&self, command: impl Into<String>, result: impl Into<Value>) {
        self.state.lock().commands.insert(command.into(), result.into());
    }

    /// Simulate losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        debug!(device = %self.device, connected, "Mock connection changed");
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of reads of `attribute` so far.
    pub fn read_count(&self, attribute: &str) -> u64 {
        self.state.lock().reads.get(attribute).copied().unwrap_or(0)
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.state.lock().writes.clone()
    }

    async fn enter(&self, operation: &'static str) -> HwoResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HwoError::transport(self.device.as_str(), "device not reachable"));
        }
        self.errors.check_operation(self.device.as_str(), operation)
    }

    fn next_scripted(&self, state: &mut MockState, attribute: &str) -> Option<ScriptStep> {
        let script = state.scripts.get_mut(attribute)?;
        if script.steps.is_empty() && script.repeat {
            script.steps = script.original.iter().cloned().collect();
        }
        let next = if script.steps.len() > 1 || script.repeat {
            script.steps.pop_front()
        } else {
            script.steps.front().cloned()
        };
        let step = next?;
        if let ScriptStep::Value(v) = &step {
            state.attributes.insert(attribute.to_string(), v.clone());
        }
        Some(step)
    }

    fn jittered(&self, value: Value) -> Value {
        match value {
            Value::Float(f) if self.jitter > 0.0 => Value::Float(self.rng.jitter(f, self.jitter)),
            other => other,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn read(&self, attribute: &str) -> HwoResult<Value> {
        self.enter("read").await?;
        let mut state = self.state.lock();
        *state.reads.entry(attribute.to_string()).or_insert(0) += 1;

        let value = match self.next_scripted(&mut state, attribute) {
            Some(ScriptStep::Value(v)) => v,
            Some(ScriptStep::TransportError) => {
                return Err(HwoError::transport(self.device.as_str(), "scripted timeout"))
            }
            Some(ScriptStep::ProtocolError) => {
                return Err(HwoError::protocol(
                    self.device.as_str(),
                    format!("scripted rejection of '{attribute}'"),
                ))
            }
            None => state.attributes.get(attribute).cloned().ok_or_else(|| {
                HwoError::protocol(
                    self.device.as_str(),
                    format!("no such attribute '{attribute}'"),
                )
            })?,
        };
        trace!(device = %self.device, attribute, value = %value, "Mock read");
        Ok(self.jittered(value))
    }

    async fn write(&self, attribute: &str, value: Value) -> HwoResult<()> {
        self.enter("write").await?;
        let mut state = self.state.lock();
        state.scripts.remove(attribute);
        state.writes.push((attribute.to_string(), value.clone()));
        state.attributes.insert(attribute.to_string(), value);
        Ok(())
    }

    async fn execute(&self, command: &str, args: &[Value]) -> HwoResult<Value> {
        self.enter("execute").await?;
        let state = self.state.lock();
        if let Some(result) = state.commands.get(command) {
            return Ok(result.clone());
        }
        // `read("Attr")` reads an attribute through the command path.
        if let ("read", [Value::Str(attribute)]) = (command, args) {
            return state.attributes.get(attribute).cloned().ok_or_else(|| {
                HwoError::protocol(
                    self.device.as_str(),
                    format!("no such attribute '{attribute}'"),
                )
            });
        }
        Err(HwoError::protocol(
            self.device.as_str(),
            format!("unknown command '{command}'"),
        ))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.errors.communication_lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_reads_then_sticky_last_value() {
        let mock = MockTransport::new("mock://phi");
        mock.script("Position", [Value::Int(1), Value::Int(2)]);
        assert_eq!(mock.read("Position").await.unwrap(), Value::Int(1));
        assert_eq!(mock.read("Position").await.unwrap(), Value::Int(2));
        assert_eq!(mock.read("Position").await.unwrap(), Value::Int(2));
        assert_eq!(mock.read_count("Position"), 3);
    }

    #[tokio::test]
    async fn repeating_script_cycles() {
        let mock = MockTransport::new("mock://phi");
        mock.script_repeating("State", [Value::from("ON"), Value::from("MOVING")]);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(mock.read("State").await.unwrap());
        }
        assert_eq!(
            seen,
            ["ON", "MOVING", "ON", "MOVING", "ON"]
                .into_iter()
                .map(Value::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn scripted_errors_have_matching_classes() {
        let mock = MockTransport::new("mock://phi");
        mock.script(
            "Position",
            [
                ScriptStep::TransportError,
                ScriptStep::ProtocolError,
                ScriptStep::Value(Value::Int(4)),
            ],
        );
        assert!(mock.read("Position").await.unwrap_err().is_recoverable());
        assert!(!mock.read("Position").await.unwrap_err().is_recoverable());
        assert_eq!(mock.read("Position").await.unwrap(), Value::Int(4));
    }

    #[tokio::test]
    async fn write_replaces_script_and_is_recorded() {
        let mock = MockTransport::new("mock://phi");
        mock.script("Position", [Value::Int(1)]);
        mock.write("Position", Value::Float(3.5)).await.unwrap();
        assert_eq!(mock.read("Position").await.unwrap(), Value::Float(3.5));
        assert_eq!(mock.writes(), vec![("Position".to_string(), Value::Float(3.5))]);
    }

    #[tokio::test]
    async fn disconnected_transport_fails_transiently() {
        let mock = MockTransport::new("mock://phi");
        mock.set("Position", 1i64);
        mock.set_connected(false);
        assert!(!mock.is_connected().await);
        assert!(mock.read("Position").await.unwrap_err().is_recoverable());
    }

    #[tokio::test]
    async fn commands_and_read_fallback() {
        let mock = MockTransport::new("mock://sc");
        mock.set_command("getLoadedSample", "1:02");
        mock.set("Powered", true);
        assert_eq!(
            mock.execute("getLoadedSample", &[]).await.unwrap(),
            Value::from("1:02")
        );
        assert_eq!(
            mock.execute("read", &[Value::from("Powered")]).await.unwrap(),
            Value::Bool(true)
        );
        assert!(mock.execute("dance", &[]).await.is_err());
    }
}
