use crate::common::ErrorConfig;
use crate::mock_transport::MockTransport;
use futures::future::BoxFuture;
use hwo_core::{DeviceId, HwoError, HwoResult, Transport, TransportFactory, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// MockTransportFactory - TransportFactory implementation
// =============================================================================

/// `[simulation]` table of a `mock://` device.
///
/// ```toml
/// [devices.simulation]
/// seed = 7
/// jitter = 0.001
/// repeat_scripts = true
///
/// [devices.simulation.attributes]
/// Powered = true
///
/// [devices.simulation.scripts]
/// State = ["ON", "RUNNING", "RUNNING", "ON"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Initial attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Command results.
    #[serde(default)]
    pub commands: BTreeMap<String, Value>,
    /// Scripted read sequences per attribute.
    #[serde(default)]
    pub scripts: BTreeMap<String, Vec<Value>>,
    /// Restart scripts when they run out instead of sticking on the last value.
    #[serde(default)]
    pub repeat_scripts: bool,
    /// Seed for jitter and random failures.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Relative jitter applied to float reads.
    #[serde(default)]
    pub jitter: f64,
    /// Probability that any operation fails.
    #[serde(default)]
    pub failure_rate: f64,
    /// Delay added to every operation.
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl SimulationConfig {
    fn from_options(options: Option<&toml::Value>) -> HwoResult<Self> {
        match options {
            None => Ok(Self::default()),
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e| HwoError::configuration(format!("invalid simulation table: {e}"))),
        }
    }

    fn check(&self) -> HwoResult<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(HwoError::configuration(
                "simulation.failure_rate must be between 0 and 1",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(HwoError::configuration(
                "simulation.jitter must be in [0, 1)",
            ));
        }
        if let Some((name, _)) = self.scripts.iter().find(|(_, steps)| steps.is_empty()) {
            return Err(HwoError::configuration(format!(
                "simulation script for '{name}' is empty"
            )));
        }
        Ok(())
    }

    /// Build a transport for `device` from this table.
    pub fn build(&self, device: DeviceId) -> MockTransport {
        let mut transport = MockTransport::new(device).with_jitter(self.jitter, self.seed);
        if self.failure_rate > 0.0 {
            transport = transport
                .with_errors(ErrorConfig::random_failures_seeded(self.failure_rate, self.seed));
        }
        if let Some(ms) = self.latency_ms {
            transport = transport.with_latency(Duration::from_millis(ms));
        }
        for (name, value) in &self.attributes {
            transport.set(name.as_str(), value.clone());
        }
        for (name, value) in &self.commands {
            transport.set_command(name.as_str(), value.clone());
        }
        for (name, steps) in &self.scripts {
            if self.repeat_scripts {
                transport.script_repeating(name.as_str(), steps.iter().cloned());
            } else {
                transport.script(name.as_str(), steps.iter().cloned());
            }
        }
        transport
    }
}

/// Factory for `mock://` endpoints.
pub struct MockTransportFactory;

impl TransportFactory for MockTransportFactory {
    fn scheme(&self) -> &'static str {
        "mock"
    }

    fn name(&self) -> &'static str {
        "Simulated device"
    }

    fn validate(&self, options: Option<&toml::Value>) -> HwoResult<()> {
        SimulationConfig::from_options(options)?.check()
    }

    fn connect(
        &self,
        device: DeviceId,
        options: Option<toml::Value>,
    ) -> BoxFuture<'static, HwoResult<Arc<dyn Transport>>> {
        Box::pin(async move {
            let config = SimulationConfig::from_options(options.as_ref())?;
            config.check()?;
            let transport: Arc<dyn Transport> = Arc::new(config.build(device));
            Ok(transport)
        })
    }
}
