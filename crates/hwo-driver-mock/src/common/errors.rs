//! Error injection for mock transports.
//!
//! Failures come out as the same [`HwoError`] classes a real transport
//! produces, so tests exercise the poller's error policy as-is:
//! communication loss and timeouts are `Transport` (silent, retried next tick),
//! device faults and injected failures are `Protocol` (logged).

use super::rng::MockRng;
use hwo_core::{HwoError, HwoResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0). `"*"` matches every operation.
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call to `operation` after `count` successful ones.
    FailAfterN {
        /// `read`, `write` or `execute`.
        operation: &'static str,
        /// Successful calls before failures start.
        count: u32,
    },
    /// Every call to `operation` times out.
    Timeout {
        /// `read`, `write` or `execute`.
        operation: &'static str,
    },
    /// The first call loses communication; all later calls fail too.
    CommunicationLoss,
    /// The first call latches a device fault; all later calls fail too.
    DeviceFault {
        /// Vendor fault code.
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors.
    pub fn none() -> Self {
        Self::with_parts(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::with_parts(HashMap::from([("*", rate)]), Vec::new(), seed)
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::with_parts(HashMap::new(), scenarios, None)
    }

    fn with_parts(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Whether a communication-loss scenario has fired.
    pub fn communication_lost(&self) -> bool {
        self.state.lock().communication_lost
    }

    /// Decide whether `operation` on `device` fails.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> HwoResult<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(HwoError::transport(device, "communication lost"));
        }
        if state.fault_code != 0 {
            return Err(HwoError::protocol(
                device,
                format!("device fault {}", state.fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(HwoError::protocol(
                            device,
                            format!("injected failure after {count} {operation} calls"),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(HwoError::transport(
                        device,
                        format!("{operation} timed out"),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(HwoError::transport(device, "communication lost"));
                }
                ErrorScenario::DeviceFault { code } => {
                    state.fault_code = *code;
                    return Err(HwoError::protocol(device, format!("device fault {code}")));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(HwoError::protocol(
                device,
                format!("random failure on {operation}"),
            ));
        }
        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
