//! Simulated transport for hardware objects.
//!
//! Lets channels, pollers and hardware objects run without a control system.
//! All waiting uses `tokio::time`, so tests with a paused clock stay
//! deterministic.
//!
//! # Available Pieces
//!
//! - [`MockTransport`] - in-memory attribute table with scripted reads,
//!   connection loss and error injection
//! - [`MockTransportFactory`] - builds a `MockTransport` from a device's
//!   `[simulation]` table for `mock://` endpoints
//!
//! ```rust,ignore
//! use hwo_driver_mock::MockTransportFactory;
//!
//! let factories: Vec<Arc<dyn TransportFactory>> = vec![Arc::new(MockTransportFactory)];
//! let (beamline, events) = Beamline::build(config, &factories, registry).await?;
//! ```

pub mod common;
mod factory;
mod mock_transport;

pub use common::{ErrorConfig, ErrorScenario, MockRng};
pub use factory::{MockTransportFactory, SimulationConfig};
pub use mock_transport::{MockTransport, ScriptStep};
