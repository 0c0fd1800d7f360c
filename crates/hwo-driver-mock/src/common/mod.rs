//! Common infrastructure for mock transports.
//!
//! - **errors**: error injection
//! - **rng**: seeded random number generator

pub mod errors;
pub mod rng;

pub use errors::{ErrorConfig, ErrorScenario};
pub use rng::MockRng;
