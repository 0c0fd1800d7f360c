//! `hwo-core`
//!
//! Polling, event dispatch and state composition for beamline hardware
//! objects.
//!
//! Data flows leaves first:
//!
//! ```text
//! Transport ─► Channel ─► Poller ─► EventDispatcher ─► HardwareObject ─► StateAggregator
//!  (read/write)  (value)   (change     (weak observers,     (valueChanged,    (composite
//!                           detection)  context hand-off)    stateChanged)     snapshot)
//! ```
//!
//! ## Key Types
//!
//! - [`Transport`]: per-protocol read/write/execute/liveness seam.
//! - [`Channel`]: one named remote value with read, write and subscribe.
//! - [`PollerRegistry`] / [`Poller`]: at most one polling task per device,
//!   created on first registration, gone when its last observer leaves.
//! - [`EventDispatcher`] / [`EventLoop`]: moves notifications from poller tasks
//!   onto the observer's context while holding observers weakly.
//! - [`HardwareObject`]: value, state and composite signals for one device.
//! - [`StateAggregator`]: composite status recomputed on every input change.
//! - [`Beamline`]: builds all of the above from a [`BeamlineConfig`].

pub mod aggregate;
pub mod beamline;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod expression;
pub mod hardware_object;
pub mod poller;
pub mod registry;
pub mod transport;
pub mod value;

pub use aggregate::{AggregateRule, GlobalState, SampleChangerRule, StateAggregator};
pub use beamline::Beamline;
pub use channel::{Channel, ChannelOptions};
pub use config::{
    BeamlineConfig, ChannelConfig, DeviceConfig, DeviceKind, PollingConfig, TimeoutPolicy,
};
pub use dispatch::{ContextId, EventDispatcher, EventLoop, ObserverFn};
pub use error::{HwoError, HwoResult};
pub use event::{Delivery, ObserverId, PollEvent, PollEventKind, PollSink};
pub use expression::{CommandTemplate, PollExpression};
pub use hardware_object::{
    HardwareObject, HardwareObjectBuilder, HardwareObjectSignal, HardwareObjectState,
};
pub use poller::{CommandId, PollRequest, Poller, PollerStatus, StopReason};
pub use registry::PollerRegistry;
pub use transport::{ChannelAddress, DeviceId, Transport, TransportFactory};
pub use value::Value;
