//! Notifications produced by pollers and the sinks that receive them.

use crate::transport::DeviceId;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

/// Identity of one observer: a dispatcher registration, a channel, or any
/// other [`PollSink`] owner.
///
/// Ids are process-unique and never reused, so a stale id can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocate a fresh id.
    pub fn allocate() -> Self {
        Self(NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// What a poller concluded about one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollEventKind {
    /// The value differs from the last one seen.
    Update,
    /// The value is unchanged and the registration asked for comparison.
    Timeout,
}

impl fmt::Display for PollEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollEventKind::Update => write!(f, "update"),
            PollEventKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// One update or timeout notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollEvent {
    /// Update or timeout.
    pub kind: PollEventKind,
    /// Device whose poller produced the event.
    pub device: DeviceId,
    /// Expression label, or channel name once a channel has forwarded it.
    pub source: String,
    /// Value read on this tick.
    pub value: Value,
    /// When the value was read.
    pub timestamp: DateTime<Utc>,
}

impl PollEvent {
    /// Build an update event stamped now.
    pub fn update(device: DeviceId, source: impl Into<String>, value: Value) -> Self {
        Self::new(PollEventKind::Update, device, source, value)
    }

    /// Build a timeout event stamped now.
    pub fn timeout(device: DeviceId, source: impl Into<String>, value: Value) -> Self {
        Self::new(PollEventKind::Timeout, device, source, value)
    }

    fn new(kind: PollEventKind, device: DeviceId, source: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            device,
            source: source.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Same event attributed to a different source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Result of handing an event to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted for delivery.
    Queued,
    /// The observer no longer exists; the event was discarded.
    Dropped,
}

/// Receiver side of a poll registration.
///
/// `deliver` is called from the poller task and must not block: implementors
/// post to a queue and return. Returning [`Delivery::Dropped`] tells the poller
/// the observer is gone, and its registration is pruned.
pub trait PollSink: Send + Sync {
    /// Hand over one event.
    fn deliver(&self, event: PollEvent) -> Delivery;

    /// Whether the observer behind this sink still exists.
    fn is_alive(&self) -> bool;
}
