//! Hardware objects: the public face of a device.
//!
//! A [`HardwareObject`] owns a set of named [`Channel`]s and turns their raw
//! updates into a small signal vocabulary:
//!
//! | signal                 | source                                         |
//! |------------------------|------------------------------------------------|
//! | `ValueChanged`         | update on the value channel                    |
//! | `StateChanged`         | update on the state channel, when the mapped   |
//! |                        | [`HardwareObjectState`] actually changes       |
//! | `ValueConfirmed`       | timeout on the value channel with `Confirm`    |
//! | `GlobalStateChanged`   | update on any channel feeding the aggregator   |
//!
//! Updates reach the object through the [`EventDispatcher`], on whichever
//! [`crate::dispatch::EventLoop`] its context belongs to. The dispatcher only
//! holds the object weakly; dropping the `HardwareObject` unsubscribes every
//! channel and releases the poller registrations that were only there for it.

use crate::aggregate::{GlobalState, StateAggregator};
use crate::channel::Channel;
use crate::config::TimeoutPolicy;
use crate::dispatch::{ContextId, EventDispatcher};
use crate::error::{HwoError, HwoResult};
use crate::event::{ObserverId, PollEvent, PollEventKind};
use crate::value::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const SIGNAL_CAPACITY: usize = 256;
const DEFAULT_FRESHNESS: Duration = Duration::from_millis(1000);

/// Generic device state derived from a control-system state string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HardwareObjectState {
    /// Nothing known yet, or an unrecognised raw state.
    #[default]
    Unknown,
    /// Switched off or disabled.
    Off,
    /// Idle and usable.
    Ready,
    /// Moving or executing.
    Busy,
    /// Usable but in alarm.
    Warning,
    /// Failed.
    Fault,
}

impl HardwareObjectState {
    /// Map a raw device state (`ON`, `MOVING`, `FAULT`, ...).
    pub fn from_device_state(raw: &Value) -> Self {
        let Some(raw) = raw.as_str() else {
            return Self::Unknown;
        };
        match raw.trim().to_ascii_uppercase().as_str() {
            "ON" | "STANDBY" | "READY" => Self::Ready,
            "MOVING" | "RUNNING" | "BUSY" => Self::Busy,
            "ALARM" => Self::Warning,
            "FAULT" => Self::Fault,
            "OFF" | "DISABLE" | "DISABLED" => Self::Off,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HardwareObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Off => "OFF",
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Warning => "WARNING",
            Self::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

/// Notifications emitted by a hardware object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum HardwareObjectSignal {
    /// The value channel reported a new value.
    ValueChanged {
        /// New value.
        value: Value,
    },
    /// The mapped device state changed.
    StateChanged {
        /// New state.
        state: HardwareObjectState,
    },
    /// The value channel confirmed its value unchanged.
    ValueConfirmed {
        /// Confirmed value.
        value: Value,
    },
    /// The composite state was recomputed.
    GlobalStateChanged {
        /// Full snapshot.
        global: GlobalState,
    },
}

struct ChannelBinding {
    channel: Channel,
    on_timeout: TimeoutPolicy,
    slot: Option<String>,
}

struct HardwareObjectInner {
    name: String,
    channels: BTreeMap<String, ChannelBinding>,
    value_channel: Option<String>,
    state_channel: Option<String>,
    freshness: Duration,
    state: Mutex<HardwareObjectState>,
    aggregator: Option<Mutex<StateAggregator>>,
    signals: broadcast::Sender<HardwareObjectSignal>,
}

impl HardwareObjectInner {
    fn emit(&self, signal: HardwareObjectSignal) {
        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    /// Dispatcher entry point.
    fn handle_event(&self, event: &PollEvent) -> anyhow::Result<()> {
        let Some(binding) = self.channels.get(&event.source) else {
            anyhow::bail!(
                "{}: event from unknown channel '{}'",
                self.name,
                event.source
            );
        };
        match event.kind {
            PollEventKind::Update => self.on_update(&event.source, binding, event.value.clone()),
            PollEventKind::Timeout => {
                self.on_timeout(&event.source, binding, &event.value);
                Ok(())
            }
        }
    }

    fn on_update(&self, channel: &str, binding: &ChannelBinding, value: Value) -> anyhow::Result<()> {
        debug!(object = %self.name, channel, value = %value, "Channel update");

        if self.state_channel.as_deref() == Some(channel) {
            self.apply_state(&value);
        }
        if self.value_channel.as_deref() == Some(channel) {
            self.emit(HardwareObjectSignal::ValueChanged {
                value: value.clone(),
            });
        }
        if let (Some(slot), Some(aggregator)) = (&binding.slot, &self.aggregator) {
            let global = aggregator.lock().update(slot, value)?;
            self.emit(HardwareObjectSignal::GlobalStateChanged { global });
        }
        Ok(())
    }

    fn on_timeout(&self, channel: &str, binding: &ChannelBinding, value: &Value) {
        match binding.on_timeout {
            TimeoutPolicy::Confirm => {
                if self.value_channel.as_deref() == Some(channel) {
                    self.emit(HardwareObjectSignal::ValueConfirmed {
                        value: value.clone(),
                    });
                }
            }
            TimeoutPolicy::Warn => {
                warn!(object = %self.name, channel, value = %value, "Channel value has not changed");
            }
        }
    }

    fn store_state(&self, raw: &Value) -> Option<HardwareObjectState> {
        let mapped = HardwareObjectState::from_device_state(raw);
        let mut state = self.state.lock();
        if *state == mapped {
            return None;
        }
        *state = mapped;
        Some(mapped)
    }

    fn apply_state(&self, raw: &Value) {
        if let Some(state) = self.store_state(raw) {
            self.emit(HardwareObjectSignal::StateChanged { state });
        }
    }
}

/// Assembles a [`HardwareObject`] from channels.
pub struct HardwareObjectBuilder {
    name: String,
    channels: Vec<(Channel, TimeoutPolicy)>,
    slots: BTreeMap<String, String>,
    value_channel: Option<String>,
    state_channel: Option<String>,
    freshness: Duration,
    aggregator: Option<StateAggregator>,
}

impl HardwareObjectBuilder {
    /// Start a builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: Vec::new(),
            slots: BTreeMap::new(),
            value_channel: None,
            state_channel: None,
            freshness: DEFAULT_FRESHNESS,
            aggregator: None,
        }
    }

    /// Add a channel.
    pub fn channel(mut self, channel: Channel, on_timeout: TimeoutPolicy) -> Self {
        self.channels.push((channel, on_timeout));
        self
    }

    /// Route `channel` into aggregator slot `slot`. Without this, a channel
    /// feeds the slot of the same name if there is one.
    pub fn feeds(mut self, channel: impl Into<String>, slot: impl Into<String>) -> Self {
        self.slots.insert(channel.into(), slot.into());
        self
    }

    /// Channel whose updates are the object's value.
    pub fn value_channel(mut self, name: impl Into<String>) -> Self {
        self.value_channel = Some(name.into());
        self
    }

    /// Channel whose updates are the object's state.
    pub fn state_channel(mut self, name: impl Into<String>) -> Self {
        self.state_channel = Some(name.into());
        self
    }

    /// How long a cached value satisfies [`HardwareObject::get_value`].
    pub fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Attach a composite.
    pub fn aggregator(mut self, aggregator: StateAggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Register with `dispatcher` on `context` and subscribe to every channel.
    pub fn build(self, dispatcher: &EventDispatcher, context: ContextId) -> HwoResult<HardwareObject> {
        let mut channels = BTreeMap::new();
        for (channel, on_timeout) in self.channels {
            let name = channel.name().to_string();
            let slot = match (self.slots.get(&name), &self.aggregator) {
                (Some(slot), Some(agg)) if agg.has_slot(slot) => Some(slot.clone()),
                (Some(slot), _) => {
                    return Err(HwoError::configuration(format!(
                        "{}: channel '{name}' feeds unknown slot '{slot}'",
                        self.name
                    )))
                }
                (None, Some(agg)) if agg.has_slot(&name) => Some(name.clone()),
                (None, _) => None,
            };
            let binding = ChannelBinding {
                channel,
                on_timeout,
                slot,
            };
            if channels.insert(name.clone(), binding).is_some() {
                return Err(HwoError::configuration(format!(
                    "{}: duplicate channel '{name}'",
                    self.name
                )));
            }
        }

        for name in [&self.value_channel, &self.state_channel].into_iter().flatten() {
            if !channels.contains_key(name) {
                return Err(HwoError::NotFound(format!("{}: channel '{name}'", self.name)));
            }
        }

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let inner = Arc::new(HardwareObjectInner {
            name: self.name,
            channels,
            value_channel: self.value_channel,
            state_channel: self.state_channel,
            freshness: self.freshness,
            state: Mutex::new(HardwareObjectState::Unknown),
            aggregator: self.aggregator.map(Mutex::new),
            signals,
        });

        let observer = dispatcher.register(context, &inner, HardwareObjectInner::handle_event)?;
        let object = HardwareObject {
            inner,
            observer,
            dispatcher: dispatcher.clone(),
        };
        for binding in object.inner.channels.values() {
            // On failure `object` is dropped, which unsubscribes what succeeded.
            binding.channel.subscribe(observer)?;
        }
        debug!(object = %object.inner.name, channels = object.inner.channels.len(), "Hardware object built");
        Ok(object)
    }
}

/// A device built from channels.
pub struct HardwareObject {
    inner: Arc<HardwareObjectInner>,
    observer: ObserverId,
    dispatcher: EventDispatcher,
}

impl fmt::Debug for HardwareObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareObject")
            .field("name", &self.inner.name)
            .field("observer", &self.observer)
            .field("channels", &self.inner.channels.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}

impl HardwareObject {
    /// Start a builder.
    pub fn builder(name: impl Into<String>) -> HardwareObjectBuilder {
        HardwareObjectBuilder::new(name)
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Dispatcher registration of this object.
    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Channel by name.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.inner.channels.get(name).map(|b| &b.channel)
    }

    /// Channel names.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.inner.channels.keys().map(String::as_str)
    }

    /// Receive this object's signals.
    pub fn subscribe(&self) -> broadcast::Receiver<HardwareObjectSignal> {
        self.inner.signals.subscribe()
    }

    /// Current mapped state.
    pub fn state(&self) -> HardwareObjectState {
        *self.inner.state.lock()
    }

    /// Current composite, if this object has one.
    pub fn global_state(&self) -> Option<GlobalState> {
        self.inner.aggregator.as_ref().map(|a| a.lock().snapshot())
    }

    fn value_binding(&self) -> HwoResult<&Channel> {
        self.inner
            .value_channel
            .as_ref()
            .and_then(|name| self.channel(name))
            .ok_or_else(|| HwoError::NotFound(format!("{}: no value channel", self.inner.name)))
    }

    /// Seed value, state and composite with one synchronous read per channel,
    /// then emit them once through [`update_values`](Self::update_values).
    ///
    /// Transient transport failures are logged and skipped; anything else is
    /// returned.
    pub async fn init(&self) -> HwoResult<()> {
        for (name, binding) in &self.inner.channels {
            let value = match binding.channel.read().await {
                Ok(value) => value,
                Err(e) if e.is_recoverable() => {
                    warn!(object = %self.inner.name, channel = %name, "Initial read failed: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.inner.state_channel.as_deref() == Some(name.as_str()) {
                self.inner.store_state(&value);
            }
            if let (Some(slot), Some(aggregator)) = (&binding.slot, &self.inner.aggregator) {
                aggregator.lock().update(slot, value)?;
            }
        }
        self.update_values();
        Ok(())
    }

    /// Cached value if fresh, otherwise a synchronous read.
    ///
    /// If the read fails with a transient transport error and a cached value
    /// exists, the stale value is returned and a warning logged.
    pub async fn get_value(&self) -> HwoResult<Value> {
        let channel = self.value_binding()?;
        if let Some(value) = channel.fresh_value(self.inner.freshness) {
            return Ok(value);
        }
        match channel.read().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_recoverable() => match channel.last_value() {
                Some(stale) => {
                    warn!(object = %self.inner.name, "Returning last known value: {e}");
                    Ok(stale)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Write the value channel. Completion of the write does not mean the
    /// device has reached the value; wait for `ValueChanged` for that.
    pub async fn set_value(&self, value: Value) -> HwoResult<()> {
        self.value_binding()?.write(value).await
    }

    /// Re-emit the current value, state and composite.
    pub fn update_values(&self) {
        if let Some(value) = self
            .inner
            .value_channel
            .as_deref()
            .and_then(|name| self.channel(name))
            .and_then(Channel::last_value)
        {
            self.inner.emit(HardwareObjectSignal::ValueChanged { value });
        }
        if self.inner.state_channel.is_some() {
            self.inner.emit(HardwareObjectSignal::StateChanged {
                state: self.state(),
            });
        }
        if let Some(global) = self.global_state() {
            self.inner.emit(HardwareObjectSignal::GlobalStateChanged { global });
        }
    }
}

impl Drop for HardwareObject {
    fn drop(&mut self) {
        for binding in self.inner.channels.values() {
            binding.channel.unsubscribe(self.observer);
        }
        self.dispatcher.unregister(self.observer);
    }
}
