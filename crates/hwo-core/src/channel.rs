//! Channels: one named remote value with read, write and subscribe.
//!
//! A [`Channel`] wraps a single device attribute (or a polled command
//! template) behind a [`Transport`]. Reads and writes go straight to the
//! transport. Subscriptions are keyed by [`ObserverId`] from the
//! [`EventDispatcher`]; the first subscriber registers the channel with the
//! device's poller and the last one to leave deregisters it.
//!
//! Events from the poller are fanned out to every subscriber through the
//! dispatcher with the event `source` rewritten to the channel name, so a
//! hardware object observing several channels can tell them apart.

use crate::dispatch::EventDispatcher;
use crate::error::HwoResult;
use crate::event::{Delivery, ObserverId, PollEvent, PollSink};
use crate::expression::PollExpression;
use crate::poller::{CommandId, PollRequest};
use crate::registry::PollerRegistry;
use crate::transport::{ChannelAddress, Transport};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Polling behaviour of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Poll period. `None` means the channel is only read on demand.
    pub polling: Option<Duration>,
    /// Report unchanged polled values as timeouts.
    pub compare: bool,
    /// Expression to poll instead of reading the attribute.
    pub expression: Option<PollExpression>,
}

impl ChannelOptions {
    /// Polled every `interval`.
    pub fn polled(interval: Duration) -> Self {
        Self {
            polling: Some(interval),
            ..Self::default()
        }
    }

    /// Set the compare flag.
    pub fn with_compare(mut self, compare: bool) -> Self {
        self.compare = compare;
        self
    }

    /// Poll `expression` instead of the attribute.
    pub fn with_expression(mut self, expression: PollExpression) -> Self {
        self.expression = Some(expression);
        self
    }
}

#[derive(Default)]
struct ChannelState {
    last: Option<(Value, Instant)>,
    subscribers: BTreeSet<ObserverId>,
    registered: bool,
    command: Option<CommandId>,
}

struct ChannelInner {
    id: ObserverId,
    name: String,
    address: ChannelAddress,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    state: Mutex<ChannelState>,
    dispatcher: EventDispatcher,
    registry: PollerRegistry,
}

impl ChannelInner {
    fn store(&self, value: Value) {
        self.state.lock().last = Some((value, Instant::now()));
    }

    /// Drop `dead` subscribers. Returns false once nobody is left, after
    /// which the poller releases the registration it is ticking.
    fn forget(&self, dead: &[ObserverId]) -> bool {
        let mut state = self.state.lock();
        for observer in dead {
            state.subscribers.remove(observer);
        }
        if !state.subscribers.is_empty() {
            return true;
        }
        if !dead.is_empty() {
            warn!(channel = %self.name, "All subscribers gone, releasing poll registration");
        }
        state.registered = false;
        state.command = None;
        false
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        match state.command.take() {
            Some(command) => {
                self.registry
                    .stop_command(&self.address.device, self.id, command);
            }
            None if state.registered => {
                self.registry.stop_polling(&self.address.device, self.id);
            }
            None => {}
        }
    }
}

/// A named remote value.
///
/// Cheap to clone; clones share subscriptions and the cached value. The poller
/// registration is released when the last clone is dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Create a channel on `transport`'s device.
    pub fn new(
        name: impl Into<String>,
        attribute: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
        dispatcher: EventDispatcher,
        registry: PollerRegistry,
    ) -> Self {
        let address = ChannelAddress::new(transport.device().clone(), attribute);
        Self {
            inner: Arc::new(ChannelInner {
                id: ObserverId::allocate(),
                name: name.into(),
                address,
                transport,
                options,
                state: Mutex::new(ChannelState::default()),
                dispatcher,
                registry,
            }),
        }
    }

    /// Channel name, used as the `source` of forwarded events.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Device and attribute.
    pub fn address(&self) -> &ChannelAddress {
        &self.inner.address
    }

    /// Identity of this channel's poller registration.
    pub fn id(&self) -> ObserverId {
        self.inner.id
    }

    /// Polling behaviour.
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Read from the transport and refresh the cache. Channels polling an
    /// expression evaluate it instead of reading the attribute.
    pub async fn read(&self) -> HwoResult<Value> {
        let value = match &self.inner.options.expression {
            Some(expression) => expression.evaluate(&self.inner.transport).await?,
            None => self.inner.transport.read(&self.inner.address.attribute).await?,
        };
        self.inner.store(value.clone());
        Ok(value)
    }

    /// Write to the transport. The cache is left alone until the device
    /// echoes the value back through a read or an update.
    pub async fn write(&self, value: Value) -> HwoResult<()> {
        trace!(channel = %self.inner.name, value = %value, "Writing channel");
        self.inner
            .transport
            .write(&self.inner.address.attribute, value)
            .await
    }

    /// Last value seen, from a read or a polled update.
    pub fn last_value(&self) -> Option<Value> {
        self.inner.state.lock().last.as_ref().map(|(v, _)| v.clone())
    }

    /// Last value if it is younger than `max_age`.
    pub fn fresh_value(&self, max_age: Duration) -> Option<Value> {
        let state = self.inner.state.lock();
        state
            .last
            .as_ref()
            .filter(|(_, at)| at.elapsed() <= max_age)
            .map(|(v, _)| v.clone())
    }

    /// Register `observer` for update and timeout notifications.
    ///
    /// Subscribing the same observer twice has no further effect.
    pub fn subscribe(&self, observer: ObserverId) -> HwoResult<()> {
        let register = {
            let mut state = self.inner.state.lock();
            if !state.subscribers.insert(observer) {
                return Ok(());
            }
            let register = self.inner.options.polling.filter(|_| !state.registered);
            if register.is_some() {
                state.registered = true;
            }
            register
        };

        debug!(channel = %self.inner.name, observer = %observer, "Subscribed");
        let Some(interval) = register else {
            return Ok(());
        };

        let command = match self.start_polling(interval) {
            Ok(command) => command,
            Err(e) => {
                let mut state = self.inner.state.lock();
                state.subscribers.remove(&observer);
                state.registered = false;
                return Err(e);
            }
        };

        // The last subscriber may have left while the poller was adding us.
        let stale = {
            let mut state = self.inner.state.lock();
            if state.registered && state.command.is_none() {
                state.command = Some(command);
                false
            } else {
                true
            }
        };
        if stale {
            self.inner
                .registry
                .stop_command(&self.inner.address.device, self.inner.id, command);
        }
        Ok(())
    }

    fn start_polling(&self, interval: Duration) -> HwoResult<CommandId> {
        let expression = self
            .inner
            .options
            .expression
            .clone()
            .unwrap_or_else(|| PollExpression::attribute(&self.inner.address.attribute));
        let sink: Arc<dyn PollSink> = Arc::new(ChannelSink {
            channel: Arc::downgrade(&self.inner),
        });
        let request = PollRequest::new(self.inner.id, sink, expression)
            .with_interval(interval)
            .with_compare(self.inner.options.compare);
        self.inner.registry.poll(&self.inner.transport, request)
    }

    /// Remove `observer`. Safe to call when it is not subscribed.
    pub fn unsubscribe(&self, observer: ObserverId) -> bool {
        let deregister = {
            let mut state = self.inner.state.lock();
            if !state.subscribers.remove(&observer) {
                return false;
            }
            if state.subscribers.is_empty() {
                state.registered = false;
                state.command.take()
            } else {
                None
            }
        };

        debug!(channel = %self.inner.name, observer = %observer, "Unsubscribed");
        if let Some(command) = deregister {
            self.inner
                .registry
                .stop_command(&self.inner.address.device, self.inner.id, command);
        }
        true
    }

    /// Number of subscribed observers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Whether this channel currently holds a poller registration.
    pub fn is_polling(&self) -> bool {
        self.inner
            .registry
            .is_polling(&self.inner.address.device, self.inner.id)
    }
}

/// Poller-facing side of a channel. Holds the channel weakly.
struct ChannelSink {
    channel: Weak<ChannelInner>,
}

impl PollSink for ChannelSink {
    fn deliver(&self, event: PollEvent) -> Delivery {
        let Some(channel) = self.channel.upgrade() else {
            return Delivery::Dropped;
        };
        channel.store(event.value.clone());

        let subscribers: Vec<ObserverId> =
            channel.state.lock().subscribers.iter().copied().collect();
        let event = event.with_source(channel.name.clone());

        let mut dropped = Vec::new();
        for observer in subscribers {
            if channel.dispatcher.post(observer, event.clone()) == Delivery::Dropped {
                dropped.push(observer);
            }
        }

        if channel.forget(&dropped) {
            Delivery::Queued
        } else {
            Delivery::Dropped
        }
    }

    fn is_alive(&self) -> bool {
        let Some(channel) = self.channel.upgrade() else {
            return false;
        };
        let subscribers: Vec<ObserverId> =
            channel.state.lock().subscribers.iter().copied().collect();
        let dead: Vec<ObserverId> = subscribers
            .into_iter()
            .filter(|id| !channel.dispatcher.is_alive(*id))
            .collect();
        channel.forget(&dead)
    }
}
