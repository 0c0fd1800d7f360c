//! Composition root: builds hardware objects from a [`BeamlineConfig`].
//!
//! `Beamline` owns the dispatcher, the poller registry and every hardware
//! object. Transports are resolved through [`TransportFactory`] by endpoint
//! scheme and shared between devices with the same endpoint.
//!
//! ```rust,ignore
//! let registry = PollerRegistry::from_current()?;
//! let (beamline, events) = Beamline::build(config, &[Arc::new(MockTransportFactory)], registry).await?;
//! tokio::spawn(events.run());
//! beamline.init().await?;
//! ```

use crate::aggregate::{SampleChangerRule, StateAggregator};
use crate::channel::{Channel, ChannelOptions};
use crate::config::{BeamlineConfig, DeviceConfig, DeviceKind};
use crate::dispatch::{ContextId, EventDispatcher, EventLoop};
use crate::error::{HwoError, HwoResult};
use crate::expression::PollExpression;
use crate::hardware_object::HardwareObject;
use crate::registry::PollerRegistry;
use crate::transport::{DeviceId, Transport, TransportFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// All hardware objects of one beamline.
pub struct Beamline {
    config: BeamlineConfig,
    dispatcher: EventDispatcher,
    registry: PollerRegistry,
    context: ContextId,
    objects: BTreeMap<String, HardwareObject>,
}

impl std::fmt::Debug for Beamline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beamline")
            .field("name", &self.config.name)
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Beamline {
    /// Connect every device and build its hardware object.
    ///
    /// Returns the beamline and the [`EventLoop`] its objects are registered
    /// on; the caller decides where that loop runs.
    pub async fn build(
        config: BeamlineConfig,
        factories: &[Arc<dyn TransportFactory>],
        registry: PollerRegistry,
    ) -> HwoResult<(Self, EventLoop)> {
        config.validate()?;
        let dispatcher = EventDispatcher::new();
        let events = dispatcher.create_context(config.name.clone());

        let mut transports: HashMap<DeviceId, Arc<dyn Transport>> = HashMap::new();
        let mut objects = BTreeMap::new();

        for device in &config.devices {
            let span = info_span!("device", name = %device.name, endpoint = %device.endpoint);
            let transport = async {
                let id = DeviceId::new(device.endpoint.as_str());
                if let Some(existing) = transports.get(&id) {
                    return Ok(existing.clone());
                }
                let transport = connect(device, id.clone(), factories).await?;
                transports.insert(id, transport.clone());
                Ok::<_, HwoError>(transport)
            }
            .instrument(span)
            .await?;

            let object = build_object(&config, device, transport, &dispatcher, events.id(), &registry)?;
            objects.insert(device.name.clone(), object);
        }

        info!(beamline = %config.name, objects = objects.len(), "Beamline built");
        Ok((
            Self {
                config,
                dispatcher,
                registry,
                context: events.id(),
                objects,
            },
            events,
        ))
    }

    /// Seed every object with an initial read.
    pub async fn init(&self) -> HwoResult<()> {
        for object in self.objects.values() {
            object.init().await?;
        }
        Ok(())
    }

    /// Beamline name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Loaded configuration.
    pub fn config(&self) -> &BeamlineConfig {
        &self.config
    }

    /// Object by name.
    pub fn object(&self, name: &str) -> Option<&HardwareObject> {
        self.objects.get(name)
    }

    /// All objects, by name.
    pub fn objects(&self) -> impl Iterator<Item = (&str, &HardwareObject)> {
        self.objects.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Dispatcher shared by every object.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Poller registry shared by every channel.
    pub fn registry(&self) -> &PollerRegistry {
        &self.registry
    }

    /// Drop every object, stop every poller and close the event context.
    pub fn shutdown(&mut self) {
        info!(beamline = %self.config.name, "Shutting down beamline");
        self.objects.clear();
        self.registry.shutdown();
        self.dispatcher.close_context(self.context);
    }
}

async fn connect(
    device: &DeviceConfig,
    id: DeviceId,
    factories: &[Arc<dyn TransportFactory>],
) -> HwoResult<Arc<dyn Transport>> {
    let scheme = id.scheme().ok_or_else(|| {
        HwoError::configuration(format!(
            "endpoint '{}' of '{}' has no scheme",
            device.endpoint, device.name
        ))
    })?;
    let factory = factories
        .iter()
        .find(|f| f.scheme() == scheme)
        .ok_or_else(|| HwoError::NotFound(format!("transport for scheme '{scheme}'")))?;

    factory.validate(device.simulation.as_ref())?;
    info!(transport = factory.name(), "Connecting");
    factory.connect(id, device.simulation.clone()).await
}

fn build_object(
    config: &BeamlineConfig,
    device: &DeviceConfig,
    transport: Arc<dyn Transport>,
    dispatcher: &EventDispatcher,
    context: ContextId,
    registry: &PollerRegistry,
) -> HwoResult<HardwareObject> {
    let mut builder = HardwareObject::builder(device.name.as_str()).freshness(config.polling.freshness());

    for channel in &device.channels {
        let mut options = ChannelOptions::polled(channel.interval(&config.polling))
            .with_compare(channel.compare);
        if let Some(template) = &channel.command {
            options = options.with_expression(PollExpression::command(template)?);
        }
        let built = Channel::new(
            channel.name.as_str(),
            channel.attribute(),
            transport.clone(),
            options,
            dispatcher.clone(),
            registry.clone(),
        );
        builder = builder.channel(built, channel.on_timeout);
        if let Some(slot) = &channel.slot {
            builder = builder.feeds(channel.name.as_str(), slot.as_str());
        }
    }

    if let Some(name) = &device.value_channel {
        builder = builder.value_channel(name.as_str());
    }
    if let Some(name) = &device.state_channel {
        builder = builder.state_channel(name.as_str());
    }
    if device.kind == DeviceKind::SampleChanger {
        builder = builder.aggregator(StateAggregator::new(Box::new(SampleChangerRule)));
    }

    builder.build(dispatcher, context)
}
