//! Device → poller registry.
//!
//! [`PollerRegistry`] guarantees at most one running [`Poller`] per
//! [`DeviceId`]. Pollers are created lazily by the first [`PollerRegistry::poll`]
//! for a device and remove themselves from the registry when they stop (last
//! observer gone, device disconnected, or shutdown). A later `poll` for the
//! same device then starts a fresh instance.
//!
//! Lock order is registry first, poller second. Calls that end up stopping a
//! poller are made with the registry lock released, because a stopping poller
//! takes the registry lock itself to deregister.

use crate::error::{HwoError, HwoResult};
use crate::event::ObserverId;
use crate::poller::{CommandId, DetachFn, PollRequest, Poller};
use crate::transport::{DeviceId, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

struct RegistryInner {
    pollers: Mutex<HashMap<DeviceId, Poller>>,
    runtime: Handle,
}

/// Shared registry of running pollers.
///
/// Created once at startup and handed to every component that polls. Cheap to
/// clone.
#[derive(Clone)]
pub struct PollerRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerRegistry")
            .field("pollers", &self.len())
            .finish()
    }
}

impl PollerRegistry {
    /// Registry spawning its poller tasks on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pollers: Mutex::new(HashMap::new()),
                runtime,
            }),
        }
    }

    /// Registry bound to the runtime of the calling context.
    pub fn from_current() -> HwoResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| HwoError::configuration(format!("no tokio runtime available: {e}")))?;
        Ok(Self::new(runtime))
    }

    /// Register `request` against the poller for `transport`'s device,
    /// starting one if none is running.
    pub fn poll(&self, transport: &Arc<dyn Transport>, request: PollRequest) -> HwoResult<CommandId> {
        if request.interval.is_zero() {
            return Err(HwoError::configuration(format!(
                "poll interval for '{}' must be greater than zero",
                request.expression.label()
            )));
        }

        let device = transport.device().clone();
        let mut pollers = self.inner.pollers.lock();

        let request = match pollers.get(&device) {
            Some(existing) => match existing.add_command(request) {
                Ok(id) => return Ok(id),
                // Stopped but not yet detached; replace it.
                Err(request) => request,
            },
            None => request,
        };

        let poller = Poller::new(device.clone(), transport.clone(), self.detach_hook());
        let id = match poller.add_command(request) {
            Ok(id) => id,
            Err(request) => {
                return Err(HwoError::Dispatch(format!(
                    "fresh poller for '{device}' refused {}",
                    request.expression.label()
                )))
            }
        };
        poller.start(&self.inner.runtime);
        info!(device = %device, instance = poller.instance(), "Started poller");
        pollers.insert(device, poller);
        Ok(id)
    }

    fn detach_hook(&self) -> DetachFn {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        Box::new(move |device: &DeviceId, instance: u64| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut pollers = registry.pollers.lock();
            if pollers.get(device).is_some_and(|p| p.instance() == instance) {
                pollers.remove(device);
                debug!(device = %device, instance, "Poller deregistered");
            }
        })
    }

    /// Remove every registration `observer` has on `device`. Safe to call when
    /// nothing is registered.
    pub fn stop_polling(&self, device: &DeviceId, observer: ObserverId) -> bool {
        match self.poller(device) {
            Some(poller) => poller.remove_observer(observer),
            None => false,
        }
    }

    /// Remove one command.
    pub fn stop_command(&self, device: &DeviceId, observer: ObserverId, command: CommandId) -> bool {
        match self.poller(device) {
            Some(poller) => poller.remove_command(observer, command),
            None => false,
        }
    }

    /// The running poller for `device`, if any.
    pub fn poller(&self, device: &DeviceId) -> Option<Poller> {
        self.inner.pollers.lock().get(device).cloned()
    }

    /// Number of pollers registered for `device`: 0 or 1.
    pub fn poller_count(&self, device: &DeviceId) -> usize {
        usize::from(self.inner.pollers.lock().contains_key(device))
    }

    /// Whether `observer` currently has registrations on `device`.
    pub fn is_polling(&self, device: &DeviceId, observer: ObserverId) -> bool {
        self.poller(device).is_some_and(|p| p.has_observer(observer))
    }

    /// Effective tick period of `device`'s poller.
    pub fn interval(&self, device: &DeviceId) -> Option<Duration> {
        self.poller(device).and_then(|p| p.interval())
    }

    /// Number of registered pollers.
    pub fn len(&self) -> usize {
        self.inner.pollers.lock().len()
    }

    /// Whether no poller is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices with a registered poller.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.inner.pollers.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Ask every poller to stop. Each one finishes its current tick first.
    pub fn shutdown(&self) {
        let pollers: Vec<Poller> = self.inner.pollers.lock().values().cloned().collect();
        info!(count = pollers.len(), "Stopping all pollers");
        for poller in pollers {
            poller.request_stop();
        }
    }
}
