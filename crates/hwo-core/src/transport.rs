//! Transport abstraction over vendor control systems.
//!
//! Tango, Taco, Exporter and SPEC all boil down to the same four operations as
//! far as hardware objects are concerned: read an attribute, write an
//! attribute, execute a named command, and check whether the device is still
//! reachable. [`Transport`] is that seam; one implementation exists per
//! protocol and is selected at configuration time through a
//! [`TransportFactory`] keyed on the endpoint scheme (`tango://`, `mock://`).
//!
//! # Example: Implementing a Transport Factory
//!
//! ```rust,ignore
//! use hwo_core::transport::{DeviceId, Transport, TransportFactory};
//!
//! pub struct ExporterFactory;
//!
//! impl TransportFactory for ExporterFactory {
//!     fn scheme(&self) -> &'static str { "exporter" }
//!     fn name(&self) -> &'static str { "EMBL Exporter" }
//!
//!     fn connect(&self, device: DeviceId, _simulation: Option<toml::Value>)
//!         -> BoxFuture<'static, HwoResult<Arc<dyn Transport>>>
//!     {
//!         Box::pin(async move { Ok(Arc::new(ExporterClient::connect(device).await?) as _) })
//!     }
//! }
//! ```

use crate::error::{HwoError, HwoResult};
use crate::value::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of one physical device or connection endpoint.
///
/// One [`crate::poller::Poller`] exists per `DeviceId` at most.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an endpoint string such as `tango://id29/cats/1`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    /// The endpoint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme prefix (`tango` for `tango://...`), if any.
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Fully qualified address of one attribute: device plus attribute name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Owning device endpoint.
    pub device: DeviceId,
    /// Attribute name on that device.
    pub attribute: String,
}

impl ChannelAddress {
    /// Create an address.
    pub fn new(device: DeviceId, attribute: impl Into<String>) -> Self {
        Self {
            device,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.attribute)
    }
}

/// Connection to one device on some control system.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint this transport is connected to.
    fn device(&self) -> &DeviceId;

    /// Read one attribute.
    async fn read(&self, attribute: &str) -> HwoResult<Value>;

    /// Write one attribute.
    async fn write(&self, attribute: &str, value: Value) -> HwoResult<()>;

    /// Execute a named device command with positional arguments.
    async fn execute(&self, command: &str, _args: &[Value]) -> HwoResult<Value> {
        Err(HwoError::protocol(
            self.device().as_str(),
            format!("command '{command}' is not supported by this transport"),
        ))
    }

    /// Liveness check. A poller stops itself once this returns `false`.
    async fn is_connected(&self) -> bool {
        true
    }
}

/// Builds transports for one endpoint scheme.
pub trait TransportFactory: Send + Sync {
    /// Endpoint scheme this factory handles (`mock`, `tango`, ...).
    fn scheme(&self) -> &'static str;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Check a device's simulation/connection table before connecting.
    fn validate(&self, _options: Option<&toml::Value>) -> HwoResult<()> {
        Ok(())
    }

    /// Open a transport to `device`.
    fn connect(
        &self,
        device: DeviceId,
        options: Option<toml::Value>,
    ) -> BoxFuture<'static, HwoResult<Arc<dyn Transport>>>;
}
