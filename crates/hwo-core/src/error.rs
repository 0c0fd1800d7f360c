//! Error types for hardware objects and the polling machinery.
//!
//! `HwoError` is the single error type returned by every fallible operation in
//! this crate. It is built with `thiserror` and follows the same split the
//! polling loop relies on:
//!
//! - **`Transport`**: connection-level failure (socket down, device server
//!   unreachable). Recoverable: the poller retries on the next tick and does
//!   not log it above `debug`.
//! - **`Protocol`**: the remote side rejected the request (unknown attribute,
//!   type mismatch). Logged at error level, not retried within the tick.
//! - **`Expression`**: a per-observer poll expression failed to evaluate. Only
//!   that one (observer, expression) pair is affected.
//! - **`Configuration`**: a malformed registration or configuration file,
//!   reported synchronously to whoever tried to register or load it.
//!
//! Errors raised inside the polling loop never reach observers. Errors raised
//! by synchronous `read`/`write`/`get_value`/`set_value` calls propagate to the
//! caller with `?` as usual.

use thiserror::Error;

/// Convenience alias for results using [`HwoError`].
pub type HwoResult<T> = std::result::Result<T, HwoError>;

/// Primary error type for channels, pollers and hardware objects.
#[derive(Error, Debug)]
pub enum HwoError {
    /// Connection-level failure talking to a device.
    ///
    /// **Error Type**: Transient. The poller treats it as silent and retries
    /// on the next tick.
    #[error("Transport error on '{device}': {message}")]
    Transport {
        /// Device endpoint the request was addressed to.
        device: String,
        /// Human-readable cause.
        message: String,
    },

    /// The device rejected the request.
    ///
    /// **Error Type**: Permanent for the request that produced it (bad
    /// attribute name, wrong type). Logged, never retried inside the same tick.
    #[error("Protocol error on '{device}': {message}")]
    Protocol {
        /// Device endpoint the request was addressed to.
        device: String,
        /// Human-readable cause.
        message: String,
    },

    /// A poll expression failed to evaluate.
    #[error("Expression '{expression}' failed: {message}")]
    Expression {
        /// Label of the failing expression.
        expression: String,
        /// Human-readable cause.
        message: String,
    },

    /// A registration or configuration value is invalid.
    ///
    /// **Recovery Strategy**: fix the configuration; the registration that
    /// produced this error was not applied.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A named channel, device or observer does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The event dispatch layer could not accept a registration.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Configuration file parsing failed.
    #[error("Failed to load configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HwoError {
    /// Build a [`HwoError::Transport`].
    pub fn transport(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`HwoError::Protocol`].
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`HwoError::Expression`].
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Build a [`HwoError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error belongs to the silent, retry-next-tick class.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Expression { .. } => "expression",
            Self::Configuration(_) => "configuration",
            Self::NotFound(_) => "not_found",
            Self::Dispatch(_) => "dispatch",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

impl From<figment::Error> for HwoError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
