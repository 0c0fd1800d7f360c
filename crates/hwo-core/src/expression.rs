//! Poll expressions: what a poller evaluates on each tick.
//!
//! A registration describes its read operation once, at registration time, and
//! the poller re-runs it every tick without re-interpreting anything. Three
//! forms exist:
//!
//! - [`PollExpression::attribute`]: read one attribute.
//! - [`PollExpression::command`]: call a device command described by a template
//!   such as `get_position(1, "phi")`. The template is parsed and validated
//!   immediately; a malformed template is a [`HwoError::Configuration`] for the
//!   caller, never a failure deferred to the polling loop.
//! - [`PollExpression::custom`]: an arbitrary closure over the transport.

use crate::error::{HwoError, HwoResult};
use crate::transport::Transport;
use crate::value::Value;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Closure type for custom poll expressions.
pub type ReadFn =
    Arc<dyn Fn(Arc<dyn Transport>) -> BoxFuture<'static, HwoResult<Value>> + Send + Sync>;

const TEMPLATE_PATTERN: &str = r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:\((?s:(.*))\))?\s*$";

/// Compiled once, shared by every `parse`.
static TEMPLATE: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(TEMPLATE_PATTERN));

/// A device command name plus literal arguments.
///
/// Arguments are JSON literals separated by commas: numbers, `true`/`false`,
/// `null`, double-quoted strings and arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    name: String,
    args: Vec<Value>,
}

impl CommandTemplate {
    /// Parse `name` or `name(arg, ...)`.
    pub fn parse(template: &str) -> HwoResult<Self> {
        let pattern = TEMPLATE
            .as_ref()
            .map_err(|e| HwoError::configuration(format!("template pattern: {e}")))?;
        let captures = pattern.captures(template).ok_or_else(|| {
            HwoError::configuration(format!("unparsable command template '{template}'"))
        })?;

        let name = captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| HwoError::configuration(format!("missing command name in '{template}'")))?;

        let args = match captures.get(2).map(|m| m.as_str().trim()) {
            None | Some("") => Vec::new(),
            Some(raw) => {
                let parsed: Vec<serde_json::Value> = serde_json::from_str(&format!("[{raw}]"))
                    .map_err(|e| {
                        HwoError::configuration(format!(
                            "invalid arguments in command template '{template}': {e}"
                        ))
                    })?;
                parsed.into_iter().map(Value::from).collect()
            }
        };

        Ok(Self { name, args })
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                Value::Str(s) => write!(f, "{s:?}")?,
                other => write!(f, "{other}")?,
            }
        }
        write!(f, ")")
    }
}

#[derive(Clone)]
enum ExpressionKind {
    Attribute(String),
    Command(CommandTemplate),
    Custom(ReadFn),
}

/// A validated, repeatable read operation.
#[derive(Clone)]
pub struct PollExpression {
    label: String,
    kind: ExpressionKind,
}

impl PollExpression {
    /// Read `attribute` on every tick.
    pub fn attribute(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self {
            label: attribute.clone(),
            kind: ExpressionKind::Attribute(attribute),
        }
    }

    /// Execute a command template on every tick.
    pub fn command(template: &str) -> HwoResult<Self> {
        let parsed = CommandTemplate::parse(template)?;
        Ok(Self {
            label: parsed.to_string(),
            kind: ExpressionKind::Command(parsed),
        })
    }

    /// Run an arbitrary closure on every tick.
    pub fn custom<F>(label: impl Into<String>, read: F) -> Self
    where
        F: Fn(Arc<dyn Transport>) -> BoxFuture<'static, HwoResult<Value>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            kind: ExpressionKind::Custom(Arc::new(read)),
        }
    }

    /// Replace the label used in events and logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Label used in events and logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Evaluate once against `transport`.
    pub async fn evaluate(&self, transport: &Arc<dyn Transport>) -> HwoResult<Value> {
        match &self.kind {
            ExpressionKind::Attribute(attribute) => transport.read(attribute).await,
            ExpressionKind::Command(template) => {
                transport.execute(template.name(), template.args()).await
            }
            ExpressionKind::Custom(read) => read(transport.clone()).await,
        }
    }
}

impl fmt::Debug for PollExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ExpressionKind::Attribute(_) => "attribute",
            ExpressionKind::Command(_) => "command",
            ExpressionKind::Custom(_) => "custom",
        };
        f.debug_struct("PollExpression")
            .field("label", &self.label)
            .field("kind", &kind)
            .finish()
    }
}
