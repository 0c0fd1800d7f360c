//! Composite state recomputed from several raw channel values.
//!
//! A [`StateAggregator`] keeps one slot per contributing input. Every update to
//! any slot recomputes the whole composite through an [`AggregateRule`] and
//! returns a full [`GlobalState`] snapshot, never a diff.
//!
//! [`SampleChangerRule`] is the rule used by sample changers. Its status string
//! resolves in a fixed order:
//!
//! 1. `running` → `MOVING`
//! 2. not `powered` while otherwise ready → `DISABLED`
//! 3. ready → `READY`
//! 4. the raw device state, verbatim

use crate::error::{HwoError, HwoResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot of a composite device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// Every contributing input plus derived flags.
    pub state: BTreeMap<String, Value>,
    /// Which commands are currently allowed.
    pub commands: BTreeMap<String, bool>,
    /// Computed status string (`MOVING`, `READY`, ...).
    pub status: String,
    /// Free-text message from the device, empty if none.
    pub message: String,
}

impl GlobalState {
    /// Whether `command` is currently allowed. Unknown commands are not.
    pub fn allows(&self, command: &str) -> bool {
        self.commands.get(command).copied().unwrap_or(false)
    }
}

/// How a composite is computed from its inputs.
pub trait AggregateRule: Send + Sync {
    /// Rule name for logs.
    fn name(&self) -> &str;

    /// Input slot names, in the order they are reported.
    fn inputs(&self) -> &[&'static str];

    /// Inputs that must be wired for the rule to make sense.
    fn required(&self) -> &[&'static str] {
        self.inputs()
    }

    /// Compute a snapshot. Slots without a value yet hold [`Value::Null`].
    fn evaluate(&self, slots: &BTreeMap<String, Value>) -> GlobalState;
}

/// Slot cache plus a rule.
pub struct StateAggregator {
    rule: Box<dyn AggregateRule>,
    slots: BTreeMap<String, Value>,
}

impl fmt::Debug for StateAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateAggregator")
            .field("rule", &self.rule.name())
            .field("slots", &self.slots)
            .finish()
    }
}

impl StateAggregator {
    /// Aggregator with every slot of `rule` set to `Null`.
    pub fn new(rule: Box<dyn AggregateRule>) -> Self {
        let slots = rule
            .inputs()
            .iter()
            .map(|name| ((*name).to_string(), Value::Null))
            .collect();
        Self { rule, slots }
    }

    /// Whether `slot` contributes to this composite.
    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    /// Current value of `slot`.
    pub fn slot(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot)
    }

    /// Rule in use.
    pub fn rule(&self) -> &dyn AggregateRule {
        self.rule.as_ref()
    }

    /// Store `value` in `slot` and recompute. Always returns a snapshot, even
    /// when the value is unchanged.
    pub fn update(&mut self, slot: &str, value: Value) -> HwoResult<GlobalState> {
        let entry = self.slots.get_mut(slot).ok_or_else(|| {
            HwoError::NotFound(format!("slot '{slot}' in {} composite", self.rule.name()))
        })?;
        *entry = value;
        Ok(self.snapshot())
    }

    /// Recompute from the current slots.
    pub fn snapshot(&self) -> GlobalState {
        self.rule.evaluate(&self.slots)
    }
}

/// Composite rule for robotic sample changers.
///
/// Inputs: `state` (raw device state string), `powered`, `running`,
/// `lid_open`, `tool_open`, `sample_on_diffractometer` and `message`.
#[derive(Debug, Clone, Default)]
pub struct SampleChangerRule;

impl SampleChangerRule {
    const INPUTS: &'static [&'static str] = &[
        "state",
        "powered",
        "running",
        "lid_open",
        "tool_open",
        "sample_on_diffractometer",
        "message",
    ];
    const REQUIRED: &'static [&'static str] = &["state", "powered", "running"];
    const READY_STATES: &'static [&'static str] = &["READY", "ON", "STANDBY"];

    fn flag(slots: &BTreeMap<String, Value>, name: &str) -> bool {
        slots.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    fn text(slots: &BTreeMap<String, Value>, name: &str) -> String {
        match slots.get(name) {
            Some(Value::Null) | None => String::new(),
            Some(Value::Str(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

impl AggregateRule for SampleChangerRule {
    fn name(&self) -> &str {
        "sample_changer"
    }

    fn inputs(&self) -> &[&'static str] {
        Self::INPUTS
    }

    fn required(&self) -> &[&'static str] {
        Self::REQUIRED
    }

    fn evaluate(&self, slots: &BTreeMap<String, Value>) -> GlobalState {
        let raw = Self::text(slots, "state");
        let powered = Self::flag(slots, "powered");
        let running = Self::flag(slots, "running");
        let lid_open = Self::flag(slots, "lid_open");
        let tool_open = Self::flag(slots, "tool_open");
        let loaded = Self::flag(slots, "sample_on_diffractometer");
        let ready = Self::READY_STATES
            .iter()
            .any(|s| raw.eq_ignore_ascii_case(s));

        let status = if running {
            "MOVING".to_string()
        } else if !powered && ready {
            "DISABLED".to_string()
        } else if ready {
            "READY".to_string()
        } else {
            raw.clone()
        };

        let mut state = slots.clone();
        state.insert("ready".into(), Value::Bool(ready));

        let idle = powered && !running;
        let commands = BTreeMap::from([
            ("powerOn".to_string(), !powered),
            ("powerOff".to_string(), idle),
            ("openLid".to_string(), idle && !lid_open),
            ("closeLid".to_string(), idle && lid_open),
            ("openTool".to_string(), idle && !tool_open),
            ("closeTool".to_string(), idle && tool_open),
            ("dry".to_string(), idle && ready),
            ("soak".to_string(), idle && ready && !loaded),
            ("home".to_string(), idle && ready),
            ("safe".to_string(), idle),
            ("reset".to_string(), !running),
            ("abort".to_string(), running),
        ]);

        GlobalState {
            state,
            commands,
            status,
            message: Self::text(slots, "message"),
        }
    }
}
