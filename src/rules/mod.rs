//! Rule and action data model.
//!
//! Rules are declarative: a condition group over variable-store samples
//! and an ordered action list. The JSON shape defined here is the
//! persisted format (local KV and removable-storage exports) and the
//! API surface, so field names are stable.
//!
//! # Main Components
//!
//! - [`Rule`] / [`ConditionGroup`] / [`Condition`] - the trigger side
//! - [`Action`] / [`ActionBody`] - the effect side
//! - [`RuleEngine`] - storage, evaluation and scheduling
//! - [`ActionDispatcher`] - action execution with repeat policy
//! - [`HistoryRing`] - bounded execution telemetry

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::{HttpMethod, LedOp, PowerVerb, LED_PIXEL_ALL};
use crate::value::Value;

mod dispatch;
mod engine;
mod history;

pub use dispatch::{
    ActionDispatcher, ActionOutcome, DispatchResult, DispatchSummary, DispatcherStats,
    PendingCompletion, SshCommandDef,
};
pub use engine::{EngineConfig, EngineStats, EvalResult, RuleEngine};
pub use history::{ExecutionRecord, ExecutionStatus, HistoryRing, TriggerSource};

/// Maximum length of a rule id.
pub const MAX_RULE_ID_LEN: usize = 63;

/// Iteration cap for `while_true` repeats.
pub const WHILE_TRUE_CAP: u32 = 100;

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring test; both operands must be strings.
    Contains,
    /// True when the variable differs from its previous sample.
    Changed,
    /// True when the variable changed and now equals the target value.
    ChangedTo,
}

/// One condition over a named variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    pub variable: String,
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(variable: &str, operator: ConditionOp, value: impl Into<Value>) -> Self {
        Self {
            variable: variable.to_string(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluates against the current and previous sample of the variable.
    /// A missing variable never matches.
    pub fn eval(&self, current: Option<&Value>, previous: Option<&Value>) -> bool {
        let Some(current) = current else {
            return false;
        };
        match self.operator {
            ConditionOp::Eq => current.loosely_eq(&self.value),
            ConditionOp::Ne => !current.loosely_eq(&self.value),
            ConditionOp::Lt => matches!(
                current.partial_cmp_loose(&self.value),
                Some(std::cmp::Ordering::Less)
            ),
            ConditionOp::Le => matches!(
                current.partial_cmp_loose(&self.value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            ConditionOp::Gt => matches!(
                current.partial_cmp_loose(&self.value),
                Some(std::cmp::Ordering::Greater)
            ),
            ConditionOp::Ge => matches!(
                current.partial_cmp_loose(&self.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            ConditionOp::Contains => current.contains(&self.value),
            ConditionOp::Changed => previous.is_some_and(|prev| prev != current),
            ConditionOp::ChangedTo => {
                previous.is_some_and(|prev| prev != current) && current.loosely_eq(&self.value)
            }
        }
    }
}

/// Combining logic of a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GroupLogic {
    #[default]
    And,
    Or,
}

/// An ordered list of conditions under one logic operator.
///
/// An empty group never matches; rules that should only fire manually
/// carry an empty group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: GroupLogic,
    #[serde(default)]
    pub items: Vec<Condition>,
}

impl ConditionGroup {
    pub fn all(items: Vec<Condition>) -> Self {
        Self {
            logic: GroupLogic::And,
            items,
        }
    }

    pub fn any(items: Vec<Condition>) -> Self {
        Self {
            logic: GroupLogic::Or,
            items,
        }
    }

    /// Evaluates with short-circuiting. `lookup` and `previous` sample
    /// the variable store and the engine's previous-sample cache.
    pub fn eval(
        &self,
        lookup: impl Fn(&str) -> Option<Value>,
        previous: impl Fn(&str) -> Option<Value>,
    ) -> bool {
        if self.items.is_empty() {
            return false;
        }
        match self.logic {
            GroupLogic::And => self.items.iter().all(|c| {
                c.eval(lookup(&c.variable).as_ref(), previous(&c.variable).as_ref())
            }),
            GroupLogic::Or => self.items.iter().any(|c| {
                c.eval(lookup(&c.variable).as_ref(), previous(&c.variable).as_ref())
            }),
        }
    }

    /// Variable names referenced by change-operators; the engine keeps
    /// previous samples for exactly these.
    pub fn change_tracked_variables(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|c| {
                matches!(c.operator, ConditionOp::Changed | ConditionOp::ChangedTo)
            })
            .map(|c| c.variable.as_str())
    }
}

/// Repeat policy of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Once,
    /// Up to `repeat_count` invocations with `repeat_interval_ms` sleeps.
    Count,
    /// Loops while the per-action condition holds, capped at
    /// [`WHILE_TRUE_CAP`] iterations.
    WhileTrue,
}

/// Log severity of a log action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn default_repeat_count() -> u32 {
    1
}

fn default_repeat_interval() -> u32 {
    1000
}

fn default_ssh_timeout() -> u32 {
    10_000
}

fn default_cli_timeout() -> u32 {
    10_000
}

fn default_led_pixel() -> u8 {
    LED_PIXEL_ALL
}

fn default_true() -> bool {
    true
}

/// Type-specific payload of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionBody {
    Led {
        device: String,
        /// Pixel index; [`LED_PIXEL_ALL`] fills the device.
        #[serde(default = "default_led_pixel")]
        pixel: u8,
        rgb: [u8; 3],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        effect: Option<String>,
        #[serde(default)]
        duration_ms: u32,
        #[serde(default)]
        op: LedOp,
    },
    Gpio {
        pin: u8,
        level: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pulse_ms: Option<u32>,
    },
    DeviceCtrl {
        device: String,
        verb: PowerVerb,
    },
    /// Inline SSH command against a host reference resolved through the
    /// variable store.
    Ssh {
        host_ref: String,
        command: String,
        #[serde(default = "default_ssh_timeout")]
        timeout_ms: u32,
    },
    /// Registered SSH command executed through the asynchronous queue.
    SshCmdRef {
        command_id: String,
    },
    /// Local command executed through the asynchronous queue.
    Cli {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capture_variable: Option<String>,
        #[serde(default = "default_cli_timeout")]
        timeout_ms: u32,
    },
    Webhook {
        url: String,
        method: HttpMethod,
        #[serde(default)]
        body: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    SetVar {
        variable: String,
        value: Value,
    },
}

/// One action with its common execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Action {
    #[serde(flatten)]
    pub body: ActionBody,
    /// Pre-delay before the first invocation.
    #[serde(default)]
    pub delay_ms: u16,
    /// Delegates execution to a registered action template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Per-action condition, separate from the rule condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub repeat: RepeatMode,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    #[serde(default = "default_repeat_interval")]
    pub repeat_interval_ms: u32,
}

impl Action {
    pub fn new(body: ActionBody) -> Self {
        Self {
            body,
            delay_ms: 0,
            template_id: None,
            condition: None,
            repeat: RepeatMode::Once,
            repeat_count: default_repeat_count(),
            repeat_interval_ms: default_repeat_interval(),
        }
    }
}

/// A declarative automation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub manual_trigger: bool,
    #[serde(default)]
    pub cooldown_ms: u32,
    #[serde(default)]
    pub conditions: ConditionGroup,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Runtime telemetry, not part of the persisted shape.
    #[serde(skip)]
    pub last_trigger_ms: u64,
    #[serde(skip)]
    pub trigger_count: u32,
}

impl Rule {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            icon: None,
            enabled: true,
            manual_trigger: false,
            cooldown_ms: 0,
            conditions: ConditionGroup::default(),
            actions: Vec::new(),
            last_trigger_ms: 0,
            trigger_count: 0,
        }
    }

    /// Validates cross-field invariants before registration.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.len() > MAX_RULE_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "rule id length must be 1..={MAX_RULE_ID_LEN}"
            )));
        }
        if self
            .id
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
        {
            return Err(Error::InvalidArgument(format!(
                "rule id must be alphanumeric/underscore/dash: '{}'",
                self.id
            )));
        }
        for (i, action) in self.actions.iter().enumerate() {
            if action.repeat == RepeatMode::Count && action.repeat_count == 0 {
                return Err(Error::InvalidArgument(format!(
                    "action[{i}] repeat_count must be at least 1"
                )));
            }
            if action.repeat == RepeatMode::WhileTrue && action.condition.is_none() {
                return Err(Error::InvalidArgument(format!(
                    "action[{i}] while_true repeat requires a per-action condition"
                )));
            }
        }
        Ok(())
    }

    /// Serializes to the persisted JSON shape.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Parse(format!("rule encode: {e}")))
    }

    /// Deserializes from the persisted JSON shape.
    pub fn from_json(json: &str) -> Result<Self> {
        let rule: Rule =
            serde_json::from_str(json).map_err(|e| Error::Parse(format!("rule decode: {e}")))?;
        rule.validate()?;
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_none(_: &str) -> Option<Value> {
        None
    }

    #[test]
    fn empty_group_never_matches() {
        let group = ConditionGroup::all(vec![]);
        assert!(!group.eval(|_| Some(Value::Bool(true)), lookup_none));
        let group = ConditionGroup::any(vec![]);
        assert!(!group.eval(|_| Some(Value::Bool(true)), lookup_none));
    }

    #[test]
    fn missing_variable_is_condition_false() {
        let group = ConditionGroup::all(vec![Condition::new("absent", ConditionOp::Eq, 1)]);
        assert!(!group.eval(lookup_none, lookup_none));
    }

    #[test]
    fn and_short_circuits_or_matches_any() {
        let lookup = |name: &str| match name {
            "a" => Some(Value::Int(1)),
            "b" => Some(Value::Int(2)),
            _ => None,
        };
        let both = vec![
            Condition::new("a", ConditionOp::Eq, 1),
            Condition::new("b", ConditionOp::Eq, 99),
        ];
        assert!(!ConditionGroup::all(both.clone()).eval(lookup, lookup_none));
        assert!(ConditionGroup::any(both).eval(lookup, lookup_none));
    }

    #[test]
    fn contains_is_substring_on_strings_only() {
        let lookup = |_: &str| Some(Value::from("temperature critical"));
        let group = ConditionGroup::all(vec![Condition::new(
            "msg",
            ConditionOp::Contains,
            "critical",
        )]);
        assert!(group.eval(lookup, lookup_none));

        let lookup_int = |_: &str| Some(Value::Int(7));
        assert!(!group.eval(lookup_int, lookup_none));
    }

    #[test]
    fn changed_requires_a_previous_sample() {
        let cond = Condition::new("temp", ConditionOp::Changed, false);
        let now = Value::Int(80);
        assert!(!cond.eval(Some(&now), None));
        assert!(!cond.eval(Some(&now), Some(&Value::Int(80))));
        assert!(cond.eval(Some(&now), Some(&Value::Int(20))));

        let cond = Condition::new("temp", ConditionOp::ChangedTo, 80);
        assert!(cond.eval(Some(&now), Some(&Value::Int(20))));
        assert!(!cond.eval(Some(&now), Some(&Value::Int(80))));
        let other = Value::Int(75);
        assert!(!cond.eval(Some(&other), Some(&Value::Int(20))));
    }

    #[test]
    fn rule_json_round_trip_preserves_observable_fields() {
        let mut rule = Rule::new("alpha", "High temperature");
        rule.icon = Some("thermometer".to_string());
        rule.cooldown_ms = 5000;
        rule.conditions = ConditionGroup::all(vec![Condition::new("temp", ConditionOp::Gt, 75)]);
        let mut action = Action::new(ActionBody::Log {
            level: LogLevel::Warn,
            message: "hot".to_string(),
        });
        action.delay_ms = 10;
        rule.actions.push(action);
        rule.actions.push(Action::new(ActionBody::SetVar {
            variable: "alarm".to_string(),
            value: Value::Bool(true),
        }));

        let json = rule.to_json().expect("encode");
        let back = Rule::from_json(&json).expect("decode");
        assert_eq!(back, rule);
    }

    #[test]
    fn rule_json_field_names_are_stable() {
        let mut rule = Rule::new("alpha", "n");
        rule.conditions = ConditionGroup::all(vec![Condition::new("temp", ConditionOp::Gt, 75)]);
        rule.actions.push(Action::new(ActionBody::Webhook {
            url: "http://example/hook".to_string(),
            method: HttpMethod::Post,
            body: "{}".to_string(),
        }));
        let json: serde_json::Value =
            serde_json::from_str(&rule.to_json().expect("encode")).expect("json");

        assert_eq!(json["id"], "alpha");
        assert_eq!(json["enabled"], true);
        assert_eq!(json["cooldown_ms"], 0);
        assert_eq!(json["conditions"]["logic"], "and");
        assert_eq!(json["conditions"]["items"][0]["variable"], "temp");
        assert_eq!(json["conditions"]["items"][0]["operator"], "gt");
        assert_eq!(json["conditions"]["items"][0]["value"], 75);
        assert_eq!(json["actions"][0]["type"], "webhook");
        assert_eq!(json["actions"][0]["method"], "POST");
        assert_eq!(json["actions"][0]["delay_ms"], 0);
        // Runtime telemetry stays out of the persisted shape.
        assert!(json.get("last_trigger_ms").is_none());
        assert!(json.get("trigger_count").is_none());
    }

    #[test]
    fn decode_classifies_numbers_per_int32_rule() {
        let json = r#"{
            "id": "r", "name": "n",
            "conditions": { "logic": "or", "items": [
                { "variable": "temp", "operator": "gt", "value": 75 },
                { "variable": "load", "operator": "ge", "value": 1.5 }
            ]},
            "actions": []
        }"#;
        let rule = Rule::from_json(json).expect("decode");
        assert_eq!(rule.conditions.items[0].value, Value::Int(75));
        assert_eq!(rule.conditions.items[1].value, Value::Float(1.5));
        assert!(rule.enabled);
    }

    #[test]
    fn validate_rejects_bad_rules() {
        let mut rule = Rule::new("", "n");
        assert!(matches!(
            rule.validate().expect_err("empty id"),
            Error::InvalidArgument(_)
        ));
        rule.id = "ok".to_string();
        let mut action = Action::new(ActionBody::Log {
            level: LogLevel::Info,
            message: "m".to_string(),
        });
        action.repeat = RepeatMode::WhileTrue;
        rule.actions.push(action);
        assert!(matches!(
            rule.validate().expect_err("while_true without condition"),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn change_tracked_variables_lists_change_operators_only() {
        let group = ConditionGroup::all(vec![
            Condition::new("a", ConditionOp::Eq, 1),
            Condition::new("b", ConditionOp::Changed, false),
            Condition::new("c", ConditionOp::ChangedTo, 5),
        ]);
        let tracked: Vec<&str> = group.change_tracked_variables().collect();
        assert_eq!(tracked, vec!["b", "c"]);
    }
}
