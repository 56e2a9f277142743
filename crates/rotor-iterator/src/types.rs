use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch milliseconds, UTC. All schedule markers use this unit.
pub type Millis = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Name of a schedule field within an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldName(pub String);

impl FieldName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FieldName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FieldName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How the engine computes an entity's next execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingType {
    /// Single next-run timestamp, fixed cadence.
    Regular,
    /// Externally supplied list of upcoming timestamps, consumed
    /// front-to-back with sequential catch-up.
    Irregular,
    /// Like `Irregular`, but stale entries are discarded instead of caught
    /// up one at a time.
    IrregularSkipMissed,
    /// Cron-expression expansion into a bounded look-ahead window.
    Cron,
}

/// Run mode for an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// One bounded sweep per invocation, driven by an external fixed-rate
    /// trigger.
    Pump,
    /// Continuous sweep-then-sleep cycle until cancelled.
    Loop,
}

/// The value of a schedule field as read from an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleValue {
    /// Single optional timestamp (regular scheduling).
    Single(Option<Millis>),
    /// Ordered, time-ascending list. `None` = never scheduled;
    /// `Some(empty)` = parked.
    List(Option<Vec<Millis>>),
}

impl ScheduleValue {
    /// Earliest pending timestamp, if any.
    pub fn head(&self) -> Option<Millis> {
        match self {
            ScheduleValue::Single(t) => *t,
            ScheduleValue::List(entries) => entries.as_ref().and_then(|v| v.first().copied()),
        }
    }

    /// True when the field has never been set. A parked list
    /// (`Some(empty)`) is *set*; it just has nothing pending.
    pub fn is_unset(&self) -> bool {
        matches!(
            self,
            ScheduleValue::Single(None) | ScheduleValue::List(None)
        )
    }

    /// JSON form for the conditional-update guard; `None` when unset.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            ScheduleValue::Single(t) => t.map(Value::from),
            ScheduleValue::List(entries) => entries.as_ref().map(|v| Value::from(v.clone())),
        }
    }
}

/// A policy's verdict for an entity that finished a processing cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulePlan {
    /// Set the single next-run timestamp.
    Next(Millis),
    /// Replace the schedule list.
    Replace(Vec<Millis>),
    /// Drop the stale head, keep the rest of the list untouched.
    PopHead,
    /// No further runs: persist an empty list so due queries stop matching
    /// until something external touches the entity again.
    Park,
}
