use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::{FaultCode, ReconciliationResult, ShadowDocument, StateMap};

/// Key carrying the human readable outcome of the last cycle
pub const STATUS_KEY: &str = "status";

/// Key carrying the fault code of the last cycle, cleared with `null`
pub const FAULT_KEY: &str = "fault";

/// The span of positions the actuator can reach
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TargetRange {
    pub min: f64,
    pub max: f64,
}

impl Default for TargetRange {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
        }
    }
}

/// What the engine is asked to do this cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Nothing changed, only observe
    Unchanged,
    /// Drive the actuator to this position
    MoveTo(f64),
    /// Refuse to actuate and report the fault
    Reject(FaultCode),
}

/// Desired vs. reported bookkeeping for one wake cycle
#[derive(Debug, Clone)]
pub struct ThingState {
    desired: StateMap,
    reported: StateMap,
    position_key: String,
}

impl ThingState {
    pub fn new(document: &ShadowDocument, position_key: impl Into<String>) -> Self {
        Self {
            desired: document.desired.clone(),
            reported: document.reported.clone(),
            position_key: position_key.into(),
        }
    }

    /// Keys whose desired value differs from the reported one, including keys
    /// that were never reported.
    pub fn diff(desired: &StateMap, reported: &StateMap) -> BTreeSet<String> {
        desired
            .iter()
            .filter(|(key, value)| !reported.get(*key).is_some_and(|r| same_value(r, value)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn changed(&self) -> BTreeSet<String> {
        Self::diff(&self.desired, &self.reported)
    }

    pub fn desired(&self) -> &StateMap {
        &self.desired
    }

    pub fn reported(&self) -> &StateMap {
        &self.reported
    }

    /// Decide what the engine should do with the position key.
    ///
    /// Only a changed position key leads to actuation. Values that are not
    /// numbers or fall outside `range` are rejected.
    pub fn target(&self, range: TargetRange) -> Target {
        if !self.changed().contains(&self.position_key) {
            return Target::Unchanged;
        }

        match self.desired.get(&self.position_key).and_then(Value::as_f64) {
            Some(position) if position >= range.min && position <= range.max => {
                Target::MoveTo(position)
            }
            other => {
                debug!(
                    key = %self.position_key,
                    value = ?other,
                    "rejecting desired position"
                );
                Target::Reject(FaultCode::InvalidTarget)
            }
        }
    }

    /// The `sleep` seconds requested through the desired state, if any
    pub fn requested_sleep_secs(&self) -> Option<u64> {
        self.desired
            .get("sleep")
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
    }

    /// Build the reported mapping for this cycle.
    ///
    /// Position comes only from what the actuator was observed at, never from
    /// the desired document. Values already reported with the same value are
    /// left out, except for the status and fault fields after the engine acted
    /// or failed.
    pub fn merge(&self, result: &ReconciliationResult, telemetry: StateMap) -> StateMap {
        let mut report = StateMap::new();

        if let Some(position) = result.final_position.and_then(position_value) {
            report.insert(self.position_key.clone(), position);
        }

        for (key, value) in telemetry {
            report.insert(key, value);
        }

        // drop anything the shadow already holds
        report.retain(|key, value| !self.reported.get(key).is_some_and(|r| same_value(r, value)));

        let noteworthy = result.actuated || !result.is_success();
        if noteworthy {
            report.insert(STATUS_KEY.to_owned(), Value::String(result.status()));
        }

        match &result.fault {
            Some(fault) => {
                report.insert(FAULT_KEY.to_owned(), Value::String(fault.to_string()));
            }
            // a null removes the key from the shadow
            None if self.reported.get(FAULT_KEY).is_some_and(|v| !v.is_null()) => {
                report.insert(FAULT_KEY.to_owned(), Value::Null);
            }
            None => {}
        }

        report
    }
}

/// Compare JSON values treating `50` and `50.0` as the same number
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

/// Encode a position, as an integer when it has no fractional part
fn position_value(position: f64) -> Option<Value> {
    if position.fract() == 0.0 && position.abs() < i64::MAX as f64 {
        Some(Value::from(position as i64))
    } else {
        serde_json::Number::from_f64(position).map(Value::Number)
    }
}
