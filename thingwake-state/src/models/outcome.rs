use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a cycle ended without reaching its target
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// The actuator reported it cannot move
    Stall,
    /// Average motor current went above the configured threshold
    Overcurrent,
    /// The position sensor could not be read
    Sensor,
    /// The motor driver refused a command
    Driver,
    /// The desired value cannot be acted upon
    InvalidTarget,
    /// A previous actuation was cut short, most likely by a power loss
    Interrupted,
    /// The cycle never reached the engine and could not report
    Aborted,
}

impl Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            FaultCode::Stall => "stall",
            FaultCode::Overcurrent => "overcurrent",
            FaultCode::Sensor => "sensor",
            FaultCode::Driver => "driver",
            FaultCode::InvalidTarget => "invalid_target",
            FaultCode::Interrupted => "interrupted",
            FaultCode::Aborted => "aborted",
        };
        f.write_str(code)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Converged,
    TimedOut,
    Faulted,
}

/// Position bookkeeping while the engine is actuating
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorState {
    pub current_position: f64,
    pub target_position: f64,
    pub tolerance_window: f64,
}

impl ActuatorState {
    pub fn is_converged(&self) -> bool {
        (self.target_position - self.current_position).abs() <= self.tolerance_window
    }
}

/// How a reconciliation ended
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub outcome: Outcome,

    /// The last position actually read from the actuator. `None` only if the
    /// sensor never answered during the cycle.
    pub final_position: Option<f64>,

    /// Time spent since entering `Actuating`, zero if the engine never did
    pub elapsed: Duration,

    pub fault: Option<FaultCode>,

    /// Whether the engine commanded the actuator at all
    pub actuated: bool,
}

impl ReconciliationResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Converged
    }

    /// A one line summary to report as the thing status
    pub fn status(&self) -> String {
        let position = self
            .final_position
            .map(|p| format!("{p}"))
            .unwrap_or_else(|| "unknown".to_owned());
        match (&self.outcome, &self.fault) {
            (Outcome::Converged, _) if self.actuated => format!(
                "done: position {position} after {} ms",
                self.elapsed.as_millis()
            ),
            (Outcome::Converged, _) => format!("done: already at position {position}"),
            (Outcome::TimedOut, _) => format!(
                "error: timed out at position {position} after {} ms",
                self.elapsed.as_millis()
            ),
            (Outcome::Faulted, Some(fault)) => {
                format!("error: {fault} at position {position}")
            }
            (Outcome::Faulted, None) => format!("error: fault at position {position}"),
        }
    }
}
