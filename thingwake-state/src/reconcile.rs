use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::actuator::{Actuator, ActuatorLease, Direction, HardwareFault};
use crate::models::{ActuatorState, FaultCode, Outcome, ReconciliationResult};
use crate::thing_state::Target;
use crate::util::json::millis;

/// Number of current samples averaged by the overcurrent guard
const CURRENT_WINDOW: usize = 4;

/// Tunables of the reconciliation engine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Give up and stop the actuator after this long in `Actuating`
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Maximum distance to the target that counts as reached
    pub tolerance: f64,

    /// Delay between position reads while actuating
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Intensity of the first command, in percent
    pub start_intensity: u8,

    /// Intensity added on every poll until full power
    pub intensity_step: u8,

    /// Average current above which the actuator is considered faulted
    #[serde(default)]
    pub overcurrent_threshold_ma: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            tolerance: 2.0,
            poll_interval: Duration::from_millis(100),
            start_intensity: 30,
            intensity_step: 5,
            overcurrent_threshold_ma: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Idle,
    Actuating,
    Converged,
    TimedOut,
    Faulted(FaultCode),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Converged | EngineState::TimedOut | EngineState::Faulted(_)
        )
    }

    pub fn can_transition_to(&self, next: &EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Actuating)
                | (Idle, Converged)
                // rejected targets, an interrupted actuation included, are
                // never retried in the same cycle
                | (Idle, Faulted(_))
                | (Actuating, Converged)
                | (Actuating, TimedOut)
                | (Actuating, Faulted(_))
        )
    }

    fn outcome(&self) -> Option<(Outcome, Option<FaultCode>)> {
        match self {
            EngineState::Converged => Some((Outcome::Converged, None)),
            EngineState::TimedOut => Some((Outcome::TimedOut, None)),
            EngineState::Faulted(code) => Some((Outcome::Faulted, Some(code.clone()))),
            _ => None,
        }
    }
}

/// Rolling average over the last few current samples
struct CurrentWindow {
    samples: VecDeque<u32>,
}

impl CurrentWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(CURRENT_WINDOW),
        }
    }

    /// Push a sample and return the average once the window is full
    fn push(&mut self, sample: u32) -> Option<u32> {
        if self.samples.len() == CURRENT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if self.samples.len() < CURRENT_WINDOW {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|s| *s as u64).sum();
        Some((sum / CURRENT_WINDOW as u64) as u32)
    }
}

/// Drives an actuator toward a target within one wake cycle.
///
/// An engine runs once: [`ReconciliationEngine::run`] consumes it, so a new
/// cycle always starts from a fresh `Idle` instance.
#[derive(Debug)]
pub struct ReconciliationEngine {
    config: EngineConfig,
    state: EngineState,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    fn transition(&mut self, next: EngineState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid engine transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "engine transition");
        self.state = next;
    }

    fn finish(
        mut self,
        next: EngineState,
        final_position: Option<f64>,
        elapsed: Duration,
        actuated: bool,
    ) -> ReconciliationResult {
        self.transition(next);
        let (outcome, fault) = self
            .state
            .outcome()
            .unwrap_or((Outcome::Faulted, Some(FaultCode::Aborted)));
        ReconciliationResult {
            outcome,
            final_position,
            elapsed,
            fault,
            actuated,
        }
    }

    /// Run the engine to a terminal state
    #[instrument(name = "reconcile", skip_all, fields(target = ?target))]
    pub async fn run<A: Actuator + ?Sized>(
        mut self,
        actuator: &mut A,
        target: Target,
    ) -> ReconciliationResult {
        let target = match target {
            Target::MoveTo(target) => target,
            Target::Unchanged => {
                // nothing to do, report where we are
                return match actuator.read_position() {
                    Ok(position) => {
                        self.finish(EngineState::Converged, Some(position), Duration::ZERO, false)
                    }
                    Err(fault) => {
                        warn!("failed to read position: {fault}");
                        self.finish(
                            EngineState::Faulted((&fault).into()),
                            None,
                            Duration::ZERO,
                            false,
                        )
                    }
                };
            }
            Target::Reject(code) => {
                let position = actuator.read_position().ok();
                return self.finish(EngineState::Faulted(code), position, Duration::ZERO, false);
            }
        };

        self.transition(EngineState::Actuating);
        let started = Instant::now();

        let mut lease = ActuatorLease::acquire(actuator);
        let (next, mut last_position, commanded) = self.actuate(&mut lease, target, started).await;

        // stop before anything else happens
        let next = match lease.release() {
            Ok(()) => next,
            Err(fault) => {
                warn!("failed to stop actuator: {fault}");
                match next {
                    EngineState::Faulted(code) => EngineState::Faulted(code),
                    _ => EngineState::Faulted((&fault).into()),
                }
            }
        };
        let elapsed = started.elapsed();

        // the output may have coasted after the stop
        match actuator.read_position() {
            Ok(position) => last_position = Some(position),
            Err(fault) => debug!("keeping last observed position: {fault}"),
        }

        match &next {
            EngineState::Converged => info!(position = ?last_position, ?elapsed, "converged"),
            EngineState::TimedOut => warn!(position = ?last_position, ?elapsed, "timed out"),
            EngineState::Faulted(code) => warn!(position = ?last_position, %code, "faulted"),
            _ => {}
        }

        self.finish(next, last_position, elapsed, commanded)
    }

    /// Poll loop while in `Actuating`. Returns the terminal state to move to,
    /// the last position observed and whether any command was issued.
    async fn actuate<A: Actuator + ?Sized>(
        &self,
        actuator: &mut ActuatorLease<'_, A>,
        target: f64,
        started: Instant,
    ) -> (EngineState, Option<f64>, bool) {
        let config = &self.config;
        let mut last_position = None;
        let mut command: Option<(Direction, u8)> = None;
        let mut currents = CurrentWindow::new();

        loop {
            let position = match actuator.read_position() {
                Ok(position) => position,
                Err(fault) => {
                    return (
                        EngineState::Faulted((&fault).into()),
                        last_position,
                        command.is_some(),
                    );
                }
            };
            last_position = Some(position);

            let state = ActuatorState {
                current_position: position,
                target_position: target,
                tolerance_window: config.tolerance,
            };
            if state.is_converged() {
                return (EngineState::Converged, last_position, command.is_some());
            }

            let elapsed = started.elapsed();
            if elapsed >= config.timeout {
                return (EngineState::TimedOut, last_position, command.is_some());
            }

            if let Some(threshold) = config.overcurrent_threshold_ma {
                match actuator.read_current_ma() {
                    Ok(Some(sample)) => {
                        if let Some(average) = currents.push(sample)
                            && average > threshold
                        {
                            warn!(average, threshold, "current over threshold");
                            return (
                                EngineState::Faulted(FaultCode::Overcurrent),
                                last_position,
                                command.is_some(),
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(fault) => {
                        return (
                            EngineState::Faulted((&fault).into()),
                            last_position,
                            command.is_some(),
                        );
                    }
                }
            }

            let direction = Direction::toward(position, target);
            let intensity = match command {
                // ramp up while moving the same way
                Some((current, intensity)) if current == direction => {
                    intensity.saturating_add(config.intensity_step).min(100)
                }
                _ => config.start_intensity.min(100),
            };
            if command != Some((direction, intensity)) {
                trace!(?direction, intensity, position, "command");
                if let Err(fault) = actuator.apply_command(direction, intensity) {
                    // the driver may have acted on it
                    return (EngineState::Faulted(command_fault(&fault)), last_position, true);
                }
                command = Some((direction, intensity));
            }

            // never sleep past the timeout boundary
            let remaining = config.timeout.saturating_sub(elapsed);
            tokio::time::sleep(config.poll_interval.min(remaining)).await;
        }
    }
}

fn command_fault(fault: &HardwareFault) -> FaultCode {
    match fault {
        // a generic sensor error while commanding is still a driver problem
        HardwareFault::Sensor(_) => FaultCode::Driver,
        other => other.into(),
    }
}
