use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::models::Outcome;
use crate::persist::{PersistedState, WakeStateStore};
use crate::util::json::millis;
use crate::util::store::StoreError;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SleepConfig {
    /// Interval between wakes when everything went fine
    #[serde(with = "millis")]
    pub base_interval: Duration,

    /// Interval used after a fault or a timeout
    #[serde(with = "millis")]
    pub fault_retry_interval: Duration,

    /// Battery voltage under which the interval is stretched
    pub low_battery_mv: u32,

    /// Interval multiplier on low battery
    pub low_battery_factor: u32,

    #[serde(with = "millis")]
    pub min_interval: Duration,

    #[serde(with = "millis")]
    pub max_interval: Duration,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(300),
            fault_retry_interval: Duration::from_secs(60),
            low_battery_mv: 3300,
            low_battery_factor: 4,
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Battery and charge readings taken during the cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryState {
    pub voltage_mv: u32,

    /// Positive while charging
    pub current_ma: Option<i32>,
}

impl BatteryState {
    fn is_charging(&self) -> bool {
        self.current_ma.is_some_and(|ma| ma > 0)
    }
}

/// How the cycle ended, as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleStatus {
    /// The engine ran to a terminal state
    Reconciled(Outcome),

    /// The cycle stopped before reconciling, e.g. the network was down
    Aborted,
}

/// Decides how long the device sleeps until the next wake
#[derive(Debug, Clone)]
pub struct SleepScheduler {
    config: SleepConfig,
    requested: Option<Duration>,
}

impl SleepScheduler {
    pub fn new(config: SleepConfig) -> Self {
        Self {
            config,
            requested: None,
        }
    }

    /// Use an interval requested by the cloud in place of the base interval
    pub fn with_requested(self, requested: Option<Duration>) -> Self {
        Self { requested, ..self }
    }

    pub fn next_interval(&self, battery: Option<&BatteryState>, status: &CycleStatus) -> Duration {
        let config = &self.config;
        let normal = self.requested.unwrap_or(config.base_interval);

        let mut interval = match status {
            CycleStatus::Reconciled(Outcome::Faulted | Outcome::TimedOut) => {
                config.fault_retry_interval.min(normal)
            }
            CycleStatus::Reconciled(Outcome::Converged) | CycleStatus::Aborted => normal,
        };

        if let Some(battery) = battery
            && battery.voltage_mv < config.low_battery_mv
            && !battery.is_charging()
        {
            debug!(voltage_mv = battery.voltage_mv, "low battery");
            interval = interval.saturating_mul(config.low_battery_factor.max(1));
        }

        interval.clamp(config.min_interval, config.max_interval.max(config.min_interval))
    }

    /// Persist the state for the next wake. This must succeed before the
    /// device is put to sleep.
    #[instrument(skip_all, fields(interval = ?interval))]
    pub async fn commit(
        &self,
        store: &WakeStateStore,
        state: &mut PersistedState,
        interval: Duration,
    ) -> Result<(), StoreError> {
        state.next_wake_secs = Some(interval.as_secs());
        store.save(state).await?;
        info!(secs = interval.as_secs(), "next wake scheduled");
        Ok(())
    }
}
