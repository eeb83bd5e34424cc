use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::models::StateMap;
use crate::state::{Actuator, BatteryState, PersistedState, SimulatedActuator, TargetRange};
use crate::util::types::ThingName;

/// Telemetry keys
const BATTERY_VOLTAGE: &str = "batteryVoltage";
const BATTERY_CURRENT: &str = "batteryCurrent";
const POWER_APPLIED: &str = "powerApplied";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ThingKind {
    /// A motorized shade driven to a desired position
    #[default]
    Shade,
    /// A sensor that only reports, it has nothing to actuate
    PowerMonitor,
}

/// Readings of the hardware attached to the device
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    /// Speed of the motor in position units per second
    pub motor_speed: f64,

    pub battery_mv: Option<u32>,

    /// Positive while charging
    pub battery_ma: Option<i32>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            motor_speed: 5.0,
            battery_mv: None,
            battery_ma: None,
        }
    }
}

/// A device woken for one cycle
#[derive(Debug)]
pub enum Thing {
    Shade {
        name: ThingName,
        motor: SimulatedActuator,
        battery: Option<BatteryState>,
    },
    PowerMonitor {
        name: ThingName,
        battery: Option<BatteryState>,
    },
}

impl Thing {
    /// Bring up the hardware of a thing.
    ///
    /// The motor is found where the previous cycle left it, or at the low
    /// end of its range on first boot.
    pub fn new(
        kind: ThingKind,
        name: ThingName,
        hardware: &HardwareConfig,
        range: TargetRange,
        persisted: &PersistedState,
    ) -> Self {
        let battery = hardware.battery_mv.map(|voltage_mv| BatteryState {
            voltage_mv,
            current_ma: hardware.battery_ma,
        });

        match kind {
            ThingKind::Shade => {
                let position = persisted
                    .last_position
                    .unwrap_or(range.min)
                    .clamp(range.min, range.max);
                let motor = SimulatedActuator::new(position)
                    .with_speed(hardware.motor_speed)
                    .with_range(range.min, range.max);
                Thing::Shade {
                    name,
                    motor,
                    battery,
                }
            }
            ThingKind::PowerMonitor => Thing::PowerMonitor { name, battery },
        }
    }

    pub fn id(&self) -> &ThingName {
        match self {
            Thing::Shade { name, .. } | Thing::PowerMonitor { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ThingKind {
        match self {
            Thing::Shade { .. } => ThingKind::Shade,
            Thing::PowerMonitor { .. } => ThingKind::PowerMonitor,
        }
    }

    /// The actuator to reconcile, if the thing has one
    pub fn actuator(&mut self) -> Option<&mut dyn Actuator> {
        match self {
            Thing::Shade { motor, .. } => Some(motor),
            Thing::PowerMonitor { .. } => None,
        }
    }

    pub fn battery(&self) -> Option<BatteryState> {
        match self {
            Thing::Shade { battery, .. } | Thing::PowerMonitor { battery, .. } => *battery,
        }
    }

    /// Readings to report along with the reconciliation result
    pub fn telemetry(&self, persisted: &PersistedState) -> StateMap {
        let mut telemetry = StateMap::new();

        if let Some(battery) = self.battery() {
            telemetry.insert(BATTERY_VOLTAGE.to_owned(), Value::from(battery.voltage_mv));
            if let Some(current_ma) = battery.current_ma {
                telemetry.insert(BATTERY_CURRENT.to_owned(), Value::from(current_ma));
            }
        }

        if let Thing::PowerMonitor { .. } = self {
            telemetry.insert(
                POWER_APPLIED.to_owned(),
                Value::from(persisted.power_on_count),
            );
        }

        telemetry
    }
}
