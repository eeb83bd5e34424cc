/*
This crate is home to everything a wake cycle knows about the thing it
controls: the shadow document model, the desired/reported bookkeeping, the
actuator capability and the engine that drives it toward a target, and the
scheduling of the next wake together with the state that must survive it.

Nothing here talks to the network; the remote crate moves documents in and
out.
*/

mod actuator;
mod persist;
mod reconcile;
mod sleep;
mod thing_state;

pub mod models;

pub use actuator::{Actuator, ActuatorLease, Direction, HardwareFault, SimulatedActuator};
pub use persist::{PendingActuation, PersistedState, WakeStateStore};
pub use reconcile::{EngineConfig, EngineState, ReconciliationEngine};
pub use sleep::{BatteryState, CycleStatus, SleepConfig, SleepScheduler};
pub use thing_state::{Target, TargetRange, ThingState};

use thingwake_util as util;
