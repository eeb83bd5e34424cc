use std::ops::{Deref, DerefMut};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::models::FaultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward higher positions
    Forward,
    /// Toward lower positions
    Reverse,
}

impl Direction {
    /// The direction that moves `from` closer to `to`
    pub fn toward(from: f64, to: f64) -> Self {
        if to >= from {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    fn sign(&self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// A hardware error raised by the actuator or one of its sensors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HardwareFault {
    #[error("actuator stalled")]
    Stall,

    #[error("overcurrent: {0} mA")]
    Overcurrent(u32),

    #[error("sensor read failed: {0}")]
    Sensor(String),

    #[error("driver command failed: {0}")]
    Driver(String),
}

impl From<&HardwareFault> for FaultCode {
    fn from(fault: &HardwareFault) -> Self {
        match fault {
            HardwareFault::Stall => FaultCode::Stall,
            HardwareFault::Overcurrent(_) => FaultCode::Overcurrent,
            HardwareFault::Sensor(_) => FaultCode::Sensor,
            HardwareFault::Driver(_) => FaultCode::Driver,
        }
    }
}

/// The capability set of a physical output
///
/// Drivers are synchronous: every call is expected to return within a few
/// milliseconds. Intensity is a percentage in `0..=100`.
pub trait Actuator {
    fn apply_command(&mut self, direction: Direction, intensity: u8) -> Result<(), HardwareFault>;

    fn read_position(&mut self) -> Result<f64, HardwareFault>;

    fn stop(&mut self) -> Result<(), HardwareFault>;

    /// Motor current in milliamps, for actuators that have a current sensor
    fn read_current_ma(&mut self) -> Result<Option<u32>, HardwareFault> {
        Ok(None)
    }
}

/// Exclusive use of an actuator while it is moving.
///
/// The actuator is stopped exactly once when the lease ends, either through
/// [`ActuatorLease::release`] or, if the lease is dropped without being
/// released, on drop.
pub struct ActuatorLease<'a, A: Actuator + ?Sized> {
    actuator: &'a mut A,
    released: bool,
}

impl<'a, A: Actuator + ?Sized> ActuatorLease<'a, A> {
    pub fn acquire(actuator: &'a mut A) -> Self {
        Self {
            actuator,
            released: false,
        }
    }

    /// Stop the actuator and end the lease
    pub fn release(mut self) -> Result<(), HardwareFault> {
        self.released = true;
        self.actuator.stop()
    }
}

impl<A: Actuator + ?Sized> Deref for ActuatorLease<'_, A> {
    type Target = A;

    fn deref(&self) -> &Self::Target {
        self.actuator
    }
}

impl<A: Actuator + ?Sized> DerefMut for ActuatorLease<'_, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.actuator
    }
}

impl<A: Actuator + ?Sized> Drop for ActuatorLease<'_, A> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.actuator.stop() {
                warn!("failed to stop actuator on early release: {e}");
            }
        }
    }
}

/// A motor with a position sensor, simulated in time.
///
/// While commanded it moves at a fixed speed in the commanded direction,
/// clamped to its travel range. Time is read from the tokio clock, so tests
/// can drive it with paused time. It is also what the `shade` thing drives on
/// hosts without a motor driver.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    position: f64,
    moving: Option<(Direction, Instant)>,
    speed: f64,
    range: (f64, f64),
    stall_sensor: Option<Duration>,
    current_ma: Option<u32>,
    stop_calls: usize,
    commands: Vec<(Direction, u8)>,
}

impl SimulatedActuator {
    /// A motor at `position` moving 5 units per second over `0..=100`
    pub fn new(position: f64) -> Self {
        Self {
            position,
            moving: None,
            speed: 5.0,
            range: (0.0, 100.0),
            stall_sensor: None,
            current_ma: None,
            stop_calls: 0,
            commands: Vec::new(),
        }
    }

    /// Units per second while commanded. A speed of zero simulates a jammed
    /// motor.
    pub fn with_speed(self, speed: f64) -> Self {
        Self { speed, ..self }
    }

    pub fn with_range(self, min: f64, max: f64) -> Self {
        Self {
            range: (min, max),
            ..self
        }
    }

    /// Report a stall once commanded for `after` without moving
    pub fn with_stall_sensor(self, after: Duration) -> Self {
        Self {
            stall_sensor: Some(after),
            ..self
        }
    }

    /// Draw a constant current while moving
    pub fn with_current(self, current_ma: u32) -> Self {
        Self {
            current_ma: Some(current_ma),
            ..self
        }
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls
    }

    pub fn commands(&self) -> &[(Direction, u8)] {
        &self.commands
    }

    pub fn is_moving(&self) -> bool {
        self.moving.is_some()
    }

    fn position_at(&self, now: Instant) -> f64 {
        let (min, max) = self.range;
        match self.moving {
            Some((direction, since)) => {
                let travelled = self.speed * now.duration_since(since).as_secs_f64();
                (self.position + direction.sign() * travelled).clamp(min, max)
            }
            None => self.position,
        }
    }

    fn settle(&mut self, now: Instant) {
        self.position = self.position_at(now);
        if let Some((direction, _)) = self.moving {
            self.moving = Some((direction, now));
        }
    }
}

impl Actuator for SimulatedActuator {
    fn apply_command(&mut self, direction: Direction, intensity: u8) -> Result<(), HardwareFault> {
        let now = Instant::now();
        // keep the stall timer running while the direction does not change
        let since = match self.moving {
            Some((current, _)) if current == direction && self.speed == 0.0 => {
                self.moving.map(|(_, since)| since).unwrap_or(now)
            }
            _ => now,
        };
        self.settle(now);
        trace!(?direction, intensity, position = self.position, "simulated command");
        self.commands.push((direction, intensity));
        self.moving = Some((direction, since));
        Ok(())
    }

    fn read_position(&mut self) -> Result<f64, HardwareFault> {
        let now = Instant::now();
        if let (Some(after), Some((_, since))) = (self.stall_sensor, self.moving)
            && self.speed == 0.0
            && now.duration_since(since) >= after
        {
            return Err(HardwareFault::Stall);
        }
        Ok(self.position_at(now))
    }

    fn stop(&mut self) -> Result<(), HardwareFault> {
        self.settle(Instant::now());
        self.moving = None;
        self.stop_calls += 1;
        Ok(())
    }

    fn read_current_ma(&mut self) -> Result<Option<u32>, HardwareFault> {
        if self.moving.is_some() {
            Ok(self.current_ma)
        } else {
            Ok(self.current_ma.map(|_| 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn it_moves_at_the_configured_speed() {
        let mut motor = SimulatedActuator::new(30.0).with_speed(5.0);
        motor.apply_command(Direction::Forward, 30).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(motor.read_position().unwrap(), 40.0);

        motor.stop().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(motor.read_position().unwrap(), 40.0);
        assert_eq!(motor.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn it_clamps_to_the_travel_range() {
        let mut motor = SimulatedActuator::new(5.0).with_speed(10.0);
        motor.apply_command(Direction::Reverse, 50).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(motor.read_position().unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn it_keeps_position_across_speed_changes() {
        let mut motor = SimulatedActuator::new(0.0).with_speed(5.0);
        motor.apply_command(Direction::Forward, 30).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        motor.apply_command(Direction::Forward, 35).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(motor.read_position().unwrap(), 10.0);
        assert_eq!(
            motor.commands(),
            &[(Direction::Forward, 30), (Direction::Forward, 35)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_fires_the_stall_sensor_when_jammed() {
        let mut motor = SimulatedActuator::new(30.0)
            .with_speed(0.0)
            .with_stall_sensor(Duration::from_secs(1));
        motor.apply_command(Direction::Forward, 30).unwrap();
        assert_eq!(motor.read_position(), Ok(30.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        motor.apply_command(Direction::Forward, 35).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(motor.read_position(), Err(HardwareFault::Stall));
    }

    struct Recorder {
        stops: usize,
    }

    impl Actuator for Recorder {
        fn apply_command(&mut self, _: Direction, _: u8) -> Result<(), HardwareFault> {
            Ok(())
        }

        fn read_position(&mut self) -> Result<f64, HardwareFault> {
            Ok(0.0)
        }

        fn stop(&mut self) -> Result<(), HardwareFault> {
            self.stops += 1;
            Ok(())
        }
    }

    #[test]
    fn lease_stops_once_on_release() {
        let mut recorder = Recorder { stops: 0 };
        let lease = ActuatorLease::acquire(&mut recorder);
        lease.release().unwrap();
        assert_eq!(recorder.stops, 1);
    }

    #[test]
    fn lease_stops_on_drop() {
        let mut recorder = Recorder { stops: 0 };
        {
            let mut lease = ActuatorLease::acquire(&mut recorder);
            lease.apply_command(Direction::Forward, 10).unwrap();
        }
        assert_eq!(recorder.stops, 1);
    }
}
