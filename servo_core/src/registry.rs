//! Fixed-capacity, port-indexed servo collection.
//!
//! The registry owns every configured [`Servo`]; the host's periodic
//! scheduler calls [`ServoRegistry::poll_all`] once per tick. Ports are a
//! closed enum, so out-of-range access is unrepresentable.

use std::sync::Arc;

use tracing::debug;

use servo_traits::{Clock, Direction, Encoder, MotorDriver, Result, ServoError};

use crate::control::GearRatio;
use crate::servo::Servo;

/// Number of motor ports on the largest supported hub.
pub const NUM_PORTS: usize = 6;

/// Motor port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Port {
    pub const ALL: [Port; NUM_PORTS] = [Port::A, Port::B, Port::C, Port::D, Port::E, Port::F];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL.get(index).copied().ok_or(ServoError::InvalidPort)
    }
}

/// Owned collection of servos, one optional slot per port.
///
/// Single-threaded by design: the scheduler tick and user operations run
/// in the same context, so no per-port locking is needed.
pub struct ServoRegistry<D: MotorDriver, E: Encoder> {
    slots: [Option<Servo<D, E>>; NUM_PORTS],
}

impl<D: MotorDriver, E: Encoder> Default for ServoRegistry<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: MotorDriver, E: Encoder> ServoRegistry<D, E> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Bind a driver and encoder on `port`, replacing any previous servo.
    ///
    /// On failure the slot is left unconfigured; other ports are not
    /// affected.
    pub fn setup(
        &mut self,
        port: Port,
        driver: D,
        encoder: E,
        clock: Arc<dyn Clock>,
        direction: Direction,
        gear: GearRatio,
    ) -> Result<()> {
        self.slots[port.index()] = None;
        let servo = Servo::bind(driver, encoder, clock, direction, gear)?;
        debug!(?port, device = ?servo.device_type(), "port configured");
        self.slots[port.index()] = Some(servo);
        Ok(())
    }

    /// Drop the servo on `port`, if any, returning it to the caller.
    pub fn remove(&mut self, port: Port) -> Option<Servo<D, E>> {
        self.slots[port.index()].take()
    }

    pub fn servo(&self, port: Port) -> Result<&Servo<D, E>> {
        self.slots[port.index()]
            .as_ref()
            .ok_or(ServoError::InvalidPort)
    }

    pub fn servo_mut(&mut self, port: Port) -> Result<&mut Servo<D, E>> {
        self.slots[port.index()]
            .as_mut()
            .ok_or(ServoError::InvalidPort)
    }

    /// Ports that currently hold a connected servo.
    pub fn connected_ports(&self) -> Vec<Port> {
        Port::ALL
            .into_iter()
            .filter(|port| {
                self.slots[port.index()]
                    .as_ref()
                    .is_some_and(Servo::is_connected)
            })
            .collect()
    }

    /// Run one control tick on every connected port, sequentially.
    ///
    /// A failing port coasts, disconnects itself, and is skipped on later
    /// passes until `setup` runs again; the remaining ports still tick in
    /// the same pass. Returns the number of ports that ticked cleanly.
    pub fn poll_all(&mut self) -> usize {
        let mut ok = 0;
        for slot in self.slots.iter_mut() {
            if let Some(servo) = slot {
                if !servo.is_connected() {
                    continue;
                }
                if servo.control_update().is_ok() {
                    ok += 1;
                }
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_indices_are_stable_and_total() {
        for (i, port) in Port::ALL.into_iter().enumerate() {
            assert_eq!(port.index(), i);
            assert_eq!(Port::from_index(i).unwrap(), port);
        }
        assert!(matches!(
            Port::from_index(NUM_PORTS),
            Err(ServoError::InvalidPort)
        ));
    }

    #[test]
    fn unconfigured_port_is_a_typed_error() {
        let registry: ServoRegistry<crate::mocks::MockDriver, crate::mocks::SimEncoder> =
            ServoRegistry::new();
        assert!(matches!(registry.servo(Port::C), Err(ServoError::InvalidPort)));
    }
}
