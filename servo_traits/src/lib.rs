//! Trait seams and boundary types for the servo control stack.
//!
//! The core in `servo_core` is hardware-agnostic: PWM drivers, quadrature
//! encoders, and log storage all plug in through the traits defined here.

pub mod clock;
pub mod error;

pub use clock::{Clock, MonotonicClock};
pub use error::{Result, ServoError};

/// Category of output applied to a motor.
///
/// `Hold` is not a direct driver command: the controller translates it into
/// a closed-loop position lock at the payload count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    Coast = 0,
    Brake = 1,
    Hold = 2,
    Duty = 3,
}

/// Sign convention for positive angles and speeds, as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Clockwise,
    Counterclockwise,
}

impl Direction {
    /// Apply the sign convention to a raw hardware value.
    #[inline]
    pub fn apply(self, value: i32) -> i32 {
        match self {
            Direction::Clockwise => value,
            Direction::Counterclockwise => -value,
        }
    }
}

/// Device type id reported by a motor driver for the attached motor.
///
/// The Spike-branded ids are catalog aliases for the corresponding Technic
/// motors; the model table maps both names to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorType {
    /// No device, or a device the model table does not know.
    Unknown,
    Ev3Medium,
    Ev3Large,
    Interactive,
    MoveHub,
    TechnicL,
    TechnicXl,
    TechnicSAngular,
    SpikeS,
    TechnicLAngular,
    SpikeL,
    TechnicMAngular,
    SpikeM,
}

/// Low-level DC motor driver for one port.
///
/// `coast` must always succeed if the hardware is present at all; the core
/// uses it as the last-resort safety action after any other failure.
pub trait MotorDriver {
    /// Device type of the attached motor. May return `Again`/`NoDevice`
    /// while enumeration is still in progress.
    fn device_type(&mut self) -> Result<MotorType>;
    fn coast(&mut self) -> Result<()>;
    fn brake(&mut self) -> Result<()>;
    /// Drive the motor open loop at the given voltage (mV, signed).
    fn set_duty(&mut self, voltage: i32) -> Result<()>;
    /// Passive state the driver is currently applying (coast, brake, or a
    /// user duty command), for logging while no control law is active.
    fn passive_state(&mut self) -> Result<(Actuation, i32)>;
}

/// Position encoder ("tacho") for one port.
pub trait Encoder {
    /// Counter resolution in counts per degree at the motor shaft.
    fn resolution(&self) -> i32;
    /// Absolute position count. Monotonic within hardware wraparound.
    fn count(&mut self) -> Result<i32>;
    /// Instantaneous rate in counts per second.
    fn rate(&mut self) -> Result<i32>;
    /// Synchronously reset the zero reference so the current position reads
    /// as `count`; with `absolute`, re-seed from the absolute-position
    /// reference instead.
    fn reset_count(&mut self, count: i32, absolute: bool) -> Result<()>;
}

/// Width of one data-log sample.
pub const LOG_ROW_LEN: usize = 9;

/// Fixed-width log sample appended once per control tick:
/// `[ref time ms, count, rate, actuation kind, actuation value,
///   count_ref, rate_ref, tracking error, integrated error]`.
pub type LogRow = [i32; LOG_ROW_LEN];

/// Data-log sink. `append` never blocks and never fails; bounded
/// implementations drop their oldest rows.
pub trait LogSink {
    fn append(&mut self, row: &LogRow);
}
