#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Motor state estimation and closed-loop servo control core
//! (hardware-agnostic).
//!
//! All hardware interactions go through the `servo_traits::MotorDriver` and
//! `servo_traits::Encoder` traits, so the same core drives educational hub
//! ports and a Linux brick alike.
//!
//! ## Architecture
//!
//! - **Model table**: immutable per-motor-type state-space coefficients and
//!   derived control settings (`model` module)
//! - **Observer**: discrete-time estimator for angle/speed/current with
//!   stall detection and torque↔voltage conversion (`observer` module)
//! - **Control**: maneuver state, reference trajectory, and PID evaluation
//!   in the torque domain (`control` module)
//! - **Servo**: per-port controller orchestrating the
//!   read → control → actuate → log tick (`servo` module)
//! - **Registry**: fixed-capacity port-indexed collection with `poll_all`
//!   (`registry` module)
//!
//! ## Fixed-point arithmetic
//!
//! Internals operate in **millidegrees** (mdeg, 1 deg = 1000 mdeg) using
//! `i32` state for deterministic behavior; prescaled products are computed
//! in 64-bit intermediates so no input can overflow or panic. There is no
//! floating point and no allocation anywhere in the tick path.

pub mod control;
pub mod logger;
pub mod mocks;
pub mod model;
pub mod observer;
pub mod registry;
pub mod servo;
pub mod util;

pub use control::{Completion, Control, ControlType, CountsPerUnit, GearRatio};
pub use logger::{NullLog, RingLog, SharedLog};
pub use model::{ControlSettings, ObserverModel};
pub use observer::Observer;
pub use registry::{NUM_PORTS, Port, ServoRegistry};
pub use servo::Servo;
pub use servo_traits::{
    Actuation, Clock, Direction, Encoder, LogRow, LogSink, MonotonicClock, MotorDriver, MotorType,
    Result, ServoError,
};
