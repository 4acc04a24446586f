//! Test doubles for servo_core: a manual clock, a spy motor driver, and a
//! scriptable encoder. Shared probe handles let a test steer the simulated
//! hardware while the servo owns the driver half.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use servo_traits::{Actuation, Clock, Encoder, MotorDriver, MotorType, Result, ServoError};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deterministic clock advanced manually (or by `sleep`) in microseconds.
#[derive(Debug, Clone)]
pub struct SimClock {
    base: Instant,
    offset_us: Arc<Mutex<u64>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_us: Arc::new(Mutex::new(0)),
        }
    }

    pub fn advance_us(&self, us: u64) {
        let mut offset = lock(&self.offset_us);
        *offset = offset.saturating_add(us);
    }

    pub fn elapsed_us(&self) -> u64 {
        *lock(&self.offset_us)
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_micros(self.elapsed_us())
    }

    fn sleep(&self, d: Duration) {
        self.advance_us(d.as_micros() as u64);
    }
}

/// One observed driver command, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Coast,
    Brake,
    Duty(i32),
}

#[derive(Debug)]
struct DriverShared {
    device: Option<MotorType>,
    /// Remaining `device_type` calls that report `Again`.
    busy_remaining: u32,
    fail_duty: bool,
    passive: (Actuation, i32),
    calls: Vec<DriverCall>,
}

/// Test-side handle to a [`MockDriver`].
#[derive(Debug, Clone)]
pub struct DriverProbe {
    shared: Arc<Mutex<DriverShared>>,
}

impl DriverProbe {
    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn coast_calls(&self) -> usize {
        lock(&self.shared)
            .calls
            .iter()
            .filter(|c| **c == DriverCall::Coast)
            .count()
    }

    pub fn last_call(&self) -> Option<DriverCall> {
        lock(&self.shared).calls.last().copied()
    }

    pub fn last_duty(&self) -> Option<i32> {
        lock(&self.shared)
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                DriverCall::Duty(v) => Some(*v),
                _ => None,
            })
    }

    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    /// Make the next `n` `device_type` calls report `Again`.
    pub fn busy_for(&self, n: u32) {
        lock(&self.shared).busy_remaining = n;
    }

    /// Make every `set_duty` call fail with an I/O error.
    pub fn fail_duty(&self, fail: bool) {
        lock(&self.shared).fail_duty = fail;
    }
}

/// Spy implementation of [`MotorDriver`] that records every command.
///
/// `coast` and `brake` always succeed, matching the contract that coast is
/// the last-resort safety action.
#[derive(Debug)]
pub struct MockDriver {
    shared: Arc<Mutex<DriverShared>>,
}

impl MockDriver {
    pub fn new(device: MotorType) -> (Self, DriverProbe) {
        let shared = Arc::new(Mutex::new(DriverShared {
            device: Some(device),
            busy_remaining: 0,
            fail_duty: false,
            passive: (Actuation::Coast, 0),
            calls: Vec::new(),
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            DriverProbe { shared },
        )
    }

    /// Driver for a port with nothing plugged in.
    pub fn disconnected() -> (Self, DriverProbe) {
        let (driver, probe) = Self::new(MotorType::Unknown);
        lock(&probe.shared).device = None;
        (driver, probe)
    }
}

impl MotorDriver for MockDriver {
    fn device_type(&mut self) -> Result<MotorType> {
        let mut shared = lock(&self.shared);
        if shared.busy_remaining > 0 {
            shared.busy_remaining -= 1;
            return Err(ServoError::Again);
        }
        shared.device.ok_or(ServoError::NoDevice)
    }

    fn coast(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(DriverCall::Coast);
        shared.passive = (Actuation::Coast, 0);
        Ok(())
    }

    fn brake(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(DriverCall::Brake);
        shared.passive = (Actuation::Brake, 0);
        Ok(())
    }

    fn set_duty(&mut self, voltage: i32) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.calls.push(DriverCall::Duty(voltage));
        if shared.fail_duty {
            return Err(ServoError::Io("pwm write failed".into()));
        }
        shared.passive = (Actuation::Duty, voltage);
        Ok(())
    }

    fn passive_state(&mut self) -> Result<(Actuation, i32)> {
        Ok(lock(&self.shared).passive)
    }
}

#[derive(Debug)]
struct EncoderShared {
    raw: i32,
    zero: i32,
    rate: i32,
    /// Absolute-reference position reported by `reset_count(_, true)`.
    absolute: i32,
    fail_count_once: bool,
    fail_rate_once: bool,
}

/// Test-side handle to a [`SimEncoder`].
#[derive(Debug, Clone)]
pub struct EncoderProbe {
    shared: Arc<Mutex<EncoderShared>>,
}

impl EncoderProbe {
    pub fn set_raw(&self, raw: i32) {
        lock(&self.shared).raw = raw;
    }

    pub fn add_raw(&self, delta: i32) {
        let mut shared = lock(&self.shared);
        shared.raw = shared.raw.wrapping_add(delta);
    }

    pub fn set_rate(&self, rate: i32) {
        lock(&self.shared).rate = rate;
    }

    pub fn set_absolute(&self, absolute: i32) {
        lock(&self.shared).absolute = absolute;
    }

    /// Fail the next `count` read with an I/O error.
    pub fn fail_next_count(&self) {
        lock(&self.shared).fail_count_once = true;
    }

    /// Fail the next `rate` read with an I/O error.
    pub fn fail_next_rate(&self) {
        lock(&self.shared).fail_rate_once = true;
    }
}

/// Scriptable [`Encoder`]: the test sets the raw position and rate, the
/// servo reads them through the zero reference.
#[derive(Debug)]
pub struct SimEncoder {
    resolution: i32,
    shared: Arc<Mutex<EncoderShared>>,
}

impl SimEncoder {
    pub fn new(resolution: i32) -> (Self, EncoderProbe) {
        let shared = Arc::new(Mutex::new(EncoderShared {
            raw: 0,
            zero: 0,
            rate: 0,
            absolute: 0,
            fail_count_once: false,
            fail_rate_once: false,
        }));
        (
            Self {
                resolution: resolution.max(1),
                shared: Arc::clone(&shared),
            },
            EncoderProbe { shared },
        )
    }
}

impl Encoder for SimEncoder {
    fn resolution(&self) -> i32 {
        self.resolution
    }

    fn count(&mut self) -> Result<i32> {
        let mut shared = lock(&self.shared);
        if shared.fail_count_once {
            shared.fail_count_once = false;
            return Err(ServoError::Io("encoder count read failed".into()));
        }
        Ok(shared.raw.wrapping_sub(shared.zero))
    }

    fn rate(&mut self) -> Result<i32> {
        let mut shared = lock(&self.shared);
        if shared.fail_rate_once {
            shared.fail_rate_once = false;
            return Err(ServoError::Io("encoder rate read failed".into()));
        }
        Ok(shared.rate)
    }

    fn reset_count(&mut self, count: i32, absolute: bool) -> Result<()> {
        let mut shared = lock(&self.shared);
        let target = if absolute { shared.absolute } else { count };
        shared.zero = shared.raw.wrapping_sub(target);
        Ok(())
    }
}
