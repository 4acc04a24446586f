//! Discrete-time state observer for one motor.
//!
//! The observer tracks an analytical estimate of angle, speed, and
//! electrical current alongside the measured encoder position. It is the
//! basis for stall detection and feedforward torque; the directly measured
//! count remains the primary controlled variable.
//!
//! All state lives in millidegree-scaled `i32`. Every prescaled product is
//! computed in a 64-bit intermediate and the resulting state clamped back
//! to the `i32` band, so the update is total and deterministic for any
//! input sequence.

use servo_traits::Actuation;

use crate::model::ObserverModel;

/// Millidegrees per degree.
pub const MDEG_PER_DEG: i32 = 1000;
/// Representable band for the relative angle estimate; overflow past this
/// rolls into the whole-degree offset.
pub const MDEG_MAX: i32 = 1_000_000 * MDEG_PER_DEG;

/// Prescale factors pairing with the model's `d_x_d_y` divisors: each
/// state contribution is `PRESCALE_y * y / d_x_d_y`. The values keep every
/// per-tick decay factor below one (`PRESCALE_SPEED` is under the smallest
/// `d_speed_d_speed` in the table) while leaving enough headroom that the
/// quotients stay precise in integer math.
pub const PRESCALE_SPEED: i32 = 800;
pub const PRESCALE_CURRENT: i32 = 10_000;
pub const PRESCALE_VOLTAGE: i32 = 100_000;
pub const PRESCALE_TORQUE: i32 = 2_000;
pub const PRESCALE_ACCELERATION: i32 = 2_000;

// Speed below which the stall conditions are checked (mdeg/s).
const STALL_SPEED_MDEG: i32 = 50 * MDEG_PER_DEG;

/// One prescaled state-transition term, exact in 64-bit.
#[inline]
fn scaled(value: i32, prescale: i32, coeff: i32) -> i64 {
    i64::from(value) * i64::from(prescale) / i64::from(coeff)
}

#[inline]
fn clamp_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Snapshot of the observer state, mainly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverState {
    /// Whole-degree wraparound accumulator.
    pub angle_offset: i32,
    /// Relative angle estimate (mdeg), within `(-MDEG_MAX, MDEG_MAX)`.
    pub angle: i32,
    /// Speed estimate (mdeg/s).
    pub speed: i32,
    /// Current estimate (scaled mA).
    pub current: i32,
    /// Raw stall condition, before the dwell-time filter.
    pub stalled: bool,
}

/// Model-based estimator for a single motor.
#[derive(Debug)]
pub struct Observer {
    model: &'static ObserverModel,
    counts_per_degree: i32,
    angle_offset: i32,
    angle: i32,
    speed: i32,
    current: i32,
    stalled: bool,
    stall_start: u64,
}

impl Observer {
    pub fn new(model: &'static ObserverModel, counts_per_degree: i32) -> Self {
        Self {
            model,
            counts_per_degree: counts_per_degree.max(1),
            angle_offset: 0,
            angle: 0,
            speed: 0,
            current: 0,
            stalled: false,
            stall_start: 0,
        }
    }

    /// Seed the estimate from the current absolute encoder reading and
    /// zero all dynamic state, including the stall flag.
    pub fn reset(&mut self, count_now: i32) {
        self.angle_offset = count_now / self.counts_per_degree;
        self.angle = 0;
        self.speed = 0;
        self.current = 0;
        self.stalled = false;
    }

    /// De-scaled estimated position (degrees) and rate (deg/s).
    pub fn estimated_state(&self) -> (i32, i32) {
        (
            self.angle_offset + self.angle / MDEG_PER_DEG,
            self.speed / MDEG_PER_DEG,
        )
    }

    pub fn state(&self) -> ObserverState {
        ObserverState {
            angle_offset: self.angle_offset,
            angle: self.angle,
            speed: self.speed,
            current: self.current,
            stalled: self.stalled,
        }
    }

    fn update_stall_state(&mut self, time: u64, voltage: i32, feedback_voltage: i32) {
        // Convert to forward motion to simplify the checks.
        let (speed, voltage, feedback) = if voltage < 0 {
            (-self.speed, -voltage, -feedback_voltage)
        } else {
            (self.speed, voltage, feedback_voltage)
        };

        if // Motor is going slow or even backward.
        speed < STALL_SPEED_MDEG
            // Model is ahead of reality (and therefore pushing back
            // negative), indicating an unmodelled load.
            && feedback < 0
            // Feedback voltage is more than half of what it would be on
            // getting fully stuck (where applied equals feedback).
            && -feedback > voltage / 2
        {
            // Rising edge of the stall flag: record the start time.
            if !self.stalled {
                self.stall_start = time;
            }
            self.stalled = true;
        } else {
            self.stalled = false;
        }
    }

    /// One estimator step.
    ///
    /// Forms a feedback voltage from the estimation error, evaluates the
    /// raw stall condition, then advances the linear model driven by the
    /// applied-plus-feedback voltage and a sign-following friction torque.
    /// Only `Duty` actuation contributes applied voltage; coast, brake,
    /// and hold ticks drive the model with the feedback voltage alone.
    pub fn update(&mut self, time: u64, count: i32, actuation: Actuation, voltage: i32) {
        let m = self.model;

        let voltage = match actuation {
            Actuation::Duty => voltage,
            _ => 0,
        };

        // Measured angle in millidegrees, relative to the offset.
        let degrees = count / self.counts_per_degree;
        let measured =
            clamp_i32((i64::from(degrees) - i64::from(self.angle_offset)) * i64::from(MDEG_PER_DEG));

        // Observer error feedback, expressed as a voltage.
        let estimation_error = i64::from(measured) - i64::from(self.angle);
        let feedback_torque = clamp_i32(i64::from(m.gain) * estimation_error / i64::from(MDEG_PER_DEG));
        let feedback_voltage = torque_to_voltage(m, feedback_torque);

        self.update_stall_state(time, voltage, feedback_voltage);

        // The model gets the applied voltage plus the feedback voltage to
        // keep it in sync with the real system.
        let voltage = voltage.saturating_add(feedback_voltage);

        // The only modeled torque is static friction. Sign follows the
        // speed estimate; exactly zero speed takes the negative branch so
        // the tie-break stays deterministic across platforms.
        let torque = if self.speed > 0 {
            m.torque_friction
        } else {
            -m.torque_friction
        };

        // Next state from current state and input: x(k+1) = Ax(k) + Bu(k).
        let angle_next = i64::from(self.angle)
            + scaled(self.speed, PRESCALE_SPEED, m.d_angle_d_speed)
            + scaled(self.current, PRESCALE_CURRENT, m.d_angle_d_current)
            + scaled(voltage, PRESCALE_VOLTAGE, m.d_angle_d_voltage)
            + scaled(torque, PRESCALE_TORQUE, m.d_angle_d_torque);
        let mut speed_next = scaled(self.speed, PRESCALE_SPEED, m.d_speed_d_speed)
            + scaled(self.current, PRESCALE_CURRENT, m.d_speed_d_current)
            + scaled(voltage, PRESCALE_VOLTAGE, m.d_speed_d_voltage)
            + scaled(torque, PRESCALE_TORQUE, m.d_speed_d_torque);
        let current_next = scaled(self.speed, PRESCALE_SPEED, m.d_current_d_speed)
            + scaled(self.current, PRESCALE_CURRENT, m.d_current_d_current)
            + scaled(voltage, PRESCALE_VOLTAGE, m.d_current_d_voltage)
            + scaled(torque, PRESCALE_TORQUE, m.d_current_d_torque);

        // A speed sign crossing caused purely by the friction term is a
        // discretization artifact; clamp it to zero instead of letting the
        // estimate reverse direction.
        let friction_step = scaled(torque, PRESCALE_TORQUE, m.d_speed_d_torque);
        if (speed_next < 0) != (speed_next - friction_step < 0) {
            speed_next = 0;
        }

        // Roll millidegree overflow into the whole-degree offset.
        let mut angle_next = clamp_i32(angle_next);
        if angle_next > MDEG_MAX {
            angle_next -= MDEG_MAX;
            self.angle_offset += MDEG_MAX / MDEG_PER_DEG;
        } else if angle_next < -MDEG_MAX {
            angle_next += MDEG_MAX;
            self.angle_offset -= MDEG_MAX / MDEG_PER_DEG;
        }

        self.angle = angle_next;
        self.speed = clamp_i32(speed_next);
        self.current = clamp_i32(current_next);
    }

    /// Reports the stall duration in milliseconds once the raw stall
    /// condition has persisted for at least `dwell` microseconds; `None`
    /// otherwise. The dwell externalizes debounce so transient load spikes
    /// are not reported as stalls.
    pub fn is_stalled(&self, time: u64, dwell: u64) -> Option<u64> {
        if self.stalled && time.saturating_sub(self.stall_start) >= dwell {
            Some((time - self.stall_start) / 1000)
        } else {
            None
        }
    }
}

/// Convert a torque to the voltage that would produce it at stall.
pub fn torque_to_voltage(model: &ObserverModel, torque: i32) -> i32 {
    clamp_i32(i64::from(torque) * i64::from(model.d_torque_d_voltage) / i64::from(PRESCALE_VOLTAGE))
}

/// Convert an applied voltage to the stall torque it can produce.
pub fn voltage_to_torque(model: &ObserverModel, voltage: i32) -> i32 {
    clamp_i32(i64::from(PRESCALE_VOLTAGE) * i64::from(voltage) / i64::from(model.d_torque_d_voltage))
}

/// Worst-case reconstruction error of `torque_to_voltage(voltage_to_torque(v))`
/// in voltage units, implied by the prescale factor.
pub fn round_trip_error_bound(model: &ObserverModel) -> i32 {
    // Stable equivalent of `i32::div_ceil` (unstable `int_roundings`);
    // exact because PRESCALE_VOLTAGE > 0.
    let q = model.d_torque_d_voltage / PRESCALE_VOLTAGE;
    let r = model.d_torque_d_voltage % PRESCALE_VOLTAGE;
    if r > 0 { q + 1 } else { q }
}

/// Feedforward torque for tracking a reference rate (deg/s) and reference
/// acceleration (deg/s²): Coulomb friction compensation, back-EMF
/// compensation, and acceleration torque.
pub fn feedforward_torque(model: &ObserverModel, rate_ref: i32, acceleration_ref: i32) -> i32 {
    let rate = i64::from(rate_ref) * i64::from(MDEG_PER_DEG);
    let acceleration = i64::from(acceleration_ref) * i64::from(MDEG_PER_DEG);

    let friction = i64::from(model.torque_friction) * i64::from(rate_ref.signum());
    let back_emf = rate * i64::from(PRESCALE_SPEED) / i64::from(model.d_torque_d_speed);
    let acceleration_torque =
        acceleration * i64::from(PRESCALE_ACCELERATION) / i64::from(model.d_torque_d_acceleration);

    clamp_i32(friction + back_emf + acceleration_torque)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::load_settings;
    use servo_traits::MotorType;

    fn observer() -> Observer {
        let (model, _) = load_settings(MotorType::Interactive).unwrap();
        Observer::new(model, 1)
    }

    #[test]
    fn reset_seeds_offset_and_zeroes_state() {
        let mut obs = observer();
        obs.update(0, 360, Actuation::Duty, 5000);
        obs.reset(720);
        let state = obs.state();
        assert_eq!(state.angle_offset, 720);
        assert_eq!((state.angle, state.speed, state.current), (0, 0, 0));
        assert!(!state.stalled);
        assert_eq!(obs.estimated_state(), (720, 0));
    }

    #[test]
    fn angle_wraparound_preserves_descaled_position() {
        let mut obs = observer();
        // Put the relative angle just below the band edge and give it
        // enough speed that the next step crosses it.
        obs.angle = MDEG_MAX - 100;
        obs.speed = 2_000_000;
        let (before_pos, _) = obs.estimated_state();
        obs.update(5_000, before_pos, Actuation::Coast, 0);
        let state = obs.state();
        assert_eq!(state.angle_offset, MDEG_MAX / MDEG_PER_DEG);
        assert!(state.angle < MDEG_MAX);
        // Continuity: the de-scaled position moved by less than the step
        // the speed term accounts for, with no one-million-degree jump.
        let (after_pos, _) = obs.estimated_state();
        let step = (after_pos as i64 - before_pos as i64).abs();
        assert!(step < 100_000, "position jumped by {step} degrees");
    }

    #[test]
    fn applied_voltage_only_counts_under_duty() {
        let mut duty = observer();
        let mut coast = observer();
        let mut idle = observer();
        for obs in [&mut duty, &mut coast, &mut idle] {
            obs.reset(0);
        }
        for tick in 1..=20u64 {
            let time = tick * 5_000;
            duty.update(time, 0, Actuation::Duty, 9000);
            coast.update(time, 0, Actuation::Coast, 9000);
            idle.update(time, 0, Actuation::Coast, 0);
        }
        // A coasting tick discards the commanded voltage entirely, so it
        // matches a tick with no voltage at all.
        assert_eq!(coast.state(), idle.state());
        // The same voltage under duty drives the model.
        assert_ne!(duty.state(), coast.state());
    }

    #[test]
    fn stall_requires_dwell_time() {
        let mut obs = observer();
        // Drive the raw stall condition directly: slow, feedback opposing
        // and more than half the applied voltage.
        obs.update_stall_state(1_000, 9000, -5000);
        assert!(obs.state().stalled);
        assert_eq!(obs.is_stalled(1_000, 200_000), None);
        assert_eq!(obs.is_stalled(200_000, 200_000), None);
        // From the 200 ms mark onward the stall is reported, with a
        // monotonically increasing duration.
        assert_eq!(obs.is_stalled(201_000, 200_000), Some(200));
        assert_eq!(obs.is_stalled(301_000, 200_000), Some(300));
    }

    #[test]
    fn stall_clears_without_debounce() {
        let mut obs = observer();
        obs.update_stall_state(0, 9000, -5000);
        obs.update_stall_state(300_000, 9000, 5000);
        assert!(!obs.state().stalled);
        assert_eq!(obs.is_stalled(600_000, 200_000), None);
        // A new stall starts its dwell clock from scratch.
        obs.update_stall_state(600_000, 9000, -5000);
        assert_eq!(obs.is_stalled(700_000, 200_000), None);
        assert_eq!(obs.is_stalled(900_000, 200_000), Some(300));
    }

    #[test]
    fn stall_checks_are_symmetric_in_direction() {
        let mut fwd = observer();
        let mut rev = observer();
        fwd.update_stall_state(0, 9000, -5000);
        rev.update_stall_state(0, -9000, 5000);
        assert_eq!(fwd.state().stalled, rev.state().stalled);
        assert!(fwd.state().stalled);
    }

    #[test]
    fn friction_sign_crossing_clamps_speed_to_zero() {
        let mut obs = observer();
        // Moving slowly forward with no drive: friction alone would push
        // the estimate through zero this tick, so the update pins it at
        // zero instead of reversing direction.
        obs.speed = 10_000;
        obs.update(0, 0, Actuation::Coast, 0);
        assert_eq!(obs.state().speed, 0);
    }

    #[test]
    fn friction_tie_break_at_zero_speed_is_negative_branch() {
        let (model, _) = load_settings(MotorType::Interactive).unwrap();
        let mut obs = Observer::new(model, 1);
        obs.update(0, 0, Actuation::Coast, 0);
        // At exactly zero speed the friction torque takes the negative
        // branch; the speed estimate moves by exactly that friction step.
        let expected = scaled(-model.torque_friction, PRESCALE_TORQUE, model.d_speed_d_torque);
        assert_eq!(i64::from(obs.state().speed), expected);
        assert!(expected > 0);
    }

    #[test]
    fn feedforward_terms_follow_reference_signs() {
        let (model, _) = load_settings(MotorType::TechnicLAngular).unwrap();
        assert!(feedforward_torque(model, 500, 0) > 0);
        assert!(feedforward_torque(model, -500, 0) < 0);
        assert_eq!(
            feedforward_torque(model, 500, 1000),
            -feedforward_torque(model, -500, -1000)
        );
        assert_eq!(feedforward_torque(model, 0, 0), 0);
    }
}
