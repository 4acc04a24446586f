//! Maneuver state and control-law evaluation for one servo.
//!
//! This is a deliberately simple reference trajectory (constant-
//! acceleration ramp to the commanded rate, then cruise, clamped at the
//! target for angle maneuvers) paired with a PID evaluated in the torque
//! domain and converted to a voltage command. Completion criteria are a
//! closed enum; the stalled flag is supplied by the servo from its
//! observer every tick.

use servo_traits::Actuation;

use crate::model::{ControlSettings, ObserverModel};
use crate::observer::{self, MDEG_PER_DEG};

const US_PER_SEC: i64 = 1_000_000;

/// Active maneuver tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Passive; the driver's own state is reported directly.
    None,
    /// Closed-loop position lock at a fixed target.
    Hold,
    /// Closed-loop rate tracking, bounded or unbounded.
    Timed,
    /// Closed-loop trajectory to a target count.
    Angle,
}

/// Completion criterion for a `Timed` maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Never,
    Time,
    Stalled,
}

/// Gear ratio between the motor shaft and the output, as an exact
/// rational. Non-positive components are clamped to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GearRatio {
    pub num: i32,
    pub den: i32,
}

impl Default for GearRatio {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

/// Exact conversion between user angle units (degrees at the gear train
/// output) and encoder counts.
#[derive(Debug, Clone, Copy)]
pub struct CountsPerUnit {
    num: i64,
    den: i64,
}

impl CountsPerUnit {
    pub fn new(resolution: i32, gear: GearRatio) -> Self {
        Self {
            num: i64::from(resolution.max(1)) * i64::from(gear.num.max(1)),
            den: i64::from(gear.den.max(1)),
        }
    }

    pub fn user_to_counts(self, value: i32) -> i32 {
        (i64::from(value) * self.num / self.den) as i32
    }

    pub fn counts_to_user(self, counts: i32) -> i32 {
        (i64::from(counts) * self.den / self.num) as i32
    }

    /// Millidegrees at the output to encoder counts.
    pub fn mdeg_to_counts(self, mdeg: i32) -> i32 {
        (i64::from(mdeg) * self.num / (self.den * i64::from(MDEG_PER_DEG))) as i32
    }

    pub fn counts_to_mdeg(self, counts: i32) -> i32 {
        (i64::from(counts) * self.den * i64::from(MDEG_PER_DEG) / self.num)
            .clamp(-i64::from(i32::MAX), i64::from(i32::MAX)) as i32
    }
}

/// Ramp-and-cruise reference path in encoder counts.
#[derive(Debug, Clone, Copy)]
struct Trajectory {
    t0: u64,
    count0: i32,
    /// Commanded cruise rate, signed (counts/s).
    rate_cmd: i32,
    /// Ramp acceleration magnitude (counts/s²).
    accel: i32,
    /// End position for angle/hold maneuvers.
    target: Option<i32>,
}

impl Trajectory {
    fn rest(count: i32) -> Self {
        Self {
            t0: 0,
            count0: count,
            rate_cmd: 0,
            accel: 1,
            target: Some(count),
        }
    }

    /// Reference `(count, rate, acceleration)` at absolute time `t` (µs).
    fn reference(&self, t: u64) -> (i32, i32, i32) {
        let dt = t.saturating_sub(self.t0).min(i64::MAX as u64) as i64;
        let rate_abs = i64::from(self.rate_cmd.unsigned_abs());
        let accel = i64::from(self.accel.max(1));
        let ramp_us = rate_abs * US_PER_SEC / accel;

        let (dist, rate, acc) = if dt < ramp_us {
            let rate_now = accel * dt / US_PER_SEC;
            (rate_now * dt / (2 * US_PER_SEC), rate_now, self.accel)
        } else {
            let ramp_dist = rate_abs * ramp_us / (2 * US_PER_SEC);
            (
                ramp_dist + rate_abs * (dt - ramp_us) / US_PER_SEC,
                rate_abs,
                0,
            )
        };

        let sign: i64 = if self.rate_cmd < 0 { -1 } else { 1 };
        let mut count_ref = i64::from(self.count0) + sign * dist;
        let mut rate_ref = sign * rate;
        let mut accel_ref = i64::from(acc) * sign;

        // Angle maneuvers clamp the reference at the target.
        if let Some(target) = self.target {
            let reached = if sign >= 0 {
                count_ref >= i64::from(target)
            } else {
                count_ref <= i64::from(target)
            };
            if reached {
                count_ref = i64::from(target);
                rate_ref = 0;
                accel_ref = 0;
            }
        }

        (
            count_ref.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            rate_ref as i32,
            accel_ref as i32,
        )
    }
}

/// Control collaborator for one servo: owns the settings, the active
/// maneuver, and the error integrator.
#[derive(Debug)]
pub struct Control {
    pub settings: ControlSettings,
    model: &'static ObserverModel,
    units: CountsPerUnit,
    counts_per_degree: i32,
    kind: ControlType,
    trajectory: Trajectory,
    completion: Completion,
    /// Maneuver duration (µs) for time-bounded maneuvers.
    duration: Option<u64>,
    after_stop: Actuation,
    /// Position-error integral in mdeg·ms.
    integral: i64,
    last_time: u64,
    on_target: bool,
}

impl Control {
    pub fn new(
        model: &'static ObserverModel,
        settings: ControlSettings,
        units: CountsPerUnit,
        counts_per_degree: i32,
    ) -> Self {
        Self {
            settings,
            model,
            units,
            counts_per_degree: counts_per_degree.max(1),
            kind: ControlType::None,
            trajectory: Trajectory::rest(0),
            completion: Completion::Never,
            duration: None,
            after_stop: Actuation::Coast,
            integral: 0,
            last_time: 0,
            on_target: false,
        }
    }

    pub fn control_type(&self) -> ControlType {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.kind != ControlType::None
    }

    pub fn is_on_target(&self) -> bool {
        self.on_target
    }

    /// Target count of the active maneuver, if it has one.
    pub fn target(&self) -> Option<i32> {
        self.trajectory.target
    }

    pub fn user_to_counts(&self, value: i32) -> i32 {
        self.units.user_to_counts(value)
    }

    pub fn counts_to_user(&self, counts: i32) -> i32 {
        self.units.counts_to_user(counts)
    }

    /// Maneuver start time (µs).
    pub fn start_time(&self) -> u64 {
        self.trajectory.t0
    }

    /// Time at which the reference is evaluated: wall time, clamped to the
    /// end of a time-bounded maneuver.
    pub fn ref_time(&self, time: u64) -> u64 {
        match self.duration {
            Some(duration) => time.min(self.trajectory.t0.saturating_add(duration)),
            None => time,
        }
    }

    /// Reference `(count, rate, acceleration)` at the given time.
    pub fn reference(&self, time: u64) -> (i32, i32, i32) {
        self.trajectory.reference(time)
    }

    /// Tracking error and integrated error for logging: count-based while
    /// tracking a position, rate-based otherwise.
    pub fn tracking_errors(&self, count: i32, rate: i32, count_ref: i32, rate_ref: i32) -> (i32, i32) {
        let err = match self.kind {
            ControlType::Angle | ControlType::Hold => count_ref.saturating_sub(count),
            _ => rate_ref.saturating_sub(rate),
        };
        let integral = self
            .integral
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        (err, integral)
    }

    /// Discard any active maneuver. Synchronous; there is nothing in
    /// flight to wait for.
    pub fn stop(&mut self) {
        self.kind = ControlType::None;
        self.integral = 0;
        self.on_target = false;
    }

    fn clamp_rate(&self, rate: i32) -> i32 {
        let max = self.units.mdeg_to_counts(self.settings.speed_max).max(1);
        rate.clamp(-max, max)
    }

    fn start(&mut self, time: u64, kind: ControlType, trajectory: Trajectory) {
        self.kind = kind;
        self.trajectory = trajectory;
        self.integral = 0;
        self.last_time = time;
        self.on_target = false;
    }

    /// Begin a rate maneuver; `duration == None` runs until superseded or
    /// until the completion criterion fires.
    pub fn start_timed(
        &mut self,
        time: u64,
        duration: Option<u64>,
        count_now: i32,
        target_rate: i32,
        completion: Completion,
        after_stop: Actuation,
    ) {
        let accel = self.units.mdeg_to_counts(self.settings.acceleration).max(1);
        self.start(
            time,
            ControlType::Timed,
            Trajectory {
                t0: time,
                count0: count_now,
                rate_cmd: self.clamp_rate(target_rate),
                accel,
                target: None,
            },
        );
        self.completion = completion;
        self.duration = duration;
        self.after_stop = after_stop;
    }

    /// Begin a position maneuver toward an absolute target count.
    pub fn start_angle(
        &mut self,
        time: u64,
        count_now: i32,
        target: i32,
        rate: i32,
        after_stop: Actuation,
    ) {
        let accel = self.units.mdeg_to_counts(self.settings.acceleration).max(1);
        let magnitude = self
            .clamp_rate(rate.unsigned_abs().min(i32::MAX as u32) as i32)
            .max(1);
        let rate_cmd = if target >= count_now { magnitude } else { -magnitude };
        self.start(
            time,
            ControlType::Angle,
            Trajectory {
                t0: time,
                count0: count_now,
                rate_cmd,
                accel,
                target: Some(target),
            },
        );
        self.completion = Completion::Never;
        self.duration = None;
        self.after_stop = after_stop;
    }

    /// Begin holding position at the given target count.
    pub fn start_hold(&mut self, time: u64, target: i32) {
        self.start(time, ControlType::Hold, Trajectory::rest(target));
        self.trajectory.t0 = time;
        self.completion = Completion::Never;
        self.duration = None;
        self.after_stop = Actuation::Coast;
        // Hold starts at its own target by definition.
        self.on_target = true;
    }

    fn maneuver_done(&self, time: u64, count: i32, rate: i32, stalled: bool) -> bool {
        match self.kind {
            ControlType::None | ControlType::Hold => false,
            ControlType::Timed => match self.completion {
                Completion::Never => false,
                Completion::Time => {
                    let duration = self.duration.unwrap_or(u64::MAX);
                    time.saturating_sub(self.trajectory.t0) >= duration
                }
                Completion::Stalled => stalled,
            },
            ControlType::Angle => {
                let Some(target) = self.trajectory.target else {
                    return false;
                };
                let (count_ref, rate_ref, _) = self.trajectory.reference(time);
                let tol = self
                    .units
                    .mdeg_to_counts(self.settings.position_tolerance)
                    .max(1);
                let rate_tol = self
                    .units
                    .mdeg_to_counts(self.settings.speed_tolerance)
                    .max(1);
                count_ref == target
                    && rate_ref == 0
                    && (i64::from(count) - i64::from(target)).abs() <= i64::from(tol)
                    && i64::from(rate).abs() <= i64::from(rate_tol)
            }
        }
    }

    /// End the active maneuver and emit the after-stop actuation. A `Hold`
    /// after-stop carries the position to lock; the servo re-enters hold
    /// control through `start_hold`.
    fn finish(&mut self, count_now: i32) -> (Actuation, i32) {
        let after = self.after_stop;
        let hold_target = self.trajectory.target.unwrap_or(count_now);
        self.stop();
        match after {
            Actuation::Hold => (Actuation::Hold, hold_target),
            Actuation::Brake => (Actuation::Brake, 0),
            // Duty is not a meaningful after-stop; fall back to coast.
            Actuation::Coast | Actuation::Duty => (Actuation::Coast, 0),
        }
    }

    /// Evaluate one control tick: completion check, then PID in the torque
    /// domain with feedforward, converted to a `Duty` voltage command.
    pub fn update(&mut self, time: u64, count: i32, rate: i32, stalled: bool) -> (Actuation, i32) {
        if self.kind == ControlType::None {
            return (Actuation::Coast, 0);
        }
        if self.maneuver_done(time, count, rate, stalled) {
            return self.finish(count);
        }

        let time_ref = self.ref_time(time);
        let (count_ref, rate_ref, accel_ref) = self.trajectory.reference(time_ref);

        let err_mdeg = self.units.counts_to_mdeg(count_ref.saturating_sub(count));
        let rate_err_mdeg = self.units.counts_to_mdeg(rate_ref.saturating_sub(rate));

        // Track whether the measured state sits at the reference endpoint.
        let tol = self.settings.position_tolerance;
        let rate_tol = self.settings.speed_tolerance;
        self.on_target = err_mdeg.abs() <= tol && self.units.counts_to_mdeg(rate).abs() <= rate_tol;

        // Integrate the position error (mdeg·ms), limiting the per-tick
        // change and saturating where ki reaches the actuation limit.
        let dt_ms = (time.saturating_sub(self.last_time) / 1000) as i64;
        self.last_time = time;
        let change = i64::from(err_mdeg.clamp(
            -self.settings.integral_change_max,
            self.settings.integral_change_max,
        ));
        self.integral = self.integral.saturating_add(change.saturating_mul(dt_ms));
        let ki = i64::from(self.settings.pid_ki.max(1));
        let integral_max = i64::from(self.settings.actuation_max) * 1_000_000 / ki;
        self.integral = self.integral.clamp(-integral_max, integral_max);

        // PID in the torque domain. kp is torque per degree of position
        // error; kd carries an extra 1000 prescale on the rate error.
        let torque_p = i64::from(self.settings.pid_kp) * i64::from(err_mdeg) / 1000;
        let torque_d = i64::from(self.settings.pid_kd) * i64::from(rate_err_mdeg) / 1_000_000;
        let torque_i = ki * self.integral / 1_000_000;
        let torque_ff = i64::from(observer::feedforward_torque(
            self.model,
            rate_ref / self.counts_per_degree,
            accel_ref / self.counts_per_degree,
        ));

        let max = i64::from(self.settings.actuation_max);
        let torque = (torque_p + torque_d + torque_i + torque_ff).clamp(-max, max) as i32;
        (Actuation::Duty, observer::torque_to_voltage(self.model, torque))
    }
}
