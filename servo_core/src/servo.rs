//! Per-port servo controller.
//!
//! One `Servo` owns a motor driver, an encoder, an observer, and a control
//! collaborator, and runs the read → control → actuate → log sequence each
//! tick. User-facing angles and speeds are in degrees at the gear train
//! output; the driver and encoder speak raw hardware units behind the
//! configured [`Direction`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use servo_traits::{
    Actuation, Clock, Direction, Encoder, LogRow, LogSink, MotorDriver, MotorType, Result,
    ServoError,
};

use crate::control::{Completion, Control, ControlType, CountsPerUnit, GearRatio};
use crate::logger::NullLog;
use crate::model;
use crate::observer::Observer;
use crate::util::retry_while_busy;

/// Device discovery may report busy while the motor enumerates; retry a
/// bounded number of times at setup only.
const SETUP_ATTEMPTS: u32 = 10;
const SETUP_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Closed-loop controller for one motor port.
pub struct Servo<D: MotorDriver, E: Encoder> {
    driver: D,
    encoder: E,
    clock: Arc<dyn Clock>,
    log: Box<dyn LogSink + Send>,
    direction: Direction,
    device: MotorType,
    voltage_max: i32,
    control: Control,
    observer: Observer,
    /// Time zero for this binding; all tick times are µs since this point.
    epoch: Instant,
    connected: bool,
}

impl<D: MotorDriver, E: Encoder> Servo<D, E> {
    /// Bind driver and encoder handles into a ready controller.
    ///
    /// Discovers the device type (retrying bounded `Again` responses),
    /// loads the model and settings for it, coasts the motor, and seeds
    /// the observer from the current encoder count. Fails with
    /// `NotSupported` if the model table does not know the device.
    pub fn bind(
        mut driver: D,
        mut encoder: E,
        clock: Arc<dyn Clock>,
        direction: Direction,
        gear: GearRatio,
    ) -> Result<Self> {
        let device = retry_while_busy(clock.as_ref(), SETUP_ATTEMPTS, SETUP_RETRY_DELAY, || {
            driver.device_type()
        })?;
        let (model, settings) = model::load_settings(device)?;
        let voltage_max = model::max_voltage(device);

        let counts_per_degree = encoder.resolution();
        let units = CountsPerUnit::new(counts_per_degree, gear);

        // Known-safe starting state before any control law runs.
        driver.coast()?;

        let count = direction.apply(encoder.count()?);
        let mut observer = Observer::new(model, counts_per_degree);
        observer.reset(count);

        debug!(?device, ?direction, "servo bound");

        Ok(Self {
            driver,
            encoder,
            clock: Arc::clone(&clock),
            log: Box::new(NullLog),
            direction,
            device,
            voltage_max,
            control: Control::new(model, settings, units, counts_per_degree),
            observer,
            epoch: clock.now(),
            connected: true,
        })
    }

    /// Replace the sample log sink.
    pub fn set_log(&mut self, log: Box<dyn LogSink + Send>) {
        self.log = log;
    }

    pub fn device_type(&self) -> MotorType {
        self.device
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn control_type(&self) -> ControlType {
        self.control.control_type()
    }

    /// Whether the active maneuver currently sits at its reference.
    pub fn is_on_target(&self) -> bool {
        self.control.is_on_target()
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn settings(&self) -> &crate::model::ControlSettings {
        &self.control.settings
    }

    /// Current position in user degrees.
    pub fn angle(&mut self) -> Result<i32> {
        let count = self.read_count()?;
        Ok(self.control.counts_to_user(count))
    }

    /// Current speed in user degrees per second.
    pub fn speed(&mut self) -> Result<i32> {
        let rate = self.direction.apply(self.encoder.rate()?);
        Ok(self.control.counts_to_user(rate))
    }

    /// Stall duration in milliseconds, once the stall has persisted past
    /// the configured dwell time.
    pub fn stalled(&self) -> Option<u64> {
        let time = self.clock.us_since(self.epoch);
        self.observer
            .is_stalled(time, self.control.settings.stall_time)
    }

    fn read_count(&mut self) -> Result<i32> {
        Ok(self.direction.apply(self.encoder.count()?))
    }

    fn read_state(&mut self) -> Result<(u64, i32, i32)> {
        let time = self.clock.us_since(self.epoch);
        let count = self.direction.apply(self.encoder.count()?);
        let rate = self.direction.apply(self.encoder.rate()?);
        Ok((time, count, rate))
    }

    /// Cancel any control law and drive open loop at the given voltage
    /// (mV, clamped to the motor's rated maximum).
    pub fn set_duty_cycle(&mut self, voltage: i32) -> Result<()> {
        self.control.stop();
        let voltage = voltage.clamp(-self.voltage_max, self.voltage_max);
        self.actuate(Actuation::Duty, voltage)
    }

    /// End any maneuver with the requested after-stop action. `Hold` locks
    /// the current position; anything else resets control to passive.
    /// Always issues exactly one actuation.
    pub fn stop(&mut self, after_stop: Actuation) -> Result<()> {
        match after_stop {
            Actuation::Hold => {
                let count = self.read_count()?;
                self.actuate(Actuation::Hold, count)
            }
            Actuation::Brake => self.actuate(Actuation::Brake, 0),
            Actuation::Coast | Actuation::Duty => self.actuate(Actuation::Coast, 0),
        }
    }

    /// Run at a constant speed (user deg/s) until superseded.
    pub fn run(&mut self, speed: i32) -> Result<()> {
        let (time, count, _) = self.read_state()?;
        let rate = self.control.user_to_counts(speed);
        debug!(speed, "run");
        self.control
            .start_timed(time, None, count, rate, Completion::Never, Actuation::Coast);
        Ok(())
    }

    /// Run at a constant speed for `duration` microseconds.
    pub fn run_time(&mut self, speed: i32, duration: u64, after_stop: Actuation) -> Result<()> {
        let (time, count, _) = self.read_state()?;
        let rate = self.control.user_to_counts(speed);
        debug!(speed, duration, "run_time");
        self.control
            .start_timed(time, Some(duration), count, rate, Completion::Time, after_stop);
        Ok(())
    }

    /// Run at a constant speed until the observer reports a stall.
    pub fn run_until_stalled(&mut self, speed: i32, after_stop: Actuation) -> Result<()> {
        let (time, count, _) = self.read_state()?;
        let rate = self.control.user_to_counts(speed);
        debug!(speed, "run_until_stalled");
        self.control
            .start_timed(time, None, count, rate, Completion::Stalled, after_stop);
        Ok(())
    }

    /// Run to an absolute target angle (user degrees).
    pub fn run_target(&mut self, speed: i32, target: i32, after_stop: Actuation) -> Result<()> {
        let (time, count, _) = self.read_state()?;
        let target = self.control.user_to_counts(target);
        let rate = self.control.user_to_counts(speed);
        debug!(speed, target, "run_target");
        self.control.start_angle(time, count, target, rate, after_stop);
        Ok(())
    }

    /// Run by a relative angle (user degrees) from the current position.
    pub fn run_angle(&mut self, speed: i32, angle: i32, after_stop: Actuation) -> Result<()> {
        let (time, count, _) = self.read_state()?;
        let target = count.saturating_add(self.control.user_to_counts(angle));
        let rate = self.control.user_to_counts(speed);
        debug!(speed, angle, "run_angle");
        self.control.start_angle(time, count, target, rate, after_stop);
        Ok(())
    }

    /// Hold position at the given absolute target angle (user degrees).
    pub fn track_target(&mut self, target: i32) -> Result<()> {
        let time = self.clock.us_since(self.epoch);
        let target = self.control.user_to_counts(target);
        debug!(target, "track_target");
        self.control.start_hold(time, target);
        Ok(())
    }

    /// Reset the angle reference so the current position reads as
    /// `new_value` user degrees (or the absolute-sensor position when
    /// `use_absolute_reference` is set).
    ///
    /// While holding on target, the held target is shifted by the same
    /// amount as the reference so the motor does not move. An active
    /// maneuver that is not a settled hold is coasted first.
    pub fn reset_angle(&mut self, new_value: i32, use_absolute_reference: bool) -> Result<()> {
        let holding = self.control.control_type() == ControlType::Hold
            || (self.control.control_type() == ControlType::Angle && self.control.is_on_target());

        if holding {
            let count = self.read_count()?;
            let offset = self.control.target().unwrap_or(count).saturating_sub(count);
            self.reset_reference(new_value, use_absolute_reference)?;
            let count = self.read_count()?;
            let time = self.clock.us_since(self.epoch);
            self.control.start_hold(time, count.saturating_add(offset));
            return Ok(());
        }

        if self.control.is_active() {
            self.actuate(Actuation::Coast, 0)?;
        }
        self.reset_reference(new_value, use_absolute_reference)
    }

    fn reset_reference(&mut self, new_value: i32, absolute: bool) -> Result<()> {
        let counts = self.control.user_to_counts(new_value);
        self.encoder
            .reset_count(self.direction.apply(counts), absolute)?;
        let count = self.read_count()?;
        self.observer.reset(count);
        Ok(())
    }

    /// Apply one actuation to the hardware.
    ///
    /// `Hold` is not a driver command: it starts a position lock at the
    /// payload count, and the control law drives the motor from the next
    /// tick. On any driver failure the control law is force-reset and a
    /// single best-effort coast is issued before the error propagates.
    pub fn actuate(&mut self, kind: Actuation, value: i32) -> Result<()> {
        let result = match kind {
            Actuation::Coast => {
                self.control.stop();
                self.driver.coast()
            }
            Actuation::Brake => {
                self.control.stop();
                self.driver.brake()
            }
            Actuation::Hold => {
                let time = self.clock.us_since(self.epoch);
                self.control.start_hold(time, value);
                Ok(())
            }
            Actuation::Duty => self.driver.set_duty(self.direction.apply(value)),
        };
        if let Err(err) = result {
            self.abort(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Stop closed-loop control and issue the last-resort coast after a
    /// hardware failure. The coast result is only logged; the triggering
    /// error is what propagates.
    fn abort(&mut self, err: &ServoError) {
        warn!(%err, "servo tick failed, coasting");
        self.control.stop();
        if let Err(coast_err) = self.driver.coast() {
            warn!(%coast_err, "last-resort coast failed");
        }
    }

    /// One control tick: read the physical state, evaluate (or observe)
    /// the actuation, apply it, advance the observer, and log a sample.
    ///
    /// Any failure aborts the tick, coasts the motor, and marks the servo
    /// disconnected; the registry excludes it from later passes until it
    /// is bound again.
    pub fn control_update(&mut self) -> Result<()> {
        let result = self.tick();
        if result.is_err() {
            self.connected = false;
        }
        result
    }

    fn tick(&mut self) -> Result<()> {
        let (time, count, rate) = match self.read_state() {
            Ok(state) => state,
            Err(err) => {
                self.abort(&err);
                return Err(err);
            }
        };

        let stalled = self
            .observer
            .is_stalled(time, self.control.settings.stall_time)
            .is_some();

        let active = self.control.is_active();
        let (kind, value) = if active {
            self.control.update(time, count, rate, stalled)
        } else {
            // Passive: report the driver's own state, no control math.
            match self.driver.passive_state() {
                Ok((kind, value)) => (kind, self.direction.apply(value)),
                Err(err) => {
                    self.abort(&err);
                    return Err(err);
                }
            }
        };

        if active {
            self.actuate(kind, value)?;
        }

        self.observer.update(time, count, kind, value);
        self.log_sample(time, count, rate, kind, value);
        Ok(())
    }

    /// Append one fixed-width sample row. Passive ticks carry only the
    /// measured state and actuation; the maneuver-time and control
    /// columns stay zero.
    fn log_sample(&mut self, time: u64, count: i32, rate: i32, kind: Actuation, value: i32) {
        let row: LogRow = if self.control.is_active() {
            let time_ref = self.control.ref_time(time);
            let (count_ref, rate_ref, _) = self.control.reference(time_ref);
            let (err, integral) = self.control.tracking_errors(count, rate, count_ref, rate_ref);
            [
                (time_ref.saturating_sub(self.control.start_time()) / 1000) as i32,
                count,
                rate,
                kind as i32,
                value,
                count_ref,
                rate_ref,
                err,
                integral,
            ]
        } else {
            [0, count, rate, kind as i32, value, 0, 0, 0, 0]
        };
        self.log.append(&row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{DriverCall, DriverProbe, EncoderProbe, MockDriver, SimClock, SimEncoder};

    fn bound_servo() -> (Servo<MockDriver, SimEncoder>, DriverProbe, EncoderProbe, SimClock) {
        let (driver, driver_probe) = MockDriver::new(MotorType::Interactive);
        let (encoder, encoder_probe) = SimEncoder::new(1);
        let clock = SimClock::new();
        let servo = Servo::bind(
            driver,
            encoder,
            Arc::new(clock.clone()),
            Direction::Clockwise,
            GearRatio::default(),
        )
        .unwrap();
        (servo, driver_probe, encoder_probe, clock)
    }

    #[test]
    fn bind_coasts_and_reports_device() {
        let (servo, probe, _, _) = bound_servo();
        assert_eq!(servo.device_type(), MotorType::Interactive);
        assert!(servo.is_connected());
        assert_eq!(probe.calls(), vec![DriverCall::Coast]);
    }

    #[test]
    fn bind_retries_through_busy_enumeration() {
        let (driver, probe) = MockDriver::new(MotorType::TechnicLAngular);
        probe.busy_for(3);
        let (encoder, _) = SimEncoder::new(2);
        let servo = Servo::bind(
            driver,
            encoder,
            Arc::new(SimClock::new()),
            Direction::Clockwise,
            GearRatio::default(),
        )
        .unwrap();
        assert_eq!(servo.device_type(), MotorType::TechnicLAngular);
    }

    #[test]
    fn bind_fails_without_device() {
        let (driver, _) = MockDriver::disconnected();
        let (encoder, _) = SimEncoder::new(1);
        let result = Servo::bind(
            driver,
            encoder,
            Arc::new(SimClock::new()),
            Direction::Clockwise,
            GearRatio::default(),
        );
        assert!(matches!(result, Err(ServoError::NoDevice)));
    }

    #[test]
    fn set_duty_cycle_clamps_to_rated_voltage() {
        let (mut servo, probe, _, _) = bound_servo();
        servo.set_duty_cycle(50_000).unwrap();
        assert_eq!(probe.last_duty(), Some(9000));
        servo.set_duty_cycle(-50_000).unwrap();
        assert_eq!(probe.last_duty(), Some(-9000));
        assert_eq!(servo.control_type(), ControlType::None);
    }

    #[test]
    fn direction_flips_commands_and_readings() {
        let (driver, probe) = MockDriver::new(MotorType::Interactive);
        let (encoder, encoder_probe) = SimEncoder::new(1);
        let mut servo = Servo::bind(
            driver,
            encoder,
            Arc::new(SimClock::new()),
            Direction::Counterclockwise,
            GearRatio::default(),
        )
        .unwrap();
        encoder_probe.set_raw(-90);
        assert_eq!(servo.angle().unwrap(), 90);
        servo.set_duty_cycle(3000).unwrap();
        assert_eq!(probe.last_duty(), Some(-3000));
    }

    #[test]
    fn stop_hold_locks_current_count() {
        let (mut servo, _, encoder_probe, _) = bound_servo();
        encoder_probe.set_raw(123);
        servo.stop(Actuation::Hold).unwrap();
        assert_eq!(servo.control_type(), ControlType::Hold);
        assert!(servo.is_on_target());
    }

    #[test]
    fn stop_coast_resets_control_to_passive() {
        let (mut servo, probe, _, clock) = bound_servo();
        servo.run(500).unwrap();
        assert_eq!(servo.control_type(), ControlType::Timed);
        clock.advance_us(5_000);
        servo.stop(Actuation::Coast).unwrap();
        assert_eq!(servo.control_type(), ControlType::None);
        assert_eq!(probe.last_call(), Some(DriverCall::Coast));
    }

    #[test]
    fn passive_tick_logs_driver_state_without_commands() {
        let (mut servo, probe, _, clock) = bound_servo();
        let log = crate::logger::SharedLog::new(8);
        servo.set_log(Box::new(log.clone()));
        probe.clear_calls();
        clock.advance_us(5_000);
        servo.control_update().unwrap();
        // No driver command was issued by the passive tick.
        assert!(probe.calls().is_empty());
        let row = log.last().unwrap();
        // No maneuver is running, so the maneuver-time column stays zero
        // along with the control columns.
        assert_eq!(row[0], 0);
        assert_eq!(row[3], Actuation::Coast as i32);
        assert_eq!(&row[5..], &[0, 0, 0, 0]);
    }

    #[test]
    fn active_tick_drives_duty_and_logs_reference() {
        let (mut servo, probe, _, clock) = bound_servo();
        let log = crate::logger::SharedLog::new(8);
        servo.set_log(Box::new(log.clone()));
        servo.run(500).unwrap();
        clock.advance_us(5_000);
        servo.control_update().unwrap();
        assert!(probe.last_duty().is_some());
        let row = log.last().unwrap();
        assert_eq!(row[3], Actuation::Duty as i32);
        // Reference rate heads toward the command during the ramp.
        assert!(row[6] > 0);
    }

    #[test]
    fn reset_angle_passive_rebases_position() {
        let (mut servo, _, encoder_probe, _) = bound_servo();
        encoder_probe.set_raw(500);
        servo.reset_angle(0, false).unwrap();
        assert_eq!(servo.angle().unwrap(), 0);
        encoder_probe.add_raw(30);
        assert_eq!(servo.angle().unwrap(), 30);
    }

    #[test]
    fn reset_angle_while_holding_keeps_target_locked() {
        let (mut servo, _, encoder_probe, _) = bound_servo();
        encoder_probe.set_raw(100);
        servo.stop(Actuation::Hold).unwrap();
        servo.reset_angle(0, false).unwrap();
        assert_eq!(servo.control_type(), ControlType::Hold);
        // Held target moved with the reference: still the current position.
        assert_eq!(servo.control.target(), Some(0));
        assert_eq!(servo.angle().unwrap(), 0);
    }

    #[test]
    fn driver_fault_coasts_once_and_disconnects() {
        let (mut servo, probe, _, clock) = bound_servo();
        servo.run(500).unwrap();
        probe.clear_calls();
        probe.fail_duty(true);
        clock.advance_us(5_000);
        let result = servo.control_update();
        assert!(matches!(result, Err(ServoError::Io(_))));
        assert!(!servo.is_connected());
        assert_eq!(servo.control_type(), ControlType::None);
        assert_eq!(probe.coast_calls(), 1);
    }

    #[test]
    fn encoder_fault_coasts_once_and_disconnects() {
        let (mut servo, probe, encoder_probe, clock) = bound_servo();
        servo.run(500).unwrap();
        probe.clear_calls();
        encoder_probe.fail_next_count();
        clock.advance_us(5_000);
        assert!(servo.control_update().is_err());
        assert!(!servo.is_connected());
        assert_eq!(probe.coast_calls(), 1);
    }
}
