//! Property tests for the estimator arithmetic.

use proptest::prelude::*;

use servo_core::model::load_settings;
use servo_core::observer::{round_trip_error_bound, torque_to_voltage, voltage_to_torque};
use servo_core::{Actuation, MotorType, Observer};

const ALL_SUPPORTED: [MotorType; 12] = [
    MotorType::Ev3Medium,
    MotorType::Ev3Large,
    MotorType::Interactive,
    MotorType::MoveHub,
    MotorType::TechnicL,
    MotorType::TechnicXl,
    MotorType::TechnicSAngular,
    MotorType::SpikeS,
    MotorType::TechnicLAngular,
    MotorType::SpikeL,
    MotorType::TechnicMAngular,
    MotorType::SpikeM,
];

fn actuation(kind: u8) -> Actuation {
    match kind % 4 {
        0 => Actuation::Coast,
        1 => Actuation::Brake,
        2 => Actuation::Hold,
        _ => Actuation::Duty,
    }
}

proptest! {
    // Two identically seeded observers fed the same input sequence stay
    // bit-identical at every step, for any inputs.
    #[test]
    fn observer_update_is_deterministic(
        seed in -1_000_000..1_000_000i32,
        steps in proptest::collection::vec(
            (0u8..4, -100_000..100_000i32, -9000..9000i32, 1u64..20_000),
            1..200,
        ),
    ) {
        let (model, _) = load_settings(MotorType::TechnicLAngular).unwrap();
        let mut a = Observer::new(model, 2);
        let mut b = Observer::new(model, 2);
        a.reset(seed);
        b.reset(seed);

        let mut time = 0u64;
        for (kind, count, voltage, dt) in steps {
            time += dt;
            let kind = actuation(kind);
            a.update(time, count, kind, voltage);
            b.update(time, count, kind, voltage);
            prop_assert_eq!(a.state(), b.state());
        }
    }

    // The update is total: extreme counts and voltages never panic and the
    // state stays inside the i32 band.
    #[test]
    fn observer_update_is_total_for_extreme_inputs(
        count in proptest::num::i32::ANY,
        voltage in proptest::num::i32::ANY,
        ticks in 1usize..50,
    ) {
        let (model, _) = load_settings(MotorType::Ev3Large).unwrap();
        let mut obs = Observer::new(model, 1);
        obs.reset(0);
        for tick in 0..ticks {
            obs.update(tick as u64 * 5_000, count, Actuation::Duty, voltage);
        }
        let _ = obs.estimated_state();
    }

    // Voltage survives a torque round trip to within the documented bound
    // for every supported motor model.
    #[test]
    fn torque_voltage_round_trip_is_within_bound(voltage in -10_000..10_000i32) {
        for id in ALL_SUPPORTED {
            let (model, _) = load_settings(id).unwrap();
            let bound = round_trip_error_bound(model);
            let back = torque_to_voltage(model, voltage_to_torque(model, voltage));
            prop_assert!(
                (back - voltage).abs() <= bound,
                "{:?}: {} -> {} exceeds bound {}",
                id, voltage, back, bound,
            );
        }
    }
}

#[test]
fn round_trip_bound_is_tight_across_models() {
    // One millivolt for every supported motor: the voltage prescale
    // exceeds every `d_torque_d_voltage` in the table.
    for id in ALL_SUPPORTED {
        let (model, _) = load_settings(id).unwrap();
        assert_eq!(round_trip_error_bound(model), 1, "{id:?}");
    }
}
