//! Per-motor-type physical model parameters and derived control settings.
//!
//! The model coefficients are the partial derivatives of a linearized
//! discrete state-space motor model (angle, speed, current as state;
//! friction torque and applied voltage as inputs), auto-generated from
//! bench measurements for each motor type. They are process-lifetime
//! constants shared by reference across every servo of the same type.

use servo_traits::{MotorType, Result, ServoError};

use crate::observer::{self, MDEG_PER_DEG};

/// Linearized discrete-time motor model.
///
/// Each `d_x_d_y` coefficient is the divisor applied to the prescaled `y`
/// contribution when advancing state variable `x` by one control tick; see
/// `observer` for the prescale factors that pair with them.
#[derive(Debug, PartialEq, Eq)]
pub struct ObserverModel {
    pub d_angle_d_speed: i32,
    pub d_speed_d_speed: i32,
    pub d_current_d_speed: i32,
    pub d_angle_d_current: i32,
    pub d_speed_d_current: i32,
    pub d_current_d_current: i32,
    pub d_angle_d_voltage: i32,
    pub d_speed_d_voltage: i32,
    pub d_current_d_voltage: i32,
    pub d_angle_d_torque: i32,
    pub d_speed_d_torque: i32,
    pub d_current_d_torque: i32,
    pub d_voltage_d_torque: i32,
    pub d_torque_d_voltage: i32,
    pub d_torque_d_speed: i32,
    pub d_torque_d_acceleration: i32,
    /// Static (Coulomb) friction torque magnitude.
    pub torque_friction: i32,
    /// Observer error-feedback gain.
    pub gain: i32,
}

static MODEL_TECHNIC_S_ANGULAR: ObserverModel = ObserverModel {
    d_angle_d_speed: 179217,
    d_speed_d_speed: 956,
    d_current_d_speed: -249247,
    d_angle_d_current: 1950303,
    d_speed_d_current: 7666,
    d_current_d_current: -9356019,
    d_angle_d_voltage: 5654927,
    d_speed_d_voltage: 11702,
    d_current_d_voltage: 349105,
    d_angle_d_torque: -425928,
    d_speed_d_torque: -1085,
    d_current_d_torque: 383927,
    d_voltage_d_torque: 22334,
    d_torque_d_voltage: 17203,
    d_torque_d_speed: 12282,
    d_torque_d_acceleration: 354592,
    torque_friction: 9182,
    gain: 500,
};

static MODEL_TECHNIC_M_ANGULAR: ObserverModel = ObserverModel {
    d_angle_d_speed: 177194,
    d_speed_d_speed: 934,
    d_current_d_speed: -165023,
    d_angle_d_current: 2407354,
    d_speed_d_current: 8311,
    d_current_d_current: 1058029,
    d_angle_d_voltage: 7431528,
    d_speed_d_voltage: 14444,
    d_current_d_voltage: 225610,
    d_angle_d_torque: -919183,
    d_speed_d_torque: -2332,
    d_current_d_torque: 629020,
    d_voltage_d_torque: 47606,
    d_torque_d_voltage: 8071,
    d_torque_d_speed: 5903,
    d_torque_d_acceleration: 163151,
    torque_friction: 21413,
    gain: 2000,
};

static MODEL_TECHNIC_L_ANGULAR: ObserverModel = ObserverModel {
    d_angle_d_speed: 174943,
    d_speed_d_speed: 904,
    d_current_d_speed: -58045,
    d_angle_d_current: 8368268,
    d_speed_d_current: 26508,
    d_current_d_current: 396164,
    d_angle_d_voltage: 13442903,
    d_speed_d_voltage: 25105,
    d_current_d_voltage: 86900,
    d_angle_d_torque: -3690545,
    d_speed_d_torque: -9310,
    d_current_d_torque: 975141,
    d_voltage_d_torque: 133763,
    d_torque_d_voltage: 2872,
    d_torque_d_speed: 1919,
    d_torque_d_acceleration: 40344,
    torque_friction: 23239,
    gain: 4000,
};

static MODEL_INTERACTIVE: ObserverModel = ObserverModel {
    d_angle_d_speed: 179110,
    d_speed_d_speed: 941,
    d_current_d_speed: -316164,
    d_angle_d_current: 7311289,
    d_speed_d_current: 35750,
    d_current_d_current: -12014584,
    d_angle_d_voltage: 4603893,
    d_speed_d_voltage: 10967,
    d_current_d_voltage: 355664,
    d_angle_d_torque: -728461,
    d_speed_d_torque: -1850,
    d_current_d_torque: 668004,
    d_voltage_d_torque: 32225,
    d_torque_d_voltage: 11923,
    d_torque_d_speed: 10599,
    d_torque_d_acceleration: 207820,
    torque_friction: 11227,
    gain: 2000,
};

static MODEL_TECHNIC_L: ObserverModel = ObserverModel {
    d_angle_d_speed: 175977,
    d_speed_d_speed: 912,
    d_current_d_speed: -159828,
    d_angle_d_current: 5728019,
    d_speed_d_current: 22787,
    d_current_d_current: -44152415,
    d_angle_d_voltage: 6164994,
    d_speed_d_voltage: 12888,
    d_current_d_voltage: 142828,
    d_angle_d_torque: -1377701,
    d_speed_d_torque: -3482,
    d_current_d_torque: 794862,
    d_voltage_d_torque: 62889,
    d_torque_d_voltage: 6110,
    d_torque_d_speed: 6837,
    d_torque_d_acceleration: 108520,
    torque_friction: 26430,
    gain: 1500,
};

static MODEL_TECHNIC_XL: ObserverModel = ObserverModel {
    d_angle_d_speed: 176559,
    d_speed_d_speed: 916,
    d_current_d_speed: -175173,
    d_angle_d_current: 8098298,
    d_speed_d_current: 35736,
    d_current_d_current: -7606150,
    d_angle_d_voltage: 5471477,
    d_speed_d_voltage: 12148,
    d_current_d_voltage: 156891,
    d_angle_d_torque: -1282598,
    d_speed_d_torque: -3244,
    d_current_d_torque: 729279,
    d_voltage_d_torque: 55617,
    d_torque_d_voltage: 6908,
    d_torque_d_speed: 7713,
    d_torque_d_acceleration: 116867,
    torque_friction: 12893,
    gain: 2000,
};

static MODEL_MOVE_HUB: ObserverModel = ObserverModel {
    d_angle_d_speed: 176283,
    d_speed_d_speed: 913,
    d_current_d_speed: -202833,
    d_angle_d_current: 7437051,
    d_speed_d_current: 32807,
    d_current_d_current: -8118383,
    d_angle_d_voltage: 5022928,
    d_speed_d_voltage: 11156,
    d_current_d_voltage: 157720,
    d_angle_d_torque: -966059,
    d_speed_d_torque: -2442,
    d_current_d_torque: 636829,
    d_voltage_d_torque: 45536,
    d_torque_d_voltage: 8438,
    d_torque_d_speed: 10851,
    d_torque_d_acceleration: 155017,
    torque_friction: 24835,
    gain: 2000,
};

static MODEL_EV3_L: ObserverModel = ObserverModel {
    d_angle_d_speed: 173282,
    d_speed_d_speed: 881,
    d_current_d_speed: -69014,
    d_angle_d_current: 15363470,
    d_speed_d_current: 49919,
    d_current_d_current: 491835,
    d_angle_d_voltage: 30444180,
    d_speed_d_voltage: 57613,
    d_current_d_voltage: 118854,
    d_angle_d_torque: -7467749,
    d_speed_d_torque: -18754,
    d_current_d_torque: 2298785,
    d_voltage_d_torque: 107106,
    d_torque_d_voltage: 3587,
    d_torque_d_speed: 2083,
    d_torque_d_acceleration: 19838,
    torque_friction: 16476,
    gain: 4000,
};

static MODEL_EV3_M: ObserverModel = ObserverModel {
    d_angle_d_speed: 174833,
    d_speed_d_speed: 899,
    d_current_d_speed: -179788,
    d_angle_d_current: 5508196,
    d_speed_d_current: 20798,
    d_current_d_current: 4313632,
    d_angle_d_voltage: 10143433,
    d_speed_d_voltage: 20656,
    d_current_d_voltage: 196531,
    d_angle_d_torque: -1577148,
    d_speed_d_torque: -3975,
    d_current_d_torque: 1082649,
    d_voltage_d_torque: 47722,
    d_torque_d_voltage: 8051,
    d_torque_d_speed: 7365,
    d_torque_d_acceleration: 94428,
    torque_friction: 18317,
    gain: 2000,
};

/// Control settings for one motor type. Positions and speeds are in
/// millidegrees at the gear train output; torques in the model's torque
/// unit; times in microseconds.
///
/// `actuation_max` and `pid_ki` are derived in `load_settings` and must be
/// recomputed whenever the model or the max-voltage policy changes; they
/// are never set independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    pub speed_max: i32,
    pub acceleration: i32,
    pub deceleration: i32,
    pub speed_tolerance: i32,
    pub position_tolerance: i32,
    pub stall_speed_limit: i32,
    pub stall_time: u64,
    pub integral_change_max: i32,
    pub pid_kp: i32,
    pub pid_kd: i32,
    pub pid_ki: i32,
    pub actuation_max: i32,
}

const fn deg(value: i32) -> i32 {
    value * MDEG_PER_DEG
}

/// Maximum allowed voltage (mV) for a motor type.
pub fn max_voltage(id: MotorType) -> i32 {
    match id {
        MotorType::TechnicSAngular | MotorType::SpikeS => 6000,
        _ => 9000,
    }
}

/// Looks up the model parameters and control settings for a device type.
///
/// Alias ids (Spike-branded motors) resolve to the same model entry as
/// their Technic counterparts by construction. Fails with `NotSupported`
/// for `MotorType::Unknown`.
pub fn load_settings(id: MotorType) -> Result<(&'static ObserverModel, ControlSettings)> {
    // Base settings shared by all motors.
    let mut s = ControlSettings {
        speed_max: 0,
        acceleration: 0,
        deceleration: 0,
        speed_tolerance: deg(50),
        position_tolerance: deg(10),
        stall_speed_limit: deg(20),
        stall_time: 200_000,
        integral_change_max: deg(15),
        pid_kp: 0,
        pid_kd: 0,
        pid_ki: 0,
        actuation_max: 0,
    };

    // Device type specific speed, acceleration, and PD settings.
    let model: &'static ObserverModel = match id {
        MotorType::Unknown => return Err(ServoError::NotSupported),
        MotorType::Ev3Medium => {
            s.speed_max = deg(2000);
            s.acceleration = deg(8000);
            s.pid_kp = 3000;
            s.pid_kd = 30;
            &MODEL_EV3_M
        }
        MotorType::Ev3Large => {
            s.speed_max = deg(1600);
            s.acceleration = deg(3200);
            s.pid_kp = 15000;
            s.pid_kd = 250;
            &MODEL_EV3_L
        }
        MotorType::Interactive => {
            s.speed_max = deg(1000);
            s.acceleration = deg(2000);
            s.pid_kp = 13500;
            s.pid_kd = 1350;
            &MODEL_INTERACTIVE
        }
        MotorType::MoveHub => {
            s.speed_max = deg(1500);
            s.acceleration = deg(5000);
            s.pid_kp = 15000;
            s.pid_kd = 500;
            &MODEL_MOVE_HUB
        }
        MotorType::TechnicL => {
            s.speed_max = deg(1470);
            s.acceleration = deg(2000);
            s.pid_kp = 17500;
            s.pid_kd = 2500;
            &MODEL_TECHNIC_L
        }
        MotorType::TechnicXl => {
            s.speed_max = deg(1525);
            s.acceleration = deg(2500);
            s.pid_kp = 17500;
            s.pid_kd = 2500;
            &MODEL_TECHNIC_XL
        }
        MotorType::TechnicSAngular | MotorType::SpikeS => {
            s.speed_max = deg(620);
            s.acceleration = deg(2000);
            s.pid_kp = 7500;
            s.pid_kd = 1000;
            &MODEL_TECHNIC_S_ANGULAR
        }
        MotorType::TechnicLAngular | MotorType::SpikeL => {
            s.speed_max = deg(970);
            s.acceleration = deg(1500);
            s.pid_kp = 35000;
            s.pid_kd = 6000;
            &MODEL_TECHNIC_L_ANGULAR
        }
        MotorType::TechnicMAngular | MotorType::SpikeM => {
            s.speed_max = deg(1080);
            s.acceleration = deg(2000);
            s.pid_kp = 15000;
            s.pid_kd = 1800;
            &MODEL_TECHNIC_M_ANGULAR
        }
    };

    // Deceleration defaults to the same value as acceleration.
    s.deceleration = s.acceleration;

    // Maximum actuation is the stall torque at maximum voltage.
    s.actuation_max = observer::voltage_to_torque(model, max_voltage(id));

    // Choose ki such that integral control saturates in about two seconds
    // if the motor were stuck at the position tolerance.
    s.pid_ki = s.actuation_max / (s.position_tolerance / MDEG_PER_DEG) / 2;

    Ok((model, s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_not_supported() {
        assert_eq!(
            load_settings(MotorType::Unknown).unwrap_err(),
            ServoError::NotSupported
        );
    }

    #[test]
    fn spike_l_aliases_technic_l_angular() {
        let (model_a, settings_a) = load_settings(MotorType::TechnicLAngular).unwrap();
        let (model_b, settings_b) = load_settings(MotorType::SpikeL).unwrap();
        assert!(std::ptr::eq(model_a, model_b));
        assert_eq!(settings_a, settings_b);
    }

    #[test]
    fn spike_m_aliases_technic_m_angular() {
        let (model_a, settings_a) = load_settings(MotorType::TechnicMAngular).unwrap();
        let (model_b, settings_b) = load_settings(MotorType::SpikeM).unwrap();
        assert!(std::ptr::eq(model_a, model_b));
        assert_eq!(settings_a, settings_b);
    }

    #[test]
    fn ki_saturates_in_two_seconds_at_position_tolerance() {
        let (_, s) = load_settings(MotorType::Interactive).unwrap();
        // Integral of a constant error at the position tolerance reaches
        // actuation_max after roughly two seconds.
        let expected = s.actuation_max / (s.position_tolerance / MDEG_PER_DEG) / 2;
        assert_eq!(s.pid_ki, expected);
        assert!(s.pid_ki > 0);
    }

    #[test]
    fn small_angular_motor_runs_at_lower_voltage() {
        assert_eq!(max_voltage(MotorType::SpikeS), 6000);
        assert_eq!(max_voltage(MotorType::TechnicSAngular), 6000);
        assert_eq!(max_voltage(MotorType::TechnicXl), 9000);
    }
}
