use thiserror::Error;

/// Closed set of error kinds crossing the servo stack's boundaries.
///
/// Hardware drivers, encoders, and the core all speak this enum; there is
/// no open-ended error type at the seam. `Again` and `NoDevice` are
/// transient and may be retried with a bounded backoff at setup time only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServoError {
    #[error("no motor configured on this port")]
    InvalidPort,
    #[error("device type not supported")]
    NotSupported,
    #[error("no device detected")]
    NoDevice,
    #[error("device busy, try again")]
    Again,
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = core::result::Result<T, ServoError>;
