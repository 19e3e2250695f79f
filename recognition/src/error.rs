use std::fmt;

use serde::Serialize;

/// Failure categories that cross component boundaries.
///
/// Every component error maps onto one of these through its `kind()`
/// method; the adapter only ever reasons about kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotEnrolled,
    StoreUnavailable,
    LowQuality,
    EmptyCapture,
    Timeout,
    InternalFault,
    UnknownUser,
    SensorUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotEnrolled => "not_enrolled",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::LowQuality => "low_quality",
            ErrorKind::EmptyCapture => "empty_capture",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalFault => "internal_fault",
            ErrorKind::UnknownUser => "unknown_user",
            ErrorKind::SensorUnavailable => "sensor_unavailable",
        }
    }

    /// Kinds after which another capture may still succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::LowQuality | ErrorKind::EmptyCapture)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
