//! Classification of failed RPCs
//!
//! Decides what a failed call means for the server behind it: whether the
//! caller gave up, whether the server may be down and should be checked, or
//! whether the failure is an application-level error that recovery cannot
//! fix.

use tonic::{Code, Status};

/// How a failed RPC should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The caller cancelled; propagate without side effects
    Cancelled,
    /// The server may be unhealthy; propagate and schedule a recovery check
    Recoverable,
    /// Not a transport or server failure; propagate and log as unexpected
    Unexpected,
}

/// Status codes that hint the server process may be down or wedged
pub const RECOVERABLE_CODES: &[Code] = &[
    Code::Unavailable,
    Code::Aborted,
    Code::DeadlineExceeded,
    Code::Internal,
    Code::Unknown,
];

impl FaultClass {
    /// Classify a status code
    pub fn of(code: Code) -> Self {
        if code == Code::Cancelled {
            FaultClass::Cancelled
        } else if RECOVERABLE_CODES.contains(&code) {
            FaultClass::Recoverable
        } else {
            FaultClass::Unexpected
        }
    }

    /// Classify a returned status
    pub fn of_status(status: &Status) -> Self {
        Self::of(status.code())
    }

    /// Whether this class should trigger a recovery check
    pub fn triggers_recovery(&self) -> bool {
        matches!(self, FaultClass::Recoverable)
    }
}

impl std::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultClass::Cancelled => write!(f, "cancelled"),
            FaultClass::Recoverable => write!(f, "recoverable"),
            FaultClass::Unexpected => write!(f, "unexpected"),
        }
    }
}
