//! Error types for the sandbox
//!
//! `SandboxError` is what every public operation returns. Failures that
//! originate inside the guest carry an [`ErrorRecord`]; everything else is a
//! local failure raised by the host side of the bridge.

use std::io;

use crate::lua::ErrorRecord;
use crate::lua::ErrorKind;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Guest-originated failure (runtime, syntax, memory, timeouts, ...)
    #[error("{0}")]
    Guest(#[from] ErrorRecord),

    /// Value could not cross the host/guest boundary
    #[error("conversion failed: {0}")]
    Marshal(#[from] MarshalError),

    /// `call_function` target does not resolve to a function
    #[error("function '{0}' does not exist")]
    FunctionNotFound(String),

    /// Bad argument supplied by the host
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The sandbox that owned a handle has been dropped
    #[error("the sandbox owning this value has been destroyed")]
    Destroyed,

    /// `FunctionHandle::dump` refused the function
    #[error("cannot dump function: {0}")]
    NotSerializable(String),

    /// Watchdog thread could not be started
    #[error("timer thread error: {0}")]
    Timer(#[from] io::Error),
}

impl SandboxError {
    /// The guest error record, if this error came from the guest
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            SandboxError::Guest(record) => Some(record),
            _ => None,
        }
    }

    /// The guest error kind, if this error came from the guest
    pub fn kind(&self) -> Option<ErrorKind> {
        self.record().map(|record| record.kind)
    }

    /// True for timeouts of either severity
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::Timeout) | Some(ErrorKind::EmergencyTimeout)
        )
    }
}

/// Conversion failures raised by the value marshaller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    /// Value type has no counterpart on the other side
    #[error("cannot convert value of type {0}")]
    Unsupported(String),

    /// Structure contains itself
    #[error("cannot convert a structure that contains itself")]
    CyclicValue,

    /// Two distinct source keys map to the same converted key
    #[error("duplicate key '{0}' after conversion")]
    KeyCollision(String),

    /// Nesting exceeds the configured conversion depth
    #[error("structure nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Error returned by a host callable invoked from guest code
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Raised in the guest as an ordinary, catchable runtime error
    #[error("{0}")]
    Runtime(String),

    /// Host-side fault: aborts the current guest call
    #[error("host fault: {0}")]
    Fault(String),

    /// Failure of a nested sandbox operation made from the callback
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl CallbackError {
    /// Convenience constructor for guest-visible runtime errors
    pub fn runtime(message: impl Into<String>) -> Self {
        CallbackError::Runtime(message.into())
    }

    /// Convenience constructor for host faults
    pub fn fault(message: impl Into<String>) -> Self {
        CallbackError::Fault(message.into())
    }
}

impl From<MarshalError> for CallbackError {
    fn from(err: MarshalError) -> Self {
        CallbackError::Sandbox(SandboxError::Marshal(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_helpers() {
        let err = SandboxError::Guest(ErrorRecord::new(ErrorKind::Timeout, "slow"));
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert!(err.is_timeout());

        let err = SandboxError::Marshal(MarshalError::CyclicValue);
        assert!(err.record().is_none());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_display() {
        let err = SandboxError::Marshal(MarshalError::KeyCollision("0".to_string()));
        assert_eq!(err.to_string(), "conversion failed: duplicate key '0' after conversion");

        let err = CallbackError::runtime("bad input");
        assert_eq!(err.to_string(), "bad input");
    }
}
