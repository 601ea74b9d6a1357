//! Error and status types for the offload container.
//!
//! Two layers are kept apart:
//!
//! - [`OlcError`] is the rich library error returned by fallible engine
//!   operations (port creation, driver calls, payload parsing).
//! - [`Status`] is the flat code carried in command acknowledgements. Every
//!   error maps onto exactly one status through `From<&OlcError>`.

use std::fmt;

use thiserror::Error;

use crate::command::Opcode;

/// Result code carried by a command acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Success.
    #[default]
    Ok,
    /// Generic failure.
    Failed,
    /// A parameter or payload was rejected.
    BadParam,
    /// The opcode or property is not handled by this container.
    Unsupported,
    /// A resource pool (bits, queues) is exhausted.
    NoResource,
    /// An allocation failed.
    NoMemory,
    /// The satellite is not reachable.
    NotReady,
    /// The container has been destroyed.
    Terminated,
    /// An internal invariant did not hold.
    Unexpected,
}

impl Status {
    /// Returns `true` for [`Status::Ok`].
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// OR-accumulates two results, keeping the first failure seen.
    #[inline]
    pub fn merge(self, other: Status) -> Status {
        if self.is_ok() { other } else { self }
    }

    /// Numeric code on the wire to the command source.
    pub fn code(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::Failed => 1,
            Status::BadParam => 2,
            Status::Unsupported => 3,
            Status::Unexpected => 5,
            Status::NoResource => 7,
            Status::NotReady => 10,
            Status::NoMemory => 18,
            Status::Terminated => 20,
        }
    }

    /// Inverse of [`Status::code`]; unknown codes map to `Failed`.
    pub fn from_code(code: u32) -> Status {
        match code {
            0 => Status::Ok,
            2 => Status::BadParam,
            3 => Status::Unsupported,
            5 => Status::Unexpected,
            7 => Status::NoResource,
            10 => Status::NotReady,
            18 => Status::NoMemory,
            20 => Status::Terminated,
            _ => Status::Failed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Failed => "FAILED",
            Status::BadParam => "BAD_PARAM",
            Status::Unsupported => "UNSUPPORTED",
            Status::NoResource => "NO_RESOURCE",
            Status::NoMemory => "NO_MEMORY",
            Status::NotReady => "NOT_READY",
            Status::Terminated => "TERMINATED",
            Status::Unexpected => "UNEXPECTED",
        };
        write!(f, "{name} (0x{:X})", self.code())
    }
}

/// Failure reported by a [`SatelliteDriver`](crate::satellite::SatelliteDriver).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The satellite rejected the request with the given status.
    #[error("satellite rejected request: {0}")]
    Rejected(Status),
    /// The data port index is not known to the driver.
    #[error("satellite data port {0} not found")]
    UnknownPort(u32),
    /// The transport to the satellite is not available.
    #[error("satellite transport unavailable")]
    Transport,
    /// `init` has not been called (or `deinit` already ran).
    #[error("satellite driver not initialised")]
    NotInitialised,
}

impl DriverError {
    /// Status carried back to the command source.
    pub fn status(&self) -> Status {
        match self {
            DriverError::Rejected(status) => *status,
            DriverError::UnknownPort(_) => Status::BadParam,
            DriverError::Transport | DriverError::NotInitialised => Status::NotReady,
        }
    }
}

/// Errors raised by the container engine.
#[derive(Debug, Error)]
pub enum OlcError {
    /// An allocation or queue creation failed.
    #[error("out of memory while creating {0}")]
    OutOfMemory(&'static str),

    /// The bit-mask pool has no free bits left.
    #[error("no free bit in channel mask (available 0x{available:08X})")]
    NoBitAvailable {
        /// Bits still available when the request failed.
        available: u32,
    },

    /// The command is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The satellite link is marked down.
    #[error("satellite is down")]
    SatelliteDown,

    /// The command payload does not match its opcode.
    #[error("malformed payload for {opcode}: expected {expected}, found {found}")]
    MalformedPayload {
        /// Opcode of the offending command.
        opcode: Opcode,
        /// Payload kind the handler needs.
        expected: &'static str,
        /// Payload kind that arrived.
        found: &'static str,
    },

    /// The request is valid but not handled here.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A referenced sub-graph, module or port does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A parameter value was rejected.
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// The satellite driver failed.
    #[error("satellite driver error")]
    Driver(#[from] DriverError),

    /// A bounded queue refused a message.
    #[error("queue {name} is full")]
    QueueFull {
        /// Diagnostic name of the queue.
        name: String,
    },

    /// An internal invariant did not hold.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl OlcError {
    /// Builds an [`OlcError::InvalidState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Builds an [`OlcError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Builds an [`OlcError::Unsupported`].
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Builds an [`OlcError::BadParam`].
    pub fn bad_param(what: impl Into<String>) -> Self {
        Self::BadParam(what.into())
    }

    /// Builds an [`OlcError::Unexpected`].
    pub fn unexpected(what: impl Into<String>) -> Self {
        Self::Unexpected(what.into())
    }

    /// Ack status for this error.
    pub fn status(&self) -> Status {
        Status::from(self)
    }
}

impl From<&OlcError> for Status {
    fn from(err: &OlcError) -> Self {
        match err {
            OlcError::OutOfMemory(_) => Status::NoMemory,
            OlcError::NoBitAvailable { .. } | OlcError::QueueFull { .. } => Status::NoResource,
            OlcError::InvalidState(_) => Status::Failed,
            OlcError::SatelliteDown => Status::NotReady,
            OlcError::MalformedPayload { .. } | OlcError::BadParam(_) => Status::BadParam,
            OlcError::Unsupported(_) => Status::Unsupported,
            OlcError::NotFound(_) => Status::BadParam,
            OlcError::Driver(e) => e.status(),
            OlcError::Unexpected(_) => Status::Unexpected,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T, E = OlcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_failure() {
        assert_eq!(Status::Ok.merge(Status::Ok), Status::Ok);
        assert_eq!(Status::Ok.merge(Status::BadParam), Status::BadParam);
        assert_eq!(Status::Failed.merge(Status::BadParam), Status::Failed);
        assert_eq!(Status::Unsupported.merge(Status::Ok), Status::Unsupported);
    }

    #[test]
    fn code_round_trip_for_known_codes() {
        for s in [
            Status::Ok,
            Status::BadParam,
            Status::Unsupported,
            Status::NoResource,
            Status::NoMemory,
            Status::NotReady,
            Status::Terminated,
            Status::Unexpected,
        ] {
            assert_eq!(Status::from_code(s.code()), s);
        }
        assert_eq!(Status::from_code(0xDEAD), Status::Failed);
    }

    #[test]
    fn error_to_status_mapping() {
        assert_eq!(
            Status::from(&OlcError::NoBitAvailable { available: 0 }),
            Status::NoResource
        );
        assert_eq!(Status::from(&OlcError::SatelliteDown), Status::NotReady);
        assert_eq!(
            Status::from(&OlcError::Driver(DriverError::Rejected(Status::BadParam))),
            Status::BadParam
        );
        assert_eq!(
            OlcError::unsupported("x").status(),
            Status::Unsupported
        );
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(Status::Terminated.to_string(), "TERMINATED (0x14)");
        let err = OlcError::NoBitAvailable { available: 0 };
        assert!(err.to_string().contains("0x00000000"));
    }
}
