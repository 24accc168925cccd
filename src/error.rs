//! Error types for rankcomm

use thiserror::Error;

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Return code of a successful operation.
pub const SUCCESS: i32 = 0;

/// Error types for communication operations
#[derive(Error, Debug)]
pub enum Error {
    /// The communicator has not been initialized
    #[error("communicator has not been initialized")]
    NotInitialized,

    /// The substrate endpoint of this rank has been released
    #[error("communication substrate has been finalized")]
    Finalized,

    /// Another rank failed and the group was torn down
    #[error("group aborted after a rank failure")]
    Aborted,

    /// A rank thread panicked while running under a universe
    #[error("rank {0} failed")]
    RankFailed(i32),

    /// Invalid rank specified
    #[error("invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid message tag
    #[error("invalid tag: {0}")]
    InvalidTag(i32),

    /// Invalid request id or substrate request handle
    #[error("invalid request: {0}")]
    InvalidRequest(u64),

    /// Invalid buffer provided
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Invalid count specified
    #[error("invalid count: {0}")]
    InvalidCount(i64),

    /// Incoming message is larger than the receive buffer
    #[error("message truncated: {actual} bytes arrived for a {capacity} byte buffer")]
    Truncated {
        /// Size of the posted receive buffer
        capacity: usize,
        /// Size of the message that arrived
        actual: usize,
    },

    /// World endpoint released while derived communicators were still alive
    #[error("{0} derived communicator(s) still open")]
    OpenHandles(usize),

    /// Operation not supported by the substrate
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Another rank failed a step the collective depends on
    #[error("a peer rank failed with code {0}")]
    PeerFailed(i32),

    /// Error code reported by the substrate
    #[error("substrate error (code {0})")]
    Substrate(i32),

    /// Failure while packing or unpacking a mobile object
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A mobile object rejected its packed representation
    #[error("unpack error: {0}")]
    Unpack(String),

    /// Invalid launch configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an error from a substrate return code.
    ///
    /// Codes owned by this crate map back onto their variants; anything else
    /// is kept verbatim as [`Error::Substrate`].
    pub fn from_code(code: i32) -> Self {
        match code {
            SUCCESS => Error::Internal("from_code called with success code".into()),
            codes::NOT_INITIALIZED => Error::NotInitialized,
            codes::FINALIZED => Error::Finalized,
            codes::ABORTED => Error::Aborted,
            _ => Error::Substrate(code),
        }
    }

    /// Check a substrate return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == SUCCESS {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }

    /// The integer return code of this error.
    ///
    /// Values follow the MPI error classes where one applies.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidBuffer(_) => codes::BUFFER,
            Error::InvalidCount(_) => codes::COUNT,
            Error::InvalidRank(_) => codes::RANK,
            Error::InvalidTag(_) => codes::TAG,
            Error::Truncated { .. } => codes::TRUNCATE,
            Error::InvalidRequest(_) => codes::REQUEST,
            Error::NotSupported(_) => codes::UNSUPPORTED,
            Error::NotInitialized => codes::NOT_INITIALIZED,
            Error::Finalized => codes::FINALIZED,
            Error::Aborted | Error::RankFailed(_) => codes::ABORTED,
            Error::OpenHandles(_) => codes::PENDING,
            Error::Serialization(_) | Error::Unpack(_) => codes::SERIALIZATION,
            Error::Config(_) => codes::ARG,
            Error::PeerFailed(code) | Error::Substrate(code) => *code,
            Error::Internal(_) => codes::INTERN,
        }
    }
}

/// Integer return codes reported through [`Error::code`].
pub mod codes {
    /// Invalid buffer pointer or length
    pub const BUFFER: i32 = 1;
    /// Invalid count argument
    pub const COUNT: i32 = 2;
    /// Invalid tag
    pub const TAG: i32 = 4;
    /// Invalid rank
    pub const RANK: i32 = 6;
    /// Invalid argument
    pub const ARG: i32 = 12;
    /// Message truncated on receive
    pub const TRUNCATE: i32 = 15;
    /// Internal error
    pub const INTERN: i32 = 16;
    /// Pending operations prevent the call
    pub const PENDING: i32 = 18;
    /// Invalid request
    pub const REQUEST: i32 = 19;
    /// Unsupported operation
    pub const UNSUPPORTED: i32 = 52;
    /// Communicator not initialized
    pub const NOT_INITIALIZED: i32 = 100;
    /// Substrate already finalized
    pub const FINALIZED: i32 = 101;
    /// Group aborted
    pub const ABORTED: i32 = 102;
    /// Pack/unpack failure
    pub const SERIALIZATION: i32 = 103;
}

/// Terminate the process after an internal contract violation.
///
/// Peers blocked in a collective cannot be unwound from one rank, so a broken
/// contract is never reported as a recoverable error.
pub(crate) fn fatal(violation: Error) -> ! {
    log::error!(code = violation.code(); "fatal contract violation: {violation}");
    std::process::abort()
}

/// Unwrap a contract check, aborting the process on violation.
pub(crate) fn enforce<T>(checked: Result<T>) -> T {
    match checked {
        Ok(value) => value,
        Err(violation) => fatal(violation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_success_is_ok() {
        assert!(Error::check(SUCCESS).is_ok());
    }

    #[test]
    fn substrate_codes_round_trip() {
        let err = Error::check(77).unwrap_err();
        assert!(matches!(err, Error::Substrate(77)));
        assert_eq!(err.code(), 77);
    }

    #[test]
    fn crate_codes_map_back_to_variants() {
        assert!(matches!(
            Error::from_code(codes::FINALIZED),
            Error::Finalized
        ));
        assert!(matches!(Error::from_code(codes::ABORTED), Error::Aborted));
        assert_eq!(Error::Aborted.code(), codes::ABORTED);
        assert_eq!(Error::RankFailed(3).code(), codes::ABORTED);
    }

    #[test]
    fn every_error_has_nonzero_code() {
        let errors = [
            Error::NotInitialized,
            Error::Finalized,
            Error::InvalidRank(9),
            Error::InvalidRequest(4),
            Error::InvalidBuffer("x".into()),
            Error::InvalidCount(-1),
            Error::Truncated {
                capacity: 1,
                actual: 2,
            },
            Error::OpenHandles(1),
            Error::Unpack("bad".into()),
            Error::Config("bad".into()),
            Error::Internal("oops".into()),
        ];
        for err in &errors {
            assert_ne!(err.code(), SUCCESS, "{err} reported success");
        }
    }

    #[test]
    fn peer_failure_carries_the_peer_code() {
        let err = Error::PeerFailed(codes::BUFFER);
        assert_eq!(err.code(), codes::BUFFER);
        assert_eq!(err.to_string(), "a peer rank failed with code 1");
    }

    #[test]
    fn truncated_message_mentions_sizes() {
        let err = Error::Truncated {
            capacity: 8,
            actual: 16,
        };
        assert_eq!(
            err.to_string(),
            "message truncated: 16 bytes arrived for a 8 byte buffer"
        );
    }
}
