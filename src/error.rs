//! Crate-level error taxonomy.

/// Error returned by every fallible operation in the crate.
///
/// The variants fall into three families:
///
/// * input problems ([`Validation`](LedgerError::Validation),
///   [`UnknownCommand`](LedgerError::UnknownCommand)),
/// * business-rule violations against current state
///   ([`PreconditionFailed`](LedgerError::PreconditionFailed),
///   [`InFlight`](LedgerError::InFlight)),
/// * store-level failures ([`Io`](LedgerError::Io),
///   [`Serialization`](LedgerError::Serialization),
///   [`Index`](LedgerError::Index), [`Corrupt`](LedgerError::Corrupt)).
///
/// Store-level failures are surfaced as-is. Nothing in the crate retries
/// internally; callers own retry policy.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Malformed input: a bad cursor, an empty id, a duplicate step sequence.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A command's precondition did not hold against the rebuilt state.
    ///
    /// `expected` and `actual` describe the state the handler needed and
    /// the state it found (e.g. `"exists"` vs `"missing"`).
    #[error("precondition failed: expected {expected}, found {actual}")]
    PreconditionFailed {
        /// State the handler required.
        expected: String,
        /// State the handler observed.
        actual: String,
    },

    /// Another attempt of the same logical command is still pending.
    #[error("command {command_id} is already in flight")]
    InFlight {
        /// The command id of the pending attempt.
        command_id: String,
    },

    /// The `command_type`/`payload` pair did not decode into a known command.
    #[error("unknown or malformed command: {0}")]
    UnknownCommand(String),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The embedded secondary index reported an error.
    #[error("index error: {0}")]
    Index(String),

    /// A log and its index disagree; rebuild the index from the log.
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Shorthand for a [`PreconditionFailed`](LedgerError::PreconditionFailed).
    pub fn precondition(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Shorthand for a [`Validation`](LedgerError::Validation) error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Index(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(err))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_display_names_both_sides() {
        let err = LedgerError::precondition("exists", "missing");
        assert_eq!(
            err.to_string(),
            "precondition failed: expected exists, found missing"
        );
    }

    #[test]
    fn io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = LedgerError::from(io_err);
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn rusqlite_error_maps_to_index() {
        let err = LedgerError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, LedgerError::Index(_)));
    }

    #[test]
    fn in_flight_display() {
        let err = LedgerError::InFlight {
            command_id: "cmd-1".into(),
        };
        assert_eq!(err.to_string(), "command cmd-1 is already in flight");
    }

    // Errors cross task boundaries (`spawn_blocking`, tokio channels).
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<LedgerError>();
        }
    };
}
