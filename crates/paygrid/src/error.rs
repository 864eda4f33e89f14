use thiserror::Error;

/// Errors produced by the settlement path.
///
/// Each variant maps to a stable wire code and an HTTP status; the split
/// between caller-correctable, proof-invalid, and internal faults follows
/// the propagation rules in the module docs: internal faults are the only
/// retryable kind, and they are raised before any state is mutated.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error("invalid input: {}", details.join("; "))]
    InvalidInput { details: Vec<String> },

    #[error("policy denied: {}", reasons.join("; "))]
    PolicyDenied { reasons: Vec<String> },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("authorization outside validity window [{valid_after}, {valid_before}] at {now}")]
    AuthorizationExpired {
        valid_after: u64,
        valid_before: u64,
        now: u64,
    },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("payment proof already consumed")]
    ReplayDetected,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("facilitator error: {0}")]
    Executor(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SettleError {
    /// Single-field convenience constructor for [`SettleError::InvalidInput`].
    pub fn invalid_input(detail: impl Into<String>) -> Self {
        SettleError::InvalidInput {
            details: vec![detail.into()],
        }
    }

    /// Stable machine-readable error code surfaced on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SettleError::InvalidInput { .. } => "INVALID_INPUT",
            SettleError::PolicyDenied { .. } => "POLICY_DENIED",
            SettleError::InvalidSignature(_) => "INVALID_SIGNATURE",
            SettleError::AuthorizationExpired { .. } => "AUTHORIZATION_EXPIRED",
            SettleError::VerificationFailed(_) => "VERIFICATION_FAILED",
            SettleError::ReplayDetected => "REPLAY_DETECTED",
            SettleError::NotFound(_) => "NOT_FOUND",
            SettleError::Storage(_)
            | SettleError::Chain(_)
            | SettleError::Executor(_)
            | SettleError::Serde(_) => "INTERNAL",
        }
    }

    /// HTTP status for the wire error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            SettleError::InvalidInput { .. }
            | SettleError::InvalidSignature(_)
            | SettleError::AuthorizationExpired { .. }
            | SettleError::VerificationFailed(_) => 400,
            SettleError::PolicyDenied { .. } => 403,
            SettleError::ReplayDetected => 409,
            SettleError::NotFound(_) => 404,
            SettleError::Storage(_)
            | SettleError::Chain(_)
            | SettleError::Executor(_)
            | SettleError::Serde(_) => 500,
        }
    }

    /// Per-field details for the wire envelope, when the variant carries any.
    pub fn details(&self) -> Option<&[String]> {
        match self {
            SettleError::InvalidInput { details } => Some(details),
            SettleError::PolicyDenied { reasons } => Some(reasons),
            _ => None,
        }
    }

    /// Whether the caller may retry the identical request with backoff.
    /// True only for internal faults, which are raised before any state
    /// is mutated.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SettleError::Storage(_)
                | SettleError::Chain(_)
                | SettleError::Executor(_)
                | SettleError::Serde(_)
        )
    }
}

impl From<rusqlite::Error> for SettleError {
    fn from(e: rusqlite::Error) -> Self {
        // A unique-constraint violation on the proof key is the replay
        // signal: the reservation is an atomic insert-if-absent.
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return SettleError::ReplayDetected;
            }
        }
        SettleError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let cases: Vec<(SettleError, &str, u16)> = vec![
            (SettleError::invalid_input("bad amount"), "INVALID_INPUT", 400),
            (
                SettleError::PolicyDenied {
                    reasons: vec!["over budget".into()],
                },
                "POLICY_DENIED",
                403,
            ),
            (
                SettleError::InvalidSignature("recovered wrong signer".into()),
                "INVALID_SIGNATURE",
                400,
            ),
            (
                SettleError::AuthorizationExpired {
                    valid_after: 0,
                    valid_before: 10,
                    now: 11,
                },
                "AUTHORIZATION_EXPIRED",
                400,
            ),
            (
                SettleError::VerificationFailed("recipient mismatch".into()),
                "VERIFICATION_FAILED",
                400,
            ),
            (SettleError::ReplayDetected, "REPLAY_DETECTED", 409),
            (SettleError::NotFound("receipt".into()), "NOT_FOUND", 404),
            (SettleError::Storage("disk".into()), "INTERNAL", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn only_internal_faults_are_retryable() {
        assert!(SettleError::Chain("rpc down".into()).retryable());
        assert!(!SettleError::ReplayDetected.retryable());
        assert!(!SettleError::invalid_input("x").retryable());
    }
}
