//! Reconcile error taxonomy. Every internal error is either a classified
//! condition error (terminal, temporary or requeue-after) or a transport
//! error that gets the default backoff.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub const REASON_NOT_FOUND: &str = "NotFound";
pub const REASON_NOT_READY: &str = "NotReady";
pub const REASON_NOT_ALLOWED: &str = "NotAllowed";
pub const REASON_UNKNOWN_ERROR: &str = "UnknownError";
pub const REASON_UNSUPPORTED_ISSUER: &str = "UnsupportedIssuer";
pub const REASON_INVALID_SEED_SECRET: &str = "InvalidSeedSecret";
pub const REASON_MALFORMED_SEED_SECRET: &str = "MalformedSeedSecret";
pub const REASON_INVALID_JWT_SECRET: &str = "InvalidJWTSecret";
pub const REASON_INVALID_SIGNING_KEY_OWNER: &str = "InvalidSigningKeyOwner";
pub const REASON_PUBLIC_KEY_MISMATCH: &str = "PublicKeyMismatch";
pub const REASON_ISSUER_SEED_ERROR: &str = "IssuerSeedError";
pub const REASON_JWT_PUSH_ERROR: &str = "JWTPushError";
pub const REASON_SYSTEM_ACCOUNT: &str = "SystemAccount";

/// Default backoff applied by `error_policy` for temporary failures.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Requeue delay after a status-update conflict.
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// A condition to mark on the owning resource. `failure: true` marks the
/// condition False (malformed input or policy violation), otherwise Unknown
/// (transient could-not-tell).
#[derive(Debug, Clone)]
pub struct ConditionError {
    pub reason: String,
    pub message: String,
    pub failure: bool,
}

impl ConditionError {
    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
            failure: true,
        }
    }

    pub fn unknown(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
            failure: false,
        }
    }
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Do not requeue until the input changes; always paired with a False
    /// condition so the user sees why.
    #[error("{0}")]
    Terminal(ConditionError),

    /// Requeue after the default backoff.
    #[error("{0}")]
    Temporary(ConditionError),

    /// Requeue after the caller-specified delay.
    #[error("{1}")]
    RequeueAfter(Duration, ConditionError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn terminal(condition: ConditionError) -> Self {
        ReconcileError::Terminal(condition)
    }

    pub fn temporary(condition: ConditionError) -> Self {
        ReconcileError::Temporary(condition)
    }

    pub fn condition(&self) -> Option<&ConditionError> {
        match self {
            ReconcileError::Terminal(c)
            | ReconcileError::Temporary(c)
            | ReconcileError::RequeueAfter(_, c) => Some(c),
            _ => None,
        }
    }

    /// How the owning condition should be marked for this error:
    /// `(failure, reason, message)`.
    pub fn marking(&self) -> (bool, String, String) {
        match self.condition() {
            Some(c) => (c.failure, c.reason.clone(), c.message.clone()),
            None => (false, REASON_UNKNOWN_ERROR.to_string(), self.to_string()),
        }
    }
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_prefers_embedded_condition() {
        let err = ReconcileError::terminal(ConditionError::failed(
            REASON_PUBLIC_KEY_MISMATCH,
            "wanted OABC got ODEF",
        ));
        let (failure, reason, message) = err.marking();
        assert!(failure);
        assert_eq!(reason, REASON_PUBLIC_KEY_MISMATCH);
        assert_eq!(message, "wanted OABC got ODEF");
    }

    #[test]
    fn marking_falls_back_to_unknown() {
        let err = ReconcileError::Other(anyhow::anyhow!("connection reset"));
        let (failure, reason, message) = err.marking();
        assert!(!failure);
        assert_eq!(reason, REASON_UNKNOWN_ERROR);
        assert_eq!(message, "connection reset");
    }

    #[test]
    fn temporary_carries_unknown_severity() {
        let err = ReconcileError::temporary(ConditionError::unknown(
            REASON_NOT_READY,
            "issuer not ready",
        ));
        assert!(!err.condition().unwrap().failure);
    }
}
