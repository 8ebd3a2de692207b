use std::time::Duration;

use thiserror::Error;

use crate::rate_limiter::LimitKind;

/// Errors surfaced by the Executor (§7: `SpawnFailed`, `InterpreterUnavailable`,
/// `LimitViolation`, `InternalIO`).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn interpreter {interpreter}: {message}")]
    SpawnFailed { interpreter: String, message: String },

    #[error("interpreter unavailable: {0}")]
    InterpreterUnavailable(String),

    #[error("resource limit violated: {reason}")]
    LimitViolation { reason: String },

    #[error("internal I/O error: {0}")]
    InternalIo(String),
}

impl SandboxError {
    /// Produce a sanitized message safe to surface across the core/front-end
    /// boundary — never leaks paths, pids, or raw OS error text.
    pub fn user_message(&self) -> String {
        match self {
            Self::SpawnFailed { interpreter, .. } => {
                format!("failed to start {interpreter}")
            }
            Self::InterpreterUnavailable(tag) => format!("interpreter not available: {tag}"),
            Self::LimitViolation { .. } => "resource limit exceeded".to_string(),
            Self::InternalIo(_) => "internal error".to_string(),
        }
    }
}

/// Errors surfaced by the Rate / Quota Engine (§7).
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {kind:?}, retry after {retry_after:?}")]
    Exceeded {
        kind: LimitKind,
        retry_after: Duration,
    },

    #[error("subject is banned")]
    Banned,
}

impl RateLimitError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Exceeded { retry_after, .. } => {
                format!("rate limit exceeded, retry after {}s", retry_after.as_secs())
            }
            Self::Banned => "subject is banned".to_string(),
        }
    }
}

/// Errors surfaced by the Proof Recorder (§7: `SessionClosed`, `EmptyTrace`).
/// Per §7 these are programming errors, fatal to the session but never to
/// the process.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("recording session already closed")]
    SessionClosed,

    #[error("cannot finalize an empty trace")]
    EmptyTrace,
}

/// Errors surfaced by the Consensus evaluator. Per §7, signature and chain
/// failures are not propagated as errors — they are classified into
/// `disagreeing_nodes` on the `ConsensusResult`. This type covers only the
/// handful of calls that can fail outright (no input, or an explicit
/// timeout with no quorum).
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("no proofs supplied")]
    NoProofs,

    #[error("validation timed out before quorum was reached")]
    Inconclusive,
}

/// Crate-level error used only at the binary boundary (`main.rs`); internal
/// component APIs always return their own typed error, never this one.
#[derive(Debug, Error)]
pub enum SandrunError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}
