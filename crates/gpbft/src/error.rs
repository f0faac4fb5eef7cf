//! Error types for the consensus core.

use thiserror::Error;

/// Failure reported by a host capability (chain fetch, signing, broadcast).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HostError(pub String);

/// Errors surfaced by the participant and instance entry points.
///
/// Validation errors are local and non-fatal: the message is dropped or
/// rejected at the transport. Internal errors indicate unexpected state and
/// must not be silently swallowed by drivers. Invariant violations (e.g. two
/// strong-quorum values at the same chain length) panic instead — they
/// signal a broken safety assumption, not a recoverable condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GpbftError {
    /// Message is for an instance below the current one; dropped silently.
    #[error("message for instance {instance} is older than current instance {current}")]
    ValidationTooOld { instance: u64, current: u64 },

    /// No committee could be fetched for the message's instance; the caller
    /// may retry.
    #[error("no committee available for instance {instance}: {reason}")]
    ValidationNoCommittee { instance: u64, reason: String },

    /// Structural or signature failure; the message can never become valid.
    #[error("invalid message: {0}")]
    ValidationInvalid(String),

    /// Message base differs from the instance base. Late-bound: only
    /// detectable once the target instance exists, so rejected at receive
    /// rather than at the transport validator.
    #[error("message base does not match instance base")]
    ValidationWrongBase,

    /// Unexpected internal state while receiving.
    #[error("internal error: {0}")]
    ReceivedInternalError(String),

    /// A host capability failed.
    #[error("host error: {0}")]
    Host(#[from] HostError),
}
