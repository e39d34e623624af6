// submerge_base::Error remains the catch-all for programming errors (e.g.
// extract_cookie misuse) and anything that should carry a backtrace when
// first raised. The error kinds below are the per-kind, matchable errors
// the coordinator's control flow actually branches on; they are
// thiserror-derived rather than folded into submerge_base::Error because
// a resolver timeout, a resolver fatal error, and a cycle-detected
// signal each demand different handling at the call site.

/// The cause carried by a `Failure` envelope. `RetiredGeneration` is the
/// only cause that escalates past its own shard.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RequestCause {
    #[error("request failed: {0}")]
    Failure(String),
    #[error("client generation retired")]
    RetiredGeneration,
}

/// Errors a `BackendInfoResolver` may complete with.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("backend resolution timed out")]
    Timeout,
    #[error(transparent)]
    Fatal(#[from] submerge_base::Error),
}

/// Returned by `Connected::enqueue` when both the transmit window and the
/// backlog behind it are full.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("connection queue overflow")]
pub struct QueueOverflow;

/// Signalled by [`crate::lock::InversibleLock`] when a reader's dependency
/// graph would form an AB/BA cycle with a blocked writer. Deliberately
/// not a `std::error::Error`: a `CycleDetected` must never be logged or
/// surfaced to a caller as a normal failure, it must be caught and
/// retried after awaiting the offending writer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CycleDetected;
