use core::fmt::Debug;
use core::hash::Hash;
use serde::{Deserialize, Serialize};

use crate::error::RequestCause;
use crate::ids::TargetId;

/// Sequence numbers are assigned per-connection and correlate a `Success`
/// or `Failure` back to the `Request` that produced it.
pub type Sequence = i64;

/// Bound satisfied by anything that can ride inside a `Request`/`Success`
/// payload. The wire encoding of `P` is a transport concern, out of
/// scope here — the coordinator only ever clones, compares, and queues
/// payloads, never serializes them itself.
pub trait Payload: Clone + Debug + Eq + PartialEq + Hash + Send + Sync + 'static {}
impl<T> Payload for T where T: Clone + Debug + Eq + PartialEq + Hash + Send + Sync + 'static {}

/// A session/transmit token, carried by every envelope. For `Request` it
/// identifies which `Connected` session the caller believed it was
/// targeting when the request was built; the cohort may rewrite it
/// during replay so that a reconnected backend accepts the request
/// under its new session.
pub type SessionToken = i64;

// An outbound request targeting a shard. `sequence` is assigned by the
// connection entry queue at enqueue time (not by the caller) so that it
// is always unique and increasing within one connection's lifetime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request<P: Payload> {
    pub target: TargetId,
    pub sequence: Sequence,
    pub session_token: SessionToken,
    pub payload: P,
}

// A successful response, correlated back to its Request by `sequence`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Success<P: Payload> {
    pub target: TargetId,
    pub sequence: Sequence,
    pub session_token: SessionToken,
    pub payload: P,
}

// A failed response. Carries no payload, only a cause; `RetiredGeneration`
// is the one cause that escalates past the owning shard's connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub target: TargetId,
    pub sequence: Sequence,
    pub session_token: SessionToken,
    pub cause: RequestCause,
}

/// The three envelope kinds the actor receives, plus the trusted
/// internal-command kind used to drive state transitions from resolver
/// completions and timers. `Command` is intentionally opaque here: the
/// behavior module defines the concrete command type it dispatches.
pub enum Inbound<P: Payload, C> {
    Success(Success<P>),
    Failure(Failure),
    Command(C),
}
