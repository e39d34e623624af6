// ConnectionEntry: the bookkeeping kept per in-flight request on a
// connection. Every entry owns the one-shot completer that its producer
// is awaiting; pairing entry and completer this way avoids any
// back-pointer from the entry to its connection (split into an entry
// record owned by the queue plus a completer handle; completion closes
// the channel, no back-pointer needed) while still guaranteeing the
// entry's callback fires exactly once: `Drop` completes it with a
// failure if nothing else already has, so poisoning a connection is as
// simple as dropping its queues.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::envelope::{Request, SessionToken};
use crate::error::RequestCause;

/// What a producer eventually learns about one request: the matching
/// `Success` envelope's payload, or the cause of a `Failure`.
pub type EntryResult<P> = Result<P, RequestCause>;

/// The producer side of an entry's completion; this is what
/// `ClientBehavior::dispatch` hands back alongside its immediate
/// outcome.
pub type Completion<P> = oneshot::Receiver<EntryResult<P>>;

/// The connection side of the same channel; consumed exactly once, by a
/// matching response, by poison, or — if simply dropped without either
/// — by `Drop`.
pub type Completer<P> = oneshot::Sender<EntryResult<P>>;

/// One outstanding request, from the moment it is assigned a sequence
/// number until its Success or Failure arrives (or it is carried across
/// a reconnect's replay).
pub struct ConnectionEntry<P> {
    pub request: Request<P>,
    pub enqueued_at: Instant,
    completer: Option<Completer<P>>,
}

impl<P> ConnectionEntry<P> {
    pub fn new(request: Request<P>, completer: Completer<P>) -> Self {
        ConnectionEntry {
            request,
            enqueued_at: Instant::now(),
            completer: Some(completer),
        }
    }

    /// Rewrite the session token as part of a reconnect's replay: the
    /// request keeps its sequence number but is addressed to the
    /// reconnected backend's new session.
    pub fn rewrite_session_token(&mut self, token: SessionToken) {
        self.request.session_token = token;
    }

    /// Complete this entry with the matching `Success` envelope's
    /// payload. Consumes the entry, so it cannot be completed twice.
    pub fn complete_success(mut self, payload: P) {
        if let Some(completer) = self.completer.take() {
            let _ = completer.send(Ok(payload));
        }
    }

    /// Complete this entry with a failure cause, used both by `Failure`
    /// envelope delivery and by poisoning.
    pub fn complete_failure(mut self, cause: RequestCause) {
        if let Some(completer) = self.completer.take() {
            let _ = completer.send(Err(cause));
        }
    }
}

impl<P> Drop for ConnectionEntry<P> {
    fn drop(&mut self) {
        if let Some(completer) = self.completer.take() {
            let _ = completer.send(Err(RequestCause::Failure(
                "connection entry dropped without completion".into(),
            )));
        }
    }
}

/// Outcome of matching a `Success`/`Failure` envelope against a
/// sequence number: `Stale` means no entry was waiting on it — already
/// resolved, or from a prior generation — so the response is dropped
/// rather than misapplied.
pub enum DeliveryOutcome<P> {
    Stale,
    Delivered { promoted: Vec<Request<P>> },
}
