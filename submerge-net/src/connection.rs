// The per-shard connection state machine: Connecting -> Connected ->
// Reconnecting -> Connected, with a transient Draining state during a
// reconnect's replay window and Halted as a poisoned terminal state
// reachable from any of the others. `C` is whatever per-connection
// context a `ClientStrategy` hands back when a connection becomes
// live; the coordinator treats it as opaque.

use std::collections::VecDeque;

use crate::backend::BackendInfo;
use crate::entry::{Completer, ConnectionEntry, DeliveryOutcome};
use crate::envelope::{Payload, Request, SessionToken};
use crate::error::{QueueOverflow, RequestCause};
use crate::ids::{Cookie, TargetId};
use crate::reconnect::ReconnectForwarder;
use crate::time::NodeID;

pub type Sequence = crate::envelope::Sequence;

/// What happened to a caller's request when it was handed to `enqueue`.
/// `Rejected` means the entry was never queued at all — its completer
/// was already fired with a failure (queue overflow, or the connection
/// was halted) — so the caller has nothing further to do but observe
/// that through the `Completion` it was handed.
#[derive(Debug)]
pub enum EnqueueOutcome<P> {
    /// Handed straight to the transport; the caller owns sending it.
    SentNow(Request<P>),
    /// Within the connection's queue ceiling, but not yet sendable
    /// (still `Connecting`/`Reconnecting`, or the transmit window on a
    /// `Connected` connection is full).
    Queued,
    Rejected,
}

fn overflow_cause() -> RequestCause {
    RequestCause::Failure(QueueOverflow.to_string())
}

/// Shared buffering for the two states with no live backend session yet.
struct Buffered<P> {
    cookie: Cookie,
    queue: VecDeque<ConnectionEntry<P>>,
    next_sequence: Sequence,
    ceiling: usize,
}

impl<P> Buffered<P> {
    fn new(cookie: Cookie, ceiling: usize) -> Self {
        Buffered {
            cookie,
            queue: VecDeque::new(),
            next_sequence: 0,
            ceiling,
        }
    }

    fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        if self.queue.len() >= self.ceiling {
            let _ = completer.send(Err(overflow_cause()));
            return EnqueueOutcome::Rejected;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        // session_token 0 is a placeholder: nothing has been transmitted
        // yet, so there is no backend session to address. It is
        // overwritten by `Connected::finish_replay` when this entry is
        // finally admitted.
        let request = Request {
            target,
            sequence,
            session_token: 0,
            payload,
        };
        self.queue.push_back(ConnectionEntry::new(request, completer));
        EnqueueOutcome::Queued
    }

    fn drain(&mut self) -> Vec<ConnectionEntry<P>> {
        std::mem::take(&mut self.queue).into_iter().collect()
    }

    fn complete_all(&mut self, cause: RequestCause) {
        for entry in self.drain() {
            entry.complete_failure(cause.clone());
        }
    }
}

/// No backend has been resolved for this shard yet; requests are
/// buffered up to `ClientConfig::connecting_queue_ceiling`.
pub struct Connecting<P>(Buffered<P>);

impl<P> Connecting<P> {
    pub fn new(cookie: Cookie, queue_ceiling: usize) -> Self {
        Connecting(Buffered::new(cookie, queue_ceiling))
    }

    pub fn cookie(&self) -> Cookie {
        self.0.cookie
    }

    pub fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        self.0.enqueue(target, payload, completer)
    }

    /// Drain this connection's buffered entries so they can be admitted
    /// into a freshly `Connected` one via `Connected::finish_replay`.
    pub fn drain(&mut self) -> Vec<ConnectionEntry<P>> {
        self.0.drain()
    }

    fn complete_all(&mut self, cause: RequestCause) {
        self.0.complete_all(cause)
    }
}

/// A resolved backend was lost mid-session; requests are buffered the
/// same way as `Connecting` while a replacement is resolved.
pub struct Reconnecting<P>(Buffered<P>);

impl<P> Reconnecting<P> {
    pub fn new(cookie: Cookie, queue_ceiling: usize) -> Self {
        Reconnecting(Buffered::new(cookie, queue_ceiling))
    }

    pub fn cookie(&self) -> Cookie {
        self.0.cookie
    }

    pub fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        self.0.enqueue(target, payload, completer)
    }

    pub fn drain(&mut self) -> Vec<ConnectionEntry<P>> {
        self.0.drain()
    }

    fn complete_all(&mut self, cause: RequestCause) {
        self.0.complete_all(cause)
    }
}

/// A live session against a resolved backend. Enforces the backend's
/// granted transmit window (`max_outstanding`); requests beyond the
/// window are held in `backlog` up to `backlog_ceiling` and promoted as
/// outstanding requests resolve.
pub struct Connected<P, C> {
    cookie: Cookie,
    backend: NodeID,
    session_token: SessionToken,
    max_outstanding: u32,
    next_sequence: Sequence,
    outstanding: VecDeque<ConnectionEntry<P>>,
    backlog: VecDeque<ConnectionEntry<P>>,
    backlog_ceiling: usize,
    context: C,
}

impl<P, C> Connected<P, C> {
    pub fn new(cookie: Cookie, info: BackendInfo, backlog_ceiling: usize, context: C) -> Self {
        Connected {
            cookie,
            backend: info.backend,
            session_token: info.session_token,
            max_outstanding: info.max_outstanding,
            next_sequence: 0,
            outstanding: VecDeque::new(),
            backlog: VecDeque::new(),
            backlog_ceiling,
            context,
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn backend(&self) -> NodeID {
        self.backend
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    fn next_seq(&mut self) -> Sequence {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    fn at_capacity(&self) -> bool {
        self.outstanding.len() + self.backlog.len() >= self.max_outstanding as usize + self.backlog_ceiling
    }

    /// Build a fresh entry addressed to this connection's current
    /// session, without admitting it yet. Used both by `enqueue` and by
    /// `ReconnectForwarder::forward`, which needs the entry in hand so
    /// the cohort can rewrite it before it is admitted — stragglers get
    /// the same rewrite as replayed entries.
    pub(crate) fn build_entry(
        &mut self,
        target: TargetId,
        payload: P,
        completer: Completer<P>,
    ) -> ConnectionEntry<P> {
        let sequence = self.next_seq();
        let request = Request {
            target,
            sequence,
            session_token: self.session_token,
            payload,
        };
        ConnectionEntry::new(request, completer)
    }

    /// Admit an already-built entry, enforcing the transmit window.
    pub(crate) fn admit_one(&mut self, entry: ConnectionEntry<P>) -> EnqueueOutcome<P>
    where
        P: Clone,
    {
        if self.at_capacity() {
            entry.complete_failure(overflow_cause());
            return EnqueueOutcome::Rejected;
        }
        let request = entry.request.clone();
        if self.outstanding.len() < self.max_outstanding as usize {
            self.outstanding.push_back(entry);
            EnqueueOutcome::SentNow(request)
        } else {
            self.backlog.push_back(entry);
            EnqueueOutcome::Queued
        }
    }

    pub fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P>
    where
        P: Clone,
    {
        if self.at_capacity() {
            let _ = completer.send(Err(overflow_cause()));
            return EnqueueOutcome::Rejected;
        }
        let entry = self.build_entry(target, payload, completer);
        self.admit_one(entry)
    }

    fn promote_backlog(&mut self) -> Vec<Request<P>>
    where
        P: Clone,
    {
        let mut promoted = Vec::new();
        while self.outstanding.len() < self.max_outstanding as usize {
            match self.backlog.pop_front() {
                Some(entry) => {
                    promoted.push(entry.request.clone());
                    self.outstanding.push_back(entry);
                }
                None => break,
            }
        }
        promoted
    }

    /// Match a `Success` envelope's sequence number against the
    /// outstanding entries, completing it with `payload` and promoting
    /// backlog into the freed window.
    pub fn receive_success(&mut self, sequence: Sequence, payload: P) -> DeliveryOutcome<P>
    where
        P: Clone,
    {
        match self.outstanding.iter().position(|e| e.request.sequence == sequence) {
            Some(pos) => {
                let entry = self.outstanding.remove(pos).unwrap();
                entry.complete_success(payload);
                DeliveryOutcome::Delivered {
                    promoted: self.promote_backlog(),
                }
            }
            None => DeliveryOutcome::Stale,
        }
    }

    pub fn receive_failure(&mut self, sequence: Sequence, cause: RequestCause) -> DeliveryOutcome<P>
    where
        P: Clone,
    {
        match self.outstanding.iter().position(|e| e.request.sequence == sequence) {
            Some(pos) => {
                let entry = self.outstanding.remove(pos).unwrap();
                entry.complete_failure(cause);
                DeliveryOutcome::Delivered {
                    promoted: self.promote_backlog(),
                }
            }
            None => DeliveryOutcome::Stale,
        }
    }

    /// Harvest every unacknowledged entry, in sequence order, so it can
    /// be replayed onto a reconnected backend. Leaves this connection
    /// with empty queues.
    pub fn start_replay(&mut self) -> Vec<ConnectionEntry<P>> {
        let outstanding = std::mem::take(&mut self.outstanding);
        let backlog = std::mem::take(&mut self.backlog);
        outstanding.into_iter().chain(backlog).collect()
    }

    /// Admit entries harvested from a prior connection (by `start_replay`
    /// or a `Connecting`/`Reconnecting` buffer's `drain`), rewriting their
    /// session token to this connection's and preserving their original
    /// sequence numbers so callers can still correlate responses. Returns
    /// the requests ready to send immediately.
    pub fn finish_replay(&mut self, entries: Vec<ConnectionEntry<P>>) -> Vec<Request<P>>
    where
        P: Clone,
    {
        let mut to_send = Vec::new();
        for mut entry in entries {
            if entry.request.sequence >= self.next_sequence {
                self.next_sequence = entry.request.sequence + 1;
            }
            entry.rewrite_session_token(self.session_token);
            if self.outstanding.len() < self.max_outstanding as usize {
                to_send.push(entry.request.clone());
                self.outstanding.push_back(entry);
            } else {
                self.backlog.push_back(entry);
            }
        }
        to_send
    }

    fn complete_all(&mut self, cause: RequestCause) {
        for entry in std::mem::take(&mut self.outstanding) {
            entry.complete_failure(cause.clone());
        }
        for entry in std::mem::take(&mut self.backlog) {
            entry.complete_failure(cause.clone());
        }
    }
}

/// A connection mid-reconnect, after its in-flight entries have been
/// harvested but before a forwarder onto the new connection exists yet.
/// Until the forwarder shows up, a straggler enqueue is held in
/// `Pending` in arrival order rather than being accepted into a buffer
/// nobody will ever drain again; once the forwarder is installed, it is
/// flushed through it in that same order, and every later enqueue goes
/// straight to `Forwarding`.
enum DrainState<P: Payload, C> {
    Pending(Vec<(TargetId, P, Completer<P>)>),
    Forwarding(ReconnectForwarder<P, C>),
}

/// A connection whose entries have already been harvested for replay.
/// The enum-level transition into this state happens in the same
/// critical section that does the harvesting (`Connection::start_replay`),
/// so there is no window in which a concurrent enqueue could land in a
/// buffer that is about to be thrown away.
pub struct Draining<P: Payload, C> {
    cookie: Cookie,
    state: DrainState<P, C>,
}

impl<P: Payload, C> Draining<P, C> {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        match &mut self.state {
            DrainState::Pending(pending) => {
                pending.push((target, payload, completer));
                EnqueueOutcome::Queued
            }
            DrainState::Forwarding(forwarder) => forwarder.forward(target, payload, completer),
        }
    }

    /// Install the forwarder onto the new connection, flushing every
    /// straggler that arrived while this connection was `Pending` through
    /// it in their original arrival order before any later enqueue can
    /// reach it.
    fn install_forwarder(&mut self, forwarder: ReconnectForwarder<P, C>) {
        let pending = match std::mem::replace(&mut self.state, DrainState::Forwarding(forwarder)) {
            DrainState::Pending(pending) => pending,
            DrainState::Forwarding(_) => return,
        };
        let DrainState::Forwarding(forwarder) = &self.state else {
            unreachable!()
        };
        for (target, payload, completer) in pending {
            forwarder.forward(target, payload, completer);
        }
    }

    fn complete_all(&mut self, cause: RequestCause) {
        if let DrainState::Pending(pending) = &mut self.state {
            for (_, _, completer) in std::mem::take(pending) {
                let _ = completer.send(Err(cause.clone()));
            }
        }
    }
}

/// Terminal, poisoned state. No further transitions are possible; the
/// only way out is for the owning shard entry to be removed from the
/// connection map and a fresh `Connecting` started under a new cookie
/// lookup.
pub struct Halted {
    cookie: Cookie,
    pub reason: String,
}

pub enum Connection<P: Payload, C> {
    Connecting(Connecting<P>),
    Connected(Connected<P, C>),
    Reconnecting(Reconnecting<P>),
    Draining(Draining<P, C>),
    Halted(Halted),
}

impl<P: Payload, C> Connection<P, C> {
    pub fn cookie(&self) -> Cookie {
        match self {
            Connection::Connecting(c) => c.cookie(),
            Connection::Connected(c) => c.cookie(),
            Connection::Reconnecting(c) => c.cookie(),
            Connection::Draining(d) => d.cookie(),
            Connection::Halted(h) => h.cookie,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, Connection::Halted(_))
    }

    pub fn enqueue(&mut self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        match self {
            Connection::Connecting(c) => c.enqueue(target, payload, completer),
            Connection::Reconnecting(c) => c.enqueue(target, payload, completer),
            Connection::Connected(c) => c.enqueue(target, payload, completer),
            Connection::Draining(d) => d.enqueue(target, payload, completer),
            Connection::Halted(h) => {
                let _ = completer.send(Err(RequestCause::Failure(format!(
                    "shard halted: {}",
                    h.reason
                ))));
                EnqueueOutcome::Rejected
            }
        }
    }

    /// Harvest this connection's buffered/in-flight entries for replay
    /// onto a reconnected backend, and in the same motion mark it
    /// draining: from the instant this call returns, nothing can enqueue
    /// onto a buffer that is about to be discarded. A straggler that
    /// arrives before the forwarder is installed (`install_forwarder`) is
    /// held in arrival order rather than accepted into this now-empty
    /// connection and lost.
    pub fn start_replay(&mut self) -> Vec<ConnectionEntry<P>> {
        let cookie = self.cookie();
        let harvested = match self {
            Connection::Connected(c) => c.start_replay(),
            Connection::Connecting(c) => c.drain(),
            Connection::Reconnecting(c) => c.drain(),
            Connection::Draining(_) | Connection::Halted(_) => return Vec::new(),
        };
        *self = Connection::Draining(Draining {
            cookie,
            state: DrainState::Pending(Vec::new()),
        });
        harvested
    }

    /// Install the forwarder that stragglers (and, before this call, any
    /// entry queued during the drain) get redirected onto the new
    /// connection through. Must be called on a connection already
    /// `Draining` (i.e. after `start_replay`); defensively treats any
    /// other variant as having nothing buffered to flush.
    pub fn install_forwarder(&mut self, forwarder: ReconnectForwarder<P, C>) {
        match self {
            Connection::Draining(d) => d.install_forwarder(forwarder),
            _ => {
                let cookie = self.cookie();
                *self = Connection::Draining(Draining {
                    cookie,
                    state: DrainState::Forwarding(forwarder),
                });
            }
        }
    }

    /// Transition to the poisoned terminal state from any other state,
    /// completing every buffered and in-flight entry with `reason`.
    /// Idempotent: poisoning an already-`Halted` connection just keeps
    /// its original reason.
    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.is_halted() {
            return;
        }
        let cookie = self.cookie();
        let reason = reason.into();
        let cause = RequestCause::Failure(reason.clone());
        match self {
            Connection::Connecting(c) => c.complete_all(cause),
            Connection::Reconnecting(c) => c.complete_all(cause),
            Connection::Connected(c) => c.complete_all(cause),
            Connection::Draining(d) => d.complete_all(cause),
            Connection::Halted(_) => {}
        }
        *self = Connection::Halted(Halted { cookie, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn target() -> TargetId {
        TargetId::Client(crate::ids::ClientId(0))
    }

    fn info() -> BackendInfo {
        BackendInfo {
            backend: NodeID(1),
            session_token: 99,
            max_outstanding: 2,
        }
    }

    fn completer() -> (Completer<u32>, Completion<u32>) {
        oneshot::channel()
    }

    use crate::entry::Completion;

    #[tokio::test]
    async fn connecting_buffers_up_to_ceiling() {
        let mut c: Connecting<u32> = Connecting::new(7, 2);
        let (tx1, rx1) = completer();
        let (tx2, rx2) = completer();
        let (tx3, rx3) = completer();
        assert!(matches!(c.enqueue(target(), 1, tx1), EnqueueOutcome::Queued));
        assert!(matches!(c.enqueue(target(), 2, tx2), EnqueueOutcome::Queued));
        assert!(matches!(
            c.enqueue(target(), 3, tx3),
            EnqueueOutcome::Rejected
        ));
        assert!(rx3.await.unwrap().is_err());
        drop((rx1, rx2));
    }

    #[tokio::test]
    async fn connected_enforces_transmit_window_then_backlogs() {
        let mut conn: Connected<u32, ()> = Connected::new(7, info(), 1, ());
        let (tx1, _rx1) = completer();
        let (tx2, _rx2) = completer();
        let (tx3, _rx3) = completer();
        let (tx4, rx4) = completer();
        match conn.enqueue(target(), 1, tx1) {
            EnqueueOutcome::SentNow(req) => assert_eq!(req.sequence, 0),
            other => panic!("expected SentNow, got {other:?}"),
        }
        match conn.enqueue(target(), 2, tx2) {
            EnqueueOutcome::SentNow(req) => assert_eq!(req.sequence, 1),
            other => panic!("expected SentNow, got {other:?}"),
        }
        assert!(matches!(
            conn.enqueue(target(), 3, tx3),
            EnqueueOutcome::Queued
        ));
        // Window (2) + backlog ceiling (1) exhausted.
        assert!(matches!(
            conn.enqueue(target(), 4, tx4),
            EnqueueOutcome::Rejected
        ));
        assert!(rx4.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn resolving_a_request_promotes_backlog() {
        let mut conn: Connected<u32, ()> = Connected::new(7, info(), 1, ());
        let (tx1, rx1) = completer();
        let (tx2, _rx2) = completer();
        let (tx3, _rx3) = completer();
        conn.enqueue(target(), 1, tx1);
        conn.enqueue(target(), 2, tx2);
        conn.enqueue(target(), 3, tx3); // backlogged

        match conn.receive_success(0, 100) {
            DeliveryOutcome::Delivered { promoted } => {
                assert_eq!(promoted.len(), 1);
                assert_eq!(promoted[0].sequence, 2);
            }
            DeliveryOutcome::Stale => panic!("expected Delivered"),
        }
        assert_eq!(rx1.await.unwrap(), Ok(100));
    }

    #[tokio::test]
    async fn stale_sequence_is_reported_without_promoting() {
        let mut conn: Connected<u32, ()> = Connected::new(7, info(), 1, ());
        let (tx1, _rx1) = completer();
        conn.enqueue(target(), 1, tx1);
        assert!(matches!(conn.receive_success(999, 0), DeliveryOutcome::Stale));
    }

    #[tokio::test]
    async fn replay_preserves_sequence_and_rewrites_session_token() {
        let mut old: Connected<u32, ()> = Connected::new(7, info(), 1, ());
        let (tx1, _rx1) = completer();
        let (tx2, _rx2) = completer();
        old.enqueue(target(), 1, tx1);
        old.enqueue(target(), 2, tx2);
        let harvested = old.start_replay();
        assert_eq!(harvested.len(), 2);

        let mut fresh_info = info();
        fresh_info.session_token = 555;
        let mut new_conn: Connected<u32, ()> = Connected::new(7, fresh_info, 1, ());
        let to_send = new_conn.finish_replay(harvested);
        assert_eq!(to_send.len(), 2);
        assert!(to_send.iter().all(|r| r.session_token == 555));
        assert_eq!(to_send[0].sequence, 0);
        assert_eq!(to_send[1].sequence, 1);
    }

    #[tokio::test]
    async fn poison_completes_buffered_entries_with_failure() {
        let mut c: Connection<u32, ()> = Connection::Connecting(Connecting::new(7, 4));
        let (tx, rx) = completer();
        c.enqueue(target(), 1, tx);
        c.poison("backend gone");
        assert!(c.is_halted());
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RequestCause::Failure(ref r)) if r == "backend gone"));
    }

    #[tokio::test]
    async fn poison_is_terminal_and_idempotent() {
        let mut c: Connection<u32, ()> = Connection::Connecting(Connecting::new(7, 4));
        c.poison("backend gone");
        assert!(c.is_halted());
        c.poison("second reason ignored");
        if let Connection::Halted(h) = &c {
            assert_eq!(h.reason, "backend gone");
        } else {
            panic!("expected Halted");
        }
    }

    #[tokio::test]
    async fn enqueue_after_halt_fails_the_completer_immediately() {
        let mut c: Connection<u32, ()> = Connection::Connecting(Connecting::new(7, 4));
        c.poison("backend gone");
        let (tx, rx) = completer();
        assert!(matches!(
            c.enqueue(target(), 1, tx),
            EnqueueOutcome::Rejected
        ));
        assert!(rx.await.unwrap().is_err());
    }
}
