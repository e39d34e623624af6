// ClientBehavior: the coordinator itself, tying the connection map, the
// backend resolver, and a client's strategy together. This is the one
// type application code actually drives: build one per client, call
// `dispatch` to send, and feed `handle_success`/`handle_failure`/
// `resolve_shard` from whatever transport and timer plumbing the host
// provides (wire encoding and the actor's event loop itself are both
// out of scope).

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::backend::{BackendInfo, BackendInfoResolver};
use crate::config::ClientConfig;
use crate::connection::{Connection, EnqueueOutcome};
use crate::entry::{Completion, ConnectionEntry};
use crate::envelope::{Failure, Inbound, Payload, Request, Success};
use crate::error::{RequestCause, ResolverError};
use crate::ids::{extract_cookie, ClientId, Cookie, TargetId};
use crate::lock::release_all_reads;
use crate::map::{ConnectionHandle, ConnectionMap};
use crate::reconnect::{self, ConnectCohort, ReconnectOutcome};
use crate::strategy::ClientStrategy;

/// Adapts a `ClientStrategy` to the reconnect protocol's narrower
/// `ConnectCohort` interface, so `ClientBehavior` never has to implement
/// both. Held as an owned `Arc<S>` rather than a borrow: a
/// `ReconnectForwarder` built from this cohort can legitimately outlive
/// the single `resolve_shard` call that created it, so nothing here can
/// borrow from the stack.
struct StrategyCohort<S> {
    strategy: Arc<S>,
}

impl<S, P, C> ConnectCohort<P, C> for StrategyCohort<S>
where
    S: ClientStrategy<P, C>,
    P: Payload,
{
    fn connection_up(&self, cookie: Cookie, info: &BackendInfo) -> Result<C, submerge_base::Error> {
        self.strategy.connection_up(cookie, info)
    }

    fn finish_reconnect(&self, entries: &mut [ConnectionEntry<P>]) {
        self.strategy.finish_reconnect(entries)
    }
}

/// What happened to a `dispatch` call's synchronous half; the eventual
/// outcome always also arrives on the `Completion<P>` handed back
/// alongside this.
#[derive(Debug)]
pub enum DispatchOutcome<P> {
    SentNow(Request<P>),
    Queued,
    /// The completer was already fired with a failure — queue overflow,
    /// the shard halted, or the whole client halted.
    Rejected,
}

/// The one synchronous error `dispatch` can raise: `target` did not name
/// a valid envelope destination at all, so there is no shard to enqueue
/// against and no completer was ever created.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Base(#[from] submerge_base::Error),
}

/// Resolution of one shard's backend, followed through to a published
/// connection or a retry schedule. Returned by `resolve_shard` so the
/// caller's actor loop can transmit `to_send` and, on `RetryAfter`,
/// re-enqueue itself via `ActorContext::send_after`.
#[derive(Debug)]
pub enum ResolveOutcome<P> {
    Published(Vec<Request<P>>),
    LostRace,
    RetryAfter(std::time::Duration),
    /// The resolver reported a hard failure for this shard specifically
    /// (as opposed to a timeout, which just backs off). The shard's
    /// connection has already been poisoned and evicted from the map;
    /// the caller has nothing further to retry here. Other shards on
    /// this client are unaffected.
    Poisoned,
}

pub struct ClientBehavior<P, C, S, R>
where
    P: Payload,
    S: ClientStrategy<P, C>,
    R: BackendInfoResolver,
{
    client: ClientId,
    map: ConnectionMap<P, C>,
    resolver: R,
    strategy: Arc<S>,
    config: ClientConfig,
    /// Set at most once: `halt_client` fires exactly once per client, no
    /// matter how many shards independently trip the condition that
    /// calls for it.
    halted: OnceLock<String>,
}

impl<P, C, S, R> ClientBehavior<P, C, S, R>
where
    P: Payload,
    S: ClientStrategy<P, C>,
    R: BackendInfoResolver,
{
    pub fn new(client: ClientId, resolver: R, strategy: S, config: ClientConfig) -> Self {
        ClientBehavior {
            client,
            map: ConnectionMap::new(),
            resolver,
            strategy: Arc::new(strategy),
            config,
            halted: OnceLock::new(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    /// Tear the whole client down irrecoverably: every shard's
    /// connection is poisoned and the map is cleared, and the
    /// strategy's `halt_client` hook fires exactly once regardless of
    /// how many callers race to get here first.
    fn halt_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.halted.set(reason.clone()).is_ok() {
            warn!(target: "submerge_net", client = self.client.0, reason = %reason, "halting client");
            self.strategy.halt_client(&reason);
        }
        self.map.poison_all(&reason);
    }

    fn lookup_with_retry(&self, cookie: Cookie) -> Option<ConnectionHandle<P, C>> {
        loop {
            match self.map.lookup(cookie) {
                Ok(handle) => return handle,
                Err(_cycle_detected) => {
                    release_all_reads();
                    self.map.await_writer();
                }
            }
        }
    }

    /// Enqueue a request addressed to `target`. Retries internally on
    /// `CycleDetected`: release this thread's other stamps, await the
    /// offending writer, then retry from the top. The returned
    /// `Completion<P>` resolves exactly once, whether that happens
    /// synchronously (this call already rejected it) or later (a
    /// response arrives, the shard is poisoned, or the entry is simply
    /// dropped).
    pub fn dispatch(
        &self,
        target: TargetId,
        payload: P,
    ) -> Result<(DispatchOutcome<P>, Completion<P>), DispatchError> {
        let cookie = extract_cookie(&target)?;
        let (completer, completion) = tokio::sync::oneshot::channel();

        if let Some(reason) = self.halted.get() {
            let _ = completer.send(Err(RequestCause::Failure(format!(
                "client halted: {reason}"
            ))));
            return Ok((DispatchOutcome::Rejected, completion));
        }

        let handle = loop {
            match self
                .map
                .get_connection(cookie, self.config.connecting_queue_ceiling)
            {
                Ok(handle) => break handle,
                Err(_cycle_detected) => {
                    release_all_reads();
                    // The writer we raced is on this same map; awaiting
                    // its own lock resolves the cycle.
                    self.map.await_writer();
                }
            }
        };

        let outcome = handle.lock().unwrap().enqueue(target, payload, completer);
        Ok((to_dispatch_outcome(outcome), completion))
    }

    /// Drive a shard's backend resolution to completion: on success, run
    /// the full reconnect/replay protocol and publish; on a timeout,
    /// report a retry delay instead of retrying forever inline; on a
    /// hard resolver failure, poison just this shard rather than
    /// retrying it at all. If `connection_up` itself fails, that is
    /// treated as fatal to the whole client, not just this shard.
    pub async fn resolve_shard(&self, cookie: Cookie) -> ResolveOutcome<P> {
        if self.is_halted() {
            return ResolveOutcome::RetryAfter(self.config.resolver_retry_delay);
        }

        let info = match self.resolver.resolve(cookie).await {
            Ok(info) => info,
            Err(ResolverError::Timeout) => {
                warn!(target: "submerge_net", cookie, "resolver timed out, backing off");
                return ResolveOutcome::RetryAfter(self.config.resolver_retry_delay);
            }
            Err(ResolverError::Fatal(e)) => {
                warn!(target: "submerge_net", cookie, error = %e, "resolver failed, poisoning shard");
                if let Some(handle) = self.lookup_with_retry(cookie) {
                    handle
                        .lock()
                        .unwrap()
                        .poison(format!("resolver failed: {e}"));
                    self.map.remove_if(cookie, &handle);
                }
                return ResolveOutcome::Poisoned;
            }
        };

        let handle = match self
            .map
            .get_connection(cookie, self.config.connecting_queue_ceiling)
        {
            Ok(handle) => handle,
            Err(_cycle_detected) => {
                release_all_reads();
                self.map.await_writer();
                return ResolveOutcome::RetryAfter(self.config.resolver_retry_delay);
            }
        };

        let cohort: Arc<dyn ConnectCohort<P, C>> = Arc::new(StrategyCohort {
            strategy: self.strategy.clone(),
        });
        match reconnect::reconnect(
            &self.map,
            cookie,
            &handle,
            info,
            cohort,
            self.config.connecting_queue_ceiling,
        ) {
            Ok(ReconnectOutcome::Published(to_send)) => {
                info!(target: "submerge_net", cookie, backend = ?info.backend, "shard connected");
                ResolveOutcome::Published(to_send)
            }
            Ok(ReconnectOutcome::LostRace) => ResolveOutcome::LostRace,
            Err(e) => {
                self.halt_all(format!("connection_up failed: {e}"));
                ResolveOutcome::LostRace
            }
        }
    }

    /// Route a `Success` envelope back to its connection. A cookie with
    /// no connection, or a sequence number that doesn't match any
    /// outstanding request, is logged and dropped rather than treated
    /// as an error: inbound envelopes are never trusted enough to crash
    /// the client. Returns any backlog entries promoted into the freed
    /// transmit window, ready to send.
    pub fn handle_success(&self, cookie: Cookie, success: Success<P>) -> Vec<Request<P>> {
        let Some(handle) = self.lookup_with_retry(cookie) else {
            warn!(target: "submerge_net", cookie, "success for unknown shard, dropping");
            return Vec::new();
        };
        let mut guard = handle.lock().unwrap();
        match &mut *guard {
            Connection::Connected(connected) => {
                match connected.receive_success(success.sequence, success.payload) {
                    crate::entry::DeliveryOutcome::Delivered { promoted } => promoted,
                    crate::entry::DeliveryOutcome::Stale => {
                        warn!(target: "submerge_net", cookie, sequence = success.sequence, "stale success, dropping");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Route a `Failure` envelope back to its connection.
    /// `RequestCause::RetiredGeneration` escalates past the single
    /// request: it halts the whole client rather than just failing the
    /// one entry, since the backend is telling us this client's
    /// generation is no longer valid anywhere.
    pub fn handle_failure(&self, cookie: Cookie, failure: Failure) -> Vec<Request<P>> {
        let escalate = matches!(failure.cause, RequestCause::RetiredGeneration);

        let promoted = match self.lookup_with_retry(cookie) {
            Some(handle) => {
                let mut guard = handle.lock().unwrap();
                match &mut *guard {
                    Connection::Connected(connected) => {
                        match connected.receive_failure(failure.sequence, failure.cause.clone()) {
                            crate::entry::DeliveryOutcome::Delivered { promoted } => promoted,
                            crate::entry::DeliveryOutcome::Stale => Vec::new(),
                        }
                    }
                    _ => Vec::new(),
                }
            }
            None => {
                warn!(target: "submerge_net", cookie, "failure for unknown shard, dropping");
                Vec::new()
            }
        };

        if escalate {
            self.halt_all("backend reported generation retired");
        }

        promoted
    }

    /// Route one inbound envelope to wherever it belongs: a `Success` or
    /// `Failure` goes to its shard's connection, and a `Command` goes
    /// straight to the strategy rather than through any connection at
    /// all. This is the single entry point a transport should feed
    /// everything it receives through.
    pub async fn handle_inbound(&self, cookie: Cookie, inbound: Inbound<P, P>) -> Vec<Request<P>> {
        match inbound {
            Inbound::Success(success) => self.handle_success(cookie, success),
            Inbound::Failure(failure) => self.handle_failure(cookie, failure),
            Inbound::Command(command) => {
                self.strategy.on_command(command).await;
                Vec::new()
            }
        }
    }
}

fn to_dispatch_outcome<P>(outcome: EnqueueOutcome<P>) -> DispatchOutcome<P> {
    match outcome {
        EnqueueOutcome::SentNow(req) => DispatchOutcome::SentNow(req),
        EnqueueOutcome::Queued => DispatchOutcome::Queued,
        EnqueueOutcome::Rejected => DispatchOutcome::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NodeID;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FixedResolver(BackendInfo);

    #[async_trait]
    impl BackendInfoResolver for FixedResolver {
        async fn resolve(&self, _cookie: Cookie) -> Result<BackendInfo, ResolverError> {
            Ok(self.0)
        }
    }

    struct PassthroughStrategy {
        commands_seen: AtomicU32,
        halted: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ClientStrategy<u32, ()> for PassthroughStrategy {
        async fn on_command(&self, _command: u32) {
            self.commands_seen.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_up(
            &self,
            _cookie: Cookie,
            _info: &BackendInfo,
        ) -> Result<(), submerge_base::Error> {
            Ok(())
        }

        fn halt_client(&self, reason: &str) {
            *self.halted.lock().unwrap() = Some(reason.to_string());
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl BackendInfoResolver for FailingResolver {
        async fn resolve(&self, _cookie: Cookie) -> Result<BackendInfo, ResolverError> {
            Err(ResolverError::Fatal(submerge_base::err("backend gone")))
        }
    }

    struct FailingConnectStrategy;

    #[async_trait]
    impl ClientStrategy<u32, ()> for FailingConnectStrategy {
        async fn on_command(&self, _command: u32) {}

        fn connection_up(
            &self,
            _cookie: Cookie,
            _info: &BackendInfo,
        ) -> Result<(), submerge_base::Error> {
            Err(submerge_base::err("backend rejected session"))
        }

        fn halt_client(&self, _reason: &str) {}
    }

    fn target() -> TargetId {
        TargetId::LocalHistory(crate::ids::LocalHistoryId::new(ClientId(1), 1))
    }

    fn behavior() -> ClientBehavior<u32, (), PassthroughStrategy, FixedResolver> {
        let info = BackendInfo {
            backend: NodeID(1),
            session_token: 5,
            max_outstanding: 4,
        };
        ClientBehavior::new(
            ClientId(1),
            FixedResolver(info),
            PassthroughStrategy {
                commands_seen: AtomicU32::new(0),
                halted: Mutex::new(None),
            },
            ClientConfig::default(),
        )
    }

    #[tokio::test]
    async fn dispatch_buffers_while_connecting() {
        let b = behavior();
        let (outcome, _completion) = b.dispatch(target(), 1).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Queued));
    }

    #[tokio::test]
    async fn resolve_then_dispatch_sends_immediately() {
        let b = behavior();
        let cookie = extract_cookie(&target()).unwrap();
        match b.resolve_shard(cookie).await {
            ResolveOutcome::Published(_) => {}
            other => panic!("expected Published, got {other:?}"),
        }
        let (outcome, _completion) = b.dispatch(target(), 7).unwrap();
        assert!(matches!(outcome, DispatchOutcome::SentNow(_)));
    }

    #[tokio::test]
    async fn success_resolves_outstanding_entry() {
        let b = behavior();
        let cookie = extract_cookie(&target()).unwrap();
        b.resolve_shard(cookie).await;
        let (DispatchOutcome::SentNow(req), completion) = b.dispatch(target(), 7).unwrap() else {
            panic!("expected SentNow");
        };
        b.handle_success(
            cookie,
            Success {
                target: target(),
                sequence: req.sequence,
                session_token: req.session_token,
                payload: 100,
            },
        );
        assert_eq!(completion.await.unwrap(), Ok(100));
    }

    #[tokio::test]
    async fn stale_success_is_dropped_without_panicking() {
        let b = behavior();
        let cookie = extract_cookie(&target()).unwrap();
        b.resolve_shard(cookie).await;
        let promoted = b.handle_success(
            cookie,
            Success {
                target: target(),
                sequence: 999,
                session_token: 5,
                payload: 1,
            },
        );
        assert!(promoted.is_empty());
    }

    #[tokio::test]
    async fn retired_generation_halts_the_whole_client() {
        let b = behavior();
        let cookie = extract_cookie(&target()).unwrap();
        b.resolve_shard(cookie).await;
        let (DispatchOutcome::SentNow(req), completion) = b.dispatch(target(), 7).unwrap() else {
            panic!("expected SentNow");
        };
        b.handle_failure(
            cookie,
            Failure {
                target: target(),
                sequence: req.sequence,
                session_token: req.session_token,
                cause: RequestCause::RetiredGeneration,
            },
        );
        assert!(b.is_halted());
        assert!(completion.await.unwrap().is_err());

        let (outcome, completion2) = b.dispatch(target(), 8).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Rejected));
        assert!(completion2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn command_inbound_reaches_the_strategy() {
        let b = behavior();
        let cookie = extract_cookie(&target()).unwrap();
        b.handle_inbound(cookie, Inbound::Command(9)).await;
        assert_eq!(
            b.strategy.commands_seen.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn resolver_fatal_poisons_only_the_failing_shard() {
        let b = ClientBehavior::new(
            ClientId(1),
            FailingResolver,
            PassthroughStrategy {
                commands_seen: AtomicU32::new(0),
                halted: Mutex::new(None),
            },
            ClientConfig::default(),
        );
        let cookie = extract_cookie(&target()).unwrap();
        let (_outcome, completion) = b.dispatch(target(), 1).unwrap();
        match b.resolve_shard(cookie).await {
            ResolveOutcome::Poisoned => {}
            other => panic!("expected Poisoned, got {other:?}"),
        }
        assert!(completion.await.unwrap().is_err());
        assert!(!b.is_halted());
    }

    #[tokio::test]
    async fn connection_up_failure_halts_the_whole_client() {
        let info = BackendInfo {
            backend: NodeID(1),
            session_token: 5,
            max_outstanding: 4,
        };
        let b = ClientBehavior::new(
            ClientId(1),
            FixedResolver(info),
            FailingConnectStrategy,
            ClientConfig::default(),
        );
        let cookie = extract_cookie(&target()).unwrap();
        match b.resolve_shard(cookie).await {
            ResolveOutcome::LostRace => {}
            other => panic!("expected LostRace, got {other:?}"),
        }
        assert!(b.is_halted());
    }
}
