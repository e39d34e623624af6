// The reconnect/replay protocol: when a shard's backend changes (the
// resolver hands back a new `BackendInfo` for a cookie that already has
// a connection), the coordinator must hand off in-flight requests to the
// new backend without losing them and without handing two different
// backends the same sequence number.
//
// Six steps, all under the connection map's write lock so no other
// writer can observe a half-finished transition:
//   1. resolve a fresh `BackendInfo` and build the new `Connected`
//   2. call the cohort's `connection_up` hook to mint its context
//   3. harvest the old connection's in-flight entries (`start_replay`)
//   4. let the cohort rewrite them (`finish_reconnect`)
//   5. admit them onto the new connection, then install a forwarder on
//      `old` so any straggler enqueue that arrives in the window before
//      step 6 is redirected onto the same new connection
//   6. publish by compare-and-swap against the map

use std::sync::Arc;

use crate::backend::BackendInfo;
use crate::connection::{Connected, Connection, EnqueueOutcome};
use crate::entry::{Completer, ConnectionEntry};
use crate::envelope::{Payload, Request};
use crate::ids::{Cookie, TargetId};
use crate::map::{ConnectionHandle, ConnectionMap};

/// External collaborator standing in for subclass hooks — dependency
/// injection instead of inheritance. Mirrors `ClientStrategy` but scoped
/// to exactly what the reconnect protocol needs from it. Held as
/// `Arc<dyn ConnectCohort<..>>` rather than borrowed, since a
/// `ReconnectForwarder` built from it can outlive the `reconnect` call
/// that installed it by as long as a producer keeps a stale handle to
/// `old` around.
pub trait ConnectCohort<P: Payload, C>: Send + Sync {
    /// Build the per-connection context for a newly resolved backend.
    /// A failure here is treated as fatal to the whole client, not just
    /// to this one shard.
    fn connection_up(&self, cookie: Cookie, info: &BackendInfo) -> Result<C, submerge_base::Error>;

    /// Give the cohort a chance to rewrite harvested entries before they
    /// are replayed onto the new connection, e.g. to refresh any
    /// per-request state that was tied to the old backend.
    fn finish_reconnect(&self, entries: &mut [ConnectionEntry<P>]);
}

/// Installed on a freshly drained connection so a request that still
/// arrives addressed to the old backend during the narrow window around
/// a publish gets redirected through the same rewrite the replayed
/// entries went through, rather than being accepted into a buffer
/// nobody will ever drain again. Shares the cohort's rewrite with the
/// replay step itself, per the decision recorded in DESIGN.md.
pub struct ReconnectForwarder<P: Payload, C> {
    cohort: Arc<dyn ConnectCohort<P, C>>,
    new_connection: ConnectionHandle<P, C>,
}

impl<P: Payload, C> ReconnectForwarder<P, C> {
    pub fn new(cohort: Arc<dyn ConnectCohort<P, C>>, new_connection: ConnectionHandle<P, C>) -> Self {
        ReconnectForwarder {
            cohort,
            new_connection,
        }
    }

    /// Forward a straggler enqueue onto the new connection, applying the
    /// same cohort rewrite replayed entries went through before it is
    /// admitted.
    pub fn forward(&self, target: TargetId, payload: P, completer: Completer<P>) -> EnqueueOutcome<P> {
        let mut guard = self.new_connection.lock().unwrap();
        match &mut *guard {
            Connection::Connected(connected) => {
                let mut entry = connected.build_entry(target, payload, completer);
                self.cohort.finish_reconnect(std::slice::from_mut(&mut entry));
                connected.admit_one(entry)
            }
            Connection::Halted(h) => {
                let reason = h.reason.clone();
                let _ = completer.send(Err(crate::error::RequestCause::Failure(format!(
                    "shard halted: {reason}"
                ))));
                EnqueueOutcome::Rejected
            }
            // The new connection is always published as `Connected`
            // before this forwarder is ever reachable (it is built in
            // the same `reconnect` call that installs the forwarder),
            // so these arms are unreachable in practice; handled
            // defensively rather than with an `unreachable!`.
            Connection::Connecting(_) | Connection::Reconnecting(_) | Connection::Draining(_) => {
                let _ = completer.send(Err(crate::error::RequestCause::Failure(
                    "reconnect forwarder target not ready".into(),
                )));
                EnqueueOutcome::Rejected
            }
        }
    }
}

/// Outcome of attempting a reconnect transition.
pub enum ReconnectOutcome<P> {
    /// Published successfully; these requests are ready to transmit.
    Published(Vec<Request<P>>),
    /// The compare-and-swap publish lost its race: another writer
    /// already replaced or halted this shard first. The caller's freshly
    /// built connection is discarded; the map already reflects whatever
    /// won.
    LostRace,
}

impl<P> std::fmt::Debug for ReconnectOutcome<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectOutcome::Published(reqs) => {
                write!(f, "Published({} requests)", reqs.len())
            }
            ReconnectOutcome::LostRace => write!(f, "LostRace"),
        }
    }
}

/// Run the full six-step protocol for one shard. `old` must be the
/// handle the caller most recently observed for `cookie` (from
/// `ConnectionMap::get_connection` or a prior failed attempt); the
/// publish step is a no-op failure if it has since changed.
pub fn reconnect<P: Payload, C>(
    map: &ConnectionMap<P, C>,
    cookie: Cookie,
    old: &ConnectionHandle<P, C>,
    info: BackendInfo,
    cohort: Arc<dyn ConnectCohort<P, C>>,
    backlog_ceiling: usize,
) -> Result<ReconnectOutcome<P>, submerge_base::Error> {
    let context = cohort.connection_up(cookie, &info)?;
    let mut new_conn = Connected::new(cookie, info, backlog_ceiling, context);

    let mut harvested = old.lock().unwrap().start_replay();
    cohort.finish_reconnect(&mut harvested);
    let to_send = new_conn.finish_replay(harvested);

    let new_handle: ConnectionHandle<P, C> = Arc::new(std::sync::Mutex::new(Connection::Connected(new_conn)));

    old.lock()
        .unwrap()
        .install_forwarder(ReconnectForwarder::new(cohort, new_handle.clone()));

    if map.replace_handle_if(cookie, old, new_handle) {
        Ok(ReconnectOutcome::Published(to_send))
    } else {
        Ok(ReconnectOutcome::LostRace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connecting;
    use crate::time::NodeID;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    struct EchoCohort {
        contexts_built: StdMutex<u32>,
    }

    impl ConnectCohort<u32, u32> for EchoCohort {
        fn connection_up(
            &self,
            _cookie: Cookie,
            info: &BackendInfo,
        ) -> Result<u32, submerge_base::Error> {
            *self.contexts_built.lock().unwrap() += 1;
            Ok(info.session_token as u32)
        }

        fn finish_reconnect(&self, _entries: &mut [ConnectionEntry<u32>]) {}
    }

    fn info(token: i64) -> BackendInfo {
        BackendInfo {
            backend: NodeID(1),
            session_token: token,
            max_outstanding: 4,
        }
    }

    #[tokio::test]
    async fn reconnect_carries_buffered_requests_into_new_connection() {
        let map: ConnectionMap<u32, u32> = ConnectionMap::new();
        let handle = map.get_connection(1, 8).unwrap();
        let (tx, _rx) = oneshot::channel();
        {
            let mut guard = handle.lock().unwrap();
            if let Connection::Connecting(c) = &mut *guard {
                c.enqueue(crate::ids::TargetId::Client(crate::ids::ClientId(0)), 42, tx);
            } else {
                panic!("expected Connecting");
            }
        }

        let cohort: Arc<dyn ConnectCohort<u32, u32>> = Arc::new(EchoCohort {
            contexts_built: StdMutex::new(0),
        });
        let outcome = reconnect(&map, 1, &handle, info(7), cohort.clone(), 4).unwrap();
        match outcome {
            ReconnectOutcome::Published(reqs) => {
                assert_eq!(reqs.len(), 1);
                assert_eq!(reqs[0].session_token, 7);
                assert_eq!(reqs[0].payload, 42);
            }
            ReconnectOutcome::LostRace => panic!("expected a clean publish"),
        }

        let fresh = map.get_connection(1, 8).unwrap();
        assert!(matches!(&*fresh.lock().unwrap(), Connection::Connected(_)));

        // The old handle is now draining; a straggler enqueue on it must
        // reach the same new connection rather than being buffered into
        // a dead end.
        let (tx2, rx2) = oneshot::channel();
        let outcome = handle
            .lock()
            .unwrap()
            .enqueue(crate::ids::TargetId::Client(crate::ids::ClientId(0)), 99, tx2);
        match outcome {
            EnqueueOutcome::SentNow(req) => assert_eq!(req.payload, 99),
            other => panic!("expected straggler to be admitted, got {other:?}"),
        }
        drop(rx2);
    }

    #[tokio::test]
    async fn reconnect_loses_race_if_entry_already_replaced() {
        let map: ConnectionMap<u32, u32> = ConnectionMap::new();
        let handle = map.get_connection(1, 8).unwrap();

        // Someone else wins first.
        assert!(map.replace_if(
            1,
            &handle,
            Connection::Connecting(Connecting::new(1, 8))
        ));

        let cohort: Arc<dyn ConnectCohort<u32, u32>> = Arc::new(EchoCohort {
            contexts_built: StdMutex::new(0),
        });
        let outcome = reconnect(&map, 1, &handle, info(7), cohort, 4).unwrap();
        assert!(matches!(outcome, ReconnectOutcome::LostRace));
    }
}
