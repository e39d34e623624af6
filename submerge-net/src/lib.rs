// submerge-net: the client-side connection coordinator for a sharded
// backend. A `ClientBehavior` owns one `ConnectionMap` per client and
// drives each shard's connection through Connecting -> Connected ->
// Reconnecting -> Connected, publishing every transition under an
// `InversibleLock` so concurrent producers never observe a
// half-finished reconnect. Wire encoding, transport I/O, and the actor
// event loop itself are all out of scope — this crate hands back
// `Request<P>`s to send and expects `Success`/`Failure` envelopes fed
// back in, nothing more.

pub mod actor;
pub mod backend;
pub mod behavior;
pub mod config;
pub mod connection;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod lock;
pub mod map;
pub mod reconnect;
pub mod strategy;
pub mod time;

pub use actor::{ActorContext, LocalActorContext};
pub use backend::{BackendInfo, BackendInfoResolver, TimeoutResolver};
pub use behavior::{ClientBehavior, DispatchError, DispatchOutcome, ResolveOutcome};
pub use config::ClientConfig;
pub use connection::{Connected, Connecting, Connection, Draining, EnqueueOutcome, Halted, Reconnecting};
pub use entry::{Completer, Completion, ConnectionEntry, DeliveryOutcome, EntryResult};
pub use envelope::{Failure, Inbound, Payload, Request, Sequence, SessionToken, Success};
pub use error::{CycleDetected, RequestCause, ResolverError};
pub use ids::{
    extract_cookie, BackendId, ClientId, Cookie, LocalHistoryId, TargetId, TransactionId,
};
pub use lock::{release_all_reads, InversibleLock, Stamp};
pub use map::{ConnectionHandle, ConnectionMap};
pub use reconnect::{reconnect, ConnectCohort, ReconnectForwarder, ReconnectOutcome};
pub use strategy::ClientStrategy;
pub use time::NodeID;
