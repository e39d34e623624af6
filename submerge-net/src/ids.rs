use serde::{Deserialize, Serialize};
use submerge_base::{err, Error};

use crate::time::NodeID;

/// A shard cookie is the 64-bit opaque identifier that partitions client
/// traffic; it is derived from a [`LocalHistoryId`] or [`TransactionId`]
/// and never observed directly by producers.
pub type Cookie = u64;

// ClientId names the client actor itself. It is never a valid target for
// a Request/Success/Failure envelope and so has no cookie of its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

// LocalHistoryId names one of a client's local histories: an
// independently-ordered stream of transactions against a single shard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct LocalHistoryId {
    pub client: ClientId,
    pub history: u64,
}

impl LocalHistoryId {
    pub fn new(client: ClientId, history: u64) -> Self {
        LocalHistoryId { client, history }
    }

    // Mixes client and history into an opaque 64-bit shard cookie. Two
    // different (client, history) pairs practically never collide; the
    // map does not rely on uniqueness for correctness, only for
    // partitioning traffic sensibly across shards.
    pub fn cookie(&self) -> Cookie {
        mix(self.client.0, self.history)
    }
}

// TransactionId names a single transaction within a LocalHistoryId's
// stream. It shares its history's cookie: all transactions in one history
// are routed to the same connection, preserving per-history ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub history: LocalHistoryId,
    pub txn: u64,
}

impl TransactionId {
    pub fn new(history: LocalHistoryId, txn: u64) -> Self {
        TransactionId { history, txn }
    }

    pub fn cookie(&self) -> Cookie {
        self.history.cookie()
    }
}

// TargetId is the union of identifier kinds that can appear as the
// `target` of a Request/Success/Failure envelope. ClientId is a valid
// identifier but never a valid envelope target: extracting its cookie
// is a programming error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TargetId {
    LocalHistory(LocalHistoryId),
    Transaction(TransactionId),
    Client(ClientId),
}

impl From<LocalHistoryId> for TargetId {
    fn from(id: LocalHistoryId) -> Self {
        TargetId::LocalHistory(id)
    }
}

impl From<TransactionId> for TargetId {
    fn from(id: TransactionId) -> Self {
        TargetId::Transaction(id)
    }
}

/// `TransactionId -> history.cookie`; `LocalHistoryId -> cookie`; any other
/// identifier kind is a programming error.
pub fn extract_cookie(target: &TargetId) -> Result<Cookie, Error> {
    match target {
        TargetId::LocalHistory(id) => Ok(id.cookie()),
        TargetId::Transaction(id) => Ok(id.cookie()),
        TargetId::Client(id) => Err(err(format!(
            "extract_cookie: ClientId({}) is not a valid envelope target",
            id.0
        ))),
    }
}

fn mix(a: u64, b: u64) -> Cookie {
    // splitmix64-style mixing, good enough to scatter shard cookies
    // without needing a dependency on a general-purpose hasher.
    let mut z = a ^ b.wrapping_mul(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// A backend is named by the NodeID of the replica currently serving a
// shard. Re-exported here since identifiers and backend references are
// frequently used together (e.g. in resolver signatures).
pub type BackendId = NodeID;
