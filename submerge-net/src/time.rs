use serde::{Deserialize, Serialize};

// A given Realm is a single, coherent, distributed system. It is composed
// of a set of Nodes, each of which has a unique NodeID. A shard's backend
// replica is identified by the NodeID currently serving it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeID(pub i64);

// NodeTime is a virtual time-point in signed 64-bit microseconds
// since the epoch. This is sufficient to span 292,471 years.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeTime(pub i64);

// RealmDuration is a time-span in signed 64-bit microseconds relative to
// some NodeTime or RealmTime. Kept distinct from std::time::Duration,
// which is used for wall-clock scheduling (resolver retry delays, actor
// timers) rather than realm-local event timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RealmDuration(pub i64);

// RealmTimes are realm-local extended timestamps. The most significant
// (time) field stores a NodeTime (microsecond count), but this is then
// followed by both a NodeID and an event count allowing each node to
// label any event with a RealmTime without coordination with other
// Nodes, _and_ with essentially arbitrary numbers of sub-microsecond
// events without implying anything about real time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RealmTime {
    pub time: NodeTime,
    pub node: NodeID,
    pub event: i64,
}

impl RealmTime {
    pub fn new(time: NodeTime, node: NodeID, event: i64) -> Self {
        RealmTime { time, node, event }
    }
}
