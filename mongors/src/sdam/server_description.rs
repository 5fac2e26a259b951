use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::bson::{Bson, Document, ObjectId};

/// `(host, port)`, the address a seed list or `hosts`/`passives`/`arbiters`
/// field names a server by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The server kind reported by `hello`/`legacy-hello`, `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Unknown,
    Standalone,
    Mongos,
    RSPrimary,
    RSSecondary,
    RSArbiter,
    RSOther,
    RSGhost,
    LoadBalancer,
}

impl ServerKind {
    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerKind::RSPrimary
                | ServerKind::RSSecondary
                | ServerKind::RSArbiter
                | ServerKind::RSOther
                | ServerKind::RSGhost
        )
    }

    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerKind::Standalone
                | ServerKind::Mongos
                | ServerKind::RSPrimary
                | ServerKind::RSSecondary
                | ServerKind::LoadBalancer
        )
    }
}

/// An election identifier, compared alongside `setVersion` to decide
/// whether a newly observed primary supersedes the one the topology
/// currently believes in (`spec.md` §4.4).
pub type ElectionId = ObjectId;

/// A single server's state as of its last heartbeat. Replaced wholesale
/// (never mutated in place) on every heartbeat reply or topology event,
/// per `spec.md` §3 "Lifecycles".
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub kind: ServerKind,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub tags: BTreeMap<String, String>,
    pub election_id: Option<ElectionId>,
    pub set_version: Option<i64>,
    pub set_name: Option<String>,
    pub logical_session_timeout_minutes: Option<i64>,
    /// Wall-clock time the server itself reported its last write at
    /// (`lastWriteDate` in `hello`), used by the max-staleness filter.
    pub last_write_date: Option<crate::bson::DateTime>,
    /// Local monotonic time this description was produced. Used for
    /// scheduling and for the *inter-server* half of the max-staleness
    /// comparison (`spec.md` §4.5 step 3), since two `Instant`s captured in
    /// this same process can be subtracted without clock-skew concerns even
    /// though neither has a meaningful absolute value on its own.
    pub last_update_time: Instant,
    /// Wall-clock counterpart of `last_update_time`, needed only to pair
    /// with `last_write_date` (itself wall-clock, server-reported) in the
    /// max-staleness formula; `Instant` cannot be differenced against a
    /// calendar time.
    pub last_update_date: crate::bson::DateTime,
    pub average_round_trip_ms: Option<f64>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub primary: Option<ServerAddress>,
    pub topology_version: Option<Document>,
    pub error: Option<String>,
}

impl ServerDescription {
    /// The baseline "we haven't heard from this server yet" description, as
    /// required by `spec.md` §3's invariant: Unknown implies empty wire
    /// version range and tags.
    pub fn unknown(address: ServerAddress) -> Self {
        ServerDescription {
            address,
            kind: ServerKind::Unknown,
            min_wire_version: 0,
            max_wire_version: 0,
            tags: BTreeMap::new(),
            election_id: None,
            set_version: None,
            set_name: None,
            logical_session_timeout_minutes: None,
            last_write_date: None,
            last_update_time: Instant::now(),
            last_update_date: crate::bson::DateTime::now(),
            average_round_trip_ms: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            topology_version: None,
            error: None,
        }
    }

    pub fn unknown_with_error(address: ServerAddress, error: String) -> Self {
        let mut desc = Self::unknown(address);
        desc.error = Some(error);
        desc
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == ServerKind::Unknown
    }

    /// `(setVersion, electionId)` compared as the table in `spec.md` §4.4
    /// requires: a missing `setVersion` sorts lower than any present one.
    pub fn election_tuple(&self) -> (Option<i64>, Option<ElectionId>) {
        (self.set_version, self.election_id)
    }

    /// True when `self`'s `(setVersion, electionId)` is strictly newer than
    /// `other`'s, used to decide whether an incoming RSPrimary supersedes
    /// the topology's currently recorded primary.
    pub fn supersedes_primary(&self, other: &ServerDescription) -> bool {
        match (self.set_version, other.set_version) {
            (Some(a), Some(b)) if a != b => a > b,
            _ => self.election_id > other.election_id,
        }
    }
}

/// Compares two `topologyVersion` documents (`{processId, counter}`) per
/// `spec.md` §4.6's pool-clear suppression rule: a different `processId`
/// (the server process restarted) always counts as newer, otherwise the
/// higher `counter` wins.
pub fn topology_version_is_newer(candidate: &Document, known: &Document) -> bool {
    let candidate_pid = candidate.get("processId").and_then(Bson::as_object_id);
    let known_pid = known.get("processId").and_then(Bson::as_object_id);
    if candidate_pid != known_pid {
        return true;
    }
    candidate.get_i64("counter") > known.get_i64("counter")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn same_process_higher_counter_is_newer() {
        let pid = ObjectId::new();
        let known = doc! { "processId" => pid, "counter" => 1i64 };
        let candidate = doc! { "processId" => pid, "counter" => 2i64 };
        assert!(topology_version_is_newer(&candidate, &known));
        assert!(!topology_version_is_newer(&known, &candidate));
    }

    #[test]
    fn different_process_always_counts_as_newer() {
        let known = doc! { "processId" => ObjectId::new(), "counter" => 5i64 };
        let candidate = doc! { "processId" => ObjectId::new(), "counter" => 1i64 };
        assert!(topology_version_is_newer(&candidate, &known));
    }
}
