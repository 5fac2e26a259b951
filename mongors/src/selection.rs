//! Server selection: a pure function from `(topology, read preference,
//! per-server operation counts)` to a chosen server (`spec.md` §4.5).
//!
//! `select` never awaits; the retry-on-empty-result loop that waits for a
//! topology change lives one layer up in [`crate::executor`].

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::bson::Document;
use crate::sdam::{ServerAddress, ServerDescription, ServerKind, TopologyDescription, TopologyType};

pub type TagSet = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// `spec.md` §3/§4.5/§6: mode plus the tag-set and max-staleness
/// refinements that only apply to non-primary modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    pub tag_sets: Vec<TagSet>,
    pub max_staleness_seconds: Option<i64>,
}

impl ReadPreference {
    pub fn primary() -> Self {
        ReadPreference {
            mode: ReadPreferenceMode::Primary,
            tag_sets: Vec::new(),
            max_staleness_seconds: None,
        }
    }

    pub fn nearest() -> Self {
        ReadPreference {
            mode: ReadPreferenceMode::Nearest,
            tag_sets: Vec::new(),
            max_staleness_seconds: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.mode == ReadPreferenceMode::Primary
    }

    pub fn to_document(&self) -> Document {
        let mode = match self.mode {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        };
        let mut doc = Document::new();
        doc.insert("mode", mode);
        if !self.tag_sets.is_empty() {
            let tags: Vec<crate::bson::Bson> = self
                .tag_sets
                .iter()
                .map(|set| {
                    let mut d = Document::new();
                    for (k, v) in set {
                        d.insert(k.clone(), v.clone());
                    }
                    crate::bson::Bson::Document(d)
                })
                .collect();
            doc.insert("tags", tags);
        }
        if let Some(staleness) = self.max_staleness_seconds {
            doc.insert("maxStalenessSeconds", staleness);
        }
        doc
    }
}

/// `spec.md` §3 "OperationCount per Server": an atomic, sequentially
/// consistent counter per server, read (not mutated) by the selector and
/// incremented/decremented by the executor around each operation.
pub type OperationCounts = HashMap<ServerAddress, std::sync::Arc<std::sync::atomic::AtomicI64>>;

#[derive(Debug)]
pub enum SelectionOutcome {
    Selected(ServerAddress),
    /// No suitable server right now; caller should wait for a topology
    /// change and retry, bounded by the remaining selection timeout.
    Retry,
}

/// Runs the algorithm in `spec.md` §4.5 steps 1-6 a single time (no
/// waiting). `heartbeat_frequency` is needed by the max-staleness filter's
/// `+ heartbeatFrequencyMS/1000` term; `local_threshold_ms` is the
/// user-configured `localThresholdMS` (`spec.md` §4.5 step 5 / §6).
pub fn select(
    topology: &TopologyDescription,
    preference: &ReadPreference,
    counts: &OperationCounts,
    heartbeat_frequency: Duration,
    local_threshold_ms: u64,
) -> crate::error::Result<SelectionOutcome> {
    if let Some(err) = &topology.compatibility_error {
        return Err(crate::error::Error::Incompatible(err.clone()));
    }

    let suitable = suitable_set(topology, preference);
    let suitable = filter_max_staleness(suitable, topology, preference, heartbeat_frequency)?;
    let suitable = filter_tag_sets(suitable, preference);
    let suitable = filter_latency_window(suitable, local_threshold_ms);

    Ok(match suitable.len() {
        0 => SelectionOutcome::Retry,
        1 => SelectionOutcome::Selected(suitable[0].address.clone()),
        _ => SelectionOutcome::Selected(pick_of_two(&suitable, counts)),
    })
}

/// `spec.md` §4.5 step 2.
fn suitable_set<'a>(
    topology: &'a TopologyDescription,
    preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    match topology.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single | TopologyType::LoadBalanced => topology.servers.values().collect(),
        TopologyType::Sharded => topology
            .servers
            .values()
            .filter(|s| s.kind == ServerKind::Mongos)
            .collect(),
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
            replica_set_suitable(topology, preference)
        }
    }
}

fn replica_set_suitable<'a>(
    topology: &'a TopologyDescription,
    preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let primary: Vec<&ServerDescription> = topology
        .servers
        .values()
        .filter(|s| s.kind == ServerKind::RSPrimary)
        .collect();
    let secondaries: Vec<&ServerDescription> = topology
        .servers
        .values()
        .filter(|s| s.kind == ServerKind::RSSecondary)
        .collect();

    match preference.mode {
        ReadPreferenceMode::Primary => primary,
        ReadPreferenceMode::Secondary => secondaries,
        ReadPreferenceMode::Nearest => primary.into_iter().chain(secondaries).collect(),
        ReadPreferenceMode::PrimaryPreferred => {
            if !primary.is_empty() {
                primary
            } else {
                secondaries
            }
        }
        ReadPreferenceMode::SecondaryPreferred => {
            if !secondaries.is_empty() {
                secondaries
            } else {
                primary
            }
        }
    }
}

/// `spec.md` §4.5 step 3. Staleness math operates on local monotonic
/// `last_update_time`, not wall clock, per `ServerDescription`'s own field
/// documentation.
fn filter_max_staleness<'a>(
    candidates: Vec<&'a ServerDescription>,
    topology: &TopologyDescription,
    preference: &ReadPreference,
    heartbeat_frequency: Duration,
) -> crate::error::Result<Vec<&'a ServerDescription>> {
    let Some(max_staleness) = preference.max_staleness_seconds.filter(|s| *s > 0) else {
        return Ok(candidates);
    };

    let heartbeat_secs = heartbeat_frequency.as_secs_f64();
    let primary = topology.primary();

    // `(S.lastUpdateTime - S.lastWriteDate) - (P.lastUpdateTime - P.lastWriteDate)
    //  + heartbeatFrequencyMS/1000` (`spec.md` §4.5 step 3). The two
    // `lastUpdateTime - lastWriteDate` terms each mix a monotonic instant
    // with a wall-clock date, which only cancels correctly once subtracted
    // from one another — so this is computed as a single wall-clock delta
    // (`lastUpdateDate`) rather than as two independent differences.
    let staleness_with_primary = |server: &ServerDescription, p: &ServerDescription| -> Option<f64> {
        let server_write = server.last_write_date?;
        let primary_write = p.last_write_date?;
        let server_lag_ms = (server.last_update_date.millis() - server_write.millis()) as f64;
        let primary_lag_ms = (p.last_update_date.millis() - primary_write.millis()) as f64;
        Some((server_lag_ms - primary_lag_ms) / 1000.0 + heartbeat_secs)
    };

    let staleness_no_primary = |server: &ServerDescription| -> Option<f64> {
        let write_date = server.last_write_date?;
        let max_last_write = topology
            .servers
            .values()
            .filter_map(|s| s.last_write_date)
            .max()?;
        Some((max_last_write.millis() - write_date.millis()) as f64 / 1000.0 + heartbeat_secs)
    };

    let staleness_of = |server: &ServerDescription| -> Option<f64> {
        match primary {
            Some(p) if p.address != server.address => staleness_with_primary(server, p),
            Some(_) => Some(0.0),
            None => staleness_no_primary(server),
        }
    };

    Ok(candidates
        .into_iter()
        .filter(|s| match staleness_of(s) {
            Some(staleness) => staleness.ceil() as i64 <= max_staleness,
            None => true,
        })
        .collect())
}

/// `spec.md` §4.5 step 4: the first tag set (in order) with a non-empty
/// match wins; an empty tag-sets list (the common case) matches everything.
fn filter_tag_sets<'a>(
    candidates: Vec<&'a ServerDescription>,
    preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    if preference.tag_sets.is_empty() {
        return candidates;
    }
    for tag_set in &preference.tag_sets {
        let matching: Vec<&ServerDescription> = candidates
            .iter()
            .copied()
            .filter(|s| tag_set.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

/// `spec.md` §4.5 step 5.
fn filter_latency_window<'a>(
    candidates: Vec<&'a ServerDescription>,
    local_threshold_ms: u64,
) -> Vec<&'a ServerDescription> {
    let Some(min_rtt) = candidates
        .iter()
        .filter_map(|s| s.average_round_trip_ms)
        .fold(None, |acc: Option<f64>, rtt| {
            Some(acc.map_or(rtt, |a| a.min(rtt)))
        })
    else {
        // No RTT samples yet (e.g. all just discovered); keep everything,
        // the subsequent pick-of-two is still well-defined.
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|s| {
            s.average_round_trip_ms
                .map(|rtt| rtt <= min_rtt + local_threshold_ms as f64)
                .unwrap_or(true)
        })
        .collect()
}

/// `spec.md` §4.5 step 6: sample two distinct servers uniformly at random
/// and return the one with the smaller current operation count, ties
/// broken by the first sampled (`spec.md` §9 Open Questions: source
/// behavior adopted verbatim, tested only as "returns one of the two").
fn pick_of_two(candidates: &[&ServerDescription], counts: &OperationCounts) -> ServerAddress {
    let mut rng = rand::thread_rng();
    let i = rng.gen_range(0..candidates.len());
    let mut j = rng.gen_range(0..candidates.len() - 1);
    if j >= i {
        j += 1;
    }
    let a = candidates[i];
    let b = candidates[j];
    let count_of = |addr: &ServerAddress| {
        counts
            .get(addr)
            .map(|c| c.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(0)
    };
    if count_of(&b.address) < count_of(&a.address) {
        b.address.clone()
    } else {
        a.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn server(addr: &str, kind: ServerKind, rtt: Option<f64>) -> ServerDescription {
        let (host, port) = addr.split_once(':').unwrap();
        ServerDescription {
            address: ServerAddress::new(host, port.parse().unwrap()),
            kind,
            min_wire_version: 6,
            max_wire_version: 17,
            tags: Default::default(),
            election_id: None,
            set_version: Some(1),
            set_name: Some("rs0".into()),
            logical_session_timeout_minutes: Some(30),
            last_write_date: None,
            last_update_time: Instant::now(),
            last_update_date: crate::bson::DateTime::now(),
            average_round_trip_ms: rtt,
            hosts: vec![],
            passives: vec![],
            arbiters: vec![],
            primary: None,
            topology_version: None,
            error: None,
        }
    }

    fn topology_of(servers: Vec<ServerDescription>, topology_type: TopologyType) -> TopologyDescription {
        TopologyDescription {
            topology_type,
            set_name: Some("rs0".into()),
            max_set_version: Some(1),
            max_election_id: None,
            servers: servers.into_iter().map(|s| (s.address.clone(), s)).collect(),
            compatibility_error: None,
            logical_session_timeout_minutes: Some(30),
        }
    }

    #[test]
    fn selects_primary_for_primary_mode() {
        let topology = topology_of(
            vec![
                server("a:1", ServerKind::RSPrimary, Some(10.0)),
                server("b:1", ServerKind::RSSecondary, Some(20.0)),
                server("c:1", ServerKind::RSSecondary, Some(100.0)),
            ],
            TopologyType::ReplicaSetWithPrimary,
        );
        let counts = OperationCounts::new();
        let outcome = select(&topology, &ReadPreference::primary(), &counts, Duration::from_secs(10), 15).unwrap();
        match outcome {
            SelectionOutcome::Selected(addr) => assert_eq!(addr, ServerAddress::new("a", 1)),
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn nearest_respects_latency_window() {
        let topology = topology_of(
            vec![
                server("a:1", ServerKind::RSPrimary, Some(10.0)),
                server("b:1", ServerKind::RSSecondary, Some(20.0)),
                server("c:1", ServerKind::RSSecondary, Some(100.0)),
            ],
            TopologyType::ReplicaSetWithPrimary,
        );
        let counts = OperationCounts::new();
        let outcome = select(&topology, &ReadPreference::nearest(), &counts, Duration::from_secs(10), 15).unwrap();
        match outcome {
            SelectionOutcome::Selected(addr) => {
                assert!(addr == ServerAddress::new("a", 1) || addr == ServerAddress::new("b", 1));
            }
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn pick_of_two_prefers_lower_operation_count() {
        let topology = topology_of(
            vec![
                server("a:1", ServerKind::RSPrimary, Some(10.0)),
                server("b:1", ServerKind::RSSecondary, Some(20.0)),
            ],
            TopologyType::ReplicaSetWithPrimary,
        );
        let mut counts = OperationCounts::new();
        counts.insert(
            ServerAddress::new("a", 1),
            std::sync::Arc::new(std::sync::atomic::AtomicI64::new(5)),
        );
        counts.insert(
            ServerAddress::new("b", 1),
            std::sync::Arc::new(std::sync::atomic::AtomicI64::new(2)),
        );
        let outcome = select(&topology, &ReadPreference::nearest(), &counts, Duration::from_secs(10), 15).unwrap();
        match outcome {
            SelectionOutcome::Selected(addr) => assert_eq!(addr, ServerAddress::new("b", 1)),
            _ => panic!("expected a selection"),
        }
    }

    #[test]
    fn max_staleness_filters_lagging_secondary() {
        let now = crate::bson::DateTime::now();
        let lagged = |ms: i64| crate::bson::DateTime::from_millis(now.millis() - ms);

        let mut primary = server("p:1", ServerKind::RSPrimary, Some(5.0));
        primary.last_write_date = Some(now);
        primary.last_update_date = now;

        let mut s1 = server("s1:1", ServerKind::RSSecondary, Some(5.0));
        s1.last_write_date = Some(lagged(5_000));
        s1.last_update_date = now;

        let mut s2 = server("s2:1", ServerKind::RSSecondary, Some(5.0));
        s2.last_write_date = Some(lagged(120_000));
        s2.last_update_date = now;

        let topology = topology_of(vec![primary, s1, s2], TopologyType::ReplicaSetWithPrimary);
        let preference = ReadPreference {
            mode: ReadPreferenceMode::Secondary,
            tag_sets: Vec::new(),
            max_staleness_seconds: Some(90),
        };
        let candidates = suitable_set(&topology, &preference);
        let filtered = filter_max_staleness(candidates, &topology, &preference, Duration::from_millis(10_000)).unwrap();
        let addrs: Vec<_> = filtered.iter().map(|s| s.address.clone()).collect();
        assert_eq!(addrs, vec![ServerAddress::new("s1", 1)]);
    }

    #[test]
    fn empty_topology_retries() {
        let topology = TopologyDescription::new(None, None);
        let counts = OperationCounts::new();
        let outcome = select(&topology, &ReadPreference::primary(), &counts, Duration::from_secs(10), 15).unwrap();
        assert!(matches!(outcome, SelectionOutcome::Retry));
    }
}
