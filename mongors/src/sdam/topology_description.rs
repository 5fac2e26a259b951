use std::collections::HashMap;

use log::debug;

use super::server_description::{ElectionId, ServerAddress, ServerDescription, ServerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
}

/// The aggregated view of every server this client has ever heard from,
/// plus the derived `TopologyType`. Replaced wholesale on every event
/// (`spec.md` §3 "Lifecycles") and published through a `watch` channel by
/// [`super::monitor`]/[`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub set_name: Option<String>,
    pub max_set_version: Option<i64>,
    pub max_election_id: Option<ElectionId>,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub compatibility_error: Option<String>,
    pub logical_session_timeout_minutes: Option<i64>,
}

/// Driver-supported wire version range. Compatibility fails (`spec.md`
/// §4.4) when a server's `[min_wire_version, max_wire_version]` doesn't
/// intersect this.
pub const SUPPORTED_WIRE_VERSION_RANGE: (i32, i32) = (6, 21);

impl TopologyDescription {
    /// `single_seed` is `Some` exactly when the topology was configured with
    /// exactly one seed address and no `replicaSet` option — the
    /// precondition `spec.md` §3 states for `TopologyType::Single`.
    pub fn new(single_seed: Option<ServerAddress>, set_name: Option<String>) -> Self {
        let mut servers = HashMap::new();
        let topology_type = if let Some(addr) = single_seed.clone() {
            servers.insert(addr.clone(), ServerDescription::unknown(addr));
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };
        TopologyDescription {
            topology_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            servers,
            compatibility_error: None,
            logical_session_timeout_minutes: None,
        }
    }

    pub fn seed(addresses: &[ServerAddress], set_name: Option<String>) -> Self {
        if addresses.len() == 1 && set_name.is_none() {
            return Self::new(Some(addresses[0].clone()), None);
        }
        let mut topology = Self::new(None, set_name.clone());
        for addr in addresses {
            topology
                .servers
                .insert(addr.clone(), ServerDescription::unknown(addr.clone()));
        }
        if set_name.is_some() {
            topology.topology_type = TopologyType::ReplicaSetNoPrimary;
        }
        topology
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.kind == ServerKind::RSPrimary)
    }

    fn check_compatibility(&mut self) {
        for server in self.servers.values() {
            if server.is_unknown() {
                continue;
            }
            let (lo, hi) = SUPPORTED_WIRE_VERSION_RANGE;
            if server.max_wire_version < lo || server.min_wire_version > hi {
                self.compatibility_error = Some(format!(
                    "server at {} reports wire version range [{}, {}], driver supports [{}, {}]",
                    server.address, server.min_wire_version, server.max_wire_version, lo, hi
                ));
                return;
            }
        }
        self.compatibility_error = None;
    }

    /// Applies one heartbeat's resulting [`ServerDescription`], running the
    /// topology type state machine from `spec.md` §4.4. Every branch either
    /// keeps the type unchanged (the table's "edges not listed... unchanged"
    /// default) or moves it exactly as the row specifies.
    pub fn on_server_description(&mut self, new_desc: ServerDescription) {
        let address = new_desc.address.clone();

        if let (Some(topology_set_name), Some(server_set_name)) =
            (&self.set_name, &new_desc.set_name)
        {
            if topology_set_name != server_set_name {
                debug!(
                    "dropping server {address} from topology: setName mismatch ({} != {})",
                    topology_set_name, server_set_name
                );
                self.servers.remove(&address);
                return;
            }
        }

        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {
                self.servers.insert(address, new_desc);
            }
            TopologyType::Unknown => self.apply_from_unknown(address, new_desc),
            TopologyType::Sharded => self.apply_sharded(address, new_desc),
            TopologyType::ReplicaSetNoPrimary => self.apply_rs_no_primary(address, new_desc),
            TopologyType::ReplicaSetWithPrimary => self.apply_rs_with_primary(address, new_desc),
        }

        self.recompute_logical_session_timeout();
        self.check_compatibility();
    }

    fn apply_from_unknown(&mut self, address: ServerAddress, new_desc: ServerDescription) {
        match new_desc.kind {
            ServerKind::Standalone => {
                if self.servers.len() == 1 {
                    self.topology_type = TopologyType::Single;
                    self.servers.insert(address, new_desc);
                } else {
                    // A standalone showing up among multiple configured
                    // seeds is not a valid single-server deployment; drop it.
                    self.servers.remove(&address);
                }
            }
            ServerKind::Mongos => {
                self.topology_type = TopologyType::Sharded;
                self.servers.insert(address, new_desc);
            }
            ServerKind::RSPrimary => {
                self.set_name = new_desc.set_name.clone();
                self.record_election(&new_desc);
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
                self.mark_absent_hosts_unknown();
            }
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.set_name = new_desc.set_name.clone().or_else(|| self.set_name.clone());
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
            }
            ServerKind::Unknown | ServerKind::RSGhost => {
                self.servers.insert(address, new_desc);
            }
            ServerKind::LoadBalancer => {
                self.topology_type = TopologyType::LoadBalanced;
                self.servers.insert(address, new_desc);
            }
        }
    }

    fn apply_sharded(&mut self, address: ServerAddress, new_desc: ServerDescription) {
        if new_desc.is_unknown() {
            self.servers.insert(address, new_desc);
            return;
        }
        if new_desc.kind != ServerKind::Mongos {
            self.servers.remove(&address);
            return;
        }
        self.servers.insert(address, new_desc);
    }

    fn apply_rs_no_primary(&mut self, address: ServerAddress, new_desc: ServerDescription) {
        match new_desc.kind {
            ServerKind::RSPrimary => {
                self.set_name = new_desc.set_name.clone().or_else(|| self.set_name.clone());
                self.record_election(&new_desc);
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
                self.mark_absent_hosts_unknown();
            }
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
            }
            ServerKind::Standalone | ServerKind::Mongos | ServerKind::LoadBalancer => {
                self.servers.remove(&address);
            }
            ServerKind::Unknown | ServerKind::RSGhost => {
                self.servers.insert(address, new_desc);
            }
        }
        if self.primary().is_none()
            && !self
                .servers
                .values()
                .any(|s| s.kind.is_replica_set_member())
        {
            self.topology_type = TopologyType::Unknown;
        }
    }

    fn apply_rs_with_primary(&mut self, address: ServerAddress, new_desc: ServerDescription) {
        match new_desc.kind {
            ServerKind::RSPrimary => {
                let current_primary = self.primary().cloned();
                let supersedes = current_primary
                    .as_ref()
                    .map(|old| new_desc.supersedes_primary(old) || old.address == address)
                    .unwrap_or(true);
                if !supersedes {
                    debug!(
                        "ignoring stale primary announcement from {address}: (setVersion, electionId) not newer"
                    );
                    return;
                }
                // demote any other server currently believed to be primary
                for server in self.servers.values_mut() {
                    if server.kind == ServerKind::RSPrimary && server.address != address {
                        *server = ServerDescription::unknown(server.address.clone());
                    }
                }
                self.record_election(&new_desc);
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
                self.mark_absent_hosts_unknown();
            }
            ServerKind::RSSecondary | ServerKind::RSArbiter | ServerKind::RSOther => {
                self.update_rs_membership(&new_desc);
                self.servers.insert(address, new_desc);
            }
            ServerKind::Unknown | ServerKind::RSGhost => {
                let was_primary = self
                    .servers
                    .get(&address)
                    .map(|s| s.kind == ServerKind::RSPrimary)
                    .unwrap_or(false);
                self.servers.insert(address, new_desc);
                if was_primary {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                }
            }
            ServerKind::Standalone | ServerKind::Mongos | ServerKind::LoadBalancer => {
                self.servers.remove(&address);
                if self.primary().is_none() {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                }
            }
        }
        if self.primary().is_none() {
            self.topology_type = TopologyType::ReplicaSetNoPrimary;
        }
    }

    fn record_election(&mut self, primary: &ServerDescription) {
        self.max_set_version = match (self.max_set_version, primary.set_version) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.max_election_id = match (self.max_election_id, primary.election_id) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Adds any host named by the primary's `hosts`/`passives`/`arbiters`
    /// lists that the topology doesn't already track, as `Unknown`, so the
    /// monitor layer starts heartbeating it.
    fn update_rs_membership(&mut self, desc: &ServerDescription) {
        for addr in desc
            .hosts
            .iter()
            .chain(desc.passives.iter())
            .chain(desc.arbiters.iter())
        {
            self.servers
                .entry(addr.clone())
                .or_insert_with(|| ServerDescription::unknown(addr.clone()));
        }
    }

    /// Per the published SDAM behavior this driver follows: when a new
    /// primary is recorded, any server previously tracked that the new
    /// primary's membership lists no longer mention is dropped, since it is
    /// no longer part of the set.
    fn mark_absent_hosts_unknown(&mut self) {
        let Some(primary) = self.primary() else {
            return;
        };
        let known: std::collections::HashSet<_> = primary
            .hosts
            .iter()
            .chain(primary.passives.iter())
            .chain(primary.arbiters.iter())
            .cloned()
            .chain(std::iter::once(primary.address.clone()))
            .collect();
        self.servers.retain(|addr, _| known.contains(addr));
    }

    fn recompute_logical_session_timeout(&mut self) {
        self.logical_session_timeout_minutes = self
            .servers
            .values()
            .filter(|s| s.kind.is_data_bearing())
            .filter_map(|s| s.logical_session_timeout_minutes)
            .min();
    }

    pub fn has_known_servers(&self) -> bool {
        self.servers.values().any(|s| !s.is_unknown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn desc(addr: &str, kind: ServerKind) -> ServerDescription {
        let (host, port) = addr.split_once(':').unwrap();
        ServerDescription {
            address: ServerAddress::new(host, port.parse().unwrap()),
            kind,
            min_wire_version: 6,
            max_wire_version: 17,
            tags: Default::default(),
            election_id: None,
            set_version: Some(1),
            set_name: Some("rs0".to_string()),
            logical_session_timeout_minutes: Some(30),
            last_write_date: None,
            last_update_time: Instant::now(),
            last_update_date: crate::bson::DateTime::now(),
            average_round_trip_ms: Some(10.0),
            hosts: vec![
                ServerAddress::new("a", 27017),
                ServerAddress::new("b", 27017),
                ServerAddress::new("c", 27017),
            ],
            passives: vec![],
            arbiters: vec![],
            primary: None,
            topology_version: None,
            error: None,
        }
    }

    #[test]
    fn unknown_to_replica_set_with_primary() {
        let mut topology = TopologyDescription::seed(
            &[
                ServerAddress::new("a", 27017),
                ServerAddress::new("b", 27017),
                ServerAddress::new("c", 27017),
            ],
            Some("rs0".to_string()),
        );
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

        topology.on_server_description(desc("a:27017", ServerKind::RSPrimary));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.primary().unwrap().address, ServerAddress::new("a", 27017));
    }

    #[test]
    fn stale_primary_is_ignored() {
        let mut topology = TopologyDescription::seed(
            &[ServerAddress::new("a", 27017), ServerAddress::new("b", 27017)],
            Some("rs0".to_string()),
        );
        let mut primary_a = desc("a:27017", ServerKind::RSPrimary);
        primary_a.set_version = Some(5);
        topology.on_server_description(primary_a);
        assert_eq!(topology.primary().unwrap().address, ServerAddress::new("a", 27017));

        let mut stale_b = desc("b:27017", ServerKind::RSPrimary);
        stale_b.set_version = Some(3);
        topology.on_server_description(stale_b);
        assert_eq!(topology.primary().unwrap().address, ServerAddress::new("a", 27017));
    }

    #[test]
    fn primary_to_unknown_demotes_to_no_primary() {
        let mut topology = TopologyDescription::seed(
            &[ServerAddress::new("a", 27017), ServerAddress::new("b", 27017)],
            Some("rs0".to_string()),
        );
        topology.on_server_description(desc("a:27017", ServerKind::RSPrimary));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

        topology.on_server_description(ServerDescription::unknown(ServerAddress::new("a", 27017)));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn mismatched_set_name_drops_server() {
        let mut topology = TopologyDescription::seed(
            &[ServerAddress::new("a", 27017)],
            Some("rs0".to_string()),
        );
        let mut other_set = desc("a:27017", ServerKind::RSSecondary);
        other_set.set_name = Some("rs1".to_string());
        topology.on_server_description(other_set);
        assert!(!topology.servers.contains_key(&ServerAddress::new("a", 27017)));
    }
}
