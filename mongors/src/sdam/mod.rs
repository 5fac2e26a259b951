//! Server Discovery And Monitoring: background heartbeats, the topology
//! state machine, and server-description aggregation (`spec.md` §4.3/§4.4).

mod monitor;
mod server_description;
mod topology_description;

pub mod events;

pub use monitor::{HeartbeatOutcome, Monitor};
pub use server_description::{ElectionId, ServerAddress, ServerDescription, ServerKind};
pub use topology_description::{TopologyDescription, TopologyType, SUPPORTED_WIRE_VERSION_RANGE};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bson::Document;
use crate::options::ClientOptions;
use crate::pool::PoolTable;

/// Owns the single mutable [`TopologyDescription`] and fans it out to every
/// reader via a `watch` channel — the idiomatic async form of "readers via
/// immutable snapshots... writer under a mutex" (`spec.md` §5). The mutex
/// here only ever guards the brief state-machine transition; readers never
/// take it, they just clone the latest value out of the watch channel.
pub struct Topology {
    state: Mutex<TopologyDescription>,
    sender: watch::Sender<Arc<TopologyDescription>>,
    monitors: Mutex<HashMap<ServerAddress, JoinHandle<()>>>,
    options: Arc<ClientOptions>,
    pools: Arc<PoolTable>,
    /// `spec.md` §4.7: the deployment-wide `$clusterTime`, the newest one
    /// observed across every session (and sessionless command) against this
    /// deployment, gossiped onto every subsequent outgoing command.
    cluster_time: Mutex<Option<Document>>,
    sdam_events: tokio::sync::broadcast::Sender<events::SdamEvent>,
}

impl Topology {
    pub fn new(options: Arc<ClientOptions>, pools: Arc<PoolTable>) -> Arc<Self> {
        let initial = TopologyDescription::seed(&options.hosts, options.replica_set.clone());
        let (sender, _) = watch::channel(Arc::new(initial.clone()));
        let (sdam_events, _) = tokio::sync::broadcast::channel(1024);
        let topology = Arc::new(Topology {
            state: Mutex::new(initial),
            sender,
            monitors: Mutex::new(HashMap::new()),
            options,
            pools,
            cluster_time: Mutex::new(None),
            sdam_events,
        });
        topology.clone().spawn_missing_monitors();
        topology
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> Arc<TopologyDescription> {
        self.sender.borrow().clone()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<events::SdamEvent> {
        self.sdam_events.subscribe()
    }

    /// The deployment-wide `$clusterTime`, `None` until the deployment has
    /// returned one on any reply (`spec.md` §4.7).
    pub fn cluster_time(&self) -> Option<Document> {
        self.cluster_time.lock().unwrap().clone()
    }

    /// Advances the deployment-wide cluster time if `candidate` is newer
    /// than the one already recorded, mirroring [`ClientSession`]'s own
    /// per-session advancement but shared across every session.
    ///
    /// [`ClientSession`]: crate::session::ClientSession
    pub fn advance_cluster_time(&self, candidate: Option<&Document>) {
        let Some(candidate) = candidate else {
            return;
        };
        let mut current = self.cluster_time.lock().unwrap();
        if crate::session::newer_cluster_time(current.as_ref(), candidate) {
            *current = Some(candidate.clone());
        }
    }

    /// Applies one monitor's heartbeat outcome: runs the state machine
    /// (`spec.md` §4.4), publishes the new snapshot, and starts monitors for
    /// any newly discovered replica set member.
    pub fn apply(self: &Arc<Self>, new_desc: ServerDescription) {
        let address = new_desc.address.clone();
        let mut guard = self.state.lock().unwrap();
        let previous = guard.servers.get(&address).cloned();
        let previous_topology = guard.clone();
        guard.on_server_description(new_desc);
        let snapshot = guard.clone();
        drop(guard);

        if let Some(new) = snapshot.servers.get(&address) {
            let previous = previous.unwrap_or_else(|| ServerDescription::unknown(address.clone()));
            let _ = self
                .sdam_events
                .send(events::SdamEvent::ServerDescriptionChanged {
                    address,
                    previous: Arc::new(previous),
                    new: Arc::new(new.clone()),
                });
        }
        let _ = self
            .sdam_events
            .send(events::SdamEvent::TopologyDescriptionChanged {
                previous: Arc::new(previous_topology),
                new: Arc::new(snapshot.clone()),
            });

        self.sender.send_replace(Arc::new(snapshot));
        self.spawn_missing_monitors();
    }

    /// `spec.md` §6 observability surface: emitted by a [`Monitor`] around
    /// each `hello` it sends, so a subscriber can time heartbeats without
    /// polling [`Topology::current`].
    pub fn emit_heartbeat_started(&self, address: &ServerAddress) {
        let _ = self
            .sdam_events
            .send(events::SdamEvent::ServerHeartbeatStarted {
                address: address.clone(),
            });
    }

    pub fn emit_heartbeat_succeeded(&self, address: &ServerAddress, duration_ms: f64) {
        let _ = self
            .sdam_events
            .send(events::SdamEvent::ServerHeartbeatSucceeded {
                address: address.clone(),
                duration_ms,
            });
    }

    pub fn emit_heartbeat_failed(&self, address: &ServerAddress, duration_ms: f64, message: String) {
        let _ = self
            .sdam_events
            .send(events::SdamEvent::ServerHeartbeatFailed {
                address: address.clone(),
                duration_ms,
                message,
            });
    }

    /// Marks `address` Unknown immediately — used on a network error
    /// (`spec.md` §4.6 "Failure semantics") rather than waiting for the next
    /// scheduled heartbeat.
    pub fn mark_unknown(self: &Arc<Self>, address: &ServerAddress, error: String) {
        self.apply(ServerDescription::unknown_with_error(
            address.clone(),
            error,
        ));
    }

    /// The shared tail of a heartbeat failure (`spec.md` §4.3) and a
    /// command network error (§4.6): marks `address` Unknown and clears its
    /// connection pool, generation-bumping it so in-flight and idle
    /// connections from before the failure are dropped rather than reused.
    /// The clear is suppressed when `error_topology_version` is strictly
    /// newer than the one already recorded for `address` — the server has
    /// already told us about a state past this error, so clearing again
    /// would just race the update already in flight.
    pub async fn mark_unknown_and_clear_pool(
        self: &Arc<Self>,
        address: &ServerAddress,
        error: String,
        error_topology_version: Option<&Document>,
    ) {
        if self.should_clear_pool_for_error(address, error_topology_version) {
            self.pools.clear_if_exists(address).await;
        }
        self.mark_unknown(address, error);
    }

    fn should_clear_pool_for_error(
        &self,
        address: &ServerAddress,
        error_topology_version: Option<&Document>,
    ) -> bool {
        let Some(candidate) = error_topology_version else {
            return true;
        };
        match self
            .state
            .lock()
            .unwrap()
            .servers
            .get(address)
            .and_then(|s| s.topology_version.as_ref())
        {
            Some(known) => !server_description::topology_version_is_newer(candidate, known),
            None => true,
        }
    }

    fn spawn_missing_monitors(self: &Arc<Self>) {
        let addresses: Vec<ServerAddress> = {
            let guard = self.state.lock().unwrap();
            guard.servers.keys().cloned().collect()
        };
        let mut monitors = self.monitors.lock().unwrap();
        for address in addresses {
            monitors.entry(address.clone()).or_insert_with(|| {
                let topology = self.clone();
                let options = self.options.clone();
                tokio::spawn(async move {
                    Monitor::new(address, topology, options).run().await;
                })
            });
        }
    }

    pub fn request_immediate_check(&self, _address: &ServerAddress) {
        // Heartbeat-on-error is handled by the monitor loop noticing the
        // server went Unknown on its own next send; an explicit
        // fast-path wakeup channel is a possible future addition (see
        // `Monitor::run`'s select! over a regular timer only).
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        for (_, handle) in self.monitors.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
