use std::sync::Arc;

use super::server_description::{ServerAddress, ServerDescription};
use super::topology_description::TopologyDescription;

/// SDAM events (`spec.md` §6 "Observability surface"), published on a
/// per-client `broadcast` channel so any number of subscribers can observe
/// topology changes independently.
#[derive(Debug, Clone)]
pub enum SdamEvent {
    ServerDescriptionChanged {
        address: ServerAddress,
        previous: Arc<ServerDescription>,
        new: Arc<ServerDescription>,
    },
    TopologyDescriptionChanged {
        previous: Arc<TopologyDescription>,
        new: Arc<TopologyDescription>,
    },
    ServerHeartbeatStarted {
        address: ServerAddress,
    },
    ServerHeartbeatSucceeded {
        address: ServerAddress,
        duration_ms: f64,
    },
    ServerHeartbeatFailed {
        address: ServerAddress,
        duration_ms: f64,
        message: String,
    },
}
