use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::server_description::{ServerAddress, ServerDescription, ServerKind};
use super::Topology;
use crate::bson::{self, Document};
use crate::error::Result;
use crate::options::ClientOptions;
use crate::wire;

/// Default and floor heartbeat intervals, `spec.md` §4.3.
const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(10_000);
const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
/// RTT exponentially weighted moving average smoothing factor.
const RTT_ALPHA: f64 = 0.2;

pub enum HeartbeatOutcome {
    Success(ServerDescription),
    Failure(String),
}

/// The single task per server address that repeatedly sends `hello` and
/// turns the reply into a fresh [`ServerDescription`]. Connects once, then
/// loops sending/receiving on the same socket at a heartbeat cadence,
/// reconnecting (rather than erroring out) whenever the socket drops.
pub struct Monitor {
    address: ServerAddress,
    topology: Arc<Topology>,
    options: Arc<ClientOptions>,
}

impl Monitor {
    pub fn new(address: ServerAddress, topology: Arc<Topology>, options: Arc<ClientOptions>) -> Self {
        Monitor {
            address,
            topology,
            options,
        }
    }

    pub async fn run(mut self) {
        let mut rtt_avg: Option<f64> = None;
        let mut topology_version: Option<Document> = None;
        let mut interval = DEFAULT_HEARTBEAT_FREQUENCY;

        loop {
            let started = Instant::now();
            self.topology.emit_heartbeat_started(&self.address);
            match self.heartbeat_once(topology_version.clone()).await {
                Ok((desc, rtt_ms)) => {
                    self.topology
                        .emit_heartbeat_succeeded(&self.address, rtt_ms);
                    rtt_avg = Some(match rtt_avg {
                        Some(prev) => RTT_ALPHA * rtt_ms + (1.0 - RTT_ALPHA) * prev,
                        None => rtt_ms,
                    });
                    topology_version = desc.topology_version.clone();
                    let mut desc = desc;
                    desc.average_round_trip_ms = rtt_avg;
                    interval = self.options.heartbeat_frequency;
                    self.topology.apply(desc);
                }
                Err(e) => {
                    warn!("heartbeat to {} failed: {e}", self.address);
                    self.topology.emit_heartbeat_failed(
                        &self.address,
                        started.elapsed().as_secs_f64() * 1000.0,
                        e.to_string(),
                    );
                    // heartbeat failure transitions the server to Unknown
                    // and clears its pool, per `spec.md` §4.3/§4.6. A
                    // connect/heartbeat failure carries no reply, so there
                    // is no topologyVersion to suppress the clear with.
                    self.topology
                        .mark_unknown_and_clear_pool(&self.address, e.to_string(), None)
                        .await;
                    rtt_avg = None;
                    topology_version = None;
                    interval = MIN_HEARTBEAT_FREQUENCY;
                }
            }

            let elapsed = started.elapsed();
            let sleep_for = interval.saturating_sub(elapsed);
            tokio::time::sleep(sleep_for.max(MIN_HEARTBEAT_FREQUENCY)).await;
        }
    }

    async fn heartbeat_once(
        &mut self,
        topology_version: Option<Document>,
    ) -> Result<(ServerDescription, f64)> {
        let connect_timeout = Duration::from_millis(self.options.connect_timeout_ms);
        let stream = timeout(
            connect_timeout,
            TcpStream::connect((self.address.host.as_str(), self.address.port)),
        )
        .await
        .map_err(|_| {
            crate::error::Error::Network(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        let mut stream = BufReader::new(read);
        let mut writer = BufWriter::new(write);

        let started = Instant::now();
        let reply = send_hello(&mut stream, &mut writer, &self.options, topology_version).await?;
        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok((parse_hello_reply(self.address.clone(), &reply), rtt_ms))
    }
}

async fn send_hello<R, W>(
    reader: &mut R,
    writer: &mut W,
    options: &ClientOptions,
    topology_version: Option<Document>,
) -> Result<Document>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut command = Document::new();
    command.insert("hello", 1i32);
    command.insert("helloOk", true);
    if let Some(tv) = topology_version {
        command.insert("topologyVersion", tv);
        command.insert("maxAwaitTimeMS", options.heartbeat_frequency.as_millis() as i64);
    }
    command.insert("client", crate::options::client_metadata(options));

    let mut combined = wire::Duplex { reader, writer };
    wire::send_command(
        &mut combined,
        1,
        "admin",
        command,
        None,
        ServerKind::Unknown,
        None,
    )
    .await
}

fn parse_hello_reply(address: ServerAddress, reply: &Document) -> ServerDescription {
    let kind = classify(reply);
    let tags = reply
        .get_document("tags")
        .map(|d| {
            d.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let hosts = read_address_list(reply, "hosts");
    let passives = read_address_list(reply, "passives");
    let arbiters = read_address_list(reply, "arbiters");
    let primary = reply
        .get_str("primary")
        .and_then(parse_host_port);

    ServerDescription {
        address,
        kind,
        min_wire_version: reply.get_i32("minWireVersion").unwrap_or(0),
        max_wire_version: reply.get_i32("maxWireVersion").unwrap_or(0),
        tags,
        election_id: reply
            .get("electionId")
            .and_then(|v| v.as_object_id()),
        set_version: reply.get_i64("setVersion").or_else(|| reply.get_i32("setVersion").map(i64::from)),
        set_name: reply.get_str("setName").map(str::to_string),
        logical_session_timeout_minutes: reply.get_i64("logicalSessionTimeoutMinutes"),
        last_write_date: reply
            .get_document("lastWrite")
            .and_then(|lw| lw.get_datetime("lastWriteDate")),
        last_update_time: Instant::now(),
        last_update_date: crate::bson::DateTime::now(),
        average_round_trip_ms: None,
        hosts,
        passives,
        arbiters,
        primary,
        topology_version: reply.get_document("topologyVersion").cloned(),
        error: None,
    }
}

fn classify(reply: &Document) -> ServerKind {
    if reply.get_bool("isreplicaset") == Some(true) {
        return ServerKind::RSGhost;
    }
    if let Some(msg) = reply.get_str("msg") {
        if msg == "isdbgrid" {
            return ServerKind::Mongos;
        }
    }
    if reply.contains_key("setName") {
        if reply.get_bool("ismaster").unwrap_or(false) || reply.get_bool("isWritablePrimary").unwrap_or(false) {
            return ServerKind::RSPrimary;
        }
        if reply.get_bool("secondary").unwrap_or(false) {
            return ServerKind::RSSecondary;
        }
        if reply.get_bool("arbiterOnly").unwrap_or(false) {
            return ServerKind::RSArbiter;
        }
        return ServerKind::RSOther;
    }
    if reply.get_bool("isWritablePrimary").unwrap_or(false) || reply.get_bool("ismaster").unwrap_or(false) {
        return ServerKind::Standalone;
    }
    ServerKind::Standalone
}

fn read_address_list(reply: &Document, field: &str) -> Vec<ServerAddress> {
    reply
        .get_array(field)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(parse_host_port)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_host_port(s: &str) -> Option<ServerAddress> {
    let (host, port) = s.rsplit_once(':')?;
    Some(ServerAddress::new(host, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn classifies_mongos_by_msg_field() {
        let reply = doc! { "msg" => "isdbgrid", "maxWireVersion" => 17i32 };
        assert_eq!(classify(&reply), ServerKind::Mongos);
    }

    #[test]
    fn classifies_replica_set_primary() {
        let reply = doc! { "setName" => "rs0", "isWritablePrimary" => true };
        assert_eq!(classify(&reply), ServerKind::RSPrimary);
    }

    #[test]
    fn parses_host_list() {
        let reply = doc! { "hosts" => vec![bson::Bson::String("a:27017".into()), bson::Bson::String("b:27017".into())] };
        let hosts = read_address_list(&reply, "hosts");
        assert_eq!(hosts, vec![ServerAddress::new("a", 27017), ServerAddress::new("b", 27017)]);
    }
}
