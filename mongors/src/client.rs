//! `Client`: the top-level handle a user constructs once per deployment.
//! Owns the single [`Topology`], one [`Pool`] per server, the session pool,
//! and the process-wide (per-client) request id counter — the shared
//! resources `spec.md` §5 enumerates.
//!
//! Cheap to clone (`Arc`-backed internals); the topology owns the monitor
//! tasks, and a pool per discovered server is created lazily as operations
//! reach it, since the seed list and the eventually discovered deployment
//! membership can differ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::sync::broadcast;

use crate::bson::Document;
use crate::database::Database;
use crate::error::Result;
use crate::event::{CommandEvent, PoolEvent};
use crate::executor::{self, ExecutionContext, Retryable};
use crate::options::ClientOptions;
use crate::pool::PoolTable;
use crate::sdam::{events::SdamEvent, ServerAddress, Topology};
use crate::selection::{OperationCounts, ReadPreference};
use crate::session::{self, ClientSession, SessionPool};
use crate::wire::RequestIdGenerator;

static CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// The user-facing entry point. Cheap to clone (`Arc` internally via its
/// fields); typically constructed once per process per deployment.
pub struct Client {
    id: u64,
    options: Arc<ClientOptions>,
    topology: Arc<Topology>,
    pools: Arc<PoolTable>,
    operation_counts: Mutex<OperationCounts>,
    session_pool: Arc<SessionPool>,
    request_ids: RequestIdGenerator,
    command_events: broadcast::Sender<CommandEvent>,
    pool_events: broadcast::Sender<PoolEvent>,
}

impl Client {
    /// Constructs a client from a `mongodb://`/`mongodb+srv://` connection
    /// string, `spec.md` §6.
    pub async fn with_uri_str(uri: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)?;
        #[cfg(feature = "dns-seedlist")]
        if options.srv_host.is_some() {
            crate::options::srv::resolve(&mut options).await?;
        }
        Ok(Self::with_options(options))
    }

    /// Constructs a client directly from an already-built [`ClientOptions`],
    /// e.g. for tests or embedders that assemble the seed list themselves.
    pub fn with_options(options: ClientOptions) -> Self {
        let options = Arc::new(options);
        let (pool_events, _) = broadcast::channel(1024);
        let (command_events, _) = broadcast::channel(1024);
        let id = CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        info!("client {id} connecting to seeds {:?}", options.hosts);

        // The topology's monitors need to reach the pool table to clear a
        // server's pool on a heartbeat failure, so it is built first.
        let pools = Arc::new(PoolTable::new(options.clone(), pool_events.clone()));
        let topology = Topology::new(options.clone(), pools.clone());

        Client {
            id,
            pools,
            options,
            topology,
            operation_counts: Mutex::new(HashMap::new()),
            session_pool: SessionPool::new(),
            request_ids: RequestIdGenerator::new(),
            command_events,
            pool_events,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn database(self: &Arc<Self>, name: &str) -> Database {
        Database::new(self.clone(), name.to_string())
    }

    pub fn subscribe_command_events(&self) -> broadcast::Receiver<CommandEvent> {
        self.command_events.subscribe()
    }

    pub fn subscribe_pool_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool_events.subscribe()
    }

    pub fn subscribe_sdam_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.topology.subscribe_events()
    }

    fn operation_count_for(&self, address: &ServerAddress) -> () {
        let mut counts = self.operation_counts.lock().unwrap();
        counts
            .entry(address.clone())
            .or_insert_with(|| Arc::new(std::sync::atomic::AtomicI64::new(0)));
    }

    /// `spec.md` §4.7 `start`: starts an explicit session. `causal_consistency`
    /// defaults to `true` per the published session spec this driver follows.
    pub fn start_session(self: &Arc<Self>, causal_consistency: bool) -> Arc<ClientSession> {
        self.new_session(causal_consistency, false)
    }

    pub(crate) fn implicit_session(self: &Arc<Self>) -> Arc<ClientSession> {
        self.new_session(false, true)
    }

    fn new_session(self: &Arc<Self>, causal_consistency: bool, implicit: bool) -> Arc<ClientSession> {
        let timeout = self
            .topology
            .current()
            .logical_session_timeout_minutes
            .map(|m| Duration::from_secs((m as u64) * 60));
        let server_session = self.session_pool.acquire(timeout);
        Arc::new(ClientSession::new(server_session, causal_consistency, implicit, self.id, timeout))
    }

    /// `spec.md` §4.7 "returned to the session pool on end if still within
    /// the server-advertised timeout".
    pub fn end_session(&self, session: &ClientSession) {
        let server_session = session.end();
        let timeout = self
            .topology
            .current()
            .logical_session_timeout_minutes
            .map(|m| Duration::from_secs((m as u64) * 60));
        self.session_pool.release(server_session, timeout);
    }

    /// Runs a raw command against the database named `db`, the thinnest
    /// possible path exercising Executor + Selector + Session together
    /// (`SPEC_FULL.md` §10); `Database`/`Collection` build on this.
    pub(crate) async fn run_command(
        self: &Arc<Self>,
        db: &str,
        command: Document,
        read_preference: Option<&ReadPreference>,
        session: Option<&Arc<ClientSession>>,
        retryable: Option<Retryable>,
    ) -> Result<Document> {
        let preference = read_preference.unwrap_or(&self.options.read_preference);
        let write_concern_unacknowledged = matches!(
            command.get_document("writeConcern").and_then(|wc| wc.get_i32("w")),
            Some(0)
        );

        let (owned_session, session_ref) = match session {
            Some(s) => (None, Some(s)),
            None => {
                let implicit = self.implicit_session();
                (Some(implicit), None)
            }
        };
        let session_ref: Option<&Arc<ClientSession>> = session_ref.or(owned_session.as_ref());

        if let Some(session) = session_ref {
            self.ensure_operation_counts_cover_topology();
            let _guard = session.begin_use(self.id)?;
            let operation_counts = self.operation_counts.lock().unwrap().clone();
            let ctx = ExecutionContext {
                topology: &self.topology,
                pools: &self.pools,
                operation_counts: &operation_counts,
                request_ids: &self.request_ids,
                read_preference: preference,
                heartbeat_frequency: self.options.heartbeat_frequency,
                server_selection_timeout: Duration::from_millis(self.options.server_selection_timeout_ms),
                local_threshold_ms: self.options.local_threshold_ms,
                retryable,
            };
            let result = executor::execute(&ctx, db, command, Some(session), write_concern_unacknowledged).await;
            if let Some(implicit) = owned_session {
                self.end_session(&implicit);
            }
            result
        } else {
            unreachable!("session_ref is always populated above")
        }
    }

    fn ensure_operation_counts_cover_topology(&self) {
        let addresses: Vec<ServerAddress> = self.topology.current().servers.keys().cloned().collect();
        for address in addresses {
            self.operation_count_for(&address);
        }
    }

    /// `spec.md` §4.7 "Drain pool on client shutdown by sending
    /// `endSessions` in batches of ≤10,000." Best-effort: a failed batch is
    /// logged and the remainder still attempted, since shutdown must not
    /// hang on a half-dead deployment.
    pub async fn shutdown(self: Arc<Self>) {
        let ids = self.session_pool.drain();
        for batch in session::end_sessions_batches(ids) {
            let ids: Vec<_> = batch.into_iter().map(crate::bson::Bson::Document).collect();
            let command = crate::doc! { "endSessions" => ids };
            if let Err(e) = self.run_command("admin", command, None, None, None).await {
                log::warn!("endSessions batch failed during client shutdown: {e}");
            }
        }
        self.pools.clear_all().await;
    }
}
