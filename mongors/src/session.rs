//! Logical sessions, server-session pooling, and causal-consistency state
//! (`spec.md` §4.7). Owns the pieces of `spec.md` §3 "ClientSession" that
//! don't belong to the executor: identity, cluster/operation-time
//! advancement, and retryable-write transaction numbering.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::bson::{Binary, BinarySubtype, Bson, Document, Timestamp};
use crate::error::{Error, Result};

/// A server-assigned session identity plus last-use bookkeeping, pooled and
/// reused across [`ClientSession`]s rather than minted fresh per session.
#[derive(Debug, Clone)]
pub struct ServerSession {
    pub id: Document,
    pub last_use: Instant,
    pub txn_number: i64,
}

impl ServerSession {
    fn new() -> Self {
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(Uuid::new_v4().as_bytes());
        let mut id = Document::new();
        id.insert("id", Bson::Binary(Binary::new(BinarySubtype::Uuid, uuid_bytes.to_vec())));
        ServerSession {
            id,
            last_use: Instant::now(),
            txn_number: 0,
        }
    }

    fn is_fresh(&self, timeout: Duration) -> bool {
        // "unexpired" means last use within `logicalSessionTimeoutMinutes -
        // 1 minute`, `spec.md` §4.7.
        let safety_margin = Duration::from_secs(60);
        let usable_for = timeout.saturating_sub(safety_margin);
        self.last_use.elapsed() < usable_for
    }
}

/// `spec.md` §4.7: "Maintains a server-session pool". One per
/// [`crate::client::Client`] (`spec.md` §5 "Shared resources").
pub struct SessionPool {
    idle: Mutex<Vec<ServerSession>>,
}

impl SessionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionPool { idle: Mutex::new(Vec::new()) })
    }

    /// Pops an unexpired session if one is available, otherwise mints a
    /// fresh `lsid`.
    pub fn acquire(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut idle = self.idle.lock().unwrap();
        if let Some(timeout) = logical_session_timeout {
            if let Some(pos) = idle.iter().rposition(|s| s.is_fresh(timeout)) {
                return idle.remove(pos);
            }
        }
        ServerSession::new()
    }

    /// Pushes `session` back to the pool if it's still within the
    /// server-advertised timeout, else discards it. LIFO, matching
    /// `spec.md` §8 scenario 5 ("start sessions A,B... start C,D — their
    /// lsids equal {A,B}'s in LIFO order").
    pub fn release(&self, mut session: ServerSession, logical_session_timeout: Option<Duration>) {
        session.last_use = Instant::now();
        let still_fresh = logical_session_timeout.map(|t| session.is_fresh(t)).unwrap_or(true);
        if still_fresh {
            self.idle.lock().unwrap().push(session);
        }
    }

    /// `spec.md` §4.7 "Drain pool on client shutdown by sending
    /// `endSessions` in batches of ≤10,000". Returns the ids so the caller
    /// (`Client::shutdown`) can batch the actual command sends; this
    /// module has no wire access of its own.
    pub fn drain(&self) -> Vec<Document> {
        std::mem::take(&mut *self.idle.lock().unwrap())
            .into_iter()
            .map(|s| s.id)
            .collect()
    }
}

pub const END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// Splits a drained id list into `endSessions` batches of at most
/// [`END_SESSIONS_BATCH_SIZE`].
pub fn end_sessions_batches(ids: Vec<Document>) -> Vec<Vec<Document>> {
    ids.chunks(END_SESSIONS_BATCH_SIZE).map(|c| c.to_vec()).collect()
}

/// `spec.md` §3 "ClusterTime": `{clusterTime: timestamp, signature:
/// document}`, compared lexicographically on `(timestamp, inc)`.
pub fn cluster_time_value(doc: &Document) -> Option<Timestamp> {
    doc.get_timestamp("clusterTime")
}

/// `spec.md` §4.7: the newer of two cluster-time documents, compared on the
/// embedded timestamp (the signature carries no ordering information of its
/// own).
pub(crate) fn newer_cluster_time(current: Option<&Document>, candidate: &Document) -> bool {
    let candidate_ts = match cluster_time_value(candidate) {
        Some(ts) => ts,
        None => return false,
    };
    match current.and_then(cluster_time_value) {
        Some(current_ts) => candidate_ts > current_ts,
        None => true,
    }
}

/// `spec.md` §3 "ClientSession" / §4.7. Held behind an `Arc` by application
/// code and the executor both; `active` enforces the "distinct sessions
/// never share a serverSession concurrently" and "inactive session is
/// rejected" invariants from `spec.md` §3/§5.
pub struct ClientSession {
    pub lsid: Document,
    server_session: Mutex<ServerSession>,
    pub causal_consistency: bool,
    cluster_time: Mutex<Option<Document>>,
    operation_time: Mutex<Option<Timestamp>>,
    pub implicit: bool,
    active: AtomicBool,
    in_use: AtomicBool,
    pinned_to: Mutex<Option<crate::sdam::ServerAddress>>,
    client_id: u64,
    logical_session_timeout: Option<Duration>,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        causal_consistency: bool,
        implicit: bool,
        client_id: u64,
        logical_session_timeout: Option<Duration>,
    ) -> Self {
        ClientSession {
            lsid: server_session.id.clone(),
            server_session: Mutex::new(server_session),
            causal_consistency,
            cluster_time: Mutex::new(None),
            operation_time: Mutex::new(None),
            implicit,
            active: AtomicBool::new(true),
            in_use: AtomicBool::new(false),
            pinned_to: Mutex::new(None),
            client_id,
            logical_session_timeout,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Validates the session is usable from this operation: active, not
    /// concurrently in use, and belonging to `client_id` (`spec.md` §3/§4.7
    /// /§5 invariants). Returns a guard that clears `in_use` on drop.
    pub(crate) fn begin_use(self: &Arc<Self>, client_id: u64) -> Result<SessionUseGuard> {
        if !self.is_active() {
            return Err(Error::SessionInactive);
        }
        if client_id != self.client_id {
            return Err(Error::SessionWrongClient);
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(Error::SessionInUse);
        }
        Ok(SessionUseGuard { session: self.clone() })
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        *self.operation_time.lock().unwrap()
    }

    pub fn cluster_time(&self) -> Option<Document> {
        self.cluster_time.lock().unwrap().clone()
    }

    pub fn pinned_to(&self) -> Option<crate::sdam::ServerAddress> {
        self.pinned_to.lock().unwrap().clone()
    }

    pub fn pin_to(&self, address: crate::sdam::ServerAddress) {
        *self.pinned_to.lock().unwrap() = Some(address);
    }

    pub fn unpin(&self) {
        *self.pinned_to.lock().unwrap() = None;
    }

    /// Allocates the next retryable-write transaction number (`spec.md`
    /// §4.7).
    pub fn next_txn_number(&self) -> i64 {
        let mut guard = self.server_session.lock().unwrap();
        guard.txn_number += 1;
        guard.txn_number
    }

    pub fn current_txn_number(&self) -> i64 {
        self.server_session.lock().unwrap().txn_number
    }

    /// `spec.md` §4.7: "Every successful reply advances
    /// `session.operationTime`... and `session.clusterTime`...". `w=0`
    /// writes must not call this (the executor skips it for unacknowledged
    /// writes per `spec.md` §4.7).
    pub fn advance_cluster_time(&self, cluster_time: Option<&Document>, operation_time: Option<Timestamp>) {
        if let Some(ct) = cluster_time {
            let mut current = self.cluster_time.lock().unwrap();
            if newer_cluster_time(current.as_ref(), ct) {
                *current = Some(ct.clone());
            }
        }
        if let Some(ot) = operation_time {
            let mut current = self.operation_time.lock().unwrap();
            if current.map(|c| ot > c).unwrap_or(true) {
                *current = Some(ot);
            }
        }
    }

    /// `spec.md` §4.7: afterClusterTime is omitted on a session's first
    /// operation (no `operationTime` recorded yet) and injected on every
    /// subsequent read once causal consistency is enabled.
    pub fn after_cluster_time(&self) -> Option<Timestamp> {
        if !self.causal_consistency {
            return None;
        }
        self.operation_time()
    }

    /// Called by `Client::end_session`: marks inactive and returns the
    /// underlying `ServerSession` for the pool to decide whether to keep.
    pub(crate) fn end(&self) -> ServerSession {
        self.active.store(false, Ordering::SeqCst);
        self.server_session.lock().unwrap().clone()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }
}

/// Held for the duration of one operation; releases the session's
/// "in-use" flag on drop so a session used serially (never concurrently)
/// from multiple operations works, but the invariant in `spec.md` §5
/// ("the driver will report an error if a session is used concurrently
/// from two operations") is still enforced.
pub struct SessionUseGuard {
    session: Arc<ClientSession>,
}

impl Drop for SessionUseGuard {
    fn drop(&mut self) {
        self.session.in_use.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_pool_is_lifo() {
        let pool = SessionPool::new();
        let a = pool.acquire(None);
        let b = pool.acquire(None);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        pool.release(a, None);
        pool.release(b, None);

        let c = pool.acquire(None);
        let d = pool.acquire(None);
        assert_eq!(c.id, b_id);
        assert_eq!(d.id, a_id);
    }

    #[test]
    fn causal_consistency_defers_after_cluster_time_until_first_reply() {
        let pool = SessionPool::new();
        let session = Arc::new(ClientSession::new(pool.acquire(None), true, false, 1, None));
        assert!(session.after_cluster_time().is_none());

        session.advance_cluster_time(None, Some(Timestamp::new(100, 1)));
        assert_eq!(session.after_cluster_time(), Some(Timestamp::new(100, 1)));
    }

    #[test]
    fn operation_time_only_advances_forward() {
        let pool = SessionPool::new();
        let session = ClientSession::new(pool.acquire(None), false, false, 1, None);
        session.advance_cluster_time(None, Some(Timestamp::new(100, 5)));
        session.advance_cluster_time(None, Some(Timestamp::new(50, 1)));
        assert_eq!(session.operation_time(), Some(Timestamp::new(100, 5)));
        session.advance_cluster_time(None, Some(Timestamp::new(100, 9)));
        assert_eq!(session.operation_time(), Some(Timestamp::new(100, 9)));
    }

    #[test]
    fn inactive_session_rejected() {
        let pool = SessionPool::new();
        let session = Arc::new(ClientSession::new(pool.acquire(None), false, false, 1, None));
        let _ = session.end();
        assert!(session.begin_use(1).is_err());
    }

    #[test]
    fn cross_client_session_rejected() {
        let pool = SessionPool::new();
        let session = Arc::new(ClientSession::new(pool.acquire(None), false, false, 1, None));
        assert!(matches!(session.begin_use(2), Err(Error::SessionWrongClient)));
    }

    #[test]
    fn concurrent_use_rejected() {
        let pool = SessionPool::new();
        let session = Arc::new(ClientSession::new(pool.acquire(None), false, false, 1, None));
        let _guard = session.begin_use(1).unwrap();
        assert!(matches!(session.begin_use(1), Err(Error::SessionInUse)));
    }

    #[test]
    fn end_sessions_batches_respect_limit() {
        let ids: Vec<Document> = (0..25_000).map(|_| Document::new()).collect();
        let batches = end_sessions_batches(ids);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), END_SESSIONS_BATCH_SIZE);
        assert_eq!(batches[2].len(), 5_000);
    }
}
