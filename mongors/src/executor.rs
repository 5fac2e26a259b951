//! Runs one operation end to end: resolves a connection via Selector+Pool,
//! attaches session metadata, and handles retry (`spec.md` §4.8).
//!
//! Each call here checks a connection out of the relevant server's pool for
//! the duration of one command and returns it, since `spec.md` §4.8 step
//! 3/6 requires checkout-per-operation rather than one long-lived socket
//! per logical query.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::bson::{Document, Timestamp};
use crate::error::{Error, Result};
use crate::sdam::{ServerAddress, Topology};
use crate::selection::{OperationCounts, ReadPreference, SelectionOutcome};
use crate::session::ClientSession;
use crate::wire::{Duplex, RequestIdGenerator};

/// Everything one call to [`execute`] needs besides the command document
/// itself: which topology/pools to select from and how to shape the
/// request.
pub struct ExecutionContext<'a> {
    pub topology: &'a Arc<Topology>,
    pub pools: &'a crate::pool::PoolTable,
    pub operation_counts: &'a OperationCounts,
    pub request_ids: &'a RequestIdGenerator,
    pub read_preference: &'a ReadPreference,
    pub heartbeat_frequency: Duration,
    pub server_selection_timeout: Duration,
    /// `spec.md` §4.5 step 5 / §6 `localThresholdMS`, threaded through so
    /// [`crate::selection::select`] filters on the user-configured window
    /// rather than a hardcoded default.
    pub local_threshold_ms: u64,
    /// `spec.md` §4.8 step 7: retryable writes/reads are retried once.
    /// `None` means the operation is not retryable at all.
    pub retryable: Option<Retryable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryable {
    Write,
    Read,
}

/// `spec.md` §4.8: `execute(op, session?)`. `command` is the bare command
/// document (e.g. `{find: "coll", filter: {...}}`); this function attaches
/// `$db`, `lsid`, `$clusterTime`, `readConcern.afterClusterTime`, and
/// `txnNumber` as applicable, then decodes the reply and advances the
/// session.
pub async fn execute(
    ctx: &ExecutionContext<'_>,
    db: &str,
    command: Document,
    session: Option<&Arc<ClientSession>>,
    write_concern_is_unacknowledged: bool,
) -> Result<Document> {
    let deadline = Instant::now() + ctx.server_selection_timeout;

    // `spec.md` §4.7: "allocates the next number" happens once, up front;
    // a retry reuses the same `txnNumber` rather than allocating another.
    let txn_number = match (ctx.retryable, session) {
        (Some(Retryable::Write), Some(session)) => Some(session.next_txn_number()),
        _ => None,
    };

    let mut attempt = 0u32;
    let max_attempts = if ctx.retryable.is_some() { 2 } else { 1 };

    loop {
        attempt += 1;
        let address = select_server(ctx, deadline).await?;
        let result = run_once(
            ctx,
            &address,
            db,
            &command,
            session,
            txn_number,
            write_concern_is_unacknowledged,
        )
        .await;

        match result {
            Ok(reply) => return Ok(reply),
            Err(e) if attempt < max_attempts && is_retryable(ctx, &e) => {
                debug!("retrying operation after error on {address}: {e}");
                continue;
            }
            Err(e) if ctx.retryable.is_some() => {
                return Err(Error::RetryExhausted(Box::new(e)));
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_retryable(ctx: &ExecutionContext<'_>, err: &Error) -> bool {
    match ctx.retryable {
        Some(Retryable::Write) => err.is_retryable_write(),
        Some(Retryable::Read) => err.is_retryable_read(),
        None => false,
    }
}

/// `spec.md` §4.8 step 2: select a server and increment its operation
/// count; step 6 (decrement) happens via [`OperationCountGuard`]. Loops on
/// [`SelectionOutcome::Retry`] until a topology change arrives or the
/// deadline passes, matching `spec.md` §4.5 step 6's "wait for a topology
/// change... then retry from step 1".
async fn select_server(ctx: &ExecutionContext<'_>, deadline: Instant) -> Result<ServerAddress> {
    loop {
        let snapshot = ctx.topology.current();
        let outcome = crate::selection::select(
            &snapshot,
            ctx.read_preference,
            ctx.operation_counts,
            ctx.heartbeat_frequency,
            ctx.local_threshold_ms,
        )?;
        match outcome {
            SelectionOutcome::Selected(address) => return Ok(address),
            SelectionOutcome::Retry => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::ServerSelection {
                        topology: Box::new((*snapshot).clone()),
                        preference: ctx.read_preference.clone(),
                        elapsed_ms: ctx.server_selection_timeout.as_millis() as u64,
                    });
                }
                let mut receiver = ctx.topology.subscribe();
                let _ = tokio::time::timeout(remaining, receiver.changed()).await;
            }
        }
    }
}

/// `spec.md` §3 "OperationCount per Server": incremented at selection,
/// decremented at completion, on every exit path including an early
/// `return`/`?`.
struct OperationCountGuard<'a> {
    counts: &'a OperationCounts,
    address: &'a ServerAddress,
}

impl<'a> OperationCountGuard<'a> {
    fn new(counts: &'a OperationCounts, address: &'a ServerAddress) -> Self {
        if let Some(counter) = counts.get(address) {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        OperationCountGuard { counts, address }
    }
}

impl<'a> Drop for OperationCountGuard<'a> {
    fn drop(&mut self) {
        if let Some(counter) = self.counts.get(self.address) {
            counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    ctx: &ExecutionContext<'_>,
    address: &ServerAddress,
    db: &str,
    command: &Document,
    session: Option<&Arc<ClientSession>>,
    txn_number: Option<i64>,
    write_concern_is_unacknowledged: bool,
) -> Result<Document> {
    let _count_guard = OperationCountGuard::new(ctx.operation_counts, address);

    let server_kind = ctx
        .topology
        .current()
        .servers
        .get(address)
        .map(|s| s.kind)
        .unwrap_or(crate::sdam::ServerKind::Unknown);

    let pool = ctx.pools.get_or_create(address.clone());
    let mut pooled = pool.checkout().await?;

    let mut outgoing = command.clone();
    // `spec.md` §4.7: `$clusterTime` gossips deployment-wide — attached to
    // every outgoing command (session-bound or not) once the deployment has
    // ever returned one, not just on the session that last observed it.
    if let Some(cluster_time) = ctx.topology.cluster_time() {
        outgoing.insert("$clusterTime", cluster_time);
    }
    if let Some(session) = session {
        outgoing.insert("lsid", session.lsid.clone());
        if let Some(after) = session.after_cluster_time() {
            attach_after_cluster_time(&mut outgoing, after);
        }
        if let Some(txn_number) = txn_number {
            outgoing.insert("txnNumber", txn_number);
        }
    }

    let request_id = ctx.request_ids.next();
    let conn = pooled.connection();
    let mut duplex = Duplex {
        reader: &mut conn.reader,
        writer: &mut conn.writer,
    };
    trace!("sending command to {address}: {outgoing:?}");
    let send_result = crate::wire::send_command(
        &mut duplex,
        request_id,
        db,
        outgoing,
        Some(ctx.read_preference),
        server_kind,
        conn.compressor,
    )
    .await;

    let reply = match send_result {
        Ok(reply) => reply,
        Err(e) => {
            pooled.invalidate().await;
            // `spec.md` §4.6 "Failure semantics": a network error on a
            // command clears the server's pool (generation bump) in
            // addition to marking it Unknown. A raw transport error carries
            // no `topologyVersion` of its own, so the suppression clause
            // never fires here; it exists for the general rule this and the
            // heartbeat-failure path share.
            ctx.topology
                .mark_unknown_and_clear_pool(address, e.to_string(), None)
                .await;
            return Err(e);
        }
    };

    let metadata = crate::wire::extract_reply_metadata(&reply);
    // `spec.md` §4.7: `$clusterTime` gossips deployment-wide regardless of
    // session or write concern.
    ctx.topology.advance_cluster_time(metadata.cluster_time.as_ref());
    if let Some(session) = session {
        if !write_concern_is_unacknowledged {
            session.advance_cluster_time(metadata.cluster_time.as_ref(), metadata.operation_time);
        }
    }
    pooled.release().await;

    if !metadata.ok {
        let code = reply.get_i32("code").unwrap_or(0);
        let code_name = reply.get_str("codeName").unwrap_or("Unknown").to_string();
        let message = reply.get_str("errmsg").unwrap_or("command failed").to_string();
        return Err(Error::Command {
            code,
            code_name,
            message,
            error_labels: metadata.error_labels,
        });
    }

    Ok(reply)
}

/// `spec.md` §4.7: appends `readConcern.afterClusterTime`, preserving any
/// user-supplied `level`.
fn attach_after_cluster_time(command: &mut Document, after: Timestamp) {
    let mut read_concern = command
        .get_document("readConcern")
        .cloned()
        .unwrap_or_default();
    read_concern.insert("afterClusterTime", after);
    command.insert("readConcern", read_concern);
}
