//! A minimal `Database`/`Collection` handle pair exposing `run_command` and
//! a `find_one`/`insert_one` pair, built on the executor. CRUD conveniences
//! are an explicit Non-goal of `spec.md` §1; these exist purely to give the
//! executor a caller, per `SPEC_FULL.md` §10.

use std::sync::Arc;

use crate::bson::Document;
use crate::client::Client;
use crate::error::Result;
use crate::executor::Retryable;
use crate::selection::ReadPreference;
use crate::session::ClientSession;

/// A handle to one database on the deployment `client` is connected to.
/// Cheap to construct; carries no state of its own beyond the name.
#[derive(Clone)]
pub struct Database {
    client: Arc<Client>,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Arc<Client>, name: String) -> Self {
        Database { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            database: self.clone(),
            name: name.to_string(),
        }
    }

    /// Runs an arbitrary command against this database, attaching session
    /// metadata and read-preference via the executor (`spec.md` §4.8).
    /// `read_preference` defaults to the client's configured preference
    /// when `None`.
    pub async fn run_command(
        &self,
        command: Document,
        session: Option<&Arc<ClientSession>>,
    ) -> Result<Document> {
        self.client
            .run_command(&self.name, command, None, session, None)
            .await
    }

    pub async fn run_command_with_read_preference(
        &self,
        command: Document,
        read_preference: &ReadPreference,
        session: Option<&Arc<ClientSession>>,
    ) -> Result<Document> {
        self.client
            .run_command(&self.name, command, Some(read_preference), session, None)
            .await
    }
}

/// A handle to one collection. `find_one`/`insert_one` are the thinnest
/// possible demonstration that Executor + Selector + Session compose; they
/// are not a query-building layer.
#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// `find` with `limit: 1`, returning the first matching document (or
    /// `None` on an empty `firstBatch`). Retryable-read eligible per
    /// `spec.md` §7, including for implicit sessions on a standalone
    /// topology (`spec.md` §9 Open Questions: the retryable-reads
    /// specification's answer, adopted here).
    pub async fn find_one(
        &self,
        filter: Document,
        session: Option<&Arc<ClientSession>>,
    ) -> Result<Option<Document>> {
        let command = crate::doc! {
            "find" => self.name.clone(),
            "filter" => filter,
            "limit" => 1i32,
            "singleBatch" => true,
        };
        let reply = self
            .database
            .client
            .run_command(
                self.database.name(),
                command,
                None,
                session,
                Some(Retryable::Read),
            )
            .await?;
        let first_batch = reply
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .unwrap_or(&[]);
        Ok(first_batch.first().and_then(|b| b.as_document().cloned()))
    }

    /// `insert` of a single document. Retryable per `spec.md` §4.7/§7.
    pub async fn insert_one(
        &self,
        document: Document,
        session: Option<&Arc<ClientSession>>,
    ) -> Result<Document> {
        let command = crate::doc! {
            "insert" => self.name.clone(),
            "documents" => vec![crate::bson::Bson::Document(document)],
        };
        self.database
            .client
            .run_command(
                self.database.name(),
                command,
                None,
                session,
                Some(Retryable::Write),
            )
            .await
    }

    /// Counts matching documents via the `count` command. Retryable-read
    /// eligible, used by `spec.md` §8 scenario 4's causal-consistency test.
    pub async fn count_documents(
        &self,
        filter: Document,
        session: Option<&Arc<ClientSession>>,
    ) -> Result<i64> {
        let command = crate::doc! {
            "count" => self.name.clone(),
            "query" => filter,
        };
        let reply = self
            .database
            .client
            .run_command(
                self.database.name(),
                command,
                None,
                session,
                Some(Retryable::Read),
            )
            .await?;
        Ok(reply.get_i64("n").unwrap_or(0))
    }
}
