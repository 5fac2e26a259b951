//! mongors — a pure Rust client driver for distributed document database
//! deployments: replica sets, sharded clusters, load-balanced deployments,
//! and standalones.
//!
//! The driver discovers topology continuously ([`sdam`]), serialises
//! commands and results with a self-describing binary document format
//! ([`bson`]), routes each operation to a suitable server subject to
//! read-preference and locality constraints ([`selection`]), and surfaces
//! sessions carrying logical clocks for causal consistency and retryable
//! semantics ([`session`]).
//!
//! ```no_run
//! # async fn run() -> mongors::Result<()> {
//! use std::sync::Arc;
//!
//! let client = Arc::new(mongors::Client::with_uri_str("mongodb://localhost:27017").await?);
//! let db = client.database("test");
//! let reply = db.run_command(mongors::doc! { "ping" => 1i32 }, None).await?;
//! assert_eq!(reply.get_f64("ok"), Some(1.0));
//! # Ok(())
//! # }
//! ```

pub mod bson;
mod client;
mod database;
pub mod error;
pub mod event;
mod executor;
pub mod options;
pub mod pool;
pub mod sdam;
pub mod selection;
pub mod session;
pub mod wire;

pub use client::Client;
pub use database::{Collection, Database};
pub use error::{Error, Result};
pub use options::ClientOptions;
pub use session::ClientSession;

#[cfg(feature = "derive")]
pub use mongors_derive::BsonSchema;
