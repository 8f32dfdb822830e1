//! Core driver internals for MongoDB.
//!
//! This crate implements the machinery every MongoDB operation rides on: the
//! topology state machine that discovers and monitors the servers of a
//! deployment, the command execution pipeline with retryable reads and
//! writes, the cursor and change-stream engines, and the client-level
//! `bulkWrite` engine with batch splitting and per-operation result
//! accounting.
//!
//! The entry point is [`Client`]. A `Client` is cheap to clone and safe to
//! share across tasks; it owns the background monitors that keep its view of
//! the deployment current.
//!
//! ```no_run
//! # use mongodb_core::{Client, options::{ClientOptions, ServerAddress}, error::Result};
//! # use bson::doc;
//! # async fn run() -> Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::Tcp {
//!         host: "localhost".to_string(),
//!         port: Some(27017),
//!     }])
//!     .build();
//! let client = Client::with_options(options)?;
//!
//! let collection = client.database("items").collection("inventory");
//! collection.insert_one(doc! { "name": "socks", "qty": 100 }, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use ::bson;

mod bson_util;
pub mod bulk_write;
pub mod change_stream;
mod client;
mod cmap;
mod coll;
pub mod concern;
mod cursor;
mod db;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod options;
pub mod results;
mod runtime;
mod sdam;
pub mod selection_criteria;
#[cfg(test)]
pub(crate) mod test;
mod trace;

pub use crate::{
    client::{session::ClientSession, Client},
    coll::{Collection, Namespace},
    cursor::{Cursor, SessionCursor},
    db::Database,
};

pub use crate::{
    bulk_write::{BulkWrite, BulkWriteException, BulkWriteResult},
    change_stream::ChangeStream,
    client::session::ClusterTime,
    sdam::public::{ServerInfo, TopologyType},
};

/// A boxed future, used by traits that need to return unnameable futures.
pub(crate) type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
