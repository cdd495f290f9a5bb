//! # minikv-client
//!
//! Client runtime for a partitioned, replicated key-value store:
//! - Resolves table names to partition maps through the meta servers
//! - Routes each key to its partition's primary replica
//! - Refreshes stale routing and retries once
//! - Deadlines on every call, no background work left behind after close
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Client                   │
//! │  registry ── TableConnector per table    │
//! │      │            │ partition_of(key)    │
//! │  MetaClient   SessionPool (by address)   │
//! └──────┬────────────┬──────────────────────┘
//!        │ QueryConfig│ Get/Set/Del
//!   ┌────▼─────┐ ┌────▼──────┐ ┌───────────┐
//!   │ Meta 1..n│ │ Replica 1 │ │ Replica 2 │
//!   └──────────┘ └───────────┘ └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> minikv_client::Result<()> {
//! use minikv_client::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! let client = Client::new(ClientConfig::new(["127.0.0.1:34601"]))?;
//! client.set("temp", b"h0", b"s0", b"v0", Duration::from_secs(1)).await?;
//! let value = client.get("temp", b"h0", b"s0", Duration::from_secs(1)).await?;
//! assert_eq!(value, b"v0");
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! ### CLI
//! ```bash
//! minikv-client --meta 127.0.0.1:34601 set temp h0 s0 v0
//! minikv-client --meta 127.0.0.1:34601 get temp h0 s0
//! minikv-client --meta 127.0.0.1:34601 bench temp --ops 10000 --concurrency 16
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod rpc;
pub mod testkit;

// Re-export commonly used types
pub use client::{Client, ConnectorState, Operation, TableConnector};
pub use common::{ClientConfig, Deadline, Error, ErrorKind, MetricsSnapshot, OpKind, Result};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
