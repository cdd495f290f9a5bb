//! Client runtime
//!
//! The client is responsible for:
//! - Table resolution (single meta query per table, cached connectors)
//! - Routing (CRC-64 over the hash key)
//! - Stale-routing recovery (partition map refresh + bounded retry)
//! - Pooled, multiplexed sessions to meta and replica servers

pub mod connector;
pub mod facade;
pub mod flight;
pub mod meta;
pub mod partition;
pub mod registry;
pub mod router;
pub mod session;

pub use connector::{ConnectorState, Operation, TableConnector};
pub use facade::Client;
pub use partition::{PartitionDescriptor, PartitionMap};
