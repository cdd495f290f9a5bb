//! Request/response messages exchanged with meta and replica servers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global partition id: table app id + partition index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gpid {
    pub app_id: i32,
    pub partition_index: u32,
}

impl fmt::Display for Gpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub hash_key: Vec<u8>,
    pub sort_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask a meta server for a table's partition configuration
    QueryConfig { table: String },
    Get { gpid: Gpid, key: KeyRef },
    Set { gpid: Gpid, key: KeyRef, value: Vec<u8> },
    Del { gpid: Gpid, key: KeyRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    QueryConfig(QueryConfigResponse),
    Replica(ReplicaResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaStatus {
    Ok,
    ObjectNotFound,
    /// This meta server is not the leader
    ForwardToOthers { leader_hint: Option<String> },
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub index: u32,
    pub ballot: i64,
    /// Empty when the partition currently has no primary
    pub primary: String,
    pub secondaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfigResponse {
    pub status: MetaStatus,
    pub app_id: i32,
    pub partition_count: u32,
    pub partitions: Vec<PartitionConfig>,
}

impl QueryConfigResponse {
    pub fn with_status(status: MetaStatus) -> Self {
        Self {
            status,
            app_id: 0,
            partition_count: 0,
            partitions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Ok,
    NotFound,
    NotPrimary,
    StaleConfig,
    Busy,
    InvalidTable,
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub status: ReplicaStatus,
    /// Stored value for a successful get, empty otherwise
    pub value: Vec<u8>,
}

impl ReplicaResponse {
    pub fn status(status: ReplicaStatus) -> Self {
        Self {
            status,
            value: Vec::new(),
        }
    }
}

/// Envelope carrying the sequence id used to match responses to requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<T> {
    pub seq: u64,
    pub body: T,
}
