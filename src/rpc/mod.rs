//! RPC plumbing between the client and cluster nodes
//!
//! - `message`: request/response types for meta and replica servers
//! - `codec`: length-prefixed bincode frames
//! - `connection`: one multiplexed TCP connection

pub mod codec;
pub mod connection;
pub mod message;

pub use connection::RpcConnection;
pub use message::{
    Frame, Gpid, KeyRef, MetaStatus, PartitionConfig, QueryConfigResponse, ReplicaResponse,
    ReplicaStatus, Request, Response,
};
