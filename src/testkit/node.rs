//! Mock meta and replica servers
//!
//! Each node accepts connections on its own listener and answers frames one
//! at a time, in order, from the shared cluster state.

use super::{ClusterState, MetaMode};
use crate::common::{partition_hash, Shutdown};
use crate::rpc::codec::{read_frame, write_frame};
use crate::rpc::{
    Frame, MetaStatus, QueryConfigResponse, ReplicaResponse, ReplicaStatus, Request, Response,
};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Meta(usize),
    Replica(usize),
}

pub(crate) async fn serve(
    listener: TcpListener,
    role: Role,
    state: Arc<Mutex<ClusterState>>,
    mut shutdown: Shutdown,
    kick: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("{:?} accepted {}", role, peer);
                    tokio::spawn(handle_connection(
                        stream,
                        role,
                        state.clone(),
                        shutdown.clone(),
                        kick.clone(),
                    ));
                }
                Err(e) => tracing::warn!("{:?} accept failed: {}", role, e),
            },
        }
    }
    tracing::debug!("{:?} stopped", role);
}

async fn handle_connection(
    stream: TcpStream,
    role: Role,
    state: Arc<Mutex<ClusterState>>,
    mut shutdown: Shutdown,
    mut kick: watch::Receiver<u64>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    kick.borrow_and_update();

    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => return,
            _ = kick.changed() => {
                tracing::debug!("{:?} dropping connection", role);
                return;
            }
            frame = read_frame::<_, Frame<Request>>(&mut reader) => frame,
        };
        let request = match frame {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("{:?} read failed: {}", role, e);
                return;
            }
        };

        let reply = {
            let mut state = state.lock().unwrap();
            match role {
                Role::Meta(idx) => meta_reply(&mut state, idx, request.body),
                Role::Replica(idx) => Some(replica_reply(&mut state, idx, request.body)),
            }
        };
        // a hung meta swallows the request
        let Some(body) = reply else { continue };

        let frame = Frame {
            seq: request.seq,
            body,
        };
        if write_frame(&mut writer, &frame).await.is_err() {
            return;
        }
    }
}

fn meta_reply(state: &mut ClusterState, idx: usize, request: Request) -> Option<Response> {
    let mode = state.meta_modes[idx];
    if mode == MetaMode::Hang {
        return None;
    }
    let Request::QueryConfig { table } = request else {
        return Some(Response::Replica(ReplicaResponse::status(
            ReplicaStatus::Internal("not a replica server".into()),
        )));
    };
    *state.queries.entry(table.clone()).or_default() += 1;

    let resp = if mode == MetaMode::Busy {
        QueryConfigResponse::with_status(MetaStatus::Busy)
    } else if idx != state.leader {
        QueryConfigResponse::with_status(MetaStatus::ForwardToOthers {
            leader_hint: state.meta_addrs.get(state.leader).cloned(),
        })
    } else {
        match state.tables.get(&table) {
            Some(t) => QueryConfigResponse {
                status: MetaStatus::Ok,
                app_id: t.app_id,
                partition_count: t.partitions.len() as u32,
                partitions: t.partitions.clone(),
            },
            None => QueryConfigResponse::with_status(MetaStatus::ObjectNotFound),
        }
    };
    Some(Response::QueryConfig(resp))
}

enum Action {
    Get,
    Set(Vec<u8>),
    Del,
}

fn replica_reply(state: &mut ClusterState, idx: usize, request: Request) -> Response {
    Response::Replica(replica_status(state, idx, request))
}

fn replica_status(state: &mut ClusterState, idx: usize, request: Request) -> ReplicaResponse {
    if let Some(status) = state.injected.get_mut(&idx).and_then(|q| q.pop_front()) {
        return ReplicaResponse::status(status);
    }

    let (gpid, key, action) = match request {
        Request::Get { gpid, key } => (gpid, key, Action::Get),
        Request::Set { gpid, key, value } => (gpid, key, Action::Set(value)),
        Request::Del { gpid, key } => (gpid, key, Action::Del),
        Request::QueryConfig { .. } => {
            return ReplicaResponse::status(ReplicaStatus::Internal(
                "not a meta server".into(),
            ))
        }
    };

    let addr = &state.replica_addrs[idx];
    let Some(table) = state.tables.values().find(|t| t.app_id == gpid.app_id) else {
        return ReplicaResponse::status(ReplicaStatus::InvalidTable);
    };
    let Some(partition) = table.partitions.get(gpid.partition_index as usize) else {
        return ReplicaResponse::status(ReplicaStatus::InvalidTable);
    };
    if partition.primary != *addr {
        return ReplicaResponse::status(ReplicaStatus::NotPrimary);
    }
    let expected = partition_hash(&key.hash_key, table.partitions.len() as u32);
    if expected != gpid.partition_index {
        return ReplicaResponse::status(ReplicaStatus::Internal(format!(
            "key belongs to partition {}, not {}",
            expected, gpid.partition_index
        )));
    }

    let store_key = (gpid.app_id, key.hash_key, key.sort_key);
    match action {
        Action::Get => match state.store.get(&store_key) {
            Some(value) => ReplicaResponse {
                status: ReplicaStatus::Ok,
                value: value.clone(),
            },
            None => ReplicaResponse::status(ReplicaStatus::NotFound),
        },
        Action::Set(value) => {
            state.store.insert(store_key, value);
            ReplicaResponse::status(ReplicaStatus::Ok)
        }
        Action::Del => {
            state.store.remove(&store_key);
            ReplicaResponse::status(ReplicaStatus::Ok)
        }
    }
}
