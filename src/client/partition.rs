//! Partition maps as served by the meta servers

use crate::common::{Error, Result};
use crate::rpc::{Gpid, MetaStatus, QueryConfigResponse};
use serde::Serialize;

/// Routing information for one partition. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    pub index: u32,
    pub primary: Option<String>,
    pub secondaries: Vec<String>,
    pub ballot: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionMap {
    table: String,
    app_id: i32,
    partitions: Vec<PartitionDescriptor>,
}

impl PartitionMap {
    /// Build a map from a meta server's answer.
    ///
    /// `ObjectNotFound` and zero partitions mean the table does not exist; a
    /// descriptor list that is not exactly `0..partition_count` is a protocol
    /// violation.
    pub fn from_response(table: &str, resp: QueryConfigResponse) -> Result<Self> {
        match resp.status {
            MetaStatus::Ok => {}
            MetaStatus::ObjectNotFound => {
                return Err(Error::InvalidTable(format!("table {} not found", table)))
            }
            other => {
                return Err(Error::Internal(format!(
                    "cannot build partition map for {} from status {:?}",
                    table, other
                )))
            }
        }

        if resp.partition_count == 0 {
            return Err(Error::InvalidTable(format!(
                "table {} has no partitions",
                table
            )));
        }
        if resp.partitions.len() != resp.partition_count as usize {
            return Err(Error::Internal(format!(
                "table {}: meta announced {} partitions but sent {}",
                table,
                resp.partition_count,
                resp.partitions.len()
            )));
        }

        let mut partitions: Vec<PartitionDescriptor> = resp
            .partitions
            .into_iter()
            .map(|p| PartitionDescriptor {
                index: p.index,
                primary: (!p.primary.is_empty()).then_some(p.primary),
                secondaries: p.secondaries,
                ballot: p.ballot,
            })
            .collect();
        partitions.sort_by_key(|p| p.index);
        if let Some((pos, p)) = partitions
            .iter()
            .enumerate()
            .find(|(pos, p)| p.index as usize != *pos)
        {
            return Err(Error::Internal(format!(
                "table {}: partition indexes are not dense (slot {} holds {})",
                table, pos, p.index
            )));
        }

        Ok(Self {
            table: table.to_string(),
            app_id: resp.app_id,
            partitions,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition(&self, index: u32) -> Option<&PartitionDescriptor> {
        self.partitions.get(index as usize)
    }

    pub fn partitions(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    pub fn gpid(&self, index: u32) -> Gpid {
        Gpid {
            app_id: self.app_id,
            partition_index: index,
        }
    }

    /// Combine a freshly fetched map with the installed one.
    ///
    /// The partition count and app id must match. A descriptor whose ballot
    /// is older than the installed one is ignored, so ballots never move
    /// backward.
    pub fn merge_newer(&self, fresh: PartitionMap) -> Result<PartitionMap> {
        if fresh.partition_count() != self.partition_count() {
            return Err(Error::Internal(format!(
                "table {}: partition count changed from {} to {}",
                self.table,
                self.partition_count(),
                fresh.partition_count()
            )));
        }
        if fresh.app_id != self.app_id {
            return Err(Error::Internal(format!(
                "table {}: app id changed from {} to {}",
                self.table, self.app_id, fresh.app_id
            )));
        }

        let partitions = fresh
            .partitions
            .into_iter()
            .zip(&self.partitions)
            .map(|(new, old)| {
                if new.ballot < old.ballot {
                    tracing::debug!(
                        "Ignoring stale descriptor for {}.{} (ballot {} < {})",
                        self.table,
                        new.index,
                        new.ballot,
                        old.ballot
                    );
                    old.clone()
                } else {
                    new
                }
            })
            .collect();

        Ok(PartitionMap {
            table: self.table.clone(),
            app_id: self.app_id,
            partitions,
        })
    }
}
