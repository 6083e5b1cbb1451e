// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Replica placement records.

use std::collections::BTreeSet;
use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};
use tracing::{debug, info};

use petrel_metadata_store::{encoded, MetaStoreClient, Precondition, ReadError, WriteError};
use petrel_types::keys;
use petrel_types::replica::ReplicaRecord;
use petrel_types::{CollectionId, NodeId, ReplicaId};

use crate::id_alloc::{AllocError, IdAllocator};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Store(#[from] WriteError),
}

pub struct ReplicaManager {
    client: MetaStoreClient,
    replicas: Mutex<HashMap<ReplicaId, ReplicaRecord>>,
}

impl ReplicaManager {
    pub fn new(client: MetaStoreClient) -> Self {
        Self {
            client,
            replicas: Mutex::new(HashMap::new()),
        }
    }

    pub async fn recover(&self) -> Result<usize, ReadError> {
        let records = self
            .client
            .load_prefix::<ReplicaRecord>(keys::replica_prefix())
            .await?;
        let mut replicas = self.replicas.lock().expect("replicas lock poisoned");
        replicas.clear();
        for (_, record, _) in records {
            replicas.insert(record.replica(), record);
        }
        debug!(replicas = replicas.len(), "recovered replica placements");
        Ok(replicas.len())
    }

    /// Create `replica_number` empty replicas for a collection spread
    /// across the requested resource groups as evenly as possible.
    /// Replica counts per group differ by at most one, with the
    /// remainder going to the lexicographically smallest groups.
    pub async fn spawn_replicas(
        &self,
        collection: CollectionId,
        resource_groups: &[String],
        replica_number: u32,
        alloc: &IdAllocator,
    ) -> Result<Vec<ReplicaRecord>, ReplicaError> {
        assert!(!resource_groups.is_empty());
        let mut groups: Vec<&String> = resource_groups.iter().collect();
        groups.sort();
        groups.dedup();

        let (begin, _) = alloc.alloc_block(u64::from(replica_number)).await?;
        let mut records = Vec::with_capacity(replica_number as usize);
        for i in 0..replica_number {
            let group = groups[(i as usize) % groups.len()];
            records.push(ReplicaRecord {
                replica_id: begin + u64::from(i),
                collection_id: collection.as_u64(),
                resource_group: group.clone(),
                ..Default::default()
            });
        }

        let saves = records
            .iter()
            .map(|r| encoded(keys::replica_key(r.replica()), r))
            .collect();
        let preconditions = records
            .iter()
            .map(|r| (keys::replica_key(r.replica()), Precondition::DoesNotExist))
            .collect();
        self.client.multi_save(saves, preconditions).await.map_err(WriteError::from)?;

        let mut replicas = self.replicas.lock().expect("replicas lock poisoned");
        for record in &records {
            replicas.insert(record.replica(), record.clone());
        }
        info!(%collection, count = records.len(), "spawned replicas");
        Ok(records)
    }

    pub fn get(&self, replica: ReplicaId) -> Option<ReplicaRecord> {
        let replicas = self.replicas.lock().expect("replicas lock poisoned");
        replicas.get(&replica).cloned()
    }

    pub fn get_by_collection(&self, collection: CollectionId) -> Vec<ReplicaRecord> {
        let replicas = self.replicas.lock().expect("replicas lock poisoned");
        let mut records: Vec<_> = replicas
            .values()
            .filter(|r| r.collection() == collection)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.replica_id);
        records
    }

    /// Resource groups currently used by a collection's replicas.
    pub fn resource_groups_of_collection(&self, collection: CollectionId) -> BTreeSet<String> {
        let replicas = self.replicas.lock().expect("replicas lock poisoned");
        replicas
            .values()
            .filter(|r| r.collection() == collection)
            .map(|r| r.resource_group.clone())
            .collect()
    }

    pub async fn put(&self, record: ReplicaRecord) -> Result<(), WriteError> {
        self.client
            .put(keys::replica_key(record.replica()), &record, Precondition::None)
            .await?;
        let mut replicas = self.replicas.lock().expect("replicas lock poisoned");
        replicas.insert(record.replica(), record);
        Ok(())
    }

    /// Remove drained nodes from a replica. The caller must have
    /// verified against the distribution that the nodes serve nothing
    /// for this collection.
    pub async fn remove_nodes(
        &self,
        replica: ReplicaId,
        nodes: &[NodeId],
    ) -> Result<(), WriteError> {
        let Some(mut record) = self.get(replica) else {
            return Ok(());
        };
        for node in nodes {
            record.remove_node(*node);
        }
        self.put(record).await
    }

    /// Remove drained streaming-query nodes from a replica.
    pub async fn remove_sq_nodes(
        &self,
        replica: ReplicaId,
        nodes: &[NodeId],
    ) -> Result<(), WriteError> {
        let Some(mut record) = self.get(replica) else {
            return Ok(());
        };
        for node in nodes {
            record.remove_sq(*node);
        }
        self.put(record).await
    }

    pub async fn remove_collection(&self, collection: CollectionId) -> Result<(), WriteError> {
        let removals = {
            let replicas = self.replicas.lock().expect("replicas lock poisoned");
            replicas
                .values()
                .filter(|r| r.collection() == collection)
                .map(|r| keys::replica_key(r.replica()))
                .collect::<Vec<_>>()
        };
        if removals.is_empty() {
            return Ok(());
        }
        self.client
            .multi_save_and_remove(Vec::new(), removals, Vec::new())
            .await?;
        let mut replicas = self.replicas.lock().expect("replicas lock poisoned");
        replicas.retain(|_, r| r.collection() != collection);
        Ok(())
    }
}
