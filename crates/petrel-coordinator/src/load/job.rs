// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Load jobs.
//!
//! A load job turns "load collection C with N replicas in resource
//! groups G" into persisted collection/partition/replica records. The
//! job is atomic through its undo list and idempotent: running it
//! twice with identical arguments yields the same meta state.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use petrel_types::replica::{
    CollectionRecord, LoadStatus, LoadType, PartitionRecord, DEFAULT_RESOURCE_GROUP,
};
use petrel_types::{CollectionId, PartitionId};

use crate::cluster::{CollectionBroker, TimestampOracle, WorkerError};
use crate::id_alloc::IdAllocator;
use crate::load::observer::CollectionObserver;
use crate::load::targets::TargetManager;
use crate::load::undo::UndoList;
use crate::meta::replicas::ReplicaError;
use crate::meta::{CollectionsMeta, ReplicaManager, ResourceManager};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),
    #[error("failed describing collection: {0}")]
    Broker(#[from] WorkerError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Store(#[from] petrel_metadata_store::WriteError),
}

/// Shared dependencies of load jobs, wired once at coordinator
/// construction.
#[derive(Clone)]
pub struct LoadContext {
    pub collections: Arc<CollectionsMeta>,
    pub replicas: Arc<ReplicaManager>,
    pub resources: Arc<ResourceManager>,
    pub broker: Arc<dyn CollectionBroker>,
    pub targets: Arc<TargetManager>,
    pub observer: Arc<CollectionObserver>,
    pub alloc: Arc<IdAllocator>,
    pub oracle: Arc<dyn TimestampOracle>,
}

#[derive(Clone, Debug)]
pub struct LoadCollectionRequest {
    pub collection: CollectionId,
    pub replica_number: u32,
    pub resource_groups: Vec<String>,
    pub load_fields: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct LoadPartitionsRequest {
    pub collection: CollectionId,
    pub partitions: Vec<PartitionId>,
    pub replica_number: u32,
    pub resource_groups: Vec<String>,
    pub load_fields: Vec<u64>,
}

pub struct LoadCollectionJob {
    request: LoadCollectionRequest,
    ctx: LoadContext,
    undo: UndoList,
}

impl LoadCollectionJob {
    pub fn new(request: LoadCollectionRequest, ctx: LoadContext) -> Self {
        Self {
            request,
            ctx,
            undo: UndoList::default(),
        }
    }

    pub async fn run(mut self) -> Result<(), LoadError> {
        normalize(&mut self.request.replica_number, &mut self.request.resource_groups);
        let description = pre_execute(
            &self.ctx,
            self.request.collection,
            self.request.replica_number,
            &self.request.resource_groups,
        )
        .await?;

        let result = self.execute(description).await;
        if let Err(err) = &result {
            warn!(collection = %self.request.collection, error = %err, "load collection failed");
            self.undo
                .rollback(&self.ctx.collections, &self.ctx.replicas, &self.ctx.targets)
                .await;
        }
        result
    }

    async fn execute(
        &mut self,
        description: crate::cluster::CollectionDescription,
    ) -> Result<(), LoadError> {
        let request = &self.request;
        let ctx = &self.ctx;
        let collection = request.collection;

        let target_partitions = ctx.broker.list_partitions(collection).await?;

        let loaded: BTreeSet<PartitionId> = ctx
            .collections
            .partitions_of(collection)
            .into_iter()
            .map(|p| p.partition())
            .collect();
        let lacking: Vec<PartitionId> = target_partitions
            .into_iter()
            .filter(|p| !loaded.contains(p))
            .collect();
        if lacking.is_empty() {
            return Ok(());
        }
        self.undo.collection = Some(collection);
        self.undo.lack_partitions = lacking.clone();
        info!(%collection, partitions = lacking.len(), "found partitions to load");

        let existed = ctx.collections.exists(collection);
        if !existed {
            // clear stale replicas of a previous incarnation
            ctx.replicas.remove_collection(collection).await?;
        }

        if ctx.replicas.get_by_collection(collection).is_empty() {
            for group in &request.resource_groups {
                ctx.resources.ensure_group(group);
            }
            ctx.replicas
                .spawn_replicas(
                    collection,
                    &request.resource_groups,
                    request.replica_number,
                    &ctx.alloc,
                )
                .await?;
            self.undo.is_replica_created = true;
        }

        let created_at = ctx.oracle.now().physical_ms() / 1000;
        let partitions = partition_records(collection, &lacking, request.replica_number, created_at);
        let record = CollectionRecord {
            collection_id: collection.as_u64(),
            db_id: description.db_id.as_u64(),
            replica_number: request.replica_number,
            status: LoadStatus::Loading as i32,
            load_type: LoadType::LoadCollection as i32,
            load_fields: request.load_fields.clone(),
            created_at,
            vchannels: description.vchannels.clone(),
            ..Default::default()
        };
        self.undo.is_new_collection = true;
        ctx.collections.put_collection(record, partitions).await?;

        // target refresh failures are tolerated here: the target
        // observer pulls periodically anyway
        ctx.targets.update_next_target(collection);
        self.undo.is_target_updated = true;

        ctx.observer.load_collection(collection);
        Ok(())
    }
}

pub struct LoadPartitionsJob {
    request: LoadPartitionsRequest,
    ctx: LoadContext,
    undo: UndoList,
}

impl LoadPartitionsJob {
    pub fn new(request: LoadPartitionsRequest, ctx: LoadContext) -> Self {
        Self {
            request,
            ctx,
            undo: UndoList::default(),
        }
    }

    pub async fn run(mut self) -> Result<(), LoadError> {
        normalize(&mut self.request.replica_number, &mut self.request.resource_groups);
        let description = pre_execute(
            &self.ctx,
            self.request.collection,
            self.request.replica_number,
            &self.request.resource_groups,
        )
        .await?;

        let result = self.execute(description).await;
        if let Err(err) = &result {
            warn!(collection = %self.request.collection, error = %err, "load partitions failed");
            self.undo
                .rollback(&self.ctx.collections, &self.ctx.replicas, &self.ctx.targets)
                .await;
        }
        result
    }

    async fn execute(
        &mut self,
        description: crate::cluster::CollectionDescription,
    ) -> Result<(), LoadError> {
        let request = &self.request;
        let ctx = &self.ctx;
        let collection = request.collection;

        let loaded: BTreeSet<PartitionId> = ctx
            .collections
            .partitions_of(collection)
            .into_iter()
            .map(|p| p.partition())
            .collect();
        let lacking: Vec<PartitionId> = request
            .partitions
            .iter()
            .copied()
            .filter(|p| !loaded.contains(p))
            .collect();
        if lacking.is_empty() {
            return Ok(());
        }
        self.undo.collection = Some(collection);
        self.undo.lack_partitions = lacking.clone();
        info!(%collection, partitions = lacking.len(), "found partitions to load");

        let existed = ctx.collections.exists(collection);
        if !existed {
            ctx.replicas.remove_collection(collection).await?;
        }

        if ctx.replicas.get_by_collection(collection).is_empty() {
            for group in &request.resource_groups {
                ctx.resources.ensure_group(group);
            }
            ctx.replicas
                .spawn_replicas(
                    collection,
                    &request.resource_groups,
                    request.replica_number,
                    &ctx.alloc,
                )
                .await?;
            self.undo.is_replica_created = true;
        }

        let created_at = ctx.oracle.now().physical_ms() / 1000;
        let partitions = partition_records(collection, &lacking, request.replica_number, created_at);
        if existed {
            ctx.collections.put_partitions(partitions).await?;
        } else {
            self.undo.is_new_collection = true;
            let record = CollectionRecord {
                collection_id: collection.as_u64(),
                db_id: description.db_id.as_u64(),
                replica_number: request.replica_number,
                status: LoadStatus::Loading as i32,
                load_type: LoadType::LoadPartition as i32,
                load_fields: request.load_fields.clone(),
                created_at,
                vchannels: description.vchannels.clone(),
                ..Default::default()
            };
            ctx.collections.put_collection(record, partitions).await?;
        }

        ctx.targets.update_next_target(collection);
        self.undo.is_target_updated = true;

        ctx.observer.load_partitions(collection, lacking);
        Ok(())
    }
}

/// Release a collection: drop its load meta, replicas and targets.
/// The inverse of the load jobs; idempotent on an absent collection.
pub struct ReleaseCollectionJob {
    collection: CollectionId,
    ctx: LoadContext,
}

impl ReleaseCollectionJob {
    pub fn new(collection: CollectionId, ctx: LoadContext) -> Self {
        Self { collection, ctx }
    }

    pub async fn run(self) -> Result<(), LoadError> {
        let collection = self.collection;
        if !self.ctx.collections.exists(collection) {
            return Ok(());
        }
        self.ctx.collections.remove_collection(collection).await?;
        self.ctx.replicas.remove_collection(collection).await?;
        self.ctx.targets.remove_collection(collection);
        info!(%collection, "collection released");
        Ok(())
    }
}

fn normalize(replica_number: &mut u32, resource_groups: &mut Vec<String>) {
    if *replica_number == 0 {
        info!("request does not indicate the number of replicas, defaulting to 1");
        *replica_number = 1;
    }
    if resource_groups.is_empty() {
        resource_groups.push(DEFAULT_RESOURCE_GROUP.to_owned());
    }
}

/// Shared preconditions: a loaded collection can neither change its
/// replica count nor its resource groups without a release first.
async fn pre_execute(
    ctx: &LoadContext,
    collection: CollectionId,
    replica_number: u32,
    resource_groups: &[String],
) -> Result<crate::cluster::CollectionDescription, LoadError> {
    let description = ctx.broker.describe_collection(collection).await?;

    let Some(existing) = ctx.collections.get_collection(collection) else {
        return Ok(description);
    };

    if existing.replica_number != replica_number {
        return Err(LoadError::ParameterInvalid(format!(
            "collection loaded with {} replicas, release it before changing to {}",
            existing.replica_number, replica_number
        )));
    }

    let used: BTreeSet<String> = ctx.replicas.resource_groups_of_collection(collection);
    let requested: BTreeSet<String> = resource_groups.iter().cloned().collect();
    if !used.is_empty() && used != requested {
        return Err(LoadError::ParameterInvalid(format!(
            "collection loaded in resource groups {used:?}, release it before moving to {requested:?}"
        )));
    }

    Ok(description)
}

fn partition_records(
    collection: CollectionId,
    partitions: &[PartitionId],
    replica_number: u32,
    created_at: u64,
) -> Vec<PartitionRecord> {
    partitions
        .iter()
        .map(|p| PartitionRecord {
            collection_id: collection.as_u64(),
            partition_id: p.as_u64(),
            replica_number,
            status: LoadStatus::Loading as i32,
            created_at,
        })
        .collect()
}
