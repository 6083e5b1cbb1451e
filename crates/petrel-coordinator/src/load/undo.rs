// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Undo list of a load job.

use std::sync::Arc;

use tracing::{info, warn};

use petrel_types::{CollectionId, PartitionId};

use crate::load::targets::TargetManager;
use crate::meta::{CollectionsMeta, ReplicaManager};

/// Records which load-job steps ran so a failure can rewind exactly
/// those, in reverse order: added partitions, then the new collection,
/// then spawned replicas, then the target update.
#[derive(Default)]
pub struct UndoList {
    pub collection: Option<CollectionId>,
    pub lack_partitions: Vec<PartitionId>,
    pub is_replica_created: bool,
    pub is_new_collection: bool,
    pub is_target_updated: bool,
}

impl UndoList {
    pub async fn rollback(
        &self,
        collections: &Arc<CollectionsMeta>,
        replicas: &Arc<ReplicaManager>,
        targets: &Arc<TargetManager>,
    ) {
        let Some(collection) = self.collection else {
            return;
        };
        info!(%collection, "rolling back load job");

        if !self.lack_partitions.is_empty() && !self.is_new_collection {
            if let Err(err) = collections
                .remove_partitions(collection, &self.lack_partitions)
                .await
            {
                warn!(%collection, error = %err, "rollback: failed removing partitions");
            }
        }

        if self.is_new_collection {
            if let Err(err) = collections.remove_collection(collection).await {
                warn!(%collection, error = %err, "rollback: failed removing collection");
            }
        }

        if self.is_replica_created {
            if let Err(err) = replicas.remove_collection(collection).await {
                warn!(%collection, error = %err, "rollback: failed removing replicas");
            }
        }

        if self.is_target_updated {
            targets.remove_collection(collection);
        }
    }
}
