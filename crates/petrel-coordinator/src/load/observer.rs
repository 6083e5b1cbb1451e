// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Collection observer: flips collections from `Loading` to `Loaded`
//! once every replica covers the collection's channels.

use std::sync::{Arc, Mutex};

use ahash::HashSet;
use tracing::{info, warn};

use petrel_types::replica::LoadStatus;
use petrel_types::CollectionId;

use crate::cluster::DistributionManager;
use crate::load::targets::TargetManager;
use crate::meta::{CollectionsMeta, ReplicaManager};

pub struct CollectionObserver {
    collections: Arc<CollectionsMeta>,
    replicas: Arc<ReplicaManager>,
    dist: Arc<DistributionManager>,
    targets: Arc<TargetManager>,
    loading: Mutex<HashSet<CollectionId>>,
}

impl CollectionObserver {
    pub fn new(
        collections: Arc<CollectionsMeta>,
        replicas: Arc<ReplicaManager>,
        dist: Arc<DistributionManager>,
        targets: Arc<TargetManager>,
    ) -> Self {
        Self {
            collections,
            replicas,
            dist,
            targets,
            loading: Mutex::new(HashSet::default()),
        }
    }

    /// Register a collection whose load progress should be tracked.
    pub fn load_collection(&self, collection: CollectionId) {
        self.loading.lock().unwrap().insert(collection);
    }

    pub fn load_partitions(&self, collection: CollectionId, _partitions: Vec<petrel_types::PartitionId>) {
        self.loading.lock().unwrap().insert(collection);
    }

    /// Pick up in-flight loads after a coordinator restart.
    pub fn recover(&self) {
        let mut loading = self.loading.lock().unwrap();
        for record in self.collections.list_collections() {
            if record.load_status() == LoadStatus::Loading {
                loading.insert(record.collection());
            }
        }
    }

    /// Check every tracked collection once; completed loads flip to
    /// `Loaded` and promote their next target.
    pub async fn observe_once(&self) {
        let tracked: Vec<CollectionId> = self.loading.lock().unwrap().iter().copied().collect();
        for collection in tracked {
            if self.is_load_complete(collection) {
                if let Err(err) = self
                    .collections
                    .set_load_status(collection, LoadStatus::Loaded)
                    .await
                {
                    warn!(%collection, error = %err, "failed flipping collection to loaded");
                    continue;
                }
                self.targets.promote_next(collection);
                self.loading.lock().unwrap().remove(&collection);
                info!(%collection, "collection loaded");
            }
        }
    }

    // Every replica must have every channel of the collection served
    // by one of its nodes.
    fn is_load_complete(&self, collection: CollectionId) -> bool {
        let Some(record) = self.collections.get_collection(collection) else {
            // released while loading; stop tracking
            self.loading.lock().unwrap().remove(&collection);
            return false;
        };
        let replicas = self.replicas.get_by_collection(collection);
        if replicas.is_empty() {
            return false;
        }
        replicas.iter().all(|replica| {
            record.vchannels.iter().all(|channel| {
                self.dist
                    .channel_holders(collection, channel)
                    .iter()
                    .any(|node| replica.contains(*node))
            })
        })
    }
}
