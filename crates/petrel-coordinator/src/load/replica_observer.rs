// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Replica observer.
//!
//! Keeps replica membership aligned with the live node set of each
//! resource group and completes node drains: a read-only node leaves a
//! replica only once the distribution shows it serving no channel and
//! no segment of the collection.

use std::sync::Arc;

use tracing::{debug, info, warn};

use petrel_types::config::LoadOptions;
use petrel_types::node::{NodeMembership, NodeRole};
use petrel_types::replica::ReplicaRecord;
use petrel_types::NodeId;
use tokio_util::sync::CancellationToken;

use crate::cluster::DistributionManager;
use crate::meta::{CollectionsMeta, ReplicaManager, ResourceManager};

pub struct ReplicaObserver {
    collections: Arc<CollectionsMeta>,
    replicas: Arc<ReplicaManager>,
    resources: Arc<ResourceManager>,
    dist: Arc<DistributionManager>,
    options: LoadOptions,
}

impl ReplicaObserver {
    pub fn new(
        collections: Arc<CollectionsMeta>,
        replicas: Arc<ReplicaManager>,
        resources: Arc<ResourceManager>,
        dist: Arc<DistributionManager>,
        options: LoadOptions,
    ) -> Self {
        Self {
            collections,
            replicas,
            resources,
            dist,
            options,
        }
    }

    /// Observer loop: ticks on the configured interval and immediately
    /// on node-change notifications.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut listener = self.resources.listen_node_changed();
        let interval = *self.options.check_node_in_replica_interval;
        info!("start check replica loop");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                result = listener.changed() => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("replica observer stopped");
                    return;
                }
            }
            self.check_nodes_in_replica().await;
        }
    }

    /// One reconcile pass over every replica of every collection.
    pub async fn check_nodes_in_replica(&self) {
        for record in self.collections.list_collections() {
            let collection = record.collection();
            for replica in self.replicas.get_by_collection(collection) {
                self.recover_replica_membership(&replica).await;
            }
            // re-read: membership recovery may have changed the records
            for replica in self.replicas.get_by_collection(collection) {
                self.drain_read_only_nodes(&replica).await;
            }
        }
    }

    // Move nodes in and out of the replica as its resource group
    // changes. New read-write group members join rw; members that left
    // the group or turned read-only demote to ro. Removal is drain's
    // job, never done here.
    async fn recover_replica_membership(&self, replica: &ReplicaRecord) {
        let group_nodes = self.resources.nodes_of_group(&replica.resource_group);
        let mut next = replica.clone();
        let mut changed = false;

        for node in &group_nodes {
            let is_rw = self.resources.membership(*node) == Some(NodeMembership::ReadWrite);
            if !is_rw {
                continue;
            }
            match self.resources.node_role(*node) {
                Some(NodeRole::Query) if !next.contains(*node) => {
                    next.add_rw(*node);
                    changed = true;
                }
                Some(NodeRole::StreamingQuery) if !next.contains_sq(*node) => {
                    next.add_rw_sq(*node);
                    changed = true;
                }
                _ => {}
            }
        }

        let rw: Vec<NodeId> = next.rw().collect();
        for node in rw {
            let left_group = !group_nodes.contains(&node);
            let read_only = self.resources.membership(node) != Some(NodeMembership::ReadWrite);
            if left_group || read_only {
                next.demote(node);
                changed = true;
            }
        }
        let rw_sq: Vec<NodeId> = next
            .rw_sq_nodes
            .iter()
            .copied()
            .map(NodeId::new)
            .collect();
        for node in rw_sq {
            let left_group = !group_nodes.contains(&node);
            let read_only = self.resources.membership(node) != Some(NodeMembership::ReadWrite);
            if left_group || read_only {
                next.demote_sq(node);
                changed = true;
            }
        }

        if changed {
            debug!(
                replica = %next.replica(),
                rw = next.rw_nodes.len(),
                ro = next.ro_nodes.len(),
                "recovered replica membership from resource group"
            );
            if let Err(err) = self.replicas.put(next).await {
                warn!(replica = %replica.replica(), error = %err, "failed persisting replica membership");
            }
        }
    }

    // The drain-completion rule: a read-only node is removed exactly
    // once the distribution shows it empty for the collection.
    async fn drain_read_only_nodes(&self, replica: &ReplicaRecord) {
        let collection = replica.collection();

        let drained: Vec<NodeId> = replica
            .ro()
            .filter(|node| self.dist.is_empty_for(collection, *node))
            .collect();
        if !drained.is_empty() {
            if let Err(err) = self.replicas.remove_nodes(replica.replica(), &drained).await {
                warn!(
                    replica = %replica.replica(),
                    error = %err,
                    "failed removing drained nodes from replica"
                );
            } else {
                info!(
                    replica = %replica.replica(),
                    nodes = ?drained,
                    "removed drained read-only nodes from replica"
                );
            }
        }

        let drained_sq: Vec<NodeId> = replica
            .ro_sq()
            .filter(|node| self.dist.is_empty_for(collection, *node))
            .collect();
        if !drained_sq.is_empty() {
            if let Err(err) = self
                .replicas
                .remove_sq_nodes(replica.replica(), &drained_sq)
                .await
            {
                warn!(
                    replica = %replica.replica(),
                    error = %err,
                    "failed removing drained streaming-query nodes"
                );
            } else {
                info!(
                    replica = %replica.replica(),
                    nodes = ?drained_sq,
                    "removed drained streaming-query nodes from replica"
                );
            }
        }
    }
}
