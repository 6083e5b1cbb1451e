// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Resource groups: named subsets of query workers over which
//! replicas are placed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::info;

use petrel_metadata_store::{MetaStoreClient, Precondition, ReadError, WriteError};
use petrel_types::keys;
use petrel_types::node::{NodeMembership, NodeRecord, NodeRole};
use petrel_types::replica::DEFAULT_RESOURCE_GROUP;
use petrel_types::NodeId;

#[derive(Default)]
struct Inner {
    /// group name → member nodes (read-write and read-only alike)
    groups: BTreeMap<String, BTreeSet<NodeId>>,
    nodes: BTreeMap<NodeId, NodeRecord>,
}

/// Single writer of query-node membership; observers subscribe to the
/// change listener instead of polling.
pub struct ResourceManager {
    client: MetaStoreClient,
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

impl ResourceManager {
    pub fn new(client: MetaStoreClient) -> Self {
        let mut inner = Inner::default();
        inner
            .groups
            .insert(DEFAULT_RESOURCE_GROUP.to_owned(), BTreeSet::new());
        let (changed, _) = watch::channel(0);
        Self {
            client,
            inner: Mutex::new(inner),
            changed,
        }
    }

    pub async fn recover(&self) -> Result<(), ReadError> {
        let records = self
            .client
            .load_prefix::<NodeRecord>(keys::node_prefix())
            .await?;
        let mut inner = self.inner.lock().expect("resource manager lock poisoned");
        for (_, record, _) in records {
            if record.node_role() == NodeRole::Ingest {
                continue;
            }
            let group = if record.resource_group.is_empty() {
                DEFAULT_RESOURCE_GROUP.to_owned()
            } else {
                record.resource_group.clone()
            };
            inner.groups.entry(group).or_default().insert(record.node());
            inner.nodes.insert(record.node(), record);
        }
        Ok(())
    }

    /// Register a query node into a resource group.
    pub async fn add_node(
        &self,
        node: NodeId,
        role: NodeRole,
        address: String,
        group: &str,
    ) -> Result<(), WriteError> {
        let record = NodeRecord {
            node_id: node.as_u64(),
            address,
            role: role as i32,
            membership: NodeMembership::ReadWrite as i32,
            resource_group: group.to_owned(),
        };
        self.client
            .put(keys::node_key(node), &record, Precondition::None)
            .await?;
        {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            inner.groups.entry(group.to_owned()).or_default().insert(node);
            inner.nodes.insert(node, record);
        }
        info!(%node, group, "query node registered");
        self.notify();
        Ok(())
    }

    /// Mark a node read-only; the replica observer drains it and
    /// removes it from replicas once the distribution shows it empty.
    pub async fn mark_read_only(&self, node: NodeId) -> Result<(), WriteError> {
        let record = {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            let Some(record) = inner.nodes.get_mut(&node) else {
                return Ok(());
            };
            record.membership = NodeMembership::ReadOnly as i32;
            record.clone()
        };
        self.client
            .put(keys::node_key(node), &record, Precondition::None)
            .await?;
        info!(%node, "query node marked read-only");
        self.notify();
        Ok(())
    }

    /// Drop a node from the registry entirely.
    pub async fn remove_node(&self, node: NodeId) -> Result<(), WriteError> {
        self.client
            .delete(keys::node_key(node), Precondition::None)
            .await?;
        {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            inner.nodes.remove(&node);
            for members in inner.groups.values_mut() {
                members.remove(&node);
            }
        }
        info!(%node, "query node removed");
        self.notify();
        Ok(())
    }

    pub fn membership(&self, node: NodeId) -> Option<NodeMembership> {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        inner.nodes.get(&node).map(|n| n.node_membership())
    }

    pub fn node_role(&self, node: NodeId) -> Option<NodeRole> {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        inner.nodes.get(&node).map(|n| n.node_role())
    }

    /// All members of a group, including read-only ones.
    pub fn nodes_of_group(&self, group: &str) -> BTreeSet<NodeId> {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        inner.groups.get(group).cloned().unwrap_or_default()
    }

    /// Members eligible for new assignments.
    pub fn writable_nodes_of_group(&self, group: &str) -> BTreeSet<NodeId> {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        inner
            .groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|node| {
                        inner
                            .nodes
                            .get(node)
                            .is_some_and(|n| n.node_membership() == NodeMembership::ReadWrite)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn group_exists(&self, group: &str) -> bool {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        inner.groups.contains_key(group)
    }

    pub fn ensure_group(&self, group: &str) {
        let mut inner = self.inner.lock().expect("resource manager lock poisoned");
        inner.groups.entry(group.to_owned()).or_default();
    }

    /// Versioned node-change listener; the value bumps on every
    /// membership mutation.
    pub fn listen_node_changed(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }
}
