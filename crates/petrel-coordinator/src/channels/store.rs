// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! In-memory projection of the channel assignment rows plus the set of
//! registered ingest nodes.
//!
//! There is exactly one persisted row per channel; moving a channel
//! between nodes saves the new row and removes the old one in a single
//! transactional write, which is what keeps invariant "every channel
//! appears exactly once across (node × state)" true even across
//! crashes.

use std::collections::BTreeMap;

use ahash::{HashMap, HashMapExt};
use tracing::debug;

use petrel_metadata_store::{encoded, MetaStoreClient, ReadError, WriteError};
use petrel_types::channel::{ChannelAssignment, ChannelState};
use petrel_types::keys;
use petrel_types::node::NodeMembership;
use petrel_types::NodeId;

pub(crate) struct ChannelStore {
    client: MetaStoreClient,
    channels: HashMap<String, ChannelAssignment>,
    nodes: BTreeMap<NodeId, NodeMembership>,
}

impl ChannelStore {
    pub fn new(client: MetaStoreClient) -> Self {
        Self {
            client,
            channels: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub async fn recover(&mut self) -> Result<usize, ReadError> {
        let rows = self
            .client
            .load_prefix::<ChannelAssignment>(keys::channel_store_prefix())
            .await?;
        self.channels.clear();
        for (_, assignment, _) in rows {
            self.channels
                .insert(assignment.channel.clone(), assignment);
        }
        debug!(channels = self.channels.len(), "recovered channel store");
        Ok(self.channels.len())
    }

    pub fn register_node(&mut self, node: NodeId) {
        if !node.is_buffer() {
            self.nodes.entry(node).or_insert(NodeMembership::ReadWrite);
        }
    }

    pub fn unregister_node(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    pub fn set_membership(&mut self, node: NodeId, membership: NodeMembership) {
        if let Some(current) = self.nodes.get_mut(&node) {
            *current = membership;
        }
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelAssignment> {
        self.channels.get(channel)
    }

    pub fn get_on_node(&self, node: NodeId, channel: &str) -> Option<&ChannelAssignment> {
        self.channels.get(channel).filter(|a| a.node() == node)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelAssignment> {
        self.channels.values()
    }

    pub fn channels_on(&self, node: NodeId) -> Vec<ChannelAssignment> {
        self.channels
            .values()
            .filter(|a| a.node() == node)
            .cloned()
            .collect()
    }

    pub fn in_state(&self, state: ChannelState) -> Vec<ChannelAssignment> {
        let mut rows: Vec<ChannelAssignment> = self
            .channels
            .values()
            .filter(|a| a.channel_state() == state)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.channel.cmp(&b.channel));
        rows
    }

    /// Channels counting toward a node's load: everything assigned to
    /// a real node that is not parked in Standby.
    pub fn assignment_counts(&self, eligible: NodeMembership) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self
            .nodes
            .iter()
            .filter(|(_, membership)| **membership == eligible)
            .map(|(node, _)| (*node, 0))
            .collect();
        for assignment in self.channels.values() {
            if assignment.channel_state() == ChannelState::Standby {
                continue;
            }
            if let Some(count) = counts.get_mut(&assignment.node()) {
                *count += 1;
            }
        }
        counts
    }

    /// Persist an assignment, removing the stale row when the channel
    /// moved to a different node.
    pub async fn persist(&mut self, assignment: ChannelAssignment) -> Result<(), WriteError> {
        let new_key = keys::channel_assignment_key(assignment.node(), &assignment.channel);
        let old_key = self
            .channels
            .get(&assignment.channel)
            .map(|old| keys::channel_assignment_key(old.node(), &old.channel))
            .filter(|old_key| *old_key != new_key);

        let saves = vec![encoded(new_key, &assignment)];
        let removals = old_key.into_iter().collect();
        self.client
            .multi_save_and_remove(saves, removals, Vec::new())
            .await?;
        self.channels
            .insert(assignment.channel.clone(), assignment);
        Ok(())
    }
}
