// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Query-side distribution view: which node currently serves which
//! channels and segments.
//!
//! Fed by worker heartbeats (single writer); read by the replica
//! observer, which must not remove a node from a replica while this
//! view still shows the node owning anything for the collection.

use std::sync::RwLock;

use ahash::{HashMap, HashMapExt};

use petrel_types::{CollectionId, NodeId, SegmentId};

#[derive(Default)]
struct Inner {
    /// node → channel name → collection
    channels: HashMap<NodeId, HashMap<String, CollectionId>>,
    /// node → segment → collection
    segments: HashMap<NodeId, HashMap<SegmentId, CollectionId>>,
}

#[derive(Default)]
pub struct DistributionManager {
    inner: RwLock<Inner>,
}

impl DistributionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the channel set reported by a node.
    pub fn update_channels(&self, node: NodeId, channels: Vec<(String, CollectionId)>) {
        let mut inner = self.inner.write().expect("distribution lock poisoned");
        inner.channels.insert(node, channels.into_iter().collect());
    }

    /// Replace the segment set reported by a node.
    pub fn update_segments(&self, node: NodeId, segments: Vec<(SegmentId, CollectionId)>) {
        let mut inner = self.inner.write().expect("distribution lock poisoned");
        inner.segments.insert(node, segments.into_iter().collect());
    }

    pub fn remove_node(&self, node: NodeId) {
        let mut inner = self.inner.write().expect("distribution lock poisoned");
        inner.channels.remove(&node);
        inner.segments.remove(&node);
    }

    pub fn channel_count(&self, collection: CollectionId, node: NodeId) -> usize {
        let inner = self.inner.read().expect("distribution lock poisoned");
        inner
            .channels
            .get(&node)
            .map(|chs| chs.values().filter(|c| **c == collection).count())
            .unwrap_or(0)
    }

    pub fn segment_count(&self, collection: CollectionId, node: NodeId) -> usize {
        let inner = self.inner.read().expect("distribution lock poisoned");
        inner
            .segments
            .get(&node)
            .map(|segs| segs.values().filter(|c| **c == collection).count())
            .unwrap_or(0)
    }

    /// True when the distribution shows the node serving nothing for
    /// the collection; the precondition for removing it from a
    /// replica.
    pub fn is_empty_for(&self, collection: CollectionId, node: NodeId) -> bool {
        self.channel_count(collection, node) == 0 && self.segment_count(collection, node) == 0
    }

    /// Nodes currently serving the given channel of a collection.
    pub fn channel_holders(&self, collection: CollectionId, channel: &str) -> Vec<NodeId> {
        let inner = self.inner.read().expect("distribution lock poisoned");
        inner
            .channels
            .iter()
            .filter(|(_, chs)| chs.get(channel).is_some_and(|c| *c == collection))
            .map(|(node, _)| *node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[test]
    fn counts_are_scoped_by_collection() {
        let dist = DistributionManager::new();
        let node = NodeId::new(5);
        dist.update_channels(
            node,
            vec![
                ("ch-1".to_owned(), CollectionId::new(1)),
                ("ch-2".to_owned(), CollectionId::new(2)),
            ],
        );
        dist.update_segments(node, vec![(SegmentId::new(10), CollectionId::new(1))]);

        assert_eq!(dist.channel_count(CollectionId::new(1), node), 1);
        assert_eq!(dist.segment_count(CollectionId::new(2), node), 0);
        assert!(!dist.is_empty_for(CollectionId::new(1), node));
        assert!(dist.is_empty_for(CollectionId::new(3), node));

        dist.update_channels(node, Vec::new());
        dist.update_segments(node, Vec::new());
        assert!(dist.is_empty_for(CollectionId::new(1), node));
    }

    #[test]
    fn channel_holders_match_exact_channel() {
        let dist = DistributionManager::new();
        dist.update_channels(
            NodeId::new(1),
            vec![("ch-1".to_owned(), CollectionId::new(1))],
        );
        dist.update_channels(
            NodeId::new(2),
            vec![("ch-1".to_owned(), CollectionId::new(2))],
        );
        assert_that!(
            dist.channel_holders(CollectionId::new(1), "ch-1"),
            elements_are![eq(&NodeId::new(1))]
        );
    }
}
