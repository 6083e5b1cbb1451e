// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Metadata-store key layout.
//!
//! Keys are slash-delimited paths under stable prefixes. Channel
//! assignments are keyed by owning node so a node's channels are one
//! prefix scan; everything else is keyed by primary id.

use bytestring::ByteString;

use crate::{CollectionId, DatabaseId, NodeId, PartitionId, PlanId, ReplicaId, SegmentId};

pub const CHANNEL_STORE_PREFIX: &str = "channel_store";
pub const COMPACTION_TASK_PREFIX: &str = "compaction-task";
pub const COLLECTION_PREFIX: &str = "collection";
pub const PARTITION_PREFIX: &str = "partition";
pub const REPLICA_PREFIX: &str = "replica";
pub const SEGMENT_PREFIX: &str = "segment";
pub const NODE_PREFIX: &str = "node";
pub const ID_ALLOCATOR_KEY: &str = "id-allocator/high-water-mark";

pub fn channel_assignment_key(node: NodeId, channel: &str) -> ByteString {
    ByteString::from(format!(
        "{CHANNEL_STORE_PREFIX}/{}/{channel}",
        node.as_u64()
    ))
}

pub fn channel_store_prefix() -> ByteString {
    ByteString::from_static("channel_store/")
}

pub fn channel_node_prefix(node: NodeId) -> ByteString {
    ByteString::from(format!("{CHANNEL_STORE_PREFIX}/{}/", node.as_u64()))
}

pub fn compaction_task_key(plan: PlanId) -> ByteString {
    ByteString::from(format!("{COMPACTION_TASK_PREFIX}/{}", plan.as_u64()))
}

pub fn compaction_task_prefix() -> ByteString {
    ByteString::from_static("compaction-task/")
}

pub fn collection_key(collection: CollectionId) -> ByteString {
    ByteString::from(format!("{COLLECTION_PREFIX}/{}", collection.as_u64()))
}

pub fn collection_prefix() -> ByteString {
    ByteString::from_static("collection/")
}

pub fn partition_key(collection: CollectionId, partition: PartitionId) -> ByteString {
    ByteString::from(format!(
        "{PARTITION_PREFIX}/{}/{}",
        collection.as_u64(),
        partition.as_u64()
    ))
}

pub fn partition_collection_prefix(collection: CollectionId) -> ByteString {
    ByteString::from(format!("{PARTITION_PREFIX}/{}/", collection.as_u64()))
}

pub fn partition_prefix() -> ByteString {
    ByteString::from_static("partition/")
}

pub fn replica_key(replica: ReplicaId) -> ByteString {
    ByteString::from(format!("{REPLICA_PREFIX}/{}", replica.as_u64()))
}

pub fn replica_prefix() -> ByteString {
    ByteString::from_static("replica/")
}

pub fn segment_key(segment: SegmentId) -> ByteString {
    ByteString::from(format!("{SEGMENT_PREFIX}/{}", segment.as_u64()))
}

pub fn segment_prefix() -> ByteString {
    ByteString::from_static("segment/")
}

pub const DATABASE_PREFIX: &str = "database";

pub fn database_key(db: DatabaseId) -> ByteString {
    ByteString::from(format!("{DATABASE_PREFIX}/{}", db.as_u64()))
}

pub fn database_prefix() -> ByteString {
    ByteString::from_static("database/")
}

pub fn node_key(node: NodeId) -> ByteString {
    ByteString::from(format!("{NODE_PREFIX}/{}", node.as_u64()))
}

pub fn node_prefix() -> ByteString {
    ByteString::from_static("node/")
}

pub fn id_allocator_key() -> ByteString {
    ByteString::from_static(ID_ALLOCATOR_KEY)
}

/// Splits a channel-store key back into its node id and channel name.
pub fn parse_channel_assignment_key(key: &str) -> Option<(NodeId, &str)> {
    let rest = key.strip_prefix(CHANNEL_STORE_PREFIX)?.strip_prefix('/')?;
    let (node, channel) = rest.split_once('/')?;
    let node = node.parse::<u64>().ok()?;
    Some((NodeId::new(node), channel))
}
