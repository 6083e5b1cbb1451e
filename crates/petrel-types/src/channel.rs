// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Logical ingest channels and their assignment state machine
//! vocabulary.

use crate::{CollectionId, NodeId, OpId};

/// Coordinator-side state of a channel assignment.
///
/// A channel starts in `Standby` (parked on the buffer sentinel or on
/// a node awaiting promotion) and is driven towards the terminal
/// `Watched` through `ToWatch`/`Watching`. Releases run through
/// `ToRelease`/`Releasing` back to `Standby`. `Legacy` marks
/// assignments recovered on coordinator restart whose watch is assumed
/// to be in effect and verified lazily.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ChannelState {
    Standby = 0,
    ToWatch = 1,
    Watching = 2,
    Watched = 3,
    ToRelease = 4,
    Releasing = 5,
    Legacy = 6,
}

/// Wire-level progress states reported by ingest workers for a channel
/// operation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ChannelOpState {
    ToWatch = 0,
    Watching = 1,
    WatchSuccess = 2,
    WatchFailure = 3,
    ToRelease = 4,
    Releasing = 5,
    ReleaseSuccess = 6,
    ReleaseFailure = 7,
}

/// Persisted channel assignment row. There is at most one row per
/// channel across all node prefixes; moving a channel between nodes is
/// a single transactional save-and-remove.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelAssignment {
    #[prost(string, tag = "1")]
    pub channel: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub collection_id: u64,
    #[prost(uint64, tag = "3")]
    pub node_id: u64,
    #[prost(enumeration = "ChannelState", tag = "4")]
    pub state: i32,
    #[prost(uint64, tag = "5")]
    pub op_id: u64,
    /// Schema snapshot shipped with watch requests. Empty when the
    /// assignment was recovered from a store written before the schema
    /// was attached; refreshed lazily before the next notification.
    #[prost(bytes = "bytes", tag = "6")]
    pub schema: ::prost::bytes::Bytes,
}

impl ChannelAssignment {
    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    pub fn op(&self) -> OpId {
        OpId::new(self.op_id)
    }

    pub fn channel_state(&self) -> ChannelState {
        ChannelState::try_from(self.state).unwrap_or_default()
    }
}

/// A watch or release intent delivered to an ingest worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOpKind {
    Watch,
    Release,
}

/// Progress report for a channel operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOpProgress {
    pub state: ChannelOpState,
    pub progress: u8,
}
