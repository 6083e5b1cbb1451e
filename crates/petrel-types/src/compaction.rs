// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Compaction plan records and their lifecycle vocabulary.

use crate::{CollectionId, NodeId, PartitionId, PlanId, SegmentId, TriggerId};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum CompactionType {
    MixCompaction = 0,
    Level0DeleteCompaction = 1,
    ClusteringCompaction = 2,
}

/// Lifecycle of a compaction task.
///
/// `Pipelining` tasks wait in the inspector queue; `Executing` tasks
/// run on a worker. Terminal outcomes (`Completed`, `Failed`,
/// `Timeout`) pass through cleanup before the record becomes
/// `Cleaned` and eligible for garbage collection.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum CompactionTaskState {
    Pipelining = 0,
    Executing = 1,
    Completed = 2,
    Failed = 3,
    Timeout = 4,
    Cleaned = 5,
}

impl CompactionTaskState {
    /// Terminal for execution; cleanup may still be pending.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            CompactionTaskState::Completed
                | CompactionTaskState::Failed
                | CompactionTaskState::Timeout
                | CompactionTaskState::Cleaned
        )
    }
}

/// A contiguous block of pre-allocated result-segment ids.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct IdRange {
    #[prost(uint64, tag = "1")]
    pub begin: u64,
    /// Inclusive end.
    #[prost(uint64, tag = "2")]
    pub end: u64,
}

/// Persisted compaction plan record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactionTaskRecord {
    #[prost(uint64, tag = "1")]
    pub plan_id: u64,
    #[prost(uint64, tag = "2")]
    pub trigger_id: u64,
    #[prost(enumeration = "CompactionType", tag = "3")]
    pub r#type: i32,
    #[prost(enumeration = "CompactionTaskState", tag = "4")]
    pub state: i32,
    #[prost(uint64, tag = "5")]
    pub collection_id: u64,
    #[prost(uint64, tag = "6")]
    pub partition_id: u64,
    #[prost(string, tag = "7")]
    pub channel: ::prost::alloc::string::String,
    #[prost(uint64, repeated, tag = "8")]
    pub input_segments: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "9")]
    pub result_segments: ::prost::alloc::vec::Vec<u64>,
    #[prost(message, optional, tag = "10")]
    pub pre_allocated_segments: ::core::option::Option<IdRange>,
    /// Worker the task is assigned to; zero until scheduled.
    #[prost(uint64, tag = "11")]
    pub node_id: u64,
    /// Unix seconds at which the task started executing.
    #[prost(uint64, tag = "12")]
    pub start_time: u64,
    #[prost(uint32, tag = "13")]
    pub timeout_seconds: u32,
    #[prost(uint64, tag = "14")]
    pub total_rows: u64,
    /// Upper bound on a result segment's size.
    #[prost(uint64, tag = "15")]
    pub max_size: u64,
    /// Collection TTL in seconds, zero when unset.
    #[prost(uint64, tag = "16")]
    pub collection_ttl_seconds: u64,
    /// Clustering key field id; only set for clustering compactions.
    #[prost(uint64, optional, tag = "17")]
    pub clustering_key_field: ::core::option::Option<u64>,
    /// Unix seconds at which the task reached a terminal state.
    #[prost(uint64, tag = "18")]
    pub end_time: u64,
}

impl CompactionTaskRecord {
    pub fn plan(&self) -> PlanId {
        PlanId::new(self.plan_id)
    }

    pub fn trigger(&self) -> TriggerId {
        TriggerId::new(self.trigger_id)
    }

    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId::new(self.partition_id)
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    pub fn task_type(&self) -> CompactionType {
        CompactionType::try_from(self.r#type).unwrap_or_default()
    }

    pub fn task_state(&self) -> CompactionTaskState {
        CompactionTaskState::try_from(self.state).unwrap_or_default()
    }

    pub fn inputs(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.input_segments.iter().copied().map(SegmentId::new)
    }
}

/// Result of polling a compaction task on its worker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompactionPlanResult {
    pub plan_id: PlanId,
    pub state: CompactionTaskState,
    pub channel: String,
    /// Output segments reported by the worker on completion.
    pub segments: Vec<CompactionResultSegment>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionResultSegment {
    pub segment_id: SegmentId,
    pub num_rows: u64,
    pub size_bytes: u64,
}
