// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Immutable data segments as the compaction planner sees them.

use crate::{CollectionId, PartitionId, SegmentId};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum SegmentLevel {
    /// Buffered delete tombstones.
    L0 = 0,
    /// Regular flushed data.
    L1 = 1,
    /// Large compacted output.
    L2 = 2,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum SegmentState {
    Growing = 0,
    Sealed = 1,
    Flushing = 2,
    Flushed = 3,
    Dropped = 4,
}

impl SegmentState {
    /// Flushed or still flushing; both are compaction candidates.
    pub fn is_flush(self) -> bool {
        matches!(self, SegmentState::Flushed | SegmentState::Flushing)
    }
}

/// A single persisted log file of a segment. Binlogs hold row data,
/// deltalogs hold delete tombstones.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogFile {
    #[prost(uint64, tag = "1")]
    pub log_id: u64,
    #[prost(uint64, tag = "2")]
    pub entries: u64,
    #[prost(uint64, tag = "3")]
    pub size_bytes: u64,
    /// Largest row timestamp covered by this file; drives TTL expiry.
    #[prost(uint64, tag = "4")]
    pub timestamp_to: u64,
}

/// Persisted segment catalog entry.
///
/// The `compacting` flag is deliberately absent: it is coordinator
/// runtime state, rebuilt from live compaction tasks on restart.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SegmentRecord {
    #[prost(uint64, tag = "1")]
    pub segment_id: u64,
    #[prost(uint64, tag = "2")]
    pub collection_id: u64,
    #[prost(uint64, tag = "3")]
    pub partition_id: u64,
    #[prost(string, tag = "4")]
    pub channel: ::prost::alloc::string::String,
    #[prost(enumeration = "SegmentLevel", tag = "5")]
    pub level: i32,
    #[prost(enumeration = "SegmentState", tag = "6")]
    pub state: i32,
    #[prost(uint64, tag = "7")]
    pub num_rows: u64,
    #[prost(message, repeated, tag = "8")]
    pub binlogs: ::prost::alloc::vec::Vec<LogFile>,
    #[prost(message, repeated, tag = "9")]
    pub deltalogs: ::prost::alloc::vec::Vec<LogFile>,
    #[prost(bool, tag = "10")]
    pub created_by_compaction: bool,
    /// Input segments this one was compacted from.
    #[prost(uint64, repeated, tag = "11")]
    pub compaction_from: ::prost::alloc::vec::Vec<u64>,
    #[prost(bool, tag = "12")]
    pub is_importing: bool,
    #[prost(bool, tag = "13")]
    pub is_invisible: bool,
    /// Index engine version the segment's index was built with.
    #[prost(int32, tag = "14")]
    pub index_version: i32,
}

impl SegmentRecord {
    pub fn id(&self) -> SegmentId {
        SegmentId::new(self.segment_id)
    }

    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId::new(self.partition_id)
    }

    pub fn segment_level(&self) -> SegmentLevel {
        SegmentLevel::try_from(self.level).unwrap_or_default()
    }

    pub fn segment_state(&self) -> SegmentState {
        SegmentState::try_from(self.state).unwrap_or_default()
    }

    /// Total stored size, data plus tombstones.
    pub fn size_bytes(&self) -> u64 {
        self.binlog_size_bytes() + self.deltalog_size_bytes()
    }

    pub fn binlog_size_bytes(&self) -> u64 {
        self.binlogs.iter().map(|l| l.size_bytes).sum()
    }

    pub fn deltalog_size_bytes(&self) -> u64 {
        self.deltalogs.iter().map(|l| l.size_bytes).sum()
    }

    pub fn deltalog_count(&self) -> usize {
        self.deltalogs.len()
    }

    pub fn deleted_rows(&self) -> u64 {
        self.deltalogs.iter().map(|l| l.entries).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(entries: u64, size: u64) -> LogFile {
        LogFile {
            log_id: 1,
            entries,
            size_bytes: size,
            timestamp_to: 0,
        }
    }

    #[test]
    fn size_aggregates_binlogs_and_deltalogs() {
        let segment = SegmentRecord {
            segment_id: 1,
            binlogs: vec![log(100, 4096), log(50, 1024)],
            deltalogs: vec![log(10, 256)],
            ..Default::default()
        };
        assert_eq!(segment.binlog_size_bytes(), 5120);
        assert_eq!(segment.deltalog_size_bytes(), 256);
        assert_eq!(segment.size_bytes(), 5376);
        assert_eq!(segment.deleted_rows(), 10);
    }

    #[test]
    fn flush_states() {
        assert!(SegmentState::Flushed.is_flush());
        assert!(SegmentState::Flushing.is_flush());
        assert!(!SegmentState::Growing.is_flush());
        assert!(!SegmentState::Dropped.is_flush());
    }
}
