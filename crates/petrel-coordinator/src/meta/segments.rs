// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Segment catalog.
//!
//! The `compacting` flag is runtime-only: it is rebuilt from live
//! compaction tasks on restart and never persisted, which is what
//! makes compaction cleanup idempotent.

use std::sync::Mutex;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use itertools::Itertools;
use tracing::{debug, warn};

use petrel_metadata_store::{encoded, MetaStoreClient, Precondition, ReadError, WriteError};
use petrel_types::compaction::{CompactionPlanResult, CompactionTaskRecord};
use petrel_types::keys;
use petrel_types::segment::{SegmentLevel, SegmentRecord, SegmentState};
use petrel_types::{CollectionId, PartitionId, SegmentId};

/// Segments of one (collection, partition, channel) group.
#[derive(Clone, Debug)]
pub struct ChanPartSegments {
    pub collection: CollectionId,
    pub partition: PartitionId,
    pub channel: String,
    pub segments: Vec<SegmentRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("input segment {0} not found")]
    SegmentNotFound(SegmentId),
    #[error("input segment {0} is in state {1:?}, expected a flushed segment")]
    InvalidState(SegmentId, SegmentState),
    #[error("segment {0} already feeds a live compaction plan")]
    AlreadyCompacting(SegmentId),
    #[error("input segment {0} is not marked compacting")]
    NotCompacting(SegmentId),
    #[error(transparent)]
    Store(#[from] WriteError),
}

#[derive(Default)]
struct Inner {
    segments: HashMap<SegmentId, SegmentRecord>,
    compacting: HashSet<SegmentId>,
}

pub struct SegmentsMeta {
    client: MetaStoreClient,
    inner: Mutex<Inner>,
}

impl SegmentsMeta {
    pub fn new(client: MetaStoreClient) -> Self {
        Self {
            client,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Rebuild the in-memory catalog from the store.
    pub async fn recover(&self) -> Result<usize, ReadError> {
        let records = self
            .client
            .load_prefix::<SegmentRecord>(keys::segment_prefix())
            .await?;
        let mut inner = self.inner.lock().expect("segments lock poisoned");
        inner.segments.clear();
        inner.compacting.clear();
        for (_, record, _) in records {
            inner.segments.insert(record.id(), record);
        }
        debug!(segments = inner.segments.len(), "recovered segment catalog");
        Ok(inner.segments.len())
    }

    /// Insert or replace segments (flush reports, imports).
    pub async fn put_segments(&self, records: Vec<SegmentRecord>) -> Result<(), WriteError> {
        let saves = records
            .iter()
            .map(|record| encoded(keys::segment_key(record.id()), record))
            .collect();
        self.client.multi_save(saves, Vec::new()).await?;
        let mut inner = self.inner.lock().expect("segments lock poisoned");
        for record in records {
            inner.segments.insert(record.id(), record);
        }
        Ok(())
    }

    pub fn get(&self, segment: SegmentId) -> Option<SegmentRecord> {
        let inner = self.inner.lock().expect("segments lock poisoned");
        inner.segments.get(&segment).cloned()
    }

    pub fn is_compacting(&self, segment: SegmentId) -> bool {
        let inner = self.inner.lock().expect("segments lock poisoned");
        inner.compacting.contains(&segment)
    }

    /// Candidate segments of a (channel, partition) pair passing the
    /// compaction filter.
    pub fn candidates_for(&self, channel: &str, partition: PartitionId) -> Vec<SegmentRecord> {
        let inner = self.inner.lock().expect("segments lock poisoned");
        inner
            .segments
            .values()
            .filter(|s| s.channel == channel && s.partition() == partition)
            .filter(|s| Self::is_candidate(&inner, s))
            .cloned()
            .collect()
    }

    /// All candidate segments grouped by (collection, partition,
    /// channel); restricted to one collection when given.
    pub fn chan_part_groups(&self, collection: Option<CollectionId>) -> Vec<ChanPartSegments> {
        let inner = self.inner.lock().expect("segments lock poisoned");
        inner
            .segments
            .values()
            .filter(|s| collection.is_none_or(|c| s.collection() == c))
            .filter(|s| Self::is_candidate(&inner, s))
            .map(|s| ((s.collection(), s.partition(), s.channel.clone()), s.clone()))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|((c, p, ch), _)| (c.as_u64(), p.as_u64(), ch.clone()))
            .map(|((collection, partition, channel), segments)| ChanPartSegments {
                collection,
                partition,
                channel,
                segments,
            })
            .collect()
    }

    // healthy ∧ flushed ∧ ¬compacting ∧ ¬importing ∧ L1 ∧ ¬invisible
    fn is_candidate(inner: &Inner, segment: &SegmentRecord) -> bool {
        segment.segment_state().is_flush()
            && !inner.compacting.contains(&segment.id())
            && !segment.is_importing
            && segment.segment_level() == SegmentLevel::L1
            && !segment.is_invisible
    }

    /// Atomically claim segments for a compaction task. Fails without
    /// side effects when any input is missing or already claimed; no
    /// segment may feed two live plans.
    pub fn check_and_set_compacting(&self, segments: &[SegmentId]) -> Result<(), CommitError> {
        let mut inner = self.inner.lock().expect("segments lock poisoned");
        for id in segments {
            let record = inner
                .segments
                .get(id)
                .ok_or(CommitError::SegmentNotFound(*id))?;
            if !record.segment_state().is_flush() {
                return Err(CommitError::InvalidState(*id, record.segment_state()));
            }
            if inner.compacting.contains(id) {
                return Err(CommitError::AlreadyCompacting(*id));
            }
        }
        inner.compacting.extend(segments.iter().copied());
        Ok(())
    }

    /// Clear (or set) the compacting flag; idempotent, part of task
    /// cleanup.
    pub fn set_compacting(&self, segments: &[SegmentId], compacting: bool) {
        let mut inner = self.inner.lock().expect("segments lock poisoned");
        for id in segments {
            if compacting {
                inner.compacting.insert(*id);
            } else {
                inner.compacting.remove(id);
            }
        }
    }

    /// Commit a completed compaction: validate the inputs are still
    /// claimable, insert the result segments and mark the inputs
    /// `Dropped`, all in one transactional write.
    pub async fn complete_compaction_mutation(
        &self,
        task: &CompactionTaskRecord,
        result: &CompactionPlanResult,
    ) -> Result<Vec<SegmentRecord>, CommitError> {
        let inputs: Vec<SegmentId> = task.inputs().collect();

        // validate before mutating anything
        let mut dropped = Vec::with_capacity(inputs.len());
        {
            let inner = self.inner.lock().expect("segments lock poisoned");
            for id in &inputs {
                let record = inner
                    .segments
                    .get(id)
                    .ok_or(CommitError::SegmentNotFound(*id))?;
                if record.segment_state() == SegmentState::Dropped {
                    return Err(CommitError::InvalidState(*id, SegmentState::Dropped));
                }
                if !inner.compacting.contains(id) {
                    return Err(CommitError::NotCompacting(*id));
                }
                let mut record = record.clone();
                record.state = SegmentState::Dropped as i32;
                dropped.push(record);
            }
        }

        let results: Vec<SegmentRecord> = result
            .segments
            .iter()
            .map(|out| SegmentRecord {
                segment_id: out.segment_id.as_u64(),
                collection_id: task.collection_id,
                partition_id: task.partition_id,
                channel: task.channel.clone(),
                level: SegmentLevel::L1 as i32,
                state: SegmentState::Flushed as i32,
                num_rows: out.num_rows,
                binlogs: vec![petrel_types::segment::LogFile {
                    log_id: out.segment_id.as_u64(),
                    entries: out.num_rows,
                    size_bytes: out.size_bytes,
                    timestamp_to: 0,
                }],
                created_by_compaction: true,
                compaction_from: task.input_segments.clone(),
                ..Default::default()
            })
            .collect();

        let saves = dropped
            .iter()
            .chain(results.iter())
            .map(|record| encoded(keys::segment_key(record.id()), record))
            .collect();
        self.client.multi_save(saves, Vec::new()).await?;

        let mut inner = self.inner.lock().expect("segments lock poisoned");
        for record in dropped {
            inner.compacting.remove(&record.id());
            inner.segments.insert(record.id(), record);
        }
        for record in &results {
            inner.segments.insert(record.id(), record.clone());
        }
        debug!(
            plan = %task.plan(),
            inputs = inputs.len(),
            outputs = results.len(),
            "committed compaction result"
        );
        Ok(results)
    }

    /// Segments of a collection in flushed state; feeds the target
    /// snapshots.
    pub fn flushed_segments_of(&self, collection: CollectionId) -> Vec<SegmentId> {
        let inner = self.inner.lock().expect("segments lock poisoned");
        inner
            .segments
            .values()
            .filter(|s| s.collection() == collection && s.segment_state() == SegmentState::Flushed)
            .map(|s| s.id())
            .collect()
    }

    /// Reclaim compacting flags for inputs of live tasks on restart.
    pub fn restore_compacting(&self, segments: &[SegmentId]) {
        let mut inner = self.inner.lock().expect("segments lock poisoned");
        for id in segments {
            if !inner.segments.contains_key(id) {
                warn!(segment = %id, "live compaction task references unknown segment");
            }
            inner.compacting.insert(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use petrel_metadata_store::MemoryMetaStore;
    use petrel_types::compaction::CompactionResultSegment;

    use super::*;

    fn segment(id: u64, channel: &str, partition: u64) -> SegmentRecord {
        SegmentRecord {
            segment_id: id,
            collection_id: 1,
            partition_id: partition,
            channel: channel.to_owned(),
            level: SegmentLevel::L1 as i32,
            state: SegmentState::Flushed as i32,
            num_rows: 1000,
            ..Default::default()
        }
    }

    async fn meta_with(segments: Vec<SegmentRecord>) -> SegmentsMeta {
        let meta = SegmentsMeta::new(MetaStoreClient::new(Arc::new(MemoryMetaStore::new())));
        meta.put_segments(segments).await.unwrap();
        meta
    }

    #[tokio::test]
    async fn no_two_live_plans_share_an_input() {
        let meta = meta_with(vec![segment(1, "ch", 1), segment(2, "ch", 1)]).await;
        meta.check_and_set_compacting(&[SegmentId::new(1), SegmentId::new(2)])
            .unwrap();
        let err = meta
            .check_and_set_compacting(&[SegmentId::new(2)])
            .unwrap_err();
        assert!(matches!(err, CommitError::AlreadyCompacting(_)));
        // and the failed claim left nothing half-set
        meta.set_compacting(&[SegmentId::new(1), SegmentId::new(2)], false);
        meta.check_and_set_compacting(&[SegmentId::new(2)]).unwrap();
    }

    #[tokio::test]
    async fn candidates_exclude_compacting_and_l0() {
        let mut l0 = segment(3, "ch", 1);
        l0.level = SegmentLevel::L0 as i32;
        let mut importing = segment(4, "ch", 1);
        importing.is_importing = true;
        let meta = meta_with(vec![segment(1, "ch", 1), segment(2, "ch", 1), l0, importing]).await;
        meta.set_compacting(&[SegmentId::new(2)], true);

        let candidates = meta.candidates_for("ch", PartitionId::new(1));
        let ids: Vec<u64> = candidates.iter().map(|s| s.segment_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn commit_marks_inputs_dropped_and_inserts_outputs() {
        let meta = meta_with(vec![segment(1, "ch", 1), segment(2, "ch", 1)]).await;
        meta.check_and_set_compacting(&[SegmentId::new(1), SegmentId::new(2)])
            .unwrap();

        let task = CompactionTaskRecord {
            plan_id: 100,
            collection_id: 1,
            partition_id: 1,
            channel: "ch".to_owned(),
            input_segments: vec![1, 2],
            ..Default::default()
        };
        let result = CompactionPlanResult {
            plan_id: task.plan(),
            segments: vec![CompactionResultSegment {
                segment_id: SegmentId::new(101),
                num_rows: 2000,
                size_bytes: 1 << 20,
            }],
            ..Default::default()
        };
        let outputs = meta.complete_compaction_mutation(&task, &result).await.unwrap();
        assert_eq!(outputs.len(), 1);

        assert_eq!(
            meta.get(SegmentId::new(1)).unwrap().segment_state(),
            SegmentState::Dropped
        );
        let output = meta.get(SegmentId::new(101)).unwrap();
        assert!(output.created_by_compaction);
        assert_eq!(output.compaction_from, vec![1, 2]);
        assert!(!meta.is_compacting(SegmentId::new(1)));

        // running the commit again fails validation (inputs dropped)
        let err = meta
            .complete_compaction_mutation(&task, &result)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::InvalidState(_, SegmentState::Dropped)));
    }

    #[tokio::test]
    async fn recover_rebuilds_from_store() {
        let store = Arc::new(MemoryMetaStore::new());
        let meta = SegmentsMeta::new(MetaStoreClient::new(store.clone()));
        meta.put_segments(vec![segment(7, "ch", 2)]).await.unwrap();

        let recovered = SegmentsMeta::new(MetaStoreClient::new(store));
        assert_eq!(recovered.recover().await.unwrap(), 1);
        assert_eq!(recovered.get(SegmentId::new(7)).unwrap().partition_id, 2);
    }
}
