// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Compaction task variants.
//!
//! The planner and inspector are written against the shared capability
//! set below, not against individual variants; only cleanup differs
//! between mix, L0-delete and clustering compactions.

use tracing::debug;

use petrel_types::compaction::{
    CompactionPlanResult, CompactionTaskRecord, CompactionTaskState, CompactionType,
};
use petrel_types::segment::SegmentRecord;
use petrel_types::{NodeId, SegmentId};

use crate::cluster::{CompactionWorkerClient, WorkerError};
use crate::meta::SegmentsMeta;

#[derive(Clone, Debug)]
pub struct CompactionTask {
    record: CompactionTaskRecord,
}

impl CompactionTask {
    pub fn from_record(record: CompactionTaskRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &CompactionTaskRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut CompactionTaskRecord {
        &mut self.record
    }

    /// Detached copy of the persisted record, for callers outside the
    /// inspector lock.
    pub fn shadow_clone(&self) -> CompactionTaskRecord {
        self.record.clone()
    }

    pub fn task_type(&self) -> CompactionType {
        self.record.task_type()
    }

    pub fn state(&self) -> CompactionTaskState {
        self.record.task_state()
    }

    pub fn set_state(&mut self, state: CompactionTaskState) {
        self.record.state = state as i32;
    }

    pub fn inputs(&self) -> Vec<SegmentId> {
        self.record.inputs().collect()
    }

    pub async fn query_on_worker(
        &self,
        worker: &dyn CompactionWorkerClient,
    ) -> Result<CompactionPlanResult, WorkerError> {
        worker
            .query_compaction(self.record.node(), self.record.plan())
            .await
    }

    /// Release worker-side resources. A vanished worker has nothing
    /// left to release, so `NodeNotFound` counts as success.
    pub async fn drop_on_worker(
        &self,
        worker: &dyn CompactionWorkerClient,
    ) -> Result<(), WorkerError> {
        match worker
            .drop_compaction(self.record.node(), self.record.plan())
            .await
        {
            Ok(()) | Err(WorkerError::NodeNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Apply the cleanup effects of a terminal task. Idempotent; the
    /// inspector retries until every effect succeeds.
    pub async fn cleanup(
        &self,
        segments: &SegmentsMeta,
        worker: &dyn CompactionWorkerClient,
    ) -> Result<(), WorkerError> {
        let inputs = self.inputs();
        segments.set_compacting(&inputs, false);

        // release the worker-side plan: after the commit for completed
        // tasks, or whatever is left of it for failed and timed-out
        // ones
        self.drop_on_worker(worker).await?;

        if self.task_type() == CompactionType::ClusteringCompaction {
            self.reset_invisible_marks(segments)
                .await
                .map_err(|err| WorkerError::Transport(err.into()))?;
        }
        Ok(())
    }

    // A clustering run marks its tentative output segments invisible
    // until the partition stats are committed; an abandoned run leaves
    // them behind.
    async fn reset_invisible_marks(
        &self,
        segments: &SegmentsMeta,
    ) -> Result<(), petrel_metadata_store::WriteError> {
        let stale: Vec<SegmentRecord> = self
            .record
            .result_segments
            .iter()
            .filter_map(|id| segments.get(SegmentId::new(*id)))
            .filter(|s| s.is_invisible)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        debug!(
            plan = %self.record.plan(),
            count = stale.len(),
            "clearing invisible marks left by clustering compaction"
        );
        let visible = stale
            .into_iter()
            .map(|mut s| {
                s.is_invisible = false;
                s
            })
            .collect();
        segments.put_segments(visible).await
    }

    pub fn assigned_node(&self) -> NodeId {
        self.record.node()
    }
}
