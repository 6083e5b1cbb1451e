// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Compaction trigger: decides when to compact and builds plans.
//!
//! A periodic global tick and per-segment flush signals feed one
//! bounded single-consumer queue. Non-forced signals are dropped when
//! the queue is full; forced (manual) compaction bypasses the queue
//! and surfaces back-pressure to the caller.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use petrel_types::compaction::{
    CompactionTaskRecord, CompactionTaskState, CompactionType, IdRange,
};
use petrel_types::config::CompactionOptions;
use petrel_types::properties;
use petrel_types::segment::SegmentRecord;
use petrel_types::tso::TsoTimestamp;
use petrel_types::{CollectionId, PartitionId, SegmentId, TriggerId};

use crate::cluster::{IndexEngineVersion, TimestampOracle};
use crate::compaction::inspector::{CompactionInspector, InspectorError};
use crate::compaction::packer::{squeeze_into_buckets, SegmentPacker};
use crate::id_alloc::{AllocError, IdAllocator};
use crate::meta::{CollectionsMeta, SegmentsMeta};

const SIGNAL_QUEUE_CAPACITY: usize = 100;

/// Safety cap on inputs per plan; not a tuning knob.
const MAX_SEGMENTS_PER_PLAN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("compaction task queue is full")]
    QueueFull,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Clone, Debug)]
pub struct CompactionSignal {
    pub id: TriggerId,
    pub is_force: bool,
    pub is_global: bool,
    pub collection: Option<CollectionId>,
    pub partition: Option<PartitionId>,
    pub channel: Option<String>,
    pub segment: Option<SegmentId>,
}

/// TTL window of one planning pass.
#[derive(Clone, Copy, Debug)]
struct CompactTime {
    start: TsoTimestamp,
    /// Rows whose timestamps fall below this are expired; zero when
    /// the collection has no TTL.
    expire: TsoTimestamp,
}

pub struct CompactionTrigger {
    segments: Arc<SegmentsMeta>,
    collections: Arc<CollectionsMeta>,
    inspector: Arc<CompactionInspector>,
    alloc: Arc<IdAllocator>,
    oracle: Arc<dyn TimestampOracle>,
    index_version: Arc<IndexEngineVersion>,
    options: CompactionOptions,
    signals_tx: mpsc::Sender<CompactionSignal>,
    signals_rx: Mutex<Option<mpsc::Receiver<CompactionSignal>>>,
}

impl CompactionTrigger {
    pub fn new(
        segments: Arc<SegmentsMeta>,
        collections: Arc<CollectionsMeta>,
        inspector: Arc<CompactionInspector>,
        alloc: Arc<IdAllocator>,
        oracle: Arc<dyn TimestampOracle>,
        index_version: Arc<IndexEngineVersion>,
        options: CompactionOptions,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        Self {
            segments,
            collections,
            inspector,
            alloc,
            oracle,
            index_version,
            options,
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
        }
    }

    /// Signal that a segment was flushed; the channel-partition group
    /// around it becomes a planning candidate. Dropped silently when
    /// the signal queue is full.
    pub async fn trigger_single(
        &self,
        collection: CollectionId,
        partition: PartitionId,
        segment: SegmentId,
        channel: String,
    ) -> Result<(), TriggerError> {
        if !self.options.enable_compaction || !self.options.enable_auto_compaction {
            return Ok(());
        }
        let id = TriggerId::new(self.alloc.alloc_one().await?);
        let signal = CompactionSignal {
            id,
            is_force: false,
            is_global: false,
            collection: Some(collection),
            partition: Some(partition),
            channel: Some(channel.clone()),
            segment: Some(segment),
        };
        if self.signals_tx.try_send(signal).is_err() {
            info!(%collection, %segment, channel, "no space to queue compaction signal");
        }
        Ok(())
    }

    /// User-initiated compaction of a collection. Forced: bypasses the
    /// auto-compaction gate, and queue overflow surfaces to the
    /// caller.
    pub async fn trigger_manual(
        &self,
        collection: CollectionId,
    ) -> Result<TriggerId, TriggerError> {
        let id = TriggerId::new(self.alloc.alloc_one().await?);
        let signal = CompactionSignal {
            id,
            is_force: true,
            is_global: true,
            collection: Some(collection),
            partition: None,
            channel: None,
            segment: None,
        };
        self.handle_global_signal(&signal).await?;
        Ok(id)
    }

    /// One periodic planning pass over everything.
    pub async fn trigger_global(&self) -> Result<(), TriggerError> {
        if !self.options.enable_compaction || !self.options.enable_auto_compaction {
            return Ok(());
        }
        let id = TriggerId::new(self.alloc.alloc_one().await?);
        let signal = CompactionSignal {
            id,
            is_force: false,
            is_global: true,
            collection: None,
            partition: None,
            channel: None,
            segment: None,
        };
        if self.signals_tx.try_send(signal).is_err() {
            debug!("compaction signal queue full, skipping global tick");
        }
        Ok(())
    }

    /// Consume signals until cancelled; the global tick runs on its
    /// own interval.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self
            .signals_rx
            .lock()
            .await
            .take()
            .expect("trigger can only run once");
        let mut interval = tokio::time::interval(*self.options.mix_trigger_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.trigger_global().await {
                        warn!(error = %err, "unable to trigger compaction");
                    }
                }
                signal = rx.recv() => {
                    let Some(signal) = signal else { return };
                    let result = if signal.is_global {
                        self.handle_global_signal(&signal).await
                    } else {
                        self.handle_segment_signal(&signal).await
                    };
                    if let Err(err) = result {
                        warn!(trigger = %signal.id, error = %err, "compaction signal failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("compaction trigger stopped");
                    return;
                }
            }
        }
    }

    pub(crate) async fn handle_global_signal(
        &self,
        signal: &CompactionSignal,
    ) -> Result<(), TriggerError> {
        let groups = self.segments.chan_part_groups(signal.collection);
        if groups.is_empty() {
            debug!(trigger = %signal.id, "no candidate groups, skipping compaction");
            return Ok(());
        }

        for group in groups {
            if !signal.is_force && self.inspector.is_full().await {
                warn!(trigger = %signal.id, "compaction plans skipped, task queue full");
                break;
            }
            let properties = self.collections.collection_properties(group.collection);
            if !signal.is_force && !properties::auto_compaction_enabled(&properties) {
                debug!(collection = %group.collection, "collection auto compaction disabled");
                continue;
            }
            let compact_time = self.compact_time(&properties);
            self.plan_group(signal, group.collection, group.partition, &group.channel, group.segments, compact_time)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_segment_signal(
        &self,
        signal: &CompactionSignal,
    ) -> Result<(), TriggerError> {
        if self.inspector.is_full().await {
            warn!(trigger = %signal.id, "compaction plans skipped, task queue full");
            return Ok(());
        }
        let (Some(collection), Some(partition), Some(channel)) =
            (signal.collection, signal.partition, signal.channel.as_deref())
        else {
            return Ok(());
        };
        let candidates = self.segments.candidates_for(channel, partition);
        if candidates.is_empty() {
            debug!(trigger = %signal.id, channel, "no candidate segments for flush signal");
            return Ok(());
        }
        let properties = self.collections.collection_properties(collection);
        if !properties::auto_compaction_enabled(&properties) {
            return Ok(());
        }
        let compact_time = self.compact_time(&properties);
        self.plan_group(signal, collection, partition, channel, candidates, compact_time)
            .await
    }

    fn compact_time(&self, properties: &petrel_types::properties::Properties) -> CompactTime {
        let start = self.oracle.now();
        let expire = match properties::collection_ttl(properties) {
            Some(ttl) => start.sub_duration(ttl),
            None => TsoTimestamp::ZERO,
        };
        CompactTime { start, expire }
    }

    async fn plan_group(
        &self,
        signal: &CompactionSignal,
        collection: CollectionId,
        partition: PartitionId,
        channel: &str,
        segments: Vec<SegmentRecord>,
        compact_time: CompactTime,
    ) -> Result<(), TriggerError> {
        let expected_size = self.options.expected_segment_size;
        let buckets = self.generate_plans(segments, signal.is_force, compact_time, expected_size);

        for bucket in buckets {
            if !signal.is_force && self.inspector.is_full().await {
                warn!(trigger = %signal.id, "remaining plans skipped, task queue full");
                break;
            }
            let total_rows: u64 = bucket.iter().map(|s| s.num_rows).sum();
            let input_segments: Vec<u64> = bucket.iter().map(|s| s.segment_id).collect();
            let result_slots = self.options.pre_allocated_result_segments;
            let (plan_id, end_id) = self.alloc.alloc_block(1 + result_slots).await?;

            let record = CompactionTaskRecord {
                plan_id,
                trigger_id: signal.id.as_u64(),
                r#type: CompactionType::MixCompaction as i32,
                state: CompactionTaskState::Pipelining as i32,
                collection_id: collection.as_u64(),
                partition_id: partition.as_u64(),
                channel: channel.to_owned(),
                input_segments: input_segments.clone(),
                pre_allocated_segments: Some(IdRange {
                    begin: plan_id + 1,
                    end: end_id,
                }),
                start_time: compact_time.start.physical_ms() / 1000,
                timeout_seconds: self.options.timeout.as_secs() as u32,
                total_rows,
                max_size: (expected_size as f64 * self.options.expansion_rate) as u64,
                ..Default::default()
            };
            match self.inspector.enqueue_compaction(record).await {
                Ok(()) => {
                    info!(
                        trigger = %signal.id,
                        plan = plan_id,
                        %collection,
                        channel,
                        inputs = input_segments.len(),
                        "generated compaction plan"
                    );
                }
                Err(InspectorError::QueueFull) if signal.is_force => {
                    return Err(TriggerError::QueueFull);
                }
                Err(err) => {
                    warn!(
                        trigger = %signal.id,
                        plan = plan_id,
                        error = %err,
                        "failed to enqueue compaction task"
                    );
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Classify candidates and pack them into plan buckets.
    fn generate_plans(
        &self,
        segments: Vec<SegmentRecord>,
        is_force: bool,
        compact_time: CompactTime,
        expected_size: u64,
    ) -> Vec<Vec<SegmentRecord>> {
        // compacting a segment before its index is built would throw
        // the build away; forced compaction overrides
        let segments: Vec<SegmentRecord> = if self.options.index_based_compaction && !is_force {
            segments.into_iter().filter(|s| s.index_version > 0).collect()
        } else {
            segments
        };
        if segments.is_empty() {
            return Vec::new();
        }

        let mut prioritized = Vec::new();
        let mut small = Vec::new();
        let mut neutral = Vec::new();
        for segment in segments {
            if is_force || self.should_do_single_compaction(&segment, compact_time) {
                prioritized.push(segment);
            } else if self.is_small_segment(&segment, expected_size) {
                small.push(segment);
            } else {
                neutral.push(segment);
            }
        }
        let classified = (prioritized.len(), small.len(), neutral.len());

        let min_segments = self.options.min_segments_to_merge;
        let satisfied_size =
            (expected_size as f64 * self.options.compactable_proportion) as u64;
        let max_left = expected_size - satisfied_size.min(expected_size);
        let expanded_size = (expected_size as f64 * self.options.expansion_rate) as u64;
        let max_expanded_left = expanded_size - satisfied_size.min(expanded_size);

        let mut buckets: Vec<Vec<SegmentRecord>> = Vec::new();
        let mut to_update = SegmentPacker::new(prioritized);
        let mut to_merge = SegmentPacker::new(small);
        let mut to_pack = SegmentPacker::new(neutral);

        // 1. merge small segments into full buckets
        while let Some((bucket, _)) =
            to_merge.pack(expected_size, max_left, min_segments, MAX_SEGMENTS_PER_PLAN)
        {
            buckets.push(bucket);
        }

        // 2. pack prioritized candidates with small segments; no bound
        //    on the leftover because every prioritized segment must go
        while let Some((bucket, _)) =
            to_update.pack_with(expected_size, u64::MAX, 0, MAX_SEGMENTS_PER_PLAN, &mut to_merge)
        {
            buckets.push(bucket);
        }
        // oversized prioritized segments compact alone
        for segment in to_update.into_candidates() {
            buckets.push(vec![segment]);
        }

        // 3. merge whatever small segments remain, then squeeze the
        //    expandable rest into existing buckets
        while let Some((bucket, _)) =
            to_merge.pack(expected_size, u64::MAX, min_segments, MAX_SEGMENTS_PER_PLAN)
        {
            buckets.push(bucket);
        }
        let expandable_bound =
            (expected_size as f64 * (self.options.expansion_rate - 1.0)) as u64;
        let (expandable, kept): (Vec<_>, Vec<_>) = to_merge
            .into_candidates()
            .into_iter()
            .partition(|s| s.size_bytes() < expandable_bound);
        let remaining = squeeze_into_buckets(expandable, &mut buckets, expanded_size);
        let mut to_merge = SegmentPacker::new(kept.into_iter().chain(remaining).collect());

        // 4. pack remaining smalls with neutral segments up to the
        //    expanded bound
        while let Some((bucket, _)) = to_merge.pack_with(
            expanded_size,
            max_expanded_left,
            min_segments,
            MAX_SEGMENTS_PER_PLAN,
            &mut to_pack,
        ) {
            buckets.push(bucket);
        }

        // single-segment buckets only make sense for prioritized work
        buckets.retain(|b| b.len() > 1 || is_force || b.iter().any(|s| self.should_do_single_compaction(s, compact_time)));

        if !buckets.is_empty() {
            info!(
                buckets = buckets.len(),
                prioritized = classified.0,
                small = classified.1,
                neutral = classified.2,
                "generated nontrivial compaction buckets"
            );
        }
        buckets
    }

    fn is_small_segment(&self, segment: &SegmentRecord, expected_size: u64) -> bool {
        segment.size_bytes() < (expected_size as f64 * self.options.small_proportion) as u64
    }

    /// Single-compaction rules: a segment qualifies on its own when it
    /// carries too many deltalogs, too many deletes, too much expired
    /// data, or an index built by an outdated engine.
    fn should_do_single_compaction(
        &self,
        segment: &SegmentRecord,
        compact_time: CompactTime,
    ) -> bool {
        if segment.deltalog_count() > self.options.single_deltalog_max_num {
            info!(
                segment = %segment.id(),
                deltalogs = segment.deltalog_count(),
                "deltalog count above threshold, prioritizing compaction"
            );
            return true;
        }

        let deleted_rows = segment.deleted_rows();
        let deltalog_size = segment.deltalog_size_bytes();
        if segment.num_rows > 0
            && (deleted_rows as f64 / segment.num_rows as f64
                >= self.options.single_ratio_threshold
                || deltalog_size > self.options.single_deltalog_max_size)
        {
            info!(
                segment = %segment.id(),
                deleted_rows,
                deltalog_size,
                "deleted rows above threshold, prioritizing compaction"
            );
            return true;
        }

        if compact_time.expire > TsoTimestamp::ZERO {
            let mut expired_rows = 0u64;
            let mut expired_size = 0u64;
            for log in &segment.binlogs {
                if TsoTimestamp::from(log.timestamp_to) < compact_time.expire {
                    expired_rows += log.entries;
                    expired_size += log.size_bytes;
                }
            }
            if segment.num_rows > 0
                && (expired_rows as f64 / segment.num_rows as f64
                    >= self.options.single_ratio_threshold
                    || expired_size > self.options.single_expired_max_size)
            {
                info!(
                    segment = %segment.id(),
                    expired_rows,
                    expired_size,
                    "expired rows above threshold, prioritizing compaction"
                );
                return true;
            }
        }

        if self.options.auto_upgrade_segment_index
            && segment.index_version < self.index_version.current()
        {
            info!(
                segment = %segment.id(),
                segment_index_version = segment.index_version,
                engine_version = self.index_version.current(),
                "index version out of date, prioritizing compaction"
            );
            return true;
        }

        false
    }

}
