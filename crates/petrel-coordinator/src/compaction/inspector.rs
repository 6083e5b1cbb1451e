// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Compaction inspector: bounded task queue, executing and cleaning
//! sets, and the periodic pass that drives every task to `Cleaned`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use petrel_metadata_store::{MetaStoreClient, Precondition, ReadError, WriteError};
use petrel_types::compaction::{
    CompactionTaskRecord, CompactionTaskState, CompactionType,
};
use petrel_types::config::CompactionOptions;
use petrel_types::keys;
use petrel_types::{NodeId, PlanId, TriggerId};

use crate::cluster::{CompactionWorkerClient, TimestampOracle, WorkerError};
use crate::compaction::task::CompactionTask;
use crate::meta::segments::CommitError;
use crate::meta::SegmentsMeta;

/// Resolves which worker currently watches a channel; compaction tasks
/// run on the channel's watcher.
#[async_trait::async_trait]
pub trait ChannelWatcherLookup: Send + Sync {
    async fn watcher_of(&self, channel: &str) -> Option<NodeId>;
}

#[async_trait::async_trait]
impl ChannelWatcherLookup for crate::channels::ChannelManager {
    async fn watcher_of(&self, channel: &str) -> Option<NodeId> {
        self.find_watcher(channel).await.ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    #[error("compaction task queue is full")]
    QueueFull,
    #[error("task {0} is not in pipelining state")]
    InvalidState(PlanId),
    #[error(transparent)]
    Segments(#[from] CommitError),
    #[error(transparent)]
    Store(#[from] WriteError),
    #[error(transparent)]
    Recovery(#[from] ReadError),
}

/// Aggregated view over the tasks of one trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionInfo {
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
}

#[derive(Default)]
struct Inner {
    /// Pipelining tasks, ordered by plan id.
    queue: BTreeMap<PlanId, CompactionTask>,
    executing: HashMap<PlanId, CompactionTask>,
    /// Terminal tasks whose cleanup effects have not all succeeded yet.
    cleaning: HashMap<PlanId, CompactionTask>,
}

pub struct CompactionInspector {
    client: MetaStoreClient,
    segments: Arc<SegmentsMeta>,
    worker: Arc<dyn CompactionWorkerClient>,
    watcher: Arc<dyn ChannelWatcherLookup>,
    oracle: Arc<dyn TimestampOracle>,
    options: CompactionOptions,
    inner: Mutex<Inner>,
}

impl CompactionInspector {
    pub fn new(
        client: MetaStoreClient,
        segments: Arc<SegmentsMeta>,
        worker: Arc<dyn CompactionWorkerClient>,
        watcher: Arc<dyn ChannelWatcherLookup>,
        oracle: Arc<dyn TimestampOracle>,
        options: CompactionOptions,
    ) -> Self {
        Self {
            client,
            segments,
            worker,
            watcher,
            oracle,
            options,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn now_unix(&self) -> u64 {
        self.oracle.now().physical_ms() / 1000
    }

    /// Rebuild queue, executing and cleaning sets from the store and
    /// re-claim the inputs of live tasks.
    pub async fn recover(&self) -> Result<(), InspectorError> {
        let records = self
            .client
            .load_prefix::<CompactionTaskRecord>(keys::compaction_task_prefix())
            .await?;
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
        for (_, record, _) in records {
            let task = CompactionTask::from_record(record);
            match task.state() {
                CompactionTaskState::Pipelining => {
                    self.segments.restore_compacting(&task.inputs());
                    inner.queue.insert(task.record().plan(), task);
                }
                CompactionTaskState::Executing => {
                    self.segments.restore_compacting(&task.inputs());
                    inner.executing.insert(task.record().plan(), task);
                }
                CompactionTaskState::Completed
                | CompactionTaskState::Failed
                | CompactionTaskState::Timeout => {
                    // terminal but cleanup did not finish before the
                    // restart; claim inputs so cleanup stays exclusive
                    self.segments.restore_compacting(&task.inputs());
                    inner.cleaning.insert(task.record().plan(), task);
                }
                CompactionTaskState::Cleaned => {}
            }
        }
        info!(
            queued = inner.queue.len(),
            executing = inner.executing.len(),
            cleaning = inner.cleaning.len(),
            "recovered compaction tasks"
        );
        Ok(())
    }

    /// Back-pressure signal for the trigger.
    pub async fn is_full(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.queue.len() >= self.options.task_queue_capacity
    }

    /// Admit a freshly planned task: claim its input segments, persist
    /// the record and queue it. Fails with [`InspectorError::QueueFull`]
    /// when the bounded queue is at capacity.
    pub async fn enqueue_compaction(
        &self,
        record: CompactionTaskRecord,
    ) -> Result<(), InspectorError> {
        if record.task_state() != CompactionTaskState::Pipelining {
            return Err(InspectorError::InvalidState(record.plan()));
        }
        let mut inner = self.inner.lock().await;
        if inner.queue.len() >= self.options.task_queue_capacity {
            return Err(InspectorError::QueueFull);
        }
        let task = CompactionTask::from_record(record);
        let inputs = task.inputs();
        self.segments.check_and_set_compacting(&inputs)?;
        if let Err(err) = self
            .client
            .put(
                keys::compaction_task_key(task.record().plan()),
                task.record(),
                Precondition::None,
            )
            .await
        {
            // roll the claim back; nothing else references it yet
            self.segments.set_compacting(&inputs, false);
            return Err(err.into());
        }
        debug!(plan = %task.record().plan(), "queued compaction task");
        inner.queue.insert(task.record().plan(), task);
        Ok(())
    }

    /// Move queued tasks to the executing set, honoring intra-channel
    /// L0 exclusivity: at most one L0-delete compaction per channel,
    /// and no mix compaction on a channel with a live L0 task. Returns
    /// the scheduled plan ids in plan order.
    pub async fn schedule(&self) -> Vec<PlanId> {
        let mut inner = self.inner.lock().await;
        let mut l0_channels: HashSet<String> = inner
            .executing
            .values()
            .filter(|t| t.task_type() == CompactionType::Level0DeleteCompaction)
            .map(|t| t.record().channel.clone())
            .collect();

        let mut picked: Vec<PlanId> = Vec::new();
        let queued: Vec<PlanId> = inner.queue.keys().copied().collect();
        for plan in queued {
            let task = &inner.queue[&plan];
            let channel = task.record().channel.clone();
            match task.task_type() {
                CompactionType::Level0DeleteCompaction => {
                    if l0_channels.contains(&channel) {
                        continue;
                    }
                    l0_channels.insert(channel.clone());
                }
                CompactionType::MixCompaction | CompactionType::ClusteringCompaction => {
                    if l0_channels.contains(&channel) {
                        continue;
                    }
                }
            }

            let node = match task.assigned_node() {
                node if !node.is_buffer() => Some(node),
                _ => self.watcher.watcher_of(&channel).await,
            };
            let Some(node) = node else {
                // stays queued; a pending L0 task keeps its channel
                // reserved so a mix task cannot overtake it
                debug!(plan = %plan, channel, "no watcher for channel, task stays queued");
                continue;
            };

            let mut task = inner.queue.remove(&plan).expect("plan id from queue keys");
            task.record_mut().node_id = node.as_u64();
            task.record_mut().start_time = self.now_unix();
            task.set_state(CompactionTaskState::Executing);
            if let Err(err) = self
                .client
                .put(
                    keys::compaction_task_key(plan),
                    task.record(),
                    Precondition::None,
                )
                .await
            {
                warn!(plan = %plan, error = %err, "failed persisting scheduled task");
                task.set_state(CompactionTaskState::Pipelining);
                inner.queue.insert(plan, task);
                continue;
            }
            debug!(plan = %plan, %node, "scheduled compaction task");
            inner.executing.insert(plan, task);
            picked.push(plan);
        }
        picked
    }

    /// Poll executing tasks on their workers and apply the outcomes.
    pub async fn check_compaction(&self) {
        let snapshot: Vec<CompactionTask> = {
            let inner = self.inner.lock().await;
            inner.executing.values().cloned().collect()
        };
        for task in snapshot {
            let plan = task.record().plan();
            let outcome = task.query_on_worker(self.worker.as_ref()).await;
            match outcome {
                Err(WorkerError::NodeNotFound(node)) => {
                    warn!(plan = %plan, %node, "compaction worker vanished, failing task");
                    self.finish_task(plan, CompactionTaskState::Failed).await;
                }
                Err(err) => {
                    debug!(plan = %plan, error = %err, "compaction poll failed, retrying next pass");
                }
                Ok(result) => match result.state {
                    CompactionTaskState::Completed => {
                        match self
                            .segments
                            .complete_compaction_mutation(task.record(), &result)
                            .await
                        {
                            Ok(outputs) => {
                                let ids = outputs.iter().map(|s| s.id()).collect::<Vec<_>>();
                                self.complete_task(plan, ids).await;
                            }
                            Err(err) => {
                                warn!(plan = %plan, error = %err, "compaction commit failed");
                                self.finish_task(plan, CompactionTaskState::Failed).await;
                            }
                        }
                    }
                    CompactionTaskState::Failed => {
                        self.finish_task(plan, CompactionTaskState::Failed).await;
                    }
                    _ => {
                        if self.timed_out(task.record()) {
                            warn!(plan = %plan, "compaction task timed out");
                            self.finish_task(plan, CompactionTaskState::Timeout).await;
                        }
                    }
                },
            }
        }
    }

    fn timed_out(&self, record: &CompactionTaskRecord) -> bool {
        record.timeout_seconds > 0
            && self.now_unix().saturating_sub(record.start_time)
                > u64::from(record.timeout_seconds)
    }

    async fn complete_task(&self, plan: PlanId, outputs: Vec<petrel_types::SegmentId>) {
        let mut inner = self.inner.lock().await;
        let Some(mut task) = inner.executing.remove(&plan) else {
            return;
        };
        task.record_mut().result_segments = outputs.iter().map(|s| s.as_u64()).collect();
        task.set_state(CompactionTaskState::Completed);
        task.record_mut().end_time = self.now_unix();
        if let Err(err) = self
            .client
            .put(keys::compaction_task_key(plan), task.record(), Precondition::None)
            .await
        {
            warn!(plan = %plan, error = %err, "failed persisting completed task");
        }
        info!(plan = %plan, outputs = outputs.len(), "compaction completed");
        // worker-side plan is released during cleanup
        inner.cleaning.insert(plan, task);
    }

    async fn finish_task(&self, plan: PlanId, state: CompactionTaskState) {
        let mut inner = self.inner.lock().await;
        let Some(mut task) = inner.executing.remove(&plan) else {
            return;
        };
        task.set_state(state);
        task.record_mut().end_time = self.now_unix();
        if let Err(err) = self
            .client
            .put(keys::compaction_task_key(plan), task.record(), Precondition::None)
            .await
        {
            warn!(plan = %plan, error = %err, "failed persisting terminal task state");
        }
        inner.cleaning.insert(plan, task);
    }

    /// Re-apply cleanup effects of terminal tasks until they all
    /// succeed; cleanup is idempotent and retried without bound.
    pub async fn clean_tasks(&self) {
        let snapshot: Vec<CompactionTask> = {
            let inner = self.inner.lock().await;
            inner.cleaning.values().cloned().collect()
        };
        for task in snapshot {
            let plan = task.record().plan();
            if let Err(err) = task.cleanup(self.segments.as_ref(), self.worker.as_ref()).await {
                debug!(plan = %plan, error = %err, "cleanup incomplete, will retry");
                continue;
            }
            let mut cleaned = task.clone();
            cleaned.set_state(CompactionTaskState::Cleaned);
            if let Err(err) = self
                .client
                .put(keys::compaction_task_key(plan), cleaned.record(), Precondition::None)
                .await
            {
                debug!(plan = %plan, error = %err, "failed persisting cleaned state, will retry");
                continue;
            }
            let mut inner = self.inner.lock().await;
            inner.cleaning.remove(&plan);
            debug!(plan = %plan, "compaction task cleaned");
        }
    }

    /// Purge terminal task records older than the retention window.
    /// Live tasks are never collected.
    pub async fn gc(&self) -> Result<usize, InspectorError> {
        let records = self
            .client
            .load_prefix::<CompactionTaskRecord>(keys::compaction_task_prefix())
            .await?;
        let retention = self.options.gc_retention.as_secs();
        let now = self.now_unix();
        let mut purged = 0;
        for (key, record, _) in records {
            if record.task_state() != CompactionTaskState::Cleaned {
                continue;
            }
            if record.end_time + retention > now {
                continue;
            }
            self.client.delete(key, Precondition::None).await?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "garbage-collected compaction task records");
        }
        Ok(purged)
    }

    /// Drop queued tasks bound to a channel that moved away. Their
    /// input claims are released and the records removed; executing
    /// tasks are left to the regular check pass.
    pub async fn remove_tasks_by_channel(&self, channel: &str) {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<PlanId> = inner
            .queue
            .values()
            .filter(|t| t.record().channel == channel)
            .map(|t| t.record().plan())
            .collect();
        for plan in doomed {
            let Some(task) = inner.queue.remove(&plan) else {
                continue;
            };
            self.segments.set_compacting(&task.inputs(), false);
            if let Err(err) = self
                .client
                .delete(keys::compaction_task_key(plan), Precondition::None)
                .await
            {
                warn!(plan = %plan, error = %err, "failed removing task record");
            }
            info!(plan = %plan, channel, "dropped queued task for moved channel");
        }
    }

    /// Aggregate task counts for one trigger, for the manual
    /// compaction status surface.
    pub async fn compaction_info(&self, trigger: TriggerId) -> Result<CompactionInfo, InspectorError> {
        let records = self
            .client
            .load_prefix::<CompactionTaskRecord>(keys::compaction_task_prefix())
            .await?;
        let mut info = CompactionInfo::default();
        for (_, record, _) in records {
            if record.trigger() != trigger {
                continue;
            }
            match record.task_state() {
                CompactionTaskState::Pipelining | CompactionTaskState::Executing => {
                    info.executing += 1
                }
                CompactionTaskState::Completed => info.completed += 1,
                CompactionTaskState::Failed => info.failed += 1,
                CompactionTaskState::Timeout => info.timeout += 1,
                CompactionTaskState::Cleaned => info.completed += 1,
            }
        }
        Ok(info)
    }

    pub async fn get_task(&self, plan: PlanId) -> Option<CompactionTaskRecord> {
        let inner = self.inner.lock().await;
        inner
            .queue
            .get(&plan)
            .or_else(|| inner.executing.get(&plan))
            .or_else(|| inner.cleaning.get(&plan))
            .map(|t| t.shadow_clone())
    }

    /// One full inspector pass.
    pub async fn inspect(&self) {
        self.schedule().await;
        self.check_compaction().await;
        self.clean_tasks().await;
        if let Err(err) = self.gc().await {
            warn!(error = %err, "compaction gc pass failed");
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(*self.options.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.inspect().await,
                _ = shutdown.cancelled() => {
                    debug!("compaction inspector stopped");
                    return;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::ManualOracle;
    use crate::cluster::MockCompactionWorkerClient;
    use petrel_metadata_store::MemoryMetaStore;
    use petrel_types::compaction::{CompactionPlanResult, CompactionResultSegment};
    use petrel_types::segment::{SegmentLevel, SegmentRecord, SegmentState};
    use petrel_types::tso::TsoTimestamp;
    use petrel_types::SegmentId;
    use std::collections::HashMap as StdHashMap;

    struct FixedWatcher(StdHashMap<String, NodeId>);

    #[async_trait::async_trait]
    impl ChannelWatcherLookup for FixedWatcher {
        async fn watcher_of(&self, channel: &str) -> Option<NodeId> {
            self.0.get(channel).copied()
        }
    }

    struct Fixture {
        inspector: Arc<CompactionInspector>,
        segments: Arc<SegmentsMeta>,
        oracle: Arc<ManualOracle>,
        client: MetaStoreClient,
    }

    async fn fixture_with(
        options: CompactionOptions,
        watchers: &[(&str, u64)],
        worker: MockCompactionWorkerClient,
    ) -> Fixture {
        let store = Arc::new(MemoryMetaStore::new());
        let client = MetaStoreClient::new(store.clone());
        let segments = Arc::new(SegmentsMeta::new(client.clone()));
        let oracle = Arc::new(ManualOracle::at(TsoTimestamp::compose(1_000_000, 0)));
        let watcher = Arc::new(FixedWatcher(
            watchers
                .iter()
                .map(|(ch, node)| (ch.to_string(), NodeId::new(*node)))
                .collect(),
        ));
        let inspector = Arc::new(CompactionInspector::new(
            client.clone(),
            segments.clone(),
            Arc::new(worker),
            watcher,
            oracle.clone(),
            options,
        ));
        Fixture {
            inspector,
            segments,
            oracle,
            client,
        }
    }

    async fn fixture(worker: MockCompactionWorkerClient) -> Fixture {
        fixture_with(
            CompactionOptions::default(),
            &[("ch-11", 101), ("ch-3", 102), ("ch-10", 103), ("ch-1", 104)],
            worker,
        )
        .await
    }

    fn seg(id: u64, channel: &str) -> SegmentRecord {
        SegmentRecord {
            segment_id: id,
            collection_id: 1,
            partition_id: 1,
            channel: channel.to_owned(),
            level: SegmentLevel::L1 as i32,
            state: SegmentState::Flushed as i32,
            num_rows: 100,
            ..Default::default()
        }
    }

    fn record(plan: u64, r#type: CompactionType, channel: &str, inputs: &[u64]) -> CompactionTaskRecord {
        CompactionTaskRecord {
            plan_id: plan,
            trigger_id: 1,
            r#type: r#type as i32,
            state: CompactionTaskState::Pipelining as i32,
            collection_id: 1,
            partition_id: 1,
            channel: channel.to_owned(),
            input_segments: inputs.to_vec(),
            timeout_seconds: 900,
            ..Default::default()
        }
    }

    fn completed(plan: PlanId) -> CompactionPlanResult {
        CompactionPlanResult {
            plan_id: plan,
            state: CompactionTaskState::Completed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn schedule_honors_l0_channel_exclusivity() {
        let mut worker = MockCompactionWorkerClient::new();
        worker
            .expect_query_compaction()
            .returning(|_, plan| Ok(completed(plan)));
        let f = fixture(worker).await;
        f.segments
            .put_segments(vec![seg(1, "ch-11"), seg(2, "ch-11"), seg(3, "ch-3")])
            .await
            .unwrap();

        f.inspector
            .enqueue_compaction(record(10, CompactionType::Level0DeleteCompaction, "ch-11", &[1]))
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(11, CompactionType::MixCompaction, "ch-11", &[2]))
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(13, CompactionType::MixCompaction, "ch-3", &[3]))
            .await
            .unwrap();

        let scheduled = f.inspector.schedule().await;
        assert_eq!(
            scheduled,
            vec![PlanId::new(10), PlanId::new(13)],
            "mix task on the L0 channel must wait"
        );

        // the shadowed mix task stays queued and runs after the L0
        // task finished
        f.inspector.check_compaction().await;
        let scheduled = f.inspector.schedule().await;
        assert_eq!(scheduled, vec![PlanId::new(11)]);
    }

    #[tokio::test]
    async fn queue_capacity_rejects_submissions() {
        let f = fixture_with(
            CompactionOptions {
                task_queue_capacity: 1,
                ..Default::default()
            },
            &[("ch-1", 104)],
            MockCompactionWorkerClient::new(),
        )
        .await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-1")])
            .await
            .unwrap();

        f.inspector
            .enqueue_compaction(record(1, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        let err = f
            .inspector
            .enqueue_compaction(record(2, CompactionType::MixCompaction, "ch-1", &[2]))
            .await
            .unwrap_err();
        assert!(matches!(err, InspectorError::QueueFull));
        // the rejected task must not leave its inputs claimed
        assert!(!f.segments.is_compacting(SegmentId::new(2)));
    }

    #[tokio::test]
    async fn conflicting_inputs_are_rejected_at_enqueue() {
        let f = fixture(MockCompactionWorkerClient::new()).await;
        f.segments.put_segments(vec![seg(1, "ch-1")]).await.unwrap();
        f.inspector
            .enqueue_compaction(record(1, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        let err = f
            .inspector
            .enqueue_compaction(record(2, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, InspectorError::Segments(_)));
    }

    #[tokio::test]
    async fn completed_task_commits_results_and_cleans() {
        let mut worker = MockCompactionWorkerClient::new();
        worker.expect_query_compaction().returning(|_, plan| {
            Ok(CompactionPlanResult {
                plan_id: plan,
                state: CompactionTaskState::Completed,
                segments: vec![CompactionResultSegment {
                    segment_id: SegmentId::new(50),
                    num_rows: 200,
                    size_bytes: 4096,
                }],
                ..Default::default()
            })
        });
        // the worker-side plan is dropped exactly once; a second
        // cleanup pass finds nothing left to do
        worker
            .expect_drop_compaction()
            .times(1)
            .returning(|_, _| Ok(()));
        let f = fixture(worker).await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-1")])
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(5, CompactionType::MixCompaction, "ch-1", &[1, 2]))
            .await
            .unwrap();
        f.inspector.schedule().await;
        f.inspector.check_compaction().await;

        let task = f.inspector.get_task(PlanId::new(5)).await.unwrap();
        assert_eq!(task.task_state(), CompactionTaskState::Completed);
        assert_eq!(task.result_segments, vec![50]);
        assert_eq!(
            f.segments.get(SegmentId::new(1)).unwrap().segment_state(),
            SegmentState::Dropped
        );

        f.inspector.clean_tasks().await;
        assert!(f.inspector.get_task(PlanId::new(5)).await.is_none());
        assert!(!f.segments.is_compacting(SegmentId::new(1)));

        // cleanup is idempotent: a second pass must not drop again
        f.inspector.clean_tasks().await;
    }

    #[tokio::test]
    async fn stuck_task_times_out_and_cleans_up() {
        let mut worker = MockCompactionWorkerClient::new();
        // worker keeps reporting progress
        worker.expect_query_compaction().returning(|_, plan| {
            Ok(CompactionPlanResult {
                plan_id: plan,
                state: CompactionTaskState::Executing,
                ..Default::default()
            })
        });
        worker
            .expect_drop_compaction()
            .times(1)
            .returning(|_, _| Ok(()));
        let f = fixture(worker).await;
        f.segments.put_segments(vec![seg(1, "ch-1")]).await.unwrap();
        let mut r = record(7, CompactionType::MixCompaction, "ch-1", &[1]);
        r.timeout_seconds = 10;
        f.inspector.enqueue_compaction(r).await.unwrap();
        f.inspector.schedule().await;

        f.inspector.check_compaction().await;
        let task = f.inspector.get_task(PlanId::new(7)).await.unwrap();
        assert_eq!(task.task_state(), CompactionTaskState::Executing);

        // 60 seconds later the 10s budget is blown
        f.oracle.set(TsoTimestamp::compose(1_000_000 + 60_000, 0));
        f.inspector.check_compaction().await;
        let task = f.inspector.get_task(PlanId::new(7)).await.unwrap();
        assert_eq!(task.task_state(), CompactionTaskState::Timeout);

        f.inspector.clean_tasks().await;
        assert!(!f.segments.is_compacting(SegmentId::new(1)));
    }

    #[tokio::test]
    async fn vanished_worker_fails_the_task() {
        let mut worker = MockCompactionWorkerClient::new();
        worker
            .expect_query_compaction()
            .returning(|node, _| Err(WorkerError::NodeNotFound(node)));
        worker
            .expect_drop_compaction()
            .times(1)
            .returning(|_, _| Ok(()));
        let f = fixture(worker).await;
        f.segments.put_segments(vec![seg(1, "ch-1")]).await.unwrap();
        f.inspector
            .enqueue_compaction(record(9, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        f.inspector.schedule().await;

        f.inspector.check_compaction().await;
        assert_eq!(
            f.inspector.get_task(PlanId::new(9)).await.unwrap().task_state(),
            CompactionTaskState::Failed
        );

        f.inspector.clean_tasks().await;
        assert!(!f.segments.is_compacting(SegmentId::new(1)));
    }

    #[tokio::test]
    async fn gc_purges_only_old_cleaned_records() {
        let mut worker = MockCompactionWorkerClient::new();
        worker.expect_query_compaction().returning(|_, plan| {
            if plan == PlanId::new(1) {
                Ok(completed(plan))
            } else {
                Ok(CompactionPlanResult {
                    plan_id: plan,
                    state: CompactionTaskState::Executing,
                    ..Default::default()
                })
            }
        });
        worker
            .expect_drop_compaction()
            .times(1)
            .returning(|_, _| Ok(()));
        let f = fixture(worker).await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-1")])
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(1, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(2, CompactionType::MixCompaction, "ch-1", &[2]))
            .await
            .unwrap();
        f.inspector.schedule().await;
        f.inspector.check_compaction().await;
        f.inspector.clean_tasks().await;

        // not old enough yet
        assert_eq!(f.inspector.gc().await.unwrap(), 0);

        // jump past the retention window; only the cleaned record goes
        let retention = CompactionOptions::default().gc_retention.as_secs();
        f.oracle.set(TsoTimestamp::compose(
            1_000_000 + (retention + 1) * 2000,
            0,
        ));
        assert_eq!(f.inspector.gc().await.unwrap(), 1);
        // the executing task record survived
        assert!(f.inspector.get_task(PlanId::new(2)).await.is_some());
    }

    #[tokio::test]
    async fn restart_recovers_live_tasks_and_claims() {
        let f = fixture(MockCompactionWorkerClient::new()).await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-1")])
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(1000, CompactionType::Level0DeleteCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        f.inspector.schedule().await;

        // a new inspector over the same store
        let segments = Arc::new(SegmentsMeta::new(f.client.clone()));
        segments.recover().await.unwrap();
        let restarted = CompactionInspector::new(
            f.client.clone(),
            segments.clone(),
            Arc::new(MockCompactionWorkerClient::new()),
            Arc::new(FixedWatcher(StdHashMap::new())),
            f.oracle.clone(),
            CompactionOptions::default(),
        );
        restarted.recover().await.unwrap();

        let task = restarted.get_task(PlanId::new(1000)).await.unwrap();
        assert_eq!(task.task_state(), CompactionTaskState::Executing);
        assert!(segments.is_compacting(SegmentId::new(1)));
        assert!(!segments.is_compacting(SegmentId::new(2)));
    }

    #[tokio::test]
    async fn remove_tasks_by_channel_releases_claims() {
        let f = fixture(MockCompactionWorkerClient::new()).await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-3")])
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(1, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(2, CompactionType::MixCompaction, "ch-3", &[2]))
            .await
            .unwrap();

        f.inspector.remove_tasks_by_channel("ch-1").await;
        assert!(f.inspector.get_task(PlanId::new(1)).await.is_none());
        assert!(!f.segments.is_compacting(SegmentId::new(1)));
        assert!(f.inspector.get_task(PlanId::new(2)).await.is_some());
        assert!(f.segments.is_compacting(SegmentId::new(2)));
    }

    #[tokio::test]
    async fn compaction_info_aggregates_by_trigger() {
        let mut worker = MockCompactionWorkerClient::new();
        worker.expect_query_compaction().returning(|_, plan| {
            if plan == PlanId::new(1) {
                Ok(completed(plan))
            } else {
                Err(WorkerError::NodeNotFound(NodeId::new(104)))
            }
        });
        let f = fixture(worker).await;
        f.segments
            .put_segments(vec![seg(1, "ch-1"), seg(2, "ch-1")])
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(1, CompactionType::MixCompaction, "ch-1", &[1]))
            .await
            .unwrap();
        f.inspector
            .enqueue_compaction(record(2, CompactionType::MixCompaction, "ch-1", &[2]))
            .await
            .unwrap();
        f.inspector.schedule().await;
        f.inspector.check_compaction().await;

        let info = f.inspector.compaction_info(TriggerId::new(1)).await.unwrap();
        assert_eq!(info.completed, 1);
        assert_eq!(info.failed, 1);
        assert_eq!(info.executing, 0);
    }
}
