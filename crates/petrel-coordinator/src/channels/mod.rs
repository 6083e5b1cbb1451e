// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Channel manager.
//!
//! Keeps every logical ingest channel assigned to exactly one live
//! ingest node and drives the watch/release state machine against the
//! workers. All RPC outcomes are observed through a separate progress
//! poll; a fresh op-id is allocated for every new intent so that a
//! late reply from a superseded operation is detected and ignored.

mod policy;
mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use petrel_metadata_store::{MetaStoreClient, ReadError, WriteError};
use petrel_types::channel::{ChannelAssignment, ChannelOpKind, ChannelOpState, ChannelState};
use petrel_types::config::ChannelOptions;
use petrel_types::node::NodeMembership;
use petrel_types::{CollectionId, NodeId, OpId};

use crate::cluster::{ChannelOpRequest, CollectionBroker, IngestWorkerClient, WorkerError};
use crate::id_alloc::{AllocError, IdAllocator};

use store::ChannelStore;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} not found")]
    ChannelNotFound(String),
    #[error("channel {0} is not assigned to any node")]
    Unassigned(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Store(#[from] WriteError),
    #[error(transparent)]
    Recovery(#[from] ReadError),
}

/// A new channel to bring under management.
#[derive(Clone, Debug)]
pub struct ChannelCreate {
    pub name: String,
    pub collection: CollectionId,
    pub schema: Bytes,
}

pub struct ChannelManager {
    store: Mutex<ChannelStore>,
    ingest: Arc<dyn IngestWorkerClient>,
    broker: Option<Arc<dyn CollectionBroker>>,
    alloc: Arc<IdAllocator>,
    options: ChannelOptions,
}

impl ChannelManager {
    pub fn new(
        client: MetaStoreClient,
        ingest: Arc<dyn IngestWorkerClient>,
        alloc: Arc<IdAllocator>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            store: Mutex::new(ChannelStore::new(client)),
            ingest,
            broker: None,
            alloc,
            options,
        }
    }

    /// Attach the external catalog used to refresh schema snapshots of
    /// assignments recovered without one.
    pub fn with_broker(mut self, broker: Arc<dyn CollectionBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Recover from the store on coordinator restart. Channels on
    /// nodes in `legacy_nodes` enter `Legacy` (watch assumed in
    /// effect, verified lazily); channels on dead nodes park on the
    /// buffer; everything else picks up where it left off.
    pub async fn startup(
        &self,
        legacy_nodes: &[NodeId],
        live_nodes: &[NodeId],
    ) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        store.recover().await?;
        for node in live_nodes {
            store.register_node(*node);
        }

        let rows: Vec<ChannelAssignment> = store.channels().cloned().collect();
        for row in rows {
            let node = row.node();
            if node.is_buffer() {
                if row.channel_state() != ChannelState::Standby {
                    let next = self.reassign(&row, NodeId::BUFFER).await?;
                    store.persist(next).await?;
                }
            } else if live_nodes.contains(&node) {
                if legacy_nodes.contains(&node) && row.channel_state() != ChannelState::Legacy {
                    let mut next = row.clone();
                    next.state = ChannelState::Legacy as i32;
                    store.persist(next).await?;
                }
            } else {
                info!(channel = %row.channel, dead_node = %node, "parking channel of dead node");
                let next = self.reassign(&row, NodeId::BUFFER).await?;
                store.persist(next).await?;
            }
        }
        Ok(())
    }

    // Standby row targeting `node`, fenced with a fresh op-id.
    async fn reassign(
        &self,
        row: &ChannelAssignment,
        node: NodeId,
    ) -> Result<ChannelAssignment, AllocError> {
        let op = self.alloc.alloc_one().await?;
        let mut next = row.clone();
        next.node_id = node.as_u64();
        next.state = ChannelState::Standby as i32;
        next.op_id = op;
        Ok(next)
    }

    /// Register an ingest node. No immediate assignment; subsequent
    /// reconcile ticks may move channels onto it.
    pub async fn add_node(&self, node: NodeId) {
        let mut store = self.store.lock().await;
        store.register_node(node);
        info!(%node, "ingest node registered");
    }

    /// Drain an ingest node: park all its channels on the buffer and
    /// forget the node.
    pub async fn delete_node(&self, node: NodeId) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        for row in store.channels_on(node) {
            let next = self.reassign(&row, NodeId::BUFFER).await?;
            store.persist(next).await?;
        }
        store.unregister_node(node);
        info!(%node, "ingest node removed");
        Ok(())
    }

    pub async fn set_node_membership(&self, node: NodeId, membership: NodeMembership) {
        let mut store = self.store.lock().await;
        store.set_membership(node, membership);
    }

    /// Bring a channel under management. With a live node available
    /// the channel heads straight for `ToWatch`; otherwise it parks in
    /// `Standby` on the buffer. Watching an already-known channel is a
    /// no-op.
    pub async fn watch(&self, create: ChannelCreate) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        if store.get(&create.name).is_some() {
            return Ok(());
        }
        let counts = store.assignment_counts(NodeMembership::ReadWrite);
        let (node, state) = match policy::choose_node(&counts) {
            Some(node) => (node, ChannelState::ToWatch),
            None => (NodeId::BUFFER, ChannelState::Standby),
        };
        let op = self.alloc.alloc_one().await?;
        let assignment = ChannelAssignment {
            channel: create.name,
            collection_id: create.collection.as_u64(),
            node_id: node.as_u64(),
            state: state as i32,
            op_id: op,
            schema: create.schema,
        };
        store.persist(assignment).await?;
        Ok(())
    }

    /// Request release of a channel from a node. The channel returns
    /// to `Standby` once the worker confirms and will be reassigned by
    /// a later tick.
    pub async fn release(&self, node: NodeId, channel: &str) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        let Some(current) = store.get_on_node(node, channel).cloned() else {
            return Err(ChannelError::ChannelNotFound(channel.to_owned()));
        };
        if node.is_buffer() {
            // nothing is watching a buffered channel
            return Ok(());
        }
        let op = self.alloc.alloc_one().await?;
        let mut next = current;
        next.state = ChannelState::ToRelease as i32;
        next.op_id = op;
        store.persist(next).await?;
        Ok(())
    }

    pub async fn find_watcher(&self, channel: &str) -> Result<NodeId, ChannelError> {
        let store = self.store.lock().await;
        let Some(row) = store.get(channel) else {
            return Err(ChannelError::ChannelNotFound(channel.to_owned()));
        };
        if row.node().is_buffer() {
            return Err(ChannelError::Unassigned(channel.to_owned()));
        }
        Ok(row.node())
    }

    pub async fn get_channel(&self, node: NodeId, channel: &str) -> Option<ChannelAssignment> {
        let store = self.store.lock().await;
        store.get_on_node(node, channel).cloned()
    }

    /// Snapshot of every assignment grouped by node, for admin
    /// surfaces.
    pub async fn channel_watch_infos(&self) -> BTreeMap<NodeId, Vec<ChannelAssignment>> {
        let store = self.store.lock().await;
        let mut infos: BTreeMap<NodeId, Vec<ChannelAssignment>> = BTreeMap::new();
        for row in store.channels() {
            infos.entry(row.node()).or_default().push(row.clone());
        }
        infos
    }

    /// One reconcile pass over every channel.
    pub async fn advance(&self) {
        if let Err(err) = self.promote_standby().await {
            warn!(error = %err, "failed promoting standby channels");
        }
        self.notify_intents().await;
        self.check_progress().await;
        self.verify_legacy().await;
        if self.options.auto_balance {
            if let Err(err) = self.balance_once().await {
                warn!(error = %err, "channel balance step failed");
            }
        }
    }

    /// Reconcile loop; ticks until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(*self.options.balance_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.advance().await,
                _ = shutdown.cancelled() => {
                    debug!("channel manager stopped");
                    return;
                }
            }
        }
    }

    async fn promote_standby(&self) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        let standby = store.in_state(ChannelState::Standby);
        if standby.is_empty() {
            return Ok(());
        }
        let mut counts = store.assignment_counts(NodeMembership::ReadWrite);
        for row in standby {
            let Some(node) = policy::choose_node(&counts) else {
                break;
            };
            let op = self.alloc.alloc_one().await?;
            let mut next = row.clone();
            next.node_id = node.as_u64();
            next.state = ChannelState::ToWatch as i32;
            next.op_id = op;
            store.persist(next).await?;
            *counts.entry(node).or_default() += 1;
            debug!(channel = %row.channel, %node, "standby channel promoted");
        }
        Ok(())
    }

    async fn notify_intents(&self) {
        let intents: Vec<(ChannelAssignment, ChannelOpKind)> = {
            let store = self.store.lock().await;
            store
                .in_state(ChannelState::ToWatch)
                .into_iter()
                .map(|row| (row, ChannelOpKind::Watch))
                .chain(
                    store
                        .in_state(ChannelState::ToRelease)
                        .into_iter()
                        .map(|row| (row, ChannelOpKind::Release)),
                )
                .collect()
        };
        if intents.is_empty() {
            return;
        }

        let results = futures::future::join_all(intents.into_iter().map(|(row, kind)| async move {
            let schema = self.resolve_schema(&row, kind).await;
            let request = ChannelOpRequest {
                kind,
                channel: row.channel.clone(),
                collection_id: row.collection(),
                op_id: row.op(),
                schema: schema.clone(),
            };
            let outcome = tokio::time::timeout(
                *self.options.notify_timeout,
                self.ingest.notify_channel_operation(row.node(), request),
            )
            .await
            .unwrap_or(Err(WorkerError::Timeout));
            (row, kind, schema, outcome)
        }))
        .await;

        for (row, kind, schema, outcome) in results {
            if let Err(err) = self.apply_notify_outcome(&row, kind, schema, outcome).await {
                warn!(channel = %row.channel, error = %err, "failed applying notify outcome");
            }
        }
    }

    async fn resolve_schema(&self, row: &ChannelAssignment, kind: ChannelOpKind) -> Bytes {
        if !row.schema.is_empty() || kind != ChannelOpKind::Watch {
            return row.schema.clone();
        }
        // assignment recovered without a schema snapshot
        let Some(broker) = &self.broker else {
            return Bytes::new();
        };
        match broker.describe_collection(row.collection()).await {
            Ok(description) => description.schema,
            Err(err) => {
                warn!(
                    channel = %row.channel,
                    collection = %row.collection(),
                    error = %err,
                    "failed refreshing channel schema"
                );
                Bytes::new()
            }
        }
    }

    async fn apply_notify_outcome(
        &self,
        row: &ChannelAssignment,
        kind: ChannelOpKind,
        schema: Bytes,
        outcome: Result<(), WorkerError>,
    ) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        let Some(current) = store.get(&row.channel) else {
            return Ok(());
        };
        // a newer intent supersedes this reply
        if current.op_id != row.op_id || current.state != row.state {
            return Ok(());
        }
        let mut next = current.clone();
        if !schema.is_empty() {
            next.schema = schema;
        }
        match (kind, outcome) {
            (ChannelOpKind::Watch, Ok(())) => {
                next.state = ChannelState::Watching as i32;
            }
            (ChannelOpKind::Watch, Err(WorkerError::ChannelReduplicate(_))) => {
                // the node already watches this channel under an older
                // incarnation; release it cleanly before re-watching
                next.state = ChannelState::ToRelease as i32;
                next.op_id = self.alloc.alloc_one().await?;
            }
            (ChannelOpKind::Watch, Err(err)) => {
                debug!(channel = %row.channel, error = %err, "watch notify failed");
                next.state = ChannelState::Standby as i32;
                next.op_id = self.alloc.alloc_one().await?;
            }
            (ChannelOpKind::Release, Ok(())) => {
                next.state = ChannelState::Releasing as i32;
            }
            (ChannelOpKind::Release, Err(err)) => {
                // keep the intent, retry next tick
                debug!(channel = %row.channel, error = %err, "release notify failed");
                return Ok(());
            }
        }
        store.persist(next).await?;
        Ok(())
    }

    async fn check_progress(&self) {
        let in_flight: Vec<ChannelAssignment> = {
            let store = self.store.lock().await;
            let mut rows = store.in_state(ChannelState::Watching);
            rows.extend(store.in_state(ChannelState::Releasing));
            rows
        };
        if in_flight.is_empty() {
            return;
        }

        let results = futures::future::join_all(in_flight.into_iter().map(|row| async move {
            let outcome = tokio::time::timeout(
                *self.options.check_timeout,
                self.ingest
                    .check_channel_operation_progress(row.node(), row.channel.clone(), row.op()),
            )
            .await
            .unwrap_or(Err(WorkerError::Timeout));
            (row, outcome)
        }))
        .await;

        for (row, outcome) in results {
            let outcome = outcome.map(|progress| progress.state);
            if let Err(err) = self.apply_check_outcome(&row.channel, row.op(), outcome).await {
                warn!(channel = %row.channel, error = %err, "failed applying progress outcome");
            }
        }
    }

    /// Apply one progress-poll outcome, fenced by op-id: a reply for
    /// anything but the currently stored op is dropped.
    async fn apply_check_outcome(
        &self,
        channel: &str,
        op: OpId,
        outcome: Result<ChannelOpState, WorkerError>,
    ) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        let Some(current) = store.get(channel) else {
            return Ok(());
        };
        if current.op() != op {
            debug!(
                channel,
                stale_op = %op,
                current_op = %current.op(),
                "dropping progress reply for superseded operation"
            );
            return Ok(());
        }
        let state = current.channel_state();
        let mut next = current.clone();
        let target = match (state, outcome) {
            (ChannelState::Watching | ChannelState::Legacy, Ok(ChannelOpState::WatchSuccess)) => {
                Some((ChannelState::Watched, false))
            }
            (ChannelState::Watching | ChannelState::Legacy, Ok(ChannelOpState::WatchFailure)) => {
                Some((ChannelState::Standby, true))
            }
            (ChannelState::Releasing, Ok(ChannelOpState::ReleaseSuccess))
            | (ChannelState::Releasing, Ok(ChannelOpState::ReleaseFailure)) => {
                Some((ChannelState::Standby, true))
            }
            (_, Err(WorkerError::NodeNotFound(node))) => {
                debug!(channel, %node, "node vanished during channel operation");
                Some((ChannelState::Standby, true))
            }
            (_, Ok(_)) | (_, Err(_)) => None,
        };
        if let Some((target_state, fresh_op)) = target {
            next.state = target_state as i32;
            if fresh_op {
                next.op_id = self.alloc.alloc_one().await?;
            }
            store.persist(next).await?;
        }
        Ok(())
    }

    async fn verify_legacy(&self) {
        let legacy: Vec<ChannelAssignment> = {
            let store = self.store.lock().await;
            store.in_state(ChannelState::Legacy)
        };
        for row in legacy {
            let outcome = tokio::time::timeout(
                *self.options.check_timeout,
                self.ingest
                    .check_channel_operation_progress(row.node(), row.channel.clone(), row.op()),
            )
            .await
            .unwrap_or(Err(WorkerError::Timeout))
            .map(|progress| progress.state);
            if let Err(err) = self.apply_check_outcome(&row.channel, row.op(), outcome).await {
                warn!(channel = %row.channel, error = %err, "failed verifying legacy channel");
            }
        }
    }

    async fn balance_once(&self) -> Result<(), ChannelError> {
        let mut store = self.store.lock().await;
        let counts = store.assignment_counts(NodeMembership::ReadWrite);
        let Some(donor) = policy::balance_donor(&counts) else {
            return Ok(());
        };
        let Some(row) = store
            .channels_on(donor)
            .into_iter()
            .find(|a| a.channel_state() == ChannelState::Watched)
        else {
            return Ok(());
        };
        info!(channel = %row.channel, %donor, "rebalancing channel off overloaded node");
        let mut next = row;
        next.state = ChannelState::ToRelease as i32;
        next.op_id = self.alloc.alloc_one().await?;
        store.persist(next).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockIngestWorkerClient;
    use petrel_metadata_store::MemoryMetaStore;
    use petrel_types::channel::ChannelOpProgress;

    struct Fixture {
        manager: ChannelManager,
        client: MetaStoreClient,
    }

    fn fixture_with(worker: MockIngestWorkerClient) -> Fixture {
        let store = Arc::new(MemoryMetaStore::new());
        let client = MetaStoreClient::new(store.clone());
        let alloc = Arc::new(IdAllocator::new(MetaStoreClient::new(store)));
        let manager = ChannelManager::new(
            client.clone(),
            Arc::new(worker),
            alloc,
            ChannelOptions::default(),
        );
        Fixture { manager, client }
    }

    // no RPC expected at all
    fn fixture() -> Fixture {
        fixture_with(MockIngestWorkerClient::new())
    }

    fn progress(state: ChannelOpState) -> ChannelOpProgress {
        ChannelOpProgress {
            state,
            progress: 100,
        }
    }

    fn create(name: &str) -> ChannelCreate {
        ChannelCreate {
            name: name.to_owned(),
            collection: CollectionId::new(1),
            schema: Bytes::from_static(b"\x01"),
        }
    }

    async fn assert_assignment(
        manager: &ChannelManager,
        node: NodeId,
        channel: &str,
        state: ChannelState,
    ) {
        let row = manager
            .get_channel(node, channel)
            .await
            .unwrap_or_else(|| panic!("channel {channel} not assigned to {node}"));
        assert_eq!(row.channel_state(), state, "channel {channel}");
    }

    #[tokio::test]
    async fn watch_without_nodes_parks_on_buffer() {
        let f = fixture();
        f.manager.watch(create("ch1")).await.unwrap();
        assert_assignment(&f.manager, NodeId::BUFFER, "ch1", ChannelState::Standby).await;
        assert!(matches!(
            f.manager.find_watcher("ch1").await,
            Err(ChannelError::Unassigned(_))
        ));
    }

    #[tokio::test]
    async fn watch_with_node_goes_to_watch() {
        let f = fixture();
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::ToWatch).await;
        assert_eq!(f.manager.find_watcher("ch1").await.unwrap(), NodeId::new(1));
    }

    #[tokio::test]
    async fn release_unknown_channel_errors() {
        let f = fixture();
        assert!(matches!(
            f.manager.release(NodeId::new(1), "ch1").await,
            Err(ChannelError::ChannelNotFound(_))
        ));
        f.manager.add_node(NodeId::new(1)).await;
        assert!(f.manager.release(NodeId::new(1), "ch1").await.is_err());
    }

    #[tokio::test]
    async fn release_buffered_channel_stays_standby() {
        let f = fixture();
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.release(NodeId::BUFFER, "ch1").await.unwrap();
        assert_assignment(&f.manager, NodeId::BUFFER, "ch1", ChannelState::Standby).await;
    }

    #[tokio::test]
    async fn delete_node_parks_channels() {
        let f = fixture();
        f.manager.add_node(NodeId::new(1)).await;
        for ch in ["ch1", "ch2", "ch3"] {
            f.manager.watch(create(ch)).await.unwrap();
        }
        f.manager.delete_node(NodeId::new(1)).await.unwrap();
        for ch in ["ch1", "ch2", "ch3"] {
            assert_assignment(&f.manager, NodeId::BUFFER, ch, ChannelState::Standby).await;
        }
    }

    #[tokio::test]
    async fn advance_promotes_standby_to_least_loaded_node() {
        let f = fixture();
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.watch(create("ch2")).await.unwrap();
        assert_assignment(&f.manager, NodeId::BUFFER, "ch1", ChannelState::Standby).await;

        // no nodes: advancing leaves them parked
        f.manager.advance().await;
        assert_assignment(&f.manager, NodeId::BUFFER, "ch1", ChannelState::Standby).await;

        f.manager.add_node(NodeId::new(1)).await;
        f.manager.promote_standby().await.unwrap();
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::ToWatch).await;
        assert_assignment(&f.manager, NodeId::new(1), "ch2", ChannelState::ToWatch).await;
    }

    #[tokio::test]
    async fn notify_ok_moves_to_watching_and_reduplicate_to_release() {
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .returning(|_, request| {
                if request.channel == "ch2" {
                    Err(WorkerError::ChannelReduplicate(request.channel))
                } else {
                    Ok(())
                }
            });
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.watch(create("ch2")).await.unwrap();

        f.manager.notify_intents().await;
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Watching).await;
        assert_assignment(&f.manager, NodeId::new(1), "ch2", ChannelState::ToRelease).await;
    }

    #[tokio::test]
    async fn watch_notify_failure_falls_back_to_standby() {
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused").into()));
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.notify_intents().await;
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Standby).await;
    }

    #[tokio::test]
    async fn release_notify_failure_keeps_intent() {
        let mut worker = MockIngestWorkerClient::new();
        // the watch notification goes through, the release one fails
        worker
            .expect_notify_channel_operation()
            .times(1)
            .returning(|_, _| Ok(()));
        worker
            .expect_notify_channel_operation()
            .returning(|_, _| Err(anyhow::anyhow!("unreachable").into()));
        worker
            .expect_check_channel_operation_progress()
            .returning(|_, _, _| Ok(progress(ChannelOpState::WatchSuccess)));
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.notify_intents().await;
        f.manager.check_progress().await;
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Watched).await;

        f.manager.release(NodeId::new(1), "ch1").await.unwrap();
        f.manager.notify_intents().await;
        // unlike a failed watch, a failed release retries the intent
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::ToRelease).await;
    }

    #[tokio::test]
    async fn watching_check_outcomes() {
        for (answer, expected) in [
            (ChannelOpState::WatchSuccess, ChannelState::Watched),
            (ChannelOpState::WatchFailure, ChannelState::Standby),
            (ChannelOpState::Watching, ChannelState::Watching),
        ] {
            let mut worker = MockIngestWorkerClient::new();
            worker
                .expect_notify_channel_operation()
                .returning(|_, _| Ok(()));
            worker
                .expect_check_channel_operation_progress()
                .returning(move |_, _, _| Ok(progress(answer)));
            let f = fixture_with(worker);
            f.manager.add_node(NodeId::new(1)).await;
            f.manager.watch(create("ch1")).await.unwrap();
            f.manager.notify_intents().await;
            f.manager.check_progress().await;
            assert_assignment(&f.manager, NodeId::new(1), "ch1", expected).await;
        }
    }

    #[tokio::test]
    async fn node_not_found_during_check_returns_to_standby() {
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .returning(|_, _| Ok(()));
        worker
            .expect_check_channel_operation_progress()
            .returning(|node, _, _| Err(WorkerError::NodeNotFound(node)));
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.notify_intents().await;
        f.manager.check_progress().await;
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Standby).await;
    }

    #[tokio::test]
    async fn release_check_outcomes_return_to_standby() {
        for answer in [ChannelOpState::ReleaseSuccess, ChannelOpState::ReleaseFailure] {
            let mut worker = MockIngestWorkerClient::new();
            worker
                .expect_notify_channel_operation()
                .times(2)
                .returning(|_, _| Ok(()));
            worker
                .expect_check_channel_operation_progress()
                .times(1)
                .returning(|_, _, _| Ok(progress(ChannelOpState::WatchSuccess)));
            worker
                .expect_check_channel_operation_progress()
                .returning(move |_, _, _| Ok(progress(answer)));
            let f = fixture_with(worker);
            f.manager.add_node(NodeId::new(1)).await;
            f.manager.watch(create("ch1")).await.unwrap();
            f.manager.notify_intents().await;
            f.manager.check_progress().await;
            assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Watched).await;

            f.manager.release(NodeId::new(1), "ch1").await.unwrap();
            f.manager.notify_intents().await;
            assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Releasing).await;

            f.manager.check_progress().await;
            assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Standby).await;

            // the freed channel gets picked up again next tick
            f.manager.promote_standby().await.unwrap();
            assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::ToWatch).await;
        }
    }

    #[tokio::test]
    async fn stale_watch_reply_cannot_override_release() {
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .once()
            .returning(|_, _| Ok(()));
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.notify_intents().await;
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Watching).await;
        let watching_op = f
            .manager
            .get_channel(NodeId::new(1), "ch1")
            .await
            .unwrap()
            .op();

        // release arrives while the watch probe is still in flight
        f.manager.release(NodeId::new(1), "ch1").await.unwrap();
        let release_op = f
            .manager
            .get_channel(NodeId::new(1), "ch1")
            .await
            .unwrap()
            .op();
        assert_ne!(watching_op, release_op);

        // the late WatchSuccess reply carries the superseded op-id and
        // must not flip the channel to Watched
        f.manager
            .apply_check_outcome("ch1", watching_op, Ok(ChannelOpState::WatchSuccess))
            .await
            .unwrap();
        let row = f.manager.get_channel(NodeId::new(1), "ch1").await.unwrap();
        assert_eq!(row.channel_state(), ChannelState::ToRelease);
        assert_eq!(row.op(), release_op);
    }

    #[tokio::test]
    async fn startup_recovers_legacy_and_dead_nodes() {
        let f = fixture();
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.add_node(NodeId::new(3)).await;
        // least-loaded placement: ch1 → n1, ch2 → n3, ch3 → n1
        for ch in ["ch1", "ch2", "ch3"] {
            f.manager.watch(create(ch)).await.unwrap();
        }

        // restart against the same backing store: node 1 is live and
        // legacy, node 3 is dead
        let restarted = ChannelManager::new(
            f.client.clone(),
            Arc::new(MockIngestWorkerClient::new()),
            Arc::new(IdAllocator::new(f.client.clone())),
            ChannelOptions::default(),
        );
        restarted
            .startup(&[NodeId::new(1)], &[NodeId::new(1)])
            .await
            .unwrap();

        let infos = restarted.channel_watch_infos().await;
        let on_node1 = infos.get(&NodeId::new(1)).cloned().unwrap_or_default();
        assert!(
            on_node1
                .iter()
                .all(|a| a.channel_state() == ChannelState::Legacy),
            "live legacy channels must recover as Legacy"
        );
        let on_buffer = infos.get(&NodeId::BUFFER).cloned().unwrap_or_default();
        assert!(
            on_buffer
                .iter()
                .all(|a| a.channel_state() == ChannelState::Standby),
            "channels of dead nodes must park on the buffer"
        );
        assert_eq!(on_node1.len(), 2);
        assert_eq!(on_buffer.len(), 1);
        assert_eq!(on_buffer[0].channel, "ch2");
    }

    #[tokio::test]
    async fn legacy_channel_verifies_into_watched() {
        let f = fixture();
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();

        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_check_channel_operation_progress()
            .returning(|_, _, _| Ok(progress(ChannelOpState::WatchSuccess)));
        let restarted = ChannelManager::new(
            f.client.clone(),
            Arc::new(worker),
            Arc::new(IdAllocator::new(f.client.clone())),
            ChannelOptions::default(),
        );
        restarted
            .startup(&[NodeId::new(1)], &[NodeId::new(1)])
            .await
            .unwrap();
        assert_assignment(&restarted, NodeId::new(1), "ch1", ChannelState::Legacy).await;

        restarted.verify_legacy().await;
        assert_assignment(&restarted, NodeId::new(1), "ch1", ChannelState::Watched).await;
    }

    #[tokio::test]
    async fn auto_balance_donates_from_overloaded_node() {
        let store = Arc::new(MemoryMetaStore::new());
        let client = MetaStoreClient::new(store.clone());
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .returning(|_, _| Ok(()));
        worker
            .expect_check_channel_operation_progress()
            .returning(|_, _, _| Ok(progress(ChannelOpState::WatchSuccess)));
        let manager = ChannelManager::new(
            client,
            Arc::new(worker),
            Arc::new(IdAllocator::new(MetaStoreClient::new(store))),
            ChannelOptions {
                auto_balance: true,
                ..Default::default()
            },
        );

        manager.add_node(NodeId::new(1)).await;
        for ch in ["ch1", "ch2", "ch3"] {
            manager.watch(create(ch)).await.unwrap();
        }
        manager.notify_intents().await;
        manager.check_progress().await;

        manager.add_node(NodeId::new(2)).await;
        manager.balance_once().await.unwrap();

        let infos = manager.channel_watch_infos().await;
        let releasing = infos[&NodeId::new(1)]
            .iter()
            .filter(|a| a.channel_state() == ChannelState::ToRelease)
            .count();
        assert_eq!(releasing, 1, "exactly one donation per tick");
    }

    #[tokio::test]
    async fn check_replies_are_fenced_per_channel() {
        let mut worker = MockIngestWorkerClient::new();
        worker
            .expect_notify_channel_operation()
            .once()
            .returning(|_, _| Ok(()));
        let f = fixture_with(worker);
        f.manager.add_node(NodeId::new(1)).await;
        f.manager.watch(create("ch1")).await.unwrap();
        f.manager.notify_intents().await;

        // a reply quoting a fabricated op-id is ignored
        f.manager
            .apply_check_outcome("ch1", OpId::new(999_999), Ok(ChannelOpState::WatchSuccess))
            .await
            .unwrap();
        assert_assignment(&f.manager, NodeId::new(1), "ch1", ChannelState::Watching).await;
    }
}
