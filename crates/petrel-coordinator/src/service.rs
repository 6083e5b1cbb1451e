// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Coordinator assembly.
//!
//! Wires the reconcilers to their shared projections and external
//! handles, recovers every projection from the metadata store before
//! accepting requests, and supervises the reconcile loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use petrel_metadata_store::{MetaStore, MetaStoreClient, ReadError};
use petrel_types::config::CoordinatorOptions;
use petrel_types::NodeId;

use crate::channels::{ChannelError, ChannelManager};
use crate::cluster::{
    CollectionBroker, CompactionWorkerClient, DistributionManager, IndexEngineVersion,
    IngestWorkerClient, MetricsSource, ProxyClient, TimestampOracle,
};
use crate::compaction::{CompactionInspector, CompactionTrigger, InspectorError};
use crate::id_alloc::IdAllocator;
use crate::load::{
    CollectionObserver, LoadCollectionJob, LoadCollectionRequest, LoadContext, LoadError,
    LoadPartitionsJob, LoadPartitionsRequest, ReplicaObserver, TargetManager,
};
use crate::meta::{CollectionsMeta, ReplicaManager, ResourceManager, SegmentsMeta};
use crate::quota::QuotaCenter;

/// Stop latency bound: loops must observe cancellation within this
/// budget even if a worker RPC hangs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed recovering projections: {0}")]
    Recovery(#[from] ReadError),
    #[error(transparent)]
    Channels(#[from] ChannelError),
    #[error(transparent)]
    Compaction(#[from] InspectorError),
}

/// External collaborators of the coordinator, injected at
/// construction.
pub struct CoordinatorHandles {
    pub store: Arc<dyn MetaStore>,
    pub ingest_workers: Arc<dyn IngestWorkerClient>,
    pub compaction_workers: Arc<dyn CompactionWorkerClient>,
    pub broker: Arc<dyn CollectionBroker>,
    pub metrics_source: Arc<dyn MetricsSource>,
    pub proxies: Arc<dyn ProxyClient>,
    pub oracle: Arc<dyn TimestampOracle>,
}

pub struct Coordinator {
    pub channels: Arc<ChannelManager>,
    pub trigger: Arc<CompactionTrigger>,
    pub inspector: Arc<CompactionInspector>,
    pub segments: Arc<SegmentsMeta>,
    pub collections: Arc<CollectionsMeta>,
    pub replicas: Arc<ReplicaManager>,
    pub resources: Arc<ResourceManager>,
    pub dist: Arc<DistributionManager>,
    pub targets: Arc<TargetManager>,
    pub collection_observer: Arc<CollectionObserver>,
    pub replica_observer: Arc<ReplicaObserver>,
    pub quota: Arc<QuotaCenter>,
    pub alloc: Arc<IdAllocator>,
    broker: Arc<dyn CollectionBroker>,
    oracle: Arc<dyn TimestampOracle>,
    options: CoordinatorOptions,
}

impl Coordinator {
    /// Build the coordinator and recover every projection from the
    /// metadata store. `legacy_nodes` are ingest nodes whose watches
    /// survive the restart; channels on nodes absent from
    /// `live_ingest_nodes` are parked for reassignment.
    pub async fn start(
        handles: CoordinatorHandles,
        options: CoordinatorOptions,
        legacy_nodes: &[NodeId],
        live_ingest_nodes: &[NodeId],
    ) -> Result<Self, StartupError> {
        let client = MetaStoreClient::new(handles.store);
        let alloc = Arc::new(IdAllocator::new(client.clone()));

        let segments = Arc::new(SegmentsMeta::new(client.clone()));
        let collections = Arc::new(CollectionsMeta::new(client.clone()));
        let replicas = Arc::new(ReplicaManager::new(client.clone()));
        let resources = Arc::new(ResourceManager::new(client.clone()));
        let dist = Arc::new(DistributionManager::new());
        let targets = Arc::new(TargetManager::new(segments.clone(), collections.clone()));

        let channels = Arc::new(
            ChannelManager::new(
                client.clone(),
                handles.ingest_workers,
                alloc.clone(),
                options.channels.clone(),
            )
            .with_broker(handles.broker.clone()),
        );

        let inspector = Arc::new(CompactionInspector::new(
            client.clone(),
            segments.clone(),
            handles.compaction_workers,
            channels.clone(),
            handles.oracle.clone(),
            options.compaction.clone(),
        ));
        let trigger = Arc::new(CompactionTrigger::new(
            segments.clone(),
            collections.clone(),
            inspector.clone(),
            alloc.clone(),
            handles.oracle.clone(),
            Arc::new(IndexEngineVersion::default()),
            options.compaction.clone(),
        ));

        let collection_observer = Arc::new(CollectionObserver::new(
            collections.clone(),
            replicas.clone(),
            dist.clone(),
            targets.clone(),
        ));
        let replica_observer = Arc::new(ReplicaObserver::new(
            collections.clone(),
            replicas.clone(),
            resources.clone(),
            dist.clone(),
            options.load.clone(),
        ));

        let quota = Arc::new(QuotaCenter::new(
            handles.metrics_source,
            handles.proxies,
            handles.oracle.clone(),
            collections.clone(),
            options.quota.clone(),
        ));

        // recover the world before serving anything
        collections.recover().await?;
        segments.recover().await?;
        replicas.recover().await?;
        resources.recover().await?;
        channels.startup(legacy_nodes, live_ingest_nodes).await?;
        inspector.recover().await?;
        collection_observer.recover();
        info!("coordinator recovered from metadata store");

        Ok(Self {
            channels,
            trigger,
            inspector,
            segments,
            collections,
            replicas,
            resources,
            dist,
            targets,
            collection_observer,
            replica_observer,
            quota,
            alloc,
            broker: handles.broker,
            oracle: handles.oracle,
            options,
        })
    }

    pub fn load_context(&self) -> LoadContext {
        LoadContext {
            collections: self.collections.clone(),
            replicas: self.replicas.clone(),
            resources: self.resources.clone(),
            broker: self.broker.clone(),
            targets: self.targets.clone(),
            observer: self.collection_observer.clone(),
            alloc: self.alloc.clone(),
            oracle: self.oracle.clone(),
        }
    }

    pub async fn load_collection(&self, request: LoadCollectionRequest) -> Result<(), LoadError> {
        LoadCollectionJob::new(request, self.load_context()).run().await
    }

    pub async fn load_partitions(&self, request: LoadPartitionsRequest) -> Result<(), LoadError> {
        LoadPartitionsJob::new(request, self.load_context()).run().await
    }

    pub async fn release_collection(
        &self,
        collection: petrel_types::CollectionId,
    ) -> Result<(), LoadError> {
        crate::load::ReleaseCollectionJob::new(collection, self.load_context())
            .run()
            .await
    }

    /// Release a channel from its node; queued compaction tasks bound
    /// to the channel are dropped alongside.
    pub async fn release_channel(&self, node: NodeId, channel: &str) -> Result<(), ChannelError> {
        self.channels.release(node, channel).await?;
        self.inspector.remove_tasks_by_channel(channel).await;
        Ok(())
    }

    /// Run every reconcile loop until `shutdown` fires. Loops get
    /// [`SHUTDOWN_GRACE`] to observe cancellation before they are
    /// aborted.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.channels.clone().run(shutdown.clone()));
        tasks.spawn(self.trigger.clone().run(shutdown.clone()));
        tasks.spawn(self.inspector.clone().run(shutdown.clone()));
        tasks.spawn(self.replica_observer.clone().run(shutdown.clone()));
        tasks.spawn(self.quota.clone().run(shutdown.clone()));
        tasks.spawn({
            let observer = self.collection_observer.clone();
            let interval = *self.options.load.check_node_in_replica_interval;
            let shutdown = shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => observer.observe_once().await,
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        });

        shutdown.cancelled().await;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("reconcilers exceeded the shutdown grace period, aborting");
            tasks.abort_all();
        }
        info!("coordinator stopped");
    }
}
