// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Seams to the rest of the cluster.
//!
//! The coordinator talks to stateless workers through the narrow
//! traits below; the wire transport lives outside this crate. Every
//! call takes a deadline derived from the calling reconciler's
//! per-tick budget. The traits are mockable; tests script them with
//! the generated `Mock*` types.

pub mod distribution;
#[cfg(test)]
pub mod mock;

use bytes::Bytes;

use petrel_types::channel::{ChannelOpKind, ChannelOpProgress};
use petrel_types::compaction::CompactionPlanResult;
use petrel_types::quota::RateSnapshot;
use petrel_types::tso::TsoTimestamp;
use petrel_types::{CollectionId, NodeId, OpId, PartitionId, PlanId};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("channel {0} is already watched by the node")]
    ChannelReduplicate(String),
    #[error("rpc deadline exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// A watch or release intent pushed to an ingest worker. The worker
/// acknowledges receipt; the outcome is observed separately through
/// [`IngestWorkerClient::check_channel_operation_progress`].
#[derive(Clone, Debug)]
pub struct ChannelOpRequest {
    pub kind: ChannelOpKind,
    pub channel: String,
    pub collection_id: CollectionId,
    pub op_id: OpId,
    pub schema: Bytes,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IngestWorkerClient: Send + Sync {
    async fn notify_channel_operation(
        &self,
        node: NodeId,
        request: ChannelOpRequest,
    ) -> Result<(), WorkerError>;

    async fn check_channel_operation_progress(
        &self,
        node: NodeId,
        channel: String,
        op_id: OpId,
    ) -> Result<ChannelOpProgress, WorkerError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CompactionWorkerClient: Send + Sync {
    async fn query_compaction(
        &self,
        node: NodeId,
        plan: PlanId,
    ) -> Result<CompactionPlanResult, WorkerError>;

    async fn drop_compaction(&self, node: NodeId, plan: PlanId) -> Result<(), WorkerError>;
}

/// Metric collection endpoints. Each returns the topology document of
/// one worker class as JSON (see [`crate::quota::metrics`]).
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn get_dc_metrics(&self) -> Result<String, WorkerError>;
    async fn get_qc_metrics(&self) -> Result<String, WorkerError>;
    async fn get_proxy_metrics(&self) -> Result<Vec<String>, WorkerError>;
}

/// Rate broadcast to the proxy fleet.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProxyClient: Send + Sync {
    async fn set_rates(&self, snapshot: RateSnapshot) -> Result<(), WorkerError>;
}

/// External collection catalog (schema authority).
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CollectionBroker: Send + Sync {
    async fn describe_collection(
        &self,
        collection: CollectionId,
    ) -> Result<CollectionDescription, WorkerError>;

    async fn list_partitions(
        &self,
        collection: CollectionId,
    ) -> Result<Vec<PartitionId>, WorkerError>;
}

#[derive(Clone, Debug, Default)]
pub struct CollectionDescription {
    pub collection_id: CollectionId,
    pub db_id: petrel_types::DatabaseId,
    pub schema: Bytes,
    pub vchannels: Vec<String>,
}

/// Timestamp oracle handle. The oracle itself is external; the
/// coordinator only reads monotone timestamps from it.
pub trait TimestampOracle: Send + Sync {
    fn now(&self) -> TsoTimestamp;
}

/// Oracle backed by the local clock; adequate for single-coordinator
/// deployments and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemOracle;

impl TimestampOracle for SystemOracle {
    fn now(&self) -> TsoTimestamp {
        TsoTimestamp::now()
    }
}

/// Current index engine version, used by the index-staleness
/// compaction rule.
#[derive(Debug, Default)]
pub struct IndexEngineVersion(std::sync::atomic::AtomicI32);

impl IndexEngineVersion {
    pub fn new(version: i32) -> Self {
        Self(std::sync::atomic::AtomicI32::new(version))
    }

    pub fn current(&self) -> i32 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set(&self, version: i32) {
        self.0.store(version, std::sync::atomic::Ordering::Relaxed);
    }
}

pub use distribution::DistributionManager;
