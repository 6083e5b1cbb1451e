// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Coordinator configuration.
//!
//! Defaults follow the shipped cluster profile; every knob can be set
//! from the node configuration file (kebab-case keys, humantime
//! durations).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// # Channel manager options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChannelOptions {
    /// # Balance check interval
    ///
    /// Period of the channel reconciler tick.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub balance_check_interval: humantime::Duration,

    /// # Auto balance
    ///
    /// Allow the reconciler to move channels from overloaded to
    /// underloaded nodes.
    pub auto_balance: bool,

    /// # Notify RPC timeout
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub notify_timeout: humantime::Duration,

    /// # Progress check RPC timeout
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub check_timeout: humantime::Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            balance_check_interval: Duration::from_secs(1).into(),
            auto_balance: false,
            notify_timeout: Duration::from_secs(5).into(),
            check_timeout: Duration::from_secs(5).into(),
        }
    }
}

/// # Compaction options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CompactionOptions {
    /// # Enable compaction
    ///
    /// Master switch; when off no plans are generated or scheduled.
    pub enable_compaction: bool,

    /// # Enable auto compaction
    ///
    /// When off, only manual (forced) compaction runs.
    pub enable_auto_compaction: bool,

    /// # Index-based compaction
    ///
    /// Only consider segments whose index is built.
    pub index_based_compaction: bool,

    /// # Global trigger interval
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub mix_trigger_interval: humantime::Duration,

    /// # Inspector check interval
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub check_interval: humantime::Duration,

    /// # Minimum segments to merge
    pub min_segments_to_merge: usize,

    /// # Small segment proportion
    ///
    /// A segment below `expected_size * small_proportion` is small.
    pub small_proportion: f64,

    /// # Compactable proportion
    ///
    /// A bucket is full once it reaches
    /// `expected_size * compactable_proportion`.
    pub compactable_proportion: f64,

    /// # Expansion rate
    ///
    /// Squeezing may grow a plan up to `expected_size * expansion_rate`.
    pub expansion_rate: f64,

    /// # Single-compaction deltalog count threshold
    pub single_deltalog_max_num: usize,

    /// # Single-compaction delete/expiry ratio threshold
    pub single_ratio_threshold: f64,

    /// # Single-compaction deltalog size threshold
    pub single_deltalog_max_size: u64,

    /// # Single-compaction expired-log size threshold
    pub single_expired_max_size: u64,

    /// # Auto upgrade segment index
    ///
    /// Recompact segments whose index engine version is out of date.
    pub auto_upgrade_segment_index: bool,

    /// # Task timeout
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub timeout: humantime::Duration,

    /// # Task queue capacity
    ///
    /// Bound of the inspector's pipelining queue; submissions beyond
    /// it are rejected.
    pub task_queue_capacity: usize,

    /// # Pre-allocated result segments per plan
    pub pre_allocated_result_segments: u64,

    /// # Expected segment size
    ///
    /// Target size of a compacted segment.
    pub expected_segment_size: u64,

    /// # GC retention for terminal tasks
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub gc_retention: humantime::Duration,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            enable_compaction: true,
            enable_auto_compaction: true,
            index_based_compaction: true,
            mix_trigger_interval: Duration::from_secs(60).into(),
            check_interval: Duration::from_secs(10).into(),
            min_segments_to_merge: 3,
            small_proportion: 0.5,
            compactable_proportion: 0.85,
            expansion_rate: 1.25,
            single_deltalog_max_num: 200,
            single_ratio_threshold: 0.2,
            single_deltalog_max_size: 2 * 1024 * 1024,
            single_expired_max_size: 10 * 1024 * 1024,
            auto_upgrade_segment_index: false,
            timeout: Duration::from_secs(900).into(),
            task_queue_capacity: 256,
            pre_allocated_result_segments: 10,
            expected_segment_size: 1024 * 1024 * 1024,
            gc_retention: Duration::from_secs(7 * 24 * 3600).into(),
        }
    }
}

/// # Load coordinator options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoadOptions {
    /// # Replica observer interval
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub check_node_in_replica_interval: humantime::Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            check_node_in_replica_interval: Duration::from_secs(1).into(),
        }
    }
}

/// # Quota center options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaOptions {
    /// # Collect interval
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub collect_interval: humantime::Duration,

    /// # DML limits enabled
    pub dml_limit_enabled: bool,

    /// # Time-tick protection
    pub tt_protection_enabled: bool,

    /// # Max time-tick delay
    ///
    /// Ingest lag at which the write factor reaches zero.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub max_time_tick_delay: humantime::Duration,

    /// # Query-node memory water levels
    pub query_node_memory_low_water_level: f64,
    pub query_node_memory_high_water_level: f64,

    /// # Growing-segment protection
    pub growing_segments_size_protection_enabled: bool,
    pub growing_segments_size_low_water_level: f64,
    pub growing_segments_size_high_water_level: f64,
    /// Floor of the growing-segment factor.
    pub growing_segments_size_min_rate_ratio: f64,

    /// # Per-collection DML rate bounds (bytes/sec, negative = unlimited)
    pub dml_max_insert_rate_per_collection: f64,
    pub dml_min_insert_rate_per_collection: f64,
    pub dml_max_upsert_rate_per_collection: f64,
    pub dml_min_upsert_rate_per_collection: f64,
    pub dml_max_delete_rate_per_collection: f64,
    pub dml_min_delete_rate_per_collection: f64,
    pub dml_max_bulk_load_rate_per_collection: f64,
    pub dml_min_bulk_load_rate_per_collection: f64,

    /// # Per-collection DQL rate bounds (requests/sec, negative = unlimited)
    pub dql_max_search_rate_per_collection: f64,
    pub dql_max_query_rate_per_collection: f64,

    /// # DDL rates (requests/sec, negative = unlimited)
    pub ddl_collection_rate: f64,
    pub ddl_partition_rate: f64,
    pub ddl_index_rate: f64,
    pub ddl_compaction_rate: f64,
    pub ddl_flush_rate: f64,

    /// # Administrative force-deny flags
    pub force_deny_writing: bool,
    pub force_deny_reading: bool,

    /// # Disk protection
    pub disk_protection_enabled: bool,
    /// Total quota in bytes, negative = unlimited.
    pub disk_quota: f64,
    pub disk_quota_per_db: f64,
    pub disk_quota_per_collection: f64,
    pub disk_quota_per_partition: f64,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(3).into(),
            dml_limit_enabled: false,
            tt_protection_enabled: false,
            max_time_tick_delay: Duration::from_secs(300).into(),
            query_node_memory_low_water_level: 0.85,
            query_node_memory_high_water_level: 0.95,
            growing_segments_size_protection_enabled: false,
            growing_segments_size_low_water_level: 0.2,
            growing_segments_size_high_water_level: 0.4,
            growing_segments_size_min_rate_ratio: 0.5,
            dml_max_insert_rate_per_collection: -1.0,
            dml_min_insert_rate_per_collection: 0.0,
            dml_max_upsert_rate_per_collection: -1.0,
            dml_min_upsert_rate_per_collection: 0.0,
            dml_max_delete_rate_per_collection: -1.0,
            dml_min_delete_rate_per_collection: 0.0,
            dml_max_bulk_load_rate_per_collection: -1.0,
            dml_min_bulk_load_rate_per_collection: 0.0,
            dql_max_search_rate_per_collection: -1.0,
            dql_max_query_rate_per_collection: -1.0,
            ddl_collection_rate: -1.0,
            ddl_partition_rate: -1.0,
            ddl_index_rate: -1.0,
            ddl_compaction_rate: -1.0,
            ddl_flush_rate: -1.0,
            force_deny_writing: false,
            force_deny_reading: false,
            disk_protection_enabled: true,
            disk_quota: -1.0,
            disk_quota_per_db: -1.0,
            disk_quota_per_collection: -1.0,
            disk_quota_per_partition: -1.0,
        }
    }
}

/// Root configuration of the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoordinatorOptions {
    pub channels: ChannelOptions,
    pub compaction: CompactionOptions,
    pub load: LoadOptions,
    pub quota: QuotaOptions,
}
