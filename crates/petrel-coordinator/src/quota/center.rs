// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Quota center.
//!
//! Once per collect interval: gather worker telemetry, recompute the
//! rate-limit tree (write factors, disk quota, read and DDL rates),
//! and broadcast the snapshot to the proxy fleet when it changed. Any
//! collection failure aborts the pass; the previous snapshot stays in
//! effect until the next tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use petrel_types::config::QuotaOptions;
use petrel_types::properties;
use petrel_types::quota::{Limit, QuotaCode, QuotaState, RateSnapshotEntry, RateType};
use petrel_types::tso::TsoTimestamp;
use petrel_types::{CollectionId, DatabaseId, PartitionId};

use crate::cluster::{MetricsSource, ProxyClient, TimestampOracle, WorkerError};
use crate::meta::CollectionsMeta;
use crate::quota::limiter::{RateLimiterNode, RateLimiterTree};
use crate::quota::metrics::{
    parse_data_topology, parse_proxy_metrics, parse_query_topology, DataNodeMetrics,
    DataQuotaMetrics, QueryNodeMetrics,
};

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("metric collection failed: {0}")]
    Worker(#[from] WorkerError),
    #[error("malformed topology document: {0}")]
    Parse(#[from] serde_json::Error),
}

type CollectionsByDb = BTreeMap<DatabaseId, BTreeMap<CollectionId, Vec<PartitionId>>>;

#[derive(Default)]
struct State {
    query_nodes: Vec<QueryNodeMetrics>,
    data_nodes: Vec<DataNodeMetrics>,
    data_quota: DataQuotaMetrics,
    writable: CollectionsByDb,
    readable: CollectionsByDb,
    tree: RateLimiterTree,
    version: u64,
    last_entries: Option<Vec<RateSnapshotEntry>>,
}

pub struct QuotaCenter {
    metrics: Arc<dyn MetricsSource>,
    proxies: Arc<dyn ProxyClient>,
    oracle: Arc<dyn TimestampOracle>,
    collections: Arc<CollectionsMeta>,
    options: QuotaOptions,
    state: Mutex<State>,
}

impl QuotaCenter {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        proxies: Arc<dyn ProxyClient>,
        oracle: Arc<dyn TimestampOracle>,
        collections: Arc<CollectionsMeta>,
        options: QuotaOptions,
    ) -> Self {
        Self {
            metrics,
            proxies,
            oracle,
            collections,
            options,
            state: Mutex::new(State::default()),
        }
    }

    /// One full collect → calculate → broadcast pass. Failures abort
    /// the pass and are retried next tick.
    pub async fn tick(&self) {
        if let Err(err) = self.collect_metrics().await {
            warn!(error = %err, "quota metric collection failed, keeping previous rates");
            return;
        }
        self.calculate_rates();
        if let Err(err) = self.broadcast().await {
            warn!(error = %err, "rate broadcast failed");
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(*self.options.collect_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.cancelled() => {
                    debug!("quota center stopped");
                    return;
                }
            }
        }
    }

    /// Fetch and parse the three topology documents. Every endpoint
    /// must answer; a stale tree is better than one computed from half
    /// a cluster.
    pub async fn collect_metrics(&self) -> Result<(), QuotaError> {
        let query_raw = self.metrics.get_qc_metrics().await?;
        let data_raw = self.metrics.get_dc_metrics().await?;
        let proxy_raw = self.metrics.get_proxy_metrics().await?;

        let query = parse_query_topology(&query_raw)?;
        let data = parse_data_topology(&data_raw)?;
        for raw in &proxy_raw {
            parse_proxy_metrics(raw)?;
        }

        let mut writable = self.collections.collections_by_database();
        let readable = writable.clone();
        // collections visible only through node effects (ingesting but
        // not loaded) still get rate-limit nodes
        for effect_collection in query
            .nodes
            .iter()
            .flat_map(|n| n.effect.collection_ids.iter())
            .chain(data.nodes.iter().flat_map(|n| n.effect.collection_ids.iter()))
        {
            let collection = CollectionId::new(*effect_collection);
            let Some(db) = self.collections.db_of_collection(collection) else {
                debug!(%collection, "metrics reference unknown collection, skipping");
                continue;
            };
            writable.entry(db).or_default().entry(collection).or_default();
        }

        let mut state = self.state.lock().expect("quota state lock poisoned");
        state.query_nodes = query.nodes;
        state.data_nodes = data.nodes;
        state.data_quota = data.quota;
        state.writable = writable;
        state.readable = readable;
        Ok(())
    }

    /// Rebuild the rate-limit tree from the collected metrics.
    pub fn calculate_rates(&self) {
        let now = self.oracle.now();
        let mut state = self.state.lock().expect("quota state lock poisoned");
        let state = &mut *state;

        self.reset_all_current_rates(state);
        self.calculate_write_rates(state, now);
        if self.options.disk_protection_enabled {
            self.check_disk_quota(state);
        }
        self.calculate_read_rates(state);
        self.calculate_ddl_rates(state);
    }

    fn reset_all_current_rates(&self, state: &mut State) {
        let options = &self.options;
        state.tree.clear();

        let root = state.tree.root_mut();
        for (rate_type, limit) in [
            (RateType::DdlCollection, options.ddl_collection_rate),
            (RateType::DdlPartition, options.ddl_partition_rate),
            (RateType::DdlIndex, options.ddl_index_rate),
            (RateType::DdlCompaction, options.ddl_compaction_rate),
            (RateType::DdlFlush, options.ddl_flush_rate),
        ] {
            root.set_limit(rate_type, Limit::rate(limit));
        }

        let mut scopes: CollectionsByDb = state.writable.clone();
        for (db, collections) in &state.readable {
            let entry = scopes.entry(*db).or_default();
            for (collection, partitions) in collections {
                entry.entry(*collection).or_insert_with(|| partitions.clone());
            }
        }

        for database in self.collections.list_databases() {
            state.tree.database_mut(database.database());
        }
        for (db, collections) in &scopes {
            state.tree.database_mut(*db);
            for (collection, partitions) in collections {
                let overrides = self.collections.collection_properties(*collection);
                let node = state.tree.collection_mut(*db, *collection);
                for (rate_type, configured) in [
                    (RateType::DmlInsert, options.dml_max_insert_rate_per_collection),
                    (RateType::DmlUpsert, options.dml_max_upsert_rate_per_collection),
                    (RateType::DmlDelete, options.dml_max_delete_rate_per_collection),
                    (
                        RateType::DmlBulkLoad,
                        options.dml_max_bulk_load_rate_per_collection,
                    ),
                    (RateType::DqlSearch, options.dql_max_search_rate_per_collection),
                    (RateType::DqlQuery, options.dql_max_query_rate_per_collection),
                ] {
                    let limit = properties::collection_rate_override(&overrides, rate_type)
                        .map(Limit::rate)
                        .unwrap_or(Limit::rate(configured));
                    node.set_limit(rate_type, limit);
                }
                for partition in partitions {
                    let node = state.tree.partition_mut(*db, *collection, *partition);
                    node.set_limit(
                        RateType::DmlInsert,
                        Limit::rate(options.dml_max_insert_rate_per_collection),
                    );
                    node.set_limit(
                        RateType::DmlUpsert,
                        Limit::rate(options.dml_max_upsert_rate_per_collection),
                    );
                }
            }
        }
    }

    fn calculate_write_rates(&self, state: &mut State, now: TsoTimestamp) {
        let options = &self.options;

        if options.force_deny_writing {
            let root = state.tree.root_mut();
            for rate_type in RateType::DML {
                root.set_limit(rate_type, Limit::Rate(0.0));
            }
            root.set_state(QuotaState::DenyToWrite, QuotaCode::ForceDeny);
            info!("writing force-denied cluster-wide");
        }

        // per-database administrative deny
        let dbs: Vec<DatabaseId> = state.writable.keys().copied().collect();
        for db in dbs {
            let Some(record) = self.collections.get_database(db) else {
                continue;
            };
            if properties::database_force_deny_writing(&record.properties) {
                let node = state.tree.database_mut(db);
                for rate_type in RateType::DML {
                    node.set_limit(rate_type, Limit::Rate(0.0));
                }
                node.set_state(QuotaState::DenyToWrite, QuotaCode::ForceDeny);
            }
        }

        if !options.dml_limit_enabled {
            return;
        }

        let factors = self.write_factors(state, now);
        let writable = state.writable.clone();
        for (db, collections) in writable {
            for collection in collections.keys() {
                let (factor, cause) = factors
                    .get(collection)
                    .copied()
                    .unwrap_or((1.0, QuotaCode::Success));
                let node = state.tree.collection_mut(db, *collection);
                if factor <= 0.0 {
                    for rate_type in [RateType::DmlInsert, RateType::DmlUpsert, RateType::DmlDelete]
                    {
                        node.set_limit(rate_type, Limit::Rate(0.0));
                    }
                    node.set_state(QuotaState::DenyToWrite, cause);
                    continue;
                }
                for (rate_type, min) in [
                    (RateType::DmlInsert, options.dml_min_insert_rate_per_collection),
                    (RateType::DmlUpsert, options.dml_min_upsert_rate_per_collection),
                    (RateType::DmlDelete, options.dml_min_delete_rate_per_collection),
                ] {
                    node.scale_limit(rate_type, factor);
                    guarantee_min_rate(node, rate_type, min);
                }
            }
        }
    }

    /// Combined multiplicative write factor per collection: the
    /// minimum of the time-tick delay, memory and growing-segment
    /// factors contributed by the nodes serving the collection.
    fn write_factors(
        &self,
        state: &State,
        now: TsoTimestamp,
    ) -> BTreeMap<CollectionId, (f64, QuotaCode)> {
        let options = &self.options;
        let mut factors: BTreeMap<CollectionId, (f64, QuotaCode)> = BTreeMap::new();
        let mut merge = |collections: &[u64], factor: f64, cause: QuotaCode| {
            for collection in collections {
                let collection = CollectionId::new(*collection);
                let entry = factors.entry(collection).or_insert((1.0, QuotaCode::Success));
                if factor < entry.0 {
                    *entry = (factor, cause);
                }
            }
        };

        if options.tt_protection_enabled {
            let max_delay = options.max_time_tick_delay.as_secs_f64();
            if max_delay > 0.0 {
                let flow_graphs = state
                    .query_nodes
                    .iter()
                    .map(|n| (&n.flow_graph, &n.effect))
                    .chain(state.data_nodes.iter().map(|n| (&n.flow_graph, &n.effect)));
                for (fg, effect) in flow_graphs {
                    if fg.num_flow_graph == 0 || fg.min_flow_graph_tt == 0 {
                        continue;
                    }
                    let delay = now
                        .physical_since(TsoTimestamp::from(fg.min_flow_graph_tt))
                        .as_secs_f64();
                    let factor = ((max_delay - delay) / max_delay).clamp(0.0, 1.0);
                    if factor < 1.0 {
                        debug!(
                            channel = fg.min_flow_graph_channel,
                            delay, factor, "time-tick delay throttling writes"
                        );
                    }
                    merge(&effect.collection_ids, factor, QuotaCode::TimeTickLongDelay);
                }
            }
        }

        let low = options.query_node_memory_low_water_level;
        let high = options.query_node_memory_high_water_level;
        for node in &state.query_nodes {
            if node.hardware.memory == 0 {
                continue;
            }
            let used = node.hardware.memory_usage as f64 / node.hardware.memory as f64;
            let factor = water_level_factor(used, low, high);
            if factor < 1.0 {
                debug!(
                    node = node.node_id,
                    used, factor, "query node memory throttling writes"
                );
            }
            merge(
                &node.effect.collection_ids,
                factor,
                QuotaCode::MemoryQuotaExhausted,
            );
        }

        if options.growing_segments_size_protection_enabled {
            let low = options.growing_segments_size_low_water_level;
            let high = options.growing_segments_size_high_water_level;
            let floor = options.growing_segments_size_min_rate_ratio;
            for node in &state.query_nodes {
                if node.hardware.memory == 0 {
                    continue;
                }
                let used = node.growing_segments_size as f64 / node.hardware.memory as f64;
                let factor = water_level_factor(used, low, high).max(floor);
                merge(
                    &node.effect.collection_ids,
                    factor,
                    QuotaCode::MemoryQuotaExhausted,
                );
            }
        }

        factors
    }

    /// Disk quota: exceeded levels zero insert/upsert at their scope
    /// and raise `DenyToWrite` with `DiskQuotaExhausted`. Deletes and
    /// bulk loads are unaffected; deletes relieve pressure.
    fn check_disk_quota(&self, state: &mut State) {
        let options = &self.options;
        let quota = state.data_quota.clone();

        if options.disk_quota >= 0.0 && quota.total_binlog_size as f64 >= options.disk_quota {
            warn!(
                total = quota.total_binlog_size,
                quota = options.disk_quota,
                "total disk quota exhausted, denying writes cluster-wide"
            );
            deny_write_for_disk(state.tree.root_mut());
            let writable = state.writable.clone();
            for (db, collections) in writable {
                for collection in collections.keys() {
                    deny_write_for_disk(state.tree.collection_mut(db, *collection));
                }
            }
            return;
        }

        let writable = state.writable.clone();
        for (db, collections) in &writable {
            let db_quota = self
                .collections
                .get_database(*db)
                .and_then(|record| properties::database_disk_quota(&record.properties))
                .or((options.disk_quota_per_db >= 0.0).then_some(options.disk_quota_per_db));
            if let Some(db_quota) = db_quota {
                let used = quota.db_binlog_size.get(&db.as_u64()).copied().unwrap_or(0);
                if used as f64 >= db_quota {
                    deny_write_for_disk(state.tree.database_mut(*db));
                }
            }

            for (collection, partitions) in collections {
                if options.disk_quota_per_collection >= 0.0 {
                    let used = quota
                        .collection_binlog_size
                        .get(&collection.as_u64())
                        .copied()
                        .unwrap_or(0);
                    if used as f64 >= options.disk_quota_per_collection {
                        info!(%collection, used, "collection disk quota exhausted");
                        deny_write_for_disk(state.tree.collection_mut(*db, *collection));
                    }
                }
                if options.disk_quota_per_partition >= 0.0 {
                    for partition in partitions {
                        let used = quota
                            .partition_binlog_size
                            .get(&collection.as_u64())
                            .and_then(|parts| parts.get(&partition.as_u64()))
                            .copied()
                            .unwrap_or(0);
                        if used as f64 >= options.disk_quota_per_partition {
                            deny_write_for_disk(state.tree.partition_mut(
                                *db,
                                *collection,
                                *partition,
                            ));
                        }
                    }
                }
            }
        }
    }

    fn calculate_read_rates(&self, state: &mut State) {
        if self.options.force_deny_reading {
            let root = state.tree.root_mut();
            for rate_type in RateType::DQL {
                root.set_limit(rate_type, Limit::Rate(0.0));
            }
            root.set_state(QuotaState::DenyToRead, QuotaCode::ForceDeny);
            let readable = state.readable.clone();
            for (db, collections) in readable {
                for collection in collections.keys() {
                    let node = state.tree.collection_mut(db, *collection);
                    for rate_type in RateType::DQL {
                        node.set_limit(rate_type, Limit::Rate(0.0));
                    }
                    node.set_state(QuotaState::DenyToRead, QuotaCode::ForceDeny);
                }
            }
            return;
        }

        let dbs: Vec<DatabaseId> = state.readable.keys().copied().collect();
        for db in dbs {
            let Some(record) = self.collections.get_database(db) else {
                continue;
            };
            if properties::database_force_deny_reading(&record.properties) {
                let node = state.tree.database_mut(db);
                for rate_type in RateType::DQL {
                    node.set_limit(rate_type, Limit::Rate(0.0));
                }
                node.set_state(QuotaState::DenyToRead, QuotaCode::ForceDeny);
            }
        }
    }

    fn calculate_ddl_rates(&self, state: &mut State) {
        for database in self.collections.list_databases() {
            let denied: Vec<RateType> = RateType::DDL
                .into_iter()
                .filter(|rt| properties::database_force_deny_ddl(&database.properties, *rt))
                .collect();
            if denied.is_empty() {
                continue;
            }
            let node = state.tree.database_mut(database.database());
            for rate_type in denied {
                node.set_limit(rate_type, Limit::Rate(0.0));
            }
            node.set_state(QuotaState::DenyToDdl, QuotaCode::ForceDeny);
        }
    }

    /// Ship the snapshot if it differs from the last broadcast one.
    /// Versions increase monotonically; proxies apply only versions
    /// newer than their last-seen.
    pub async fn broadcast(&self) -> Result<(), QuotaError> {
        let snapshot = {
            let mut state = self.state.lock().expect("quota state lock poisoned");
            let entries = state.tree.entries();
            if state.last_entries.as_ref() == Some(&entries) {
                None
            } else {
                state.version += 1;
                state.last_entries = Some(entries.clone());
                Some(state.tree.snapshot(state.version))
            }
        };
        if let Some(snapshot) = snapshot {
            debug!(version = snapshot.version, entries = snapshot.entries.len(), "broadcasting rates");
            self.proxies.set_rates(snapshot).await?;
        }
        Ok(())
    }

    /// Test and inspection hook: the current limit at a scope.
    pub fn effective_limit(
        &self,
        scope: petrel_types::quota::RateScope,
        rate_type: RateType,
    ) -> Limit {
        let state = self.state.lock().expect("quota state lock poisoned");
        state.tree.effective_limit(scope, rate_type)
    }

    pub fn collection_state(
        &self,
        db: DatabaseId,
        collection: CollectionId,
        quota_state: QuotaState,
    ) -> QuotaCode {
        let state = self.state.lock().expect("quota state lock poisoned");
        state
            .tree
            .collection(db, collection)
            .map(|node| node.state(quota_state))
            .unwrap_or_default()
    }
}

fn deny_write_for_disk(node: &mut RateLimiterNode) {
    node.set_limit(RateType::DmlInsert, Limit::Rate(0.0));
    node.set_limit(RateType::DmlUpsert, Limit::Rate(0.0));
    node.set_state(QuotaState::DenyToWrite, QuotaCode::DiskQuotaExhausted);
}

/// 1.0 below the low water level, 0.0 above the high one, linear in
/// between.
fn water_level_factor(used: f64, low: f64, high: f64) -> f64 {
    if high <= low {
        return if used >= high { 0.0 } else { 1.0 };
    }
    ((high - used) / (high - low)).clamp(0.0, 1.0)
}

fn guarantee_min_rate(node: &mut RateLimiterNode, rate_type: RateType, min: f64) {
    if min <= 0.0 {
        return;
    }
    if let Some(Limit::Rate(rate)) = node.limit(rate_type) {
        if rate > 0.0 && rate < min {
            node.set_limit(rate_type, Limit::Rate(min));
        }
    }
}
