// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Cluster-wide admission-rate control.

pub mod center;
pub mod limiter;
pub mod metrics;

pub use center::{QuotaCenter, QuotaError};
pub use limiter::{RateLimiterNode, RateLimiterTree, TokenBucket};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use petrel_metadata_store::{MemoryMetaStore, MetaStoreClient};
    use petrel_types::config::QuotaOptions;
    use petrel_types::quota::{Limit, QuotaCode, QuotaState, RateScope, RateSnapshot, RateType};
    use petrel_types::replica::{CollectionRecord, DatabaseRecord};
    use petrel_types::tso::TsoTimestamp;
    use petrel_types::{CollectionId, DatabaseId};

    use crate::cluster::mock::ManualOracle;
    use crate::cluster::{MockMetricsSource, MockProxyClient, WorkerError};
    use crate::meta::CollectionsMeta;

    use super::metrics::{
        DataQuotaMetrics, DataTopology, FlowGraphMetrics, HardwareMetrics, NodeEffect,
        QueryNodeMetrics, QueryTopology,
    };
    use super::*;

    const MB: f64 = 1024.0 * 1024.0;
    const NOW_MS: u64 = 1_000_000_000;

    struct Fixture {
        center: QuotaCenter,
        /// Topology documents the mocked endpoints serve; `None` makes
        /// the endpoint fail.
        qc: Arc<Mutex<Option<String>>>,
        dc: Arc<Mutex<Option<String>>>,
        /// Snapshots the mocked proxy received.
        snapshots: Arc<Mutex<Vec<RateSnapshot>>>,
        collections: Arc<CollectionsMeta>,
    }

    impl Fixture {
        fn set_qc(&self, topology: String) {
            *self.qc.lock().unwrap() = Some(topology);
        }

        fn set_dc(&self, topology: String) {
            *self.dc.lock().unwrap() = Some(topology);
        }
    }

    async fn fixture(options: QuotaOptions) -> Fixture {
        let client = MetaStoreClient::new(Arc::new(MemoryMetaStore::new()));
        let collections = Arc::new(CollectionsMeta::new(client));
        collections
            .put_database(DatabaseRecord {
                db_id: 0,
                name: "default".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();
        for id in 1..=3u64 {
            collections
                .put_collection(
                    CollectionRecord {
                        collection_id: id,
                        db_id: 0,
                        ..Default::default()
                    },
                    vec![],
                )
                .await
                .unwrap();
        }

        let qc = Arc::new(Mutex::new(Some(
            serde_json::to_string(&QueryTopology::default()).unwrap(),
        )));
        let dc = Arc::new(Mutex::new(Some(
            serde_json::to_string(&DataTopology::default()).unwrap(),
        )));
        let mut source = MockMetricsSource::new();
        {
            let qc = qc.clone();
            source
                .expect_get_qc_metrics()
                .returning(move || qc.lock().unwrap().clone().ok_or(WorkerError::Timeout));
        }
        {
            let dc = dc.clone();
            source
                .expect_get_dc_metrics()
                .returning(move || dc.lock().unwrap().clone().ok_or(WorkerError::Timeout));
        }
        source.expect_get_proxy_metrics().returning(|| Ok(Vec::new()));

        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let mut proxy = MockProxyClient::new();
        {
            let snapshots = snapshots.clone();
            proxy.expect_set_rates().returning(move |snapshot| {
                snapshots.lock().unwrap().push(snapshot);
                Ok(())
            });
        }

        let oracle = Arc::new(ManualOracle::at(TsoTimestamp::compose(NOW_MS, 0)));
        let center = QuotaCenter::new(
            Arc::new(source),
            Arc::new(proxy),
            oracle.clone(),
            collections.clone(),
            options,
        );
        Fixture {
            center,
            qc,
            dc,
            snapshots,
            collections,
        }
    }

    fn write_options() -> QuotaOptions {
        QuotaOptions {
            dml_limit_enabled: true,
            tt_protection_enabled: true,
            max_time_tick_delay: std::time::Duration::from_secs(10).into(),
            dml_max_insert_rate_per_collection: 100.0 * MB,
            dml_min_insert_rate_per_collection: 0.0,
            dml_max_upsert_rate_per_collection: 100.0 * MB,
            dml_min_upsert_rate_per_collection: 0.0,
            dml_max_delete_rate_per_collection: 100.0 * MB,
            dml_min_delete_rate_per_collection: 0.0,
            ..Default::default()
        }
    }

    fn query_node_with_tt(delay_secs: u64, collections: &[u64]) -> QueryTopology {
        QueryTopology {
            nodes: vec![QueryNodeMetrics {
                node_id: 1,
                flow_graph: FlowGraphMetrics {
                    num_flow_graph: 1,
                    min_flow_graph_tt: u64::from(TsoTimestamp::compose(
                        NOW_MS - delay_secs * 1000,
                        0,
                    )),
                    min_flow_graph_channel: "dml_0".to_owned(),
                },
                effect: NodeEffect {
                    node_id: 1,
                    collection_ids: collections.to_vec(),
                },
                ..Default::default()
            }],
        }
    }

    fn collection_limit(f: &Fixture, collection: u64, rate_type: RateType) -> Limit {
        f.center.effective_limit(
            RateScope::Collection(DatabaseId::new(0), CollectionId::new(collection)),
            rate_type,
        )
    }

    #[tokio::test]
    async fn time_tick_back_pressure_is_linear() {
        let f = fixture(write_options()).await;
        let cases: [(u64, f64); 8] = [
            (0, 1.0),
            (1, 0.9),
            (2, 0.8),
            (5, 0.5),
            (7, 0.3),
            (9, 0.1),
            (10, 0.0),
            (100, 0.0),
        ];
        for (delay, expected) in cases {
            f.set_qc(serde_json::to_string(&query_node_with_tt(delay, &[1, 2, 3])).unwrap());
            f.center.collect_metrics().await.unwrap();
            f.center.calculate_rates();

            let limit = collection_limit(&f, 1, RateType::DmlDelete);
            let factor = limit.as_f64() / (100.0 * MB);
            assert!(
                (factor - expected).abs() < 0.01,
                "delay {delay}s: expected factor {expected}, got {factor}"
            );
        }
    }

    #[tokio::test]
    async fn memory_factor_water_levels() {
        let cases: [(f64, f64, u64, u64, f64); 6] = [
            (0.8, 0.9, 10, 100, 1.0),
            (0.8, 0.9, 80, 100, 1.0),
            (0.8, 0.9, 82, 100, 0.8),
            (0.8, 0.9, 85, 100, 0.5),
            (0.8, 0.9, 88, 100, 0.2),
            (0.8, 0.9, 90, 100, 0.0),
        ];
        for (low, high, usage, total, expected) in cases {
            let mut options = write_options();
            options.tt_protection_enabled = false;
            options.query_node_memory_low_water_level = low;
            options.query_node_memory_high_water_level = high;
            let f = fixture(options).await;
            let topology = QueryTopology {
                nodes: vec![QueryNodeMetrics {
                    node_id: 1,
                    hardware: HardwareMetrics {
                        memory: total,
                        memory_usage: usage,
                    },
                    effect: NodeEffect {
                        node_id: 1,
                        collection_ids: vec![1],
                    },
                    ..Default::default()
                }],
            };
            f.set_qc(serde_json::to_string(&topology).unwrap());
            f.center.collect_metrics().await.unwrap();
            f.center.calculate_rates();

            let factor = collection_limit(&f, 1, RateType::DmlInsert).as_f64() / (100.0 * MB);
            assert!(
                (factor - expected).abs() < 0.01,
                "usage {usage}/{total}: expected {expected}, got {factor}"
            );
        }
    }

    #[tokio::test]
    async fn growing_segments_factor_has_a_floor() {
        let mut options = write_options();
        options.tt_protection_enabled = false;
        options.growing_segments_size_protection_enabled = true;
        options.growing_segments_size_low_water_level = 0.8;
        options.growing_segments_size_high_water_level = 0.9;
        options.growing_segments_size_min_rate_ratio = 0.5;
        let f = fixture(options).await;

        // 88% of memory in growing segments: the raw factor 0.2 is
        // lifted to the configured floor, unlike the memory factor
        let topology = QueryTopology {
            nodes: vec![QueryNodeMetrics {
                node_id: 1,
                hardware: HardwareMetrics {
                    memory: 100,
                    memory_usage: 0,
                },
                growing_segments_size: 88,
                effect: NodeEffect {
                    node_id: 1,
                    collection_ids: vec![1],
                },
                ..Default::default()
            }],
        };
        f.set_qc(serde_json::to_string(&topology).unwrap());
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();

        let factor = collection_limit(&f, 1, RateType::DmlInsert).as_f64() / (100.0 * MB);
        assert!((factor - 0.5).abs() < 0.01, "expected floor 0.5, got {factor}");
    }

    #[tokio::test]
    async fn disk_quota_per_collection_denies_insert_but_not_delete() {
        let mut options = write_options();
        options.tt_protection_enabled = false;
        options.disk_quota_per_collection = 30.0 * MB;
        let f = fixture(options).await;

        let data = DataTopology {
            quota: DataQuotaMetrics {
                collection_binlog_size: [
                    (1u64, (20.0 * MB) as u64),
                    (2, (30.0 * MB) as u64),
                    (3, (60.0 * MB) as u64),
                ]
                .into_iter()
                .collect(),
                ..Default::default()
            },
            ..Default::default()
        };
        f.set_dc(serde_json::to_string(&data).unwrap());
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();

        // collection 1 is under quota
        assert!(!collection_limit(&f, 1, RateType::DmlInsert).is_zero());
        assert!(!collection_limit(&f, 1, RateType::DmlUpsert).is_zero());
        assert!(!collection_limit(&f, 1, RateType::DmlDelete).is_zero());

        // collections 2 and 3 exhausted their quota: writes denied,
        // deletes still allowed to relieve pressure
        for collection in [2u64, 3] {
            assert!(collection_limit(&f, collection, RateType::DmlInsert).is_zero());
            assert!(collection_limit(&f, collection, RateType::DmlUpsert).is_zero());
            assert!(!collection_limit(&f, collection, RateType::DmlDelete).is_zero());
            assert_eq!(
                f.center.collection_state(
                    DatabaseId::new(0),
                    CollectionId::new(collection),
                    QuotaState::DenyToWrite
                ),
                QuotaCode::DiskQuotaExhausted
            );
        }
    }

    #[tokio::test]
    async fn no_live_query_nodes_keeps_configured_defaults() {
        let f = fixture(write_options()).await;
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        assert_eq!(
            collection_limit(&f, 1, RateType::DmlInsert),
            Limit::Rate(100.0 * MB)
        );
    }

    #[tokio::test]
    async fn force_deny_flags_zero_their_rate_class() {
        let mut options = write_options();
        options.force_deny_writing = true;
        options.force_deny_reading = true;
        let f = fixture(options).await;
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();

        for rate_type in RateType::DML {
            assert!(f
                .center
                .effective_limit(RateScope::Cluster, rate_type)
                .is_zero());
        }
        // the cluster-level deny dominates every collection
        assert!(collection_limit(&f, 1, RateType::DmlInsert).is_zero());
        assert!(collection_limit(&f, 1, RateType::DqlSearch).is_zero());
    }

    #[tokio::test]
    async fn guarantee_min_rate_floors_scaled_limits() {
        let mut options = write_options();
        options.dml_min_insert_rate_per_collection = 20.0 * MB;
        let f = fixture(options).await;

        // 9s of 10s delay: scaling would leave 10 MB/s, the configured
        // minimum lifts it back to 20 MB/s
        f.set_qc(serde_json::to_string(&query_node_with_tt(9, &[1])).unwrap());
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        let limit = collection_limit(&f, 1, RateType::DmlInsert);
        assert_eq!(limit, Limit::Rate(20.0 * MB));
    }

    #[tokio::test]
    async fn database_properties_deny_reads_and_ddl() {
        let f = fixture(write_options()).await;
        f.collections
            .put_database(DatabaseRecord {
                db_id: 0,
                name: "default".to_owned(),
                properties: [
                    (
                        petrel_types::properties::DATABASE_FORCE_DENY_READING.to_owned(),
                        "true".to_owned(),
                    ),
                    (
                        petrel_types::properties::DATABASE_FORCE_DENY_DDL.to_owned(),
                        "true".to_owned(),
                    ),
                ]
                .into_iter()
                .collect(),
            })
            .await
            .unwrap();

        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        assert!(f
            .center
            .effective_limit(
                RateScope::Database(DatabaseId::new(0)),
                RateType::DqlSearch
            )
            .is_zero());
        assert!(f
            .center
            .effective_limit(
                RateScope::Database(DatabaseId::new(0)),
                RateType::DdlCollection
            )
            .is_zero());
        // writes in the database are untouched
        assert!(!collection_limit(&f, 1, RateType::DmlInsert).is_zero());
    }

    #[tokio::test]
    async fn broadcast_versions_increase_and_skip_unchanged() {
        let f = fixture(write_options()).await;
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        f.center.broadcast().await.unwrap();
        let first = f.snapshots.lock().unwrap().last().cloned().unwrap();

        // identical tree: no new broadcast
        f.center.calculate_rates();
        f.center.broadcast().await.unwrap();
        assert_eq!(f.snapshots.lock().unwrap().len(), 1);

        // a throttled node changes the tree: new, higher version
        f.set_qc(serde_json::to_string(&query_node_with_tt(5, &[1])).unwrap());
        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        f.center.broadcast().await.unwrap();
        let second = f.snapshots.lock().unwrap().last().cloned().unwrap();
        assert!(second.version > first.version);
        assert_eq!(f.snapshots.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn collection_rate_override_property_wins() {
        let f = fixture(write_options()).await;
        f.collections
            .put_collection(
                CollectionRecord {
                    collection_id: 1,
                    db_id: 0,
                    properties: [(
                        petrel_types::properties::COLLECTION_INSERT_RATE_MAX_MB.to_owned(),
                        "2".to_owned(),
                    )]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                },
                vec![],
            )
            .await
            .unwrap();

        f.center.collect_metrics().await.unwrap();
        f.center.calculate_rates();
        assert_eq!(
            collection_limit(&f, 1, RateType::DmlInsert),
            Limit::Rate(2.0 * MB)
        );
        // collections without the property keep the configured max
        assert_eq!(
            collection_limit(&f, 2, RateType::DmlInsert),
            Limit::Rate(100.0 * MB)
        );
    }

    #[tokio::test]
    async fn failed_collection_aborts_the_pass() {
        let f = fixture(write_options()).await;
        // no dc metrics configured: endpoint fails
        *f.dc.lock().unwrap() = None;
        assert!(f.center.collect_metrics().await.is_err());
    }
}
