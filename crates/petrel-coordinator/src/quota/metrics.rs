// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Topology documents returned by the metric collection endpoints.
//!
//! Workers serialize these as JSON; the quota center is the only
//! consumer. Missing fields deserialize to their defaults so older
//! workers keep reporting during rolling upgrades.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareMetrics {
    /// Total memory in bytes.
    pub memory: u64,
    pub memory_usage: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowGraphMetrics {
    pub num_flow_graph: usize,
    /// Minimum time-tick across the node's flow graphs (TSO format).
    pub min_flow_graph_tt: u64,
    pub min_flow_graph_channel: String,
}

/// Which collections a node's metrics apply to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeEffect {
    pub node_id: u64,
    pub collection_ids: Vec<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryNodeMetrics {
    pub node_id: u64,
    pub hardware: HardwareMetrics,
    pub flow_graph: FlowGraphMetrics,
    pub growing_segments_size: u64,
    pub effect: NodeEffect,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryTopology {
    pub nodes: Vec<QueryNodeMetrics>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataNodeMetrics {
    pub node_id: u64,
    pub flow_graph: FlowGraphMetrics,
    pub effect: NodeEffect,
}

/// Storage accounting reported by the data plane.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataQuotaMetrics {
    pub total_binlog_size: u64,
    pub db_binlog_size: HashMap<u64, u64>,
    pub collection_binlog_size: HashMap<u64, u64>,
    /// collection → partition → bytes
    pub partition_binlog_size: HashMap<u64, HashMap<u64, u64>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataTopology {
    pub nodes: Vec<DataNodeMetrics>,
    pub quota: DataQuotaMetrics,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyMetrics {
    pub node_id: u64,
}

pub fn parse_query_topology(raw: &str) -> Result<QueryTopology, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn parse_data_topology(raw: &str) -> Result<DataTopology, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn parse_proxy_metrics(raw: &str) -> Result<ProxyMetrics, serde_json::Error> {
    serde_json::from_str(raw)
}
