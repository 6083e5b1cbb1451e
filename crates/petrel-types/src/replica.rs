// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Collection load state and replica placement records.

use crate::{CollectionId, DatabaseId, NodeId, PartitionId, ReplicaId};

pub const DEFAULT_RESOURCE_GROUP: &str = "__default_resource_group";

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum LoadStatus {
    NotLoaded = 0,
    Loading = 1,
    Loaded = 2,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum LoadType {
    LoadCollection = 0,
    LoadPartition = 1,
}

/// Persisted load state of a collection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectionRecord {
    #[prost(uint64, tag = "1")]
    pub collection_id: u64,
    #[prost(uint64, tag = "2")]
    pub db_id: u64,
    #[prost(uint32, tag = "3")]
    pub replica_number: u32,
    #[prost(enumeration = "LoadStatus", tag = "4")]
    pub status: i32,
    #[prost(enumeration = "LoadType", tag = "5")]
    pub load_type: i32,
    #[prost(uint64, repeated, tag = "6")]
    pub load_fields: ::prost::alloc::vec::Vec<u64>,
    /// Unix seconds.
    #[prost(uint64, tag = "7")]
    pub created_at: u64,
    /// Recognized `collection.*` property overrides.
    #[prost(map = "string, string", tag = "8")]
    pub properties:
        ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    /// Virtual channel names of the collection, snapshotted at load
    /// time.
    #[prost(string, repeated, tag = "9")]
    pub vchannels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

impl CollectionRecord {
    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn database(&self) -> DatabaseId {
        DatabaseId::new(self.db_id)
    }

    pub fn load_status(&self) -> LoadStatus {
        LoadStatus::try_from(self.status).unwrap_or_default()
    }

    pub fn load_kind(&self) -> LoadType {
        LoadType::try_from(self.load_type).unwrap_or_default()
    }
}

/// Database catalog entry; properties carry the recognized
/// `database.*` overrides (force-deny flags, disk quota).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatabaseRecord {
    #[prost(uint64, tag = "1")]
    pub db_id: u64,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "3")]
    pub properties:
        ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}

impl DatabaseRecord {
    pub fn database(&self) -> DatabaseId {
        DatabaseId::new(self.db_id)
    }
}

/// Persisted load state of a partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionRecord {
    #[prost(uint64, tag = "1")]
    pub collection_id: u64,
    #[prost(uint64, tag = "2")]
    pub partition_id: u64,
    #[prost(uint32, tag = "3")]
    pub replica_number: u32,
    #[prost(enumeration = "LoadStatus", tag = "4")]
    pub status: i32,
    #[prost(uint64, tag = "5")]
    pub created_at: u64,
}

impl PartitionRecord {
    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId::new(self.partition_id)
    }

    pub fn load_status(&self) -> LoadStatus {
        LoadStatus::try_from(self.status).unwrap_or_default()
    }
}

/// Persisted replica placement.
///
/// Nodes move rw → ro while draining and are removed only once the
/// distribution shows them empty; a node id never appears in both
/// sets.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaRecord {
    #[prost(uint64, tag = "1")]
    pub replica_id: u64,
    #[prost(uint64, tag = "2")]
    pub collection_id: u64,
    #[prost(string, tag = "3")]
    pub resource_group: ::prost::alloc::string::String,
    #[prost(uint64, repeated, tag = "4")]
    pub rw_nodes: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "5")]
    pub ro_nodes: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "6")]
    pub rw_sq_nodes: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "7")]
    pub ro_sq_nodes: ::prost::alloc::vec::Vec<u64>,
    #[prost(bool, tag = "8")]
    pub channel_exclusive: bool,
}

impl ReplicaRecord {
    pub fn replica(&self) -> ReplicaId {
        ReplicaId::new(self.replica_id)
    }

    pub fn collection(&self) -> CollectionId {
        CollectionId::new(self.collection_id)
    }

    pub fn rw(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.rw_nodes.iter().copied().map(NodeId::new)
    }

    pub fn ro(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ro_nodes.iter().copied().map(NodeId::new)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.rw_nodes.contains(&node.as_u64()) || self.ro_nodes.contains(&node.as_u64())
    }

    /// Move a node from the rw set to the ro set. Inserting an unknown
    /// node into ro directly is not allowed; drain starts from rw.
    pub fn demote(&mut self, node: NodeId) {
        let raw = node.as_u64();
        if let Some(idx) = self.rw_nodes.iter().position(|n| *n == raw) {
            self.rw_nodes.swap_remove(idx);
            if !self.ro_nodes.contains(&raw) {
                self.ro_nodes.push(raw);
            }
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        let raw = node.as_u64();
        self.rw_nodes.retain(|n| *n != raw);
        self.ro_nodes.retain(|n| *n != raw);
    }

    pub fn add_rw(&mut self, node: NodeId) {
        let raw = node.as_u64();
        self.ro_nodes.retain(|n| *n != raw);
        if !self.rw_nodes.contains(&raw) {
            self.rw_nodes.push(raw);
        }
    }

    pub fn ro_sq(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ro_sq_nodes.iter().copied().map(NodeId::new)
    }

    pub fn contains_sq(&self, node: NodeId) -> bool {
        self.rw_sq_nodes.contains(&node.as_u64()) || self.ro_sq_nodes.contains(&node.as_u64())
    }

    pub fn add_rw_sq(&mut self, node: NodeId) {
        let raw = node.as_u64();
        self.ro_sq_nodes.retain(|n| *n != raw);
        if !self.rw_sq_nodes.contains(&raw) {
            self.rw_sq_nodes.push(raw);
        }
    }

    pub fn demote_sq(&mut self, node: NodeId) {
        let raw = node.as_u64();
        if let Some(idx) = self.rw_sq_nodes.iter().position(|n| *n == raw) {
            self.rw_sq_nodes.swap_remove(idx);
            if !self.ro_sq_nodes.contains(&raw) {
                self.ro_sq_nodes.push(raw);
            }
        }
    }

    pub fn remove_sq(&mut self, node: NodeId) {
        let raw = node.as_u64();
        self.rw_sq_nodes.retain(|n| *n != raw);
        self.ro_sq_nodes.retain(|n| *n != raw);
    }
}
