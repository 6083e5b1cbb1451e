// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Worker node registration records.

use crate::NodeId;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum NodeRole {
    Ingest = 0,
    Query = 1,
    StreamingQuery = 2,
}

/// ReadOnly marks a node that is being drained; it must not receive
/// new assignments but keeps serving what it already holds.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum NodeMembership {
    ReadWrite = 0,
    ReadOnly = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRecord {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,
    #[prost(enumeration = "NodeRole", tag = "3")]
    pub role: i32,
    #[prost(enumeration = "NodeMembership", tag = "4")]
    pub membership: i32,
    /// Resource group the node belongs to; empty for ingest nodes.
    #[prost(string, tag = "5")]
    pub resource_group: ::prost::alloc::string::String,
}

impl NodeRecord {
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    pub fn node_role(&self) -> NodeRole {
        NodeRole::try_from(self.role).unwrap_or_default()
    }

    pub fn node_membership(&self) -> NodeMembership {
        NodeMembership::try_from(self.membership).unwrap_or_default()
    }

    pub fn is_read_only(&self) -> bool {
        self.node_membership() == NodeMembership::ReadOnly
    }
}
