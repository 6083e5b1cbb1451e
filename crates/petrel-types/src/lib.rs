// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Shared vocabulary of the Petrel coordination plane: identifiers,
//! versioned-metadata primitives, persisted record types and
//! configuration.

pub mod channel;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod keys;
pub mod node;
pub mod properties;
pub mod quota;
pub mod replica;
pub mod segment;
pub mod tso;
mod version;

pub use version::{Version, Versioned};

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            derive_more::Display,
            derive_more::Debug,
            derive_more::From,
            derive_more::Into,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[display("{}{}", $prefix, _0)]
        #[debug("{}{}", $prefix, _0)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }
    };
}

id_type!(
    /// Identifier of a logical dataset.
    CollectionId,
    "c"
);
id_type!(
    /// Identifier of a partition within a collection.
    PartitionId,
    "p"
);
id_type!(
    /// Identifier of an immutable data segment.
    SegmentId,
    "s"
);
id_type!(
    /// Identifier of a query replica of a loaded collection.
    ReplicaId,
    "r"
);
id_type!(
    /// Identifier of a database (namespace of collections).
    DatabaseId,
    "db"
);
id_type!(
    /// Identifier of a compaction plan.
    PlanId,
    "plan-"
);
id_type!(
    /// Groups the compaction tasks emitted by one scheduling pass.
    TriggerId,
    "trigger-"
);
id_type!(
    /// Fencing token for channel watch/release operations. Allocated
    /// fresh for every new RPC intent so late replies are detectable.
    OpId,
    "op-"
);

/// Identifier of a worker node. The reserved value [`NodeId::BUFFER`]
/// is the sentinel owner of channels that currently have no live
/// assignment.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::Debug,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
#[display("n{}", _0)]
#[debug("n{}", _0)]
pub struct NodeId(u64);

impl NodeId {
    /// Sentinel owner of unassigned channels.
    pub const BUFFER: NodeId = NodeId(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_buffer(self) -> bool {
        self.0 == Self::BUFFER.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_node_is_reserved() {
        assert!(NodeId::BUFFER.is_buffer());
        assert!(!NodeId::new(1).is_buffer());
    }

    #[test]
    fn id_display_prefixes() {
        assert_eq!(CollectionId::new(42).to_string(), "c42");
        assert_eq!(PlanId::new(7).to_string(), "plan-7");
        assert_eq!(NodeId::new(3).to_string(), "n3");
    }
}
