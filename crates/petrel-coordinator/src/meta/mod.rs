// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Coordinator-side projections over the metadata store.
//!
//! Each projection holds `memory = store ∪ pending-writes`: mutations
//! are persisted before the in-memory view is updated, and every
//! projection rebuilds itself from the store on coordinator startup
//! before external requests are accepted.

pub mod collections;
pub mod replicas;
pub mod resource_groups;
pub mod segments;

pub use collections::CollectionsMeta;
pub use replicas::ReplicaManager;
pub use resource_groups::ResourceManager;
pub use segments::{ChanPartSegments, SegmentsMeta};
