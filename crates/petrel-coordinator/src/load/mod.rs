// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Collection load coordination: load jobs, replica observer, target
//! and collection observers.

pub mod job;
pub mod observer;
pub mod replica_observer;
pub mod targets;
pub mod undo;

pub use job::{
    LoadCollectionJob, LoadCollectionRequest, LoadContext, LoadError, LoadPartitionsJob,
    LoadPartitionsRequest, ReleaseCollectionJob,
};
pub use observer::CollectionObserver;
pub use replica_observer::ReplicaObserver;
pub use targets::TargetManager;
