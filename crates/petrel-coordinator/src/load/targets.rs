// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Current/next target snapshots.
//!
//! A target is the set of segments and channels a loaded collection is
//! expected to serve. The *next* target is rebuilt from the segment
//! catalog while loading progresses; it is atomically promoted to
//! *current* once every replica reports coverage.

use std::collections::BTreeSet;
use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};
use tracing::debug;

use petrel_types::{CollectionId, SegmentId};

use crate::meta::{CollectionsMeta, SegmentsMeta};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub segments: BTreeSet<SegmentId>,
    pub channels: BTreeSet<String>,
    pub version: u64,
}

#[derive(Default)]
struct Targets {
    current: Option<TargetSnapshot>,
    next: Option<TargetSnapshot>,
}

pub struct TargetManager {
    segments: std::sync::Arc<SegmentsMeta>,
    collections: std::sync::Arc<CollectionsMeta>,
    inner: Mutex<HashMap<CollectionId, Targets>>,
    version: std::sync::atomic::AtomicU64,
}

impl TargetManager {
    pub fn new(
        segments: std::sync::Arc<SegmentsMeta>,
        collections: std::sync::Arc<CollectionsMeta>,
    ) -> Self {
        Self {
            segments,
            collections,
            inner: Mutex::new(HashMap::new()),
            version: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Rebuild the next target of a collection from the catalog.
    pub fn update_next_target(&self, collection: CollectionId) {
        let channels: BTreeSet<String> = self
            .collections
            .get_collection(collection)
            .map(|record| record.vchannels.into_iter().collect())
            .unwrap_or_default();
        let segments: BTreeSet<SegmentId> =
            self.segments.flushed_segments_of(collection).into_iter().collect();
        let version = self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;

        let mut inner = self.inner.lock().expect("target lock poisoned");
        let targets = inner.entry(collection).or_default();
        targets.next = Some(TargetSnapshot {
            segments,
            channels,
            version,
        });
        debug!(%collection, version, "updated next target");
    }

    /// Swap next into current; the two snapshots are never mixed.
    pub fn promote_next(&self, collection: CollectionId) {
        let mut inner = self.inner.lock().expect("target lock poisoned");
        if let Some(targets) = inner.get_mut(&collection) {
            if let Some(next) = targets.next.take() {
                debug!(%collection, version = next.version, "promoted next target");
                targets.current = Some(next);
            }
        }
    }

    pub fn current_target(&self, collection: CollectionId) -> Option<TargetSnapshot> {
        let inner = self.inner.lock().expect("target lock poisoned");
        inner.get(&collection).and_then(|t| t.current.clone())
    }

    pub fn next_target(&self, collection: CollectionId) -> Option<TargetSnapshot> {
        let inner = self.inner.lock().expect("target lock poisoned");
        inner.get(&collection).and_then(|t| t.next.clone())
    }

    pub fn remove_collection(&self, collection: CollectionId) {
        let mut inner = self.inner.lock().expect("target lock poisoned");
        inner.remove(&collection);
    }
}
