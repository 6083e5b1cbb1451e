// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Hierarchical rate-limit tree.
//!
//! One node per scope (cluster → database → collection → partition),
//! each owning a token bucket per rate type plus deny-state codes.
//! Stored limits are per-node; enforcement takes the minimum over the
//! ancestor chain, which is computed proxy-side from the broadcast
//! snapshot.

use std::collections::BTreeMap;
use std::time::Instant;

use petrel_types::quota::{
    Limit, QuotaCode, QuotaState, RateScope, RateSnapshot, RateSnapshotEntry, RateType,
};
use petrel_types::{CollectionId, DatabaseId, PartitionId};

/// Token bucket refilling at `limit` per second with burst equal to
/// the rate.
#[derive(Debug)]
pub struct TokenBucket {
    limit: Limit,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            tokens: limit.as_f64().min(f64::MAX),
            last_refill: Instant::now(),
        }
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Limit) {
        self.limit = limit;
    }

    /// Consume `n` units if available.
    pub fn try_acquire(&mut self, n: f64) -> bool {
        let Limit::Rate(rate) = self.limit else {
            return true;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(rate);
        self.last_refill = now;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Limits and deny states of one scope.
#[derive(Debug, Default)]
pub struct RateLimiterNode {
    limiters: BTreeMap<RateType, TokenBucket>,
    states: BTreeMap<QuotaState, QuotaCode>,
}

impl RateLimiterNode {
    pub fn set_limit(&mut self, rate_type: RateType, limit: Limit) {
        match self.limiters.get_mut(&rate_type) {
            Some(bucket) => bucket.set_limit(limit),
            None => {
                self.limiters.insert(rate_type, TokenBucket::new(limit));
            }
        }
    }

    pub fn limit(&self, rate_type: RateType) -> Option<Limit> {
        self.limiters.get(&rate_type).map(|b| b.limit())
    }

    /// Multiply the current limit; unlimited stays unlimited.
    pub fn scale_limit(&mut self, rate_type: RateType, factor: f64) {
        if let Some(bucket) = self.limiters.get_mut(&rate_type) {
            if let Limit::Rate(rate) = bucket.limit() {
                bucket.set_limit(Limit::Rate(rate * factor));
            }
        }
    }

    pub fn set_state(&mut self, state: QuotaState, code: QuotaCode) {
        self.states.insert(state, code);
    }

    pub fn state(&self, state: QuotaState) -> QuotaCode {
        self.states.get(&state).copied().unwrap_or_default()
    }

    fn entry(&self, scope: RateScope) -> RateSnapshotEntry {
        RateSnapshotEntry {
            scope,
            limits: self
                .limiters
                .iter()
                .map(|(rt, bucket)| (*rt, bucket.limit()))
                .collect(),
            states: self.states.iter().map(|(qs, code)| (*qs, *code)).collect(),
        }
    }
}

#[derive(Default)]
struct CollectionLimiters {
    node: RateLimiterNode,
    partitions: BTreeMap<PartitionId, RateLimiterNode>,
}

#[derive(Default)]
struct DatabaseLimiters {
    node: RateLimiterNode,
    collections: BTreeMap<CollectionId, CollectionLimiters>,
}

#[derive(Default)]
pub struct RateLimiterTree {
    root: RateLimiterNode,
    databases: BTreeMap<DatabaseId, DatabaseLimiters>,
}

impl RateLimiterTree {
    pub fn clear(&mut self) {
        *self = RateLimiterTree::default();
    }

    pub fn root(&self) -> &RateLimiterNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut RateLimiterNode {
        &mut self.root
    }

    pub fn database_mut(&mut self, db: DatabaseId) -> &mut RateLimiterNode {
        &mut self.databases.entry(db).or_default().node
    }

    pub fn database(&self, db: DatabaseId) -> Option<&RateLimiterNode> {
        self.databases.get(&db).map(|d| &d.node)
    }

    pub fn collection_mut(&mut self, db: DatabaseId, collection: CollectionId) -> &mut RateLimiterNode {
        &mut self
            .databases
            .entry(db)
            .or_default()
            .collections
            .entry(collection)
            .or_default()
            .node
    }

    pub fn collection(&self, db: DatabaseId, collection: CollectionId) -> Option<&RateLimiterNode> {
        self.databases
            .get(&db)
            .and_then(|d| d.collections.get(&collection))
            .map(|c| &c.node)
    }

    pub fn partition_mut(
        &mut self,
        db: DatabaseId,
        collection: CollectionId,
        partition: PartitionId,
    ) -> &mut RateLimiterNode {
        self.databases
            .entry(db)
            .or_default()
            .collections
            .entry(collection)
            .or_default()
            .partitions
            .entry(partition)
            .or_default()
    }

    pub fn partition(
        &self,
        db: DatabaseId,
        collection: CollectionId,
        partition: PartitionId,
    ) -> Option<&RateLimiterNode> {
        self.databases
            .get(&db)
            .and_then(|d| d.collections.get(&collection))
            .and_then(|c| c.partitions.get(&partition))
    }

    /// Visit every collection node.
    pub fn for_each_collection(
        &mut self,
        mut f: impl FnMut(DatabaseId, CollectionId, &mut RateLimiterNode),
    ) {
        for (db, database) in self.databases.iter_mut() {
            for (collection, limiters) in database.collections.iter_mut() {
                f(*db, *collection, &mut limiters.node);
            }
        }
    }

    /// Effective limit at a scope: the minimum over the node and its
    /// ancestors, mirroring proxy-side enforcement.
    pub fn effective_limit(&self, scope: RateScope, rate_type: RateType) -> Limit {
        let mut limit = self.root.limit(rate_type).unwrap_or(Limit::Unlimited);
        let (db, collection, partition) = match scope {
            RateScope::Cluster => return limit,
            RateScope::Database(db) => (db, None, None),
            RateScope::Collection(db, c) => (db, Some(c), None),
            RateScope::Partition(db, c, p) => (db, Some(c), Some(p)),
        };
        if let Some(node) = self.database(db) {
            if let Some(db_limit) = node.limit(rate_type) {
                limit = limit.min(db_limit);
            }
        }
        if let Some(collection) = collection {
            if let Some(node) = self.collection(db, collection) {
                if let Some(c_limit) = node.limit(rate_type) {
                    limit = limit.min(c_limit);
                }
            }
            if let Some(partition) = partition {
                if let Some(node) = self.partition(db, collection, partition) {
                    if let Some(p_limit) = node.limit(rate_type) {
                        limit = limit.min(p_limit);
                    }
                }
            }
        }
        limit
    }

    /// Flatten the tree into a broadcast snapshot.
    pub fn snapshot(&self, version: u64) -> RateSnapshot {
        RateSnapshot {
            version,
            entries: self.entries(),
        }
    }

    pub fn entries(&self) -> Vec<RateSnapshotEntry> {
        let mut entries = vec![self.root.entry(RateScope::Cluster)];
        for (db, database) in &self.databases {
            entries.push(database.node.entry(RateScope::Database(*db)));
            for (collection, limiters) in &database.collections {
                entries.push(limiters.node.entry(RateScope::Collection(*db, *collection)));
                for (partition, node) in &limiters.partitions {
                    entries.push(node.entry(RateScope::Partition(*db, *collection, *partition)));
                }
            }
        }
        entries
    }
}
