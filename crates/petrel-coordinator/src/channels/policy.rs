// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Channel placement policies.

use std::collections::BTreeMap;

use petrel_types::NodeId;

/// Node for the next assignment: fewest currently-assigned channels,
/// ties broken by the lowest node id. `counts` must already be
/// restricted to nodes eligible for new assignments.
pub fn choose_node(counts: &BTreeMap<NodeId, usize>) -> Option<NodeId> {
    counts
        .iter()
        .min_by_key(|(node, count)| (**count, **node))
        .map(|(node, _)| *node)
}

/// Pick one channel donation for auto-balance: the most loaded node
/// gives up a channel when it holds more than the balanced share
/// `ceil(total / nodes)`. Returns the donor node. At most one donation
/// per tick keeps the rebalance conservative.
pub fn balance_donor(counts: &BTreeMap<NodeId, usize>) -> Option<NodeId> {
    if counts.len() < 2 {
        return None;
    }
    let total: usize = counts.values().sum();
    let share = total.div_ceil(counts.len());
    counts
        .iter()
        .max_by_key(|(node, count)| (**count, std::cmp::Reverse(**node)))
        .filter(|(_, count)| **count > share)
        .map(|(node, _)| *node)
}
