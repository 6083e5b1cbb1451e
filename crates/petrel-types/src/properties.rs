// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Recognized per-collection and per-database property overrides.
//!
//! Properties are free-form string pairs attached to collection and
//! database records; only the keys below have coordinator-side
//! meaning. Unparseable values are treated as unset.

use std::collections::HashMap;
use std::time::Duration;

use crate::quota::RateType;

pub const COLLECTION_TTL_SECONDS: &str = "collection.ttl.seconds";
pub const COLLECTION_AUTO_COMPACTION_ENABLED: &str = "collection.autocompaction.enabled";
pub const COLLECTION_INSERT_RATE_MAX_MB: &str = "collection.insertRate.max.mb";
pub const COLLECTION_UPSERT_RATE_MAX_MB: &str = "collection.upsertRate.max.mb";
pub const COLLECTION_DELETE_RATE_MAX_MB: &str = "collection.deleteRate.max.mb";
pub const COLLECTION_BULK_LOAD_RATE_MAX_MB: &str = "collection.bulkLoadRate.max.mb";
pub const COLLECTION_SEARCH_RATE_MAX: &str = "collection.searchRate.max.qps";
pub const COLLECTION_QUERY_RATE_MAX: &str = "collection.queryRate.max.qps";
pub const PARTITION_KEY_ISOLATION: &str = "partitionkey.isolation";

pub const DATABASE_FORCE_DENY_WRITING: &str = "database.forceDeny.writing";
pub const DATABASE_FORCE_DENY_READING: &str = "database.forceDeny.reading";
pub const DATABASE_FORCE_DENY_DDL: &str = "database.forceDeny.ddl";
pub const DATABASE_FORCE_DENY_COLLECTION_DDL: &str = "database.forceDeny.collectionDdl";
pub const DATABASE_FORCE_DENY_PARTITION_DDL: &str = "database.forceDeny.partitionDdl";
pub const DATABASE_FORCE_DENY_INDEX_DDL: &str = "database.forceDeny.indexDdl";
pub const DATABASE_FORCE_DENY_FLUSH_DDL: &str = "database.forceDeny.flushDdl";
pub const DATABASE_FORCE_DENY_COMPACTION_DDL: &str = "database.forceDeny.compactionDdl";
pub const DATABASE_DISK_QUOTA_MB: &str = "database.diskQuota.mb";

pub type Properties = HashMap<String, String>;

fn get_bool(props: &Properties, key: &str) -> Option<bool> {
    props.get(key).and_then(|v| v.parse::<bool>().ok())
}

fn get_f64(props: &Properties, key: &str) -> Option<f64> {
    props.get(key).and_then(|v| v.parse::<f64>().ok())
}

/// Collection TTL; `None` when unset, zero or unparseable.
pub fn collection_ttl(props: &Properties) -> Option<Duration> {
    let seconds = get_f64(props, COLLECTION_TTL_SECONDS)?;
    if seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// Auto-compaction defaults to enabled unless explicitly turned off.
pub fn auto_compaction_enabled(props: &Properties) -> bool {
    get_bool(props, COLLECTION_AUTO_COMPACTION_ENABLED).unwrap_or(true)
}

/// Per-collection rate override for a rate type, already converted to
/// the unit of the rate tree (bytes/sec for DML, requests/sec for DQL).
pub fn collection_rate_override(props: &Properties, rate_type: RateType) -> Option<f64> {
    const MB: f64 = 1024.0 * 1024.0;
    match rate_type {
        RateType::DmlInsert => get_f64(props, COLLECTION_INSERT_RATE_MAX_MB).map(|v| v * MB),
        RateType::DmlUpsert => get_f64(props, COLLECTION_UPSERT_RATE_MAX_MB).map(|v| v * MB),
        RateType::DmlDelete => get_f64(props, COLLECTION_DELETE_RATE_MAX_MB).map(|v| v * MB),
        RateType::DmlBulkLoad => get_f64(props, COLLECTION_BULK_LOAD_RATE_MAX_MB).map(|v| v * MB),
        RateType::DqlSearch => get_f64(props, COLLECTION_SEARCH_RATE_MAX),
        RateType::DqlQuery => get_f64(props, COLLECTION_QUERY_RATE_MAX),
        _ => None,
    }
}

pub fn database_force_deny_writing(props: &Properties) -> bool {
    get_bool(props, DATABASE_FORCE_DENY_WRITING).unwrap_or(false)
}

pub fn database_force_deny_reading(props: &Properties) -> bool {
    get_bool(props, DATABASE_FORCE_DENY_READING).unwrap_or(false)
}

/// Force-deny flag for a DDL rate type, honoring both the blanket
/// `database.forceDeny.ddl` and the per-kind flags.
pub fn database_force_deny_ddl(props: &Properties, rate_type: RateType) -> bool {
    if get_bool(props, DATABASE_FORCE_DENY_DDL).unwrap_or(false) {
        return true;
    }
    let key = match rate_type {
        RateType::DdlCollection => DATABASE_FORCE_DENY_COLLECTION_DDL,
        RateType::DdlPartition => DATABASE_FORCE_DENY_PARTITION_DDL,
        RateType::DdlIndex => DATABASE_FORCE_DENY_INDEX_DDL,
        RateType::DdlFlush => DATABASE_FORCE_DENY_FLUSH_DDL,
        RateType::DdlCompaction => DATABASE_FORCE_DENY_COMPACTION_DDL,
        _ => return false,
    };
    get_bool(props, key).unwrap_or(false)
}

/// Per-database disk quota in bytes; `None` when unset or negative.
pub fn database_disk_quota(props: &Properties) -> Option<f64> {
    let mb = get_f64(props, DATABASE_DISK_QUOTA_MB)?;
    if mb >= 0.0 {
        Some(mb * 1024.0 * 1024.0)
    } else {
        None
    }
}
