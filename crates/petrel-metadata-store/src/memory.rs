// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use bytestring::ByteString;
use tracing::trace;

use petrel_types::Version;

use crate::{
    KeyValue, MetaStore, Precondition, PreconditionViolation, ReadError, VersionedValue,
    WriteError,
};

/// In-memory metadata store.
///
/// Backs the coordinator tests and embedded single-binary deployments.
/// A `BTreeMap` keeps keys ordered so prefix scans are range scans.
#[derive(Clone, Default)]
pub struct MemoryMetaStore {
    entries: Arc<Mutex<BTreeMap<ByteString, VersionedValue>>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_precondition(
        entries: &BTreeMap<ByteString, VersionedValue>,
        key: &ByteString,
        precondition: Precondition,
    ) -> Result<(), PreconditionViolation> {
        match precondition {
            Precondition::None => Ok(()),
            Precondition::DoesNotExist => {
                if entries.contains_key(key) {
                    Err(PreconditionViolation::kv_pair_exists())
                } else {
                    Ok(())
                }
            }
            Precondition::MatchesVersion(expected) => {
                let actual = entries.get(key).map(|entry| entry.version);
                if actual == Some(expected) {
                    Ok(())
                } else {
                    Err(PreconditionViolation::version_mismatch(expected, actual))
                }
            }
        }
    }

    fn apply_save(entries: &mut BTreeMap<ByteString, VersionedValue>, key: ByteString, value: Bytes) -> Version {
        let version = entries
            .get(&key)
            .map(|entry| entry.version.next())
            .unwrap_or(Version::MIN);
        entries.insert(key, VersionedValue::new(version, value));
        version
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: ByteString) -> Result<Option<VersionedValue>, ReadError> {
        let entries = self.entries.lock().expect("metadata store lock poisoned");
        Ok(entries.get(&key).cloned())
    }

    async fn load_prefix(
        &self,
        prefix: ByteString,
    ) -> Result<Vec<(ByteString, VersionedValue)>, ReadError> {
        let entries = self.entries.lock().expect("metadata store lock poisoned");
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&*prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn put(
        &self,
        key: ByteString,
        value: Bytes,
        precondition: Precondition,
    ) -> Result<Version, WriteError> {
        let mut entries = self.entries.lock().expect("metadata store lock poisoned");
        Self::check_precondition(&entries, &key, precondition)?;
        trace!(%key, "put");
        Ok(Self::apply_save(&mut entries, key, value))
    }

    async fn delete(
        &self,
        key: ByteString,
        precondition: Precondition,
    ) -> Result<(), WriteError> {
        let mut entries = self.entries.lock().expect("metadata store lock poisoned");
        Self::check_precondition(&entries, &key, precondition)?;
        entries.remove(&key);
        Ok(())
    }

    async fn multi_save(
        &self,
        saves: Vec<KeyValue>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError> {
        self.multi_save_and_remove(saves, Vec::new(), preconditions)
            .await
    }

    async fn multi_save_and_remove(
        &self,
        saves: Vec<KeyValue>,
        removals: Vec<ByteString>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError> {
        let mut entries = self.entries.lock().expect("metadata store lock poisoned");
        for (key, precondition) in &preconditions {
            Self::check_precondition(&entries, key, *precondition)?;
        }
        trace!(saves = saves.len(), removals = removals.len(), "multi save and remove");
        for (key, value) in saves {
            Self::apply_save(&mut entries, key, value);
        }
        for key in removals {
            entries.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ByteString {
        ByteString::from(raw.to_owned())
    }

    #[tokio::test]
    async fn put_assigns_monotonic_versions() {
        let store = MemoryMetaStore::new();
        let v1 = store
            .put(key("a"), Bytes::from_static(b"1"), Precondition::None)
            .await
            .unwrap();
        let v2 = store
            .put(key("a"), Bytes::from_static(b"2"), Precondition::MatchesVersion(v1))
            .await
            .unwrap();
        assert_eq!(v1, Version::MIN);
        assert_eq!(v2, v1.next());

        // stale CAS is rejected
        let err = store
            .put(key("a"), Bytes::from_static(b"3"), Precondition::MatchesVersion(v1))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn does_not_exist_precondition() {
        let store = MemoryMetaStore::new();
        store
            .put(key("a"), Bytes::new(), Precondition::DoesNotExist)
            .await
            .unwrap();
        let err = store
            .put(key("a"), Bytes::new(), Precondition::DoesNotExist)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WriteError::FailedPrecondition(PreconditionViolation::Exists)
        ));
    }

    #[tokio::test]
    async fn prefix_scan_is_bounded() {
        let store = MemoryMetaStore::new();
        for k in ["channel_store/0/ch1", "channel_store/1/ch2", "collection/9"] {
            store
                .put(key(k), Bytes::new(), Precondition::None)
                .await
                .unwrap();
        }
        let scanned = store.load_prefix(key("channel_store/")).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().all(|(k, _)| k.starts_with("channel_store/")));
    }

    #[tokio::test]
    async fn multi_save_and_remove_is_atomic_under_preconditions() {
        let store = MemoryMetaStore::new();
        let v1 = store
            .put(key("guard"), Bytes::new(), Precondition::None)
            .await
            .unwrap();

        // failing precondition leaves everything untouched
        let err = store
            .multi_save_and_remove(
                vec![(key("new"), Bytes::new())],
                vec![key("guard")],
                vec![(key("guard"), Precondition::MatchesVersion(v1.next()))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::FailedPrecondition(_)));
        assert!(store.get(key("new")).await.unwrap().is_none());
        assert!(store.get(key("guard")).await.unwrap().is_some());

        store
            .multi_save_and_remove(
                vec![(key("new"), Bytes::new())],
                vec![key("guard")],
                vec![(key("guard"), Precondition::MatchesVersion(v1))],
            )
            .await
            .unwrap();
        assert!(store.get(key("new")).await.unwrap().is_some());
        assert!(store.get(key("guard")).await.unwrap().is_none());
    }
}
