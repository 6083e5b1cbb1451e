// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Collection, partition and database catalog.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};
use bytestring::ByteString;
use tracing::debug;

use petrel_metadata_store::{encoded, MetaStoreClient, ReadError, WriteError};
use petrel_types::keys;
use petrel_types::properties::Properties;
use petrel_types::replica::{
    CollectionRecord, DatabaseRecord, LoadStatus, PartitionRecord,
};
use petrel_types::{CollectionId, DatabaseId, PartitionId};

#[derive(Default)]
struct Inner {
    collections: HashMap<CollectionId, CollectionRecord>,
    partitions: HashMap<CollectionId, BTreeMap<PartitionId, PartitionRecord>>,
    databases: BTreeMap<DatabaseId, DatabaseRecord>,
}

pub struct CollectionsMeta {
    client: MetaStoreClient,
    inner: Mutex<Inner>,
}

impl CollectionsMeta {
    pub fn new(client: MetaStoreClient) -> Self {
        Self {
            client,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn recover(&self) -> Result<(), ReadError> {
        let collections = self
            .client
            .load_prefix::<CollectionRecord>(keys::collection_prefix())
            .await?;
        let partitions = self
            .client
            .load_prefix::<PartitionRecord>(keys::partition_prefix())
            .await?;
        let databases = self
            .client
            .load_prefix::<DatabaseRecord>(keys::database_prefix())
            .await?;

        let mut inner = self.inner.lock().expect("collections lock poisoned");
        *inner = Inner::default();
        for (_, record, _) in collections {
            inner.collections.insert(record.collection(), record);
        }
        for (_, record, _) in partitions {
            inner
                .partitions
                .entry(record.collection())
                .or_default()
                .insert(record.partition(), record);
        }
        for (_, record, _) in databases {
            inner.databases.insert(record.database(), record);
        }
        debug!(
            collections = inner.collections.len(),
            databases = inner.databases.len(),
            "recovered collection catalog"
        );
        Ok(())
    }

    pub fn exists(&self, collection: CollectionId) -> bool {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner.collections.contains_key(&collection)
    }

    pub fn get_collection(&self, collection: CollectionId) -> Option<CollectionRecord> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner.collections.get(&collection).cloned()
    }

    pub fn list_collections(&self) -> Vec<CollectionRecord> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        let mut collections: Vec<_> = inner.collections.values().cloned().collect();
        collections.sort_by_key(|c| c.collection_id);
        collections
    }

    pub fn partitions_of(&self, collection: CollectionId) -> Vec<PartitionRecord> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner
            .partitions
            .get(&collection)
            .map(|parts| parts.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn db_of_collection(&self, collection: CollectionId) -> Option<DatabaseId> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner.collections.get(&collection).map(|c| c.database())
    }

    pub fn collection_properties(&self, collection: CollectionId) -> Properties {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner
            .collections
            .get(&collection)
            .map(|c| c.properties.clone())
            .unwrap_or_default()
    }

    /// Store a collection together with its partitions in one write.
    pub async fn put_collection(
        &self,
        collection: CollectionRecord,
        partitions: Vec<PartitionRecord>,
    ) -> Result<(), WriteError> {
        let mut saves = vec![encoded(keys::collection_key(collection.collection()), &collection)];
        for partition in &partitions {
            saves.push(encoded(
                keys::partition_key(partition.collection(), partition.partition()),
                partition,
            ));
        }
        self.client.multi_save(saves, Vec::new()).await?;

        let mut inner = self.inner.lock().expect("collections lock poisoned");
        let entry = inner.partitions.entry(collection.collection()).or_default();
        for partition in partitions {
            entry.insert(partition.partition(), partition);
        }
        inner.collections.insert(collection.collection(), collection);
        Ok(())
    }

    pub async fn put_partitions(
        &self,
        partitions: Vec<PartitionRecord>,
    ) -> Result<(), WriteError> {
        let saves = partitions
            .iter()
            .map(|p| encoded(keys::partition_key(p.collection(), p.partition()), p))
            .collect();
        self.client.multi_save(saves, Vec::new()).await?;
        let mut inner = self.inner.lock().expect("collections lock poisoned");
        for partition in partitions {
            inner
                .partitions
                .entry(partition.collection())
                .or_default()
                .insert(partition.partition(), partition);
        }
        Ok(())
    }

    /// Remove a collection and all its partition rows.
    pub async fn remove_collection(&self, collection: CollectionId) -> Result<(), WriteError> {
        let mut removals: Vec<ByteString> = vec![keys::collection_key(collection)];
        {
            let inner = self.inner.lock().expect("collections lock poisoned");
            if let Some(parts) = inner.partitions.get(&collection) {
                removals.extend(parts.keys().map(|p| keys::partition_key(collection, *p)));
            }
        }
        self.client
            .multi_save_and_remove(Vec::new(), removals, Vec::new())
            .await?;
        let mut inner = self.inner.lock().expect("collections lock poisoned");
        inner.collections.remove(&collection);
        inner.partitions.remove(&collection);
        Ok(())
    }

    pub async fn remove_partitions(
        &self,
        collection: CollectionId,
        partitions: &[PartitionId],
    ) -> Result<(), WriteError> {
        let removals = partitions
            .iter()
            .map(|p| keys::partition_key(collection, *p))
            .collect();
        self.client
            .multi_save_and_remove(Vec::new(), removals, Vec::new())
            .await?;
        let mut inner = self.inner.lock().expect("collections lock poisoned");
        if let Some(parts) = inner.partitions.get_mut(&collection) {
            for partition in partitions {
                parts.remove(partition);
            }
        }
        Ok(())
    }

    /// Flip the load status of a collection and all its partitions.
    pub async fn set_load_status(
        &self,
        collection: CollectionId,
        status: LoadStatus,
    ) -> Result<(), WriteError> {
        let (record, partitions) = {
            let inner = self.inner.lock().expect("collections lock poisoned");
            let Some(record) = inner.collections.get(&collection) else {
                return Ok(());
            };
            let mut record = record.clone();
            record.status = status as i32;
            let partitions: Vec<PartitionRecord> = inner
                .partitions
                .get(&collection)
                .map(|parts| {
                    parts
                        .values()
                        .map(|p| {
                            let mut p = p.clone();
                            p.status = status as i32;
                            p
                        })
                        .collect()
                })
                .unwrap_or_default();
            (record, partitions)
        };
        self.put_collection(record, partitions).await
    }

    pub async fn put_database(&self, database: DatabaseRecord) -> Result<(), WriteError> {
        self.client
            .put(
                keys::database_key(database.database()),
                &database,
                petrel_metadata_store::Precondition::None,
            )
            .await?;
        let mut inner = self.inner.lock().expect("collections lock poisoned");
        inner.databases.insert(database.database(), database);
        Ok(())
    }

    pub fn list_databases(&self) -> Vec<DatabaseRecord> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner.databases.values().cloned().collect()
    }

    pub fn get_database(&self, db: DatabaseId) -> Option<DatabaseRecord> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        inner.databases.get(&db).cloned()
    }

    /// db → collection → partitions listing used by the quota center
    /// to shape its rate-limit tree.
    pub fn collections_by_database(
        &self,
    ) -> BTreeMap<DatabaseId, BTreeMap<CollectionId, Vec<PartitionId>>> {
        let inner = self.inner.lock().expect("collections lock poisoned");
        let mut result: BTreeMap<DatabaseId, BTreeMap<CollectionId, Vec<PartitionId>>> =
            BTreeMap::new();
        for record in inner.collections.values() {
            let partitions = inner
                .partitions
                .get(&record.collection())
                .map(|parts| parts.keys().copied().collect())
                .unwrap_or_default();
            result
                .entry(record.database())
                .or_default()
                .insert(record.collection(), partitions);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use petrel_metadata_store::MemoryMetaStore;
    use petrel_types::replica::LoadType;

    use super::*;

    fn collection(id: u64, db: u64) -> CollectionRecord {
        CollectionRecord {
            collection_id: id,
            db_id: db,
            replica_number: 1,
            status: LoadStatus::Loading as i32,
            load_type: LoadType::LoadCollection as i32,
            ..Default::default()
        }
    }

    fn partition(collection: u64, id: u64) -> PartitionRecord {
        PartitionRecord {
            collection_id: collection,
            partition_id: id,
            replica_number: 1,
            status: LoadStatus::Loading as i32,
            created_at: 0,
        }
    }

    fn meta() -> CollectionsMeta {
        CollectionsMeta::new(MetaStoreClient::new(Arc::new(MemoryMetaStore::new())))
    }

    #[tokio::test]
    async fn put_and_remove_collection_with_partitions() {
        let meta = meta();
        meta.put_collection(collection(1, 0), vec![partition(1, 10), partition(1, 11)])
            .await
            .unwrap();
        assert!(meta.exists(CollectionId::new(1)));
        assert_eq!(meta.partitions_of(CollectionId::new(1)).len(), 2);

        meta.remove_collection(CollectionId::new(1)).await.unwrap();
        assert!(!meta.exists(CollectionId::new(1)));
        assert!(meta.partitions_of(CollectionId::new(1)).is_empty());
    }

    #[tokio::test]
    async fn set_load_status_cascades_to_partitions() {
        let meta = meta();
        meta.put_collection(collection(1, 0), vec![partition(1, 10)])
            .await
            .unwrap();
        meta.set_load_status(CollectionId::new(1), LoadStatus::Loaded)
            .await
            .unwrap();
        assert_eq!(
            meta.get_collection(CollectionId::new(1)).unwrap().load_status(),
            LoadStatus::Loaded
        );
        assert_eq!(
            meta.partitions_of(CollectionId::new(1))[0].load_status(),
            LoadStatus::Loaded
        );
    }

    #[tokio::test]
    async fn recovery_restores_catalog() {
        let store = Arc::new(MemoryMetaStore::new());
        {
            let meta = CollectionsMeta::new(MetaStoreClient::new(store.clone()));
            meta.put_collection(collection(3, 1), vec![partition(3, 30)])
                .await
                .unwrap();
            meta.put_database(DatabaseRecord {
                db_id: 1,
                name: "default".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let meta = CollectionsMeta::new(MetaStoreClient::new(store));
        meta.recover().await.unwrap();
        assert!(meta.exists(CollectionId::new(3)));
        assert_eq!(meta.list_databases().len(), 1);
        let by_db = meta.collections_by_database();
        assert_eq!(
            by_db[&DatabaseId::new(1)][&CollectionId::new(3)],
            vec![PartitionId::new(30)]
        );
    }
}
