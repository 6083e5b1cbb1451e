// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use prost::Message;
use tracing::debug;

use petrel_types::Version;

use crate::{KeyValue, MetaStore, Precondition, ReadError, ReadWriteError, WriteError};

/// Typed wrapper over a [`MetaStore`] handling prost encode/decode and
/// optimistic read-modify-write loops.
#[derive(Clone)]
pub struct MetaStoreClient {
    store: Arc<dyn MetaStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadModifyWriteError<E = String> {
    /// The operation callback rejected the current value.
    #[error("read-modify-write operation failed: {0}")]
    FailedOperation(E),
    #[error(transparent)]
    ReadWrite(#[from] ReadWriteError),
}

impl MetaStoreClient {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub async fn get<T: Message + Default>(
        &self,
        key: ByteString,
    ) -> Result<Option<(T, Version)>, ReadError> {
        match self.store.get(key).await? {
            Some(versioned) => {
                let value = T::decode(versioned.value.as_ref())?;
                Ok(Some((value, versioned.version)))
            }
            None => Ok(None),
        }
    }

    pub async fn load_prefix<T: Message + Default>(
        &self,
        prefix: ByteString,
    ) -> Result<Vec<(ByteString, T, Version)>, ReadError> {
        let entries = self.store.load_prefix(prefix).await?;
        let mut decoded = Vec::with_capacity(entries.len());
        for (key, versioned) in entries {
            let value = T::decode(versioned.value.as_ref())?;
            decoded.push((key, value, versioned.version));
        }
        Ok(decoded)
    }

    pub async fn put<T: Message>(
        &self,
        key: ByteString,
        value: &T,
        precondition: Precondition,
    ) -> Result<Version, WriteError> {
        self.store
            .put(key, encode(value), precondition)
            .await
    }

    pub async fn delete(
        &self,
        key: ByteString,
        precondition: Precondition,
    ) -> Result<(), WriteError> {
        self.store.delete(key, precondition).await
    }

    pub async fn multi_save(
        &self,
        saves: Vec<KeyValue>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError> {
        self.store.multi_save(saves, preconditions).await
    }

    pub async fn multi_save_and_remove(
        &self,
        saves: Vec<KeyValue>,
        removals: Vec<ByteString>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError> {
        self.store
            .multi_save_and_remove(saves, removals, preconditions)
            .await
    }

    /// Optimistically update `key`: read the current value, apply
    /// `modify`, write back guarded by the read version. Retries on
    /// version conflicts until the callback rejects or the write
    /// sticks.
    pub async fn read_modify_write<T, F, E>(
        &self,
        key: ByteString,
        mut modify: F,
    ) -> Result<T, ReadModifyWriteError<E>>
    where
        T: Message + Default,
        F: FnMut(Option<T>) -> Result<T, E>,
    {
        loop {
            let current = self.get::<T>(key.clone()).await.map_err(ReadWriteError::from)?;
            let (current_value, precondition) = match current {
                Some((value, version)) => (Some(value), Precondition::MatchesVersion(version)),
                None => (None, Precondition::DoesNotExist),
            };

            let next = modify(current_value).map_err(ReadModifyWriteError::FailedOperation)?;

            match self.put(key.clone(), &next, precondition).await {
                Ok(_) => return Ok(next),
                Err(WriteError::FailedPrecondition(violation)) => {
                    debug!(%key, %violation, "concurrent update, retrying read-modify-write");
                    continue;
                }
                Err(err) => return Err(ReadWriteError::from(err).into()),
            }
        }
    }
}

pub(crate) fn encode<T: Message>(value: &T) -> Bytes {
    let mut buf = Vec::with_capacity(value.encoded_len());
    value
        .encode(&mut buf)
        .expect("buffer has sufficient capacity");
    Bytes::from(buf)
}

/// Encode a prost message for inclusion in a batched save.
pub fn encoded<T: Message>(key: ByteString, value: &T) -> KeyValue {
    (key, encode(value))
}
