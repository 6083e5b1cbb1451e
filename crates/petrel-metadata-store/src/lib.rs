// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Versioned key-value metadata persistence.
//!
//! Every coordinator decision is persisted through this contract
//! before it is acted upon. Keys are slash-delimited paths (see
//! `petrel_types::keys`), values are protobuf-encoded records, and
//! every key carries a store-maintained monotonic [`Version`] used as
//! the compare-and-set token. Multi-key writes are atomic and guarded
//! by explicit preconditions.

mod client;
mod memory;

use bytes::Bytes;
use bytestring::ByteString;

use petrel_types::Version;

pub use client::{encoded, MetaStoreClient, ReadModifyWriteError};
pub use memory::MemoryMetaStore;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub version: Version,
    pub value: Bytes,
}

impl VersionedValue {
    pub fn new(version: Version, value: Bytes) -> Self {
        Self { version, value }
    }
}

/// Preconditions for write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No precondition.
    None,
    /// Key-value pair must not exist for the write to succeed.
    DoesNotExist,
    /// Key-value pair must have the provided [`Version`].
    MatchesVersion(Version),
}

#[derive(Debug, thiserror::Error)]
pub enum PreconditionViolation {
    #[error("key-value pair already exists")]
    Exists,
    #[error("expected version '{expected}' but found version '{actual:?}'")]
    VersionMismatch {
        expected: Version,
        actual: Option<Version>,
    },
}

impl PreconditionViolation {
    pub fn kv_pair_exists() -> Self {
        PreconditionViolation::Exists
    }

    pub fn version_mismatch(expected: Version, actual: Option<Version>) -> Self {
        PreconditionViolation::VersionMismatch { expected, actual }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed precondition: {0}")]
    FailedPrecondition(#[from] PreconditionViolation),
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadWriteError {
    #[error(transparent)]
    Read(ReadError),
    #[error(transparent)]
    Write(WriteError),
}

impl From<ReadError> for ReadWriteError {
    fn from(err: ReadError) -> Self {
        ReadWriteError::Read(err)
    }
}

impl From<WriteError> for ReadWriteError {
    fn from(err: WriteError) -> Self {
        ReadWriteError::Write(err)
    }
}

/// A batched save guarded by the preconditions passed alongside it.
pub type KeyValue = (ByteString, Bytes);

/// The metadata-store contract required by the coordinator.
///
/// Implementations must apply `multi_save` / `multi_save_and_remove`
/// atomically: either every save and removal takes effect or none
/// does, and preconditions are evaluated against the pre-write state.
#[async_trait::async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: ByteString) -> Result<Option<VersionedValue>, ReadError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn load_prefix(
        &self,
        prefix: ByteString,
    ) -> Result<Vec<(ByteString, VersionedValue)>, ReadError>;

    /// Write one value; returns the version assigned by the store.
    async fn put(
        &self,
        key: ByteString,
        value: Bytes,
        precondition: Precondition,
    ) -> Result<Version, WriteError>;

    async fn delete(&self, key: ByteString, precondition: Precondition)
        -> Result<(), WriteError>;

    async fn multi_save(
        &self,
        saves: Vec<KeyValue>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError>;

    async fn multi_save_and_remove(
        &self,
        saves: Vec<KeyValue>,
        removals: Vec<ByteString>,
        preconditions: Vec<(ByteString, Precondition)>,
    ) -> Result<(), WriteError>;
}
