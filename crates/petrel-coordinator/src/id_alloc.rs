// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Monotonic id allocation backed by a persisted high-water mark.
//!
//! Ids are handed out from an in-memory block; the high-water mark in
//! the metadata store is advanced a block at a time, so ids keep
//! strictly increasing across coordinator restarts (ids inside an
//! unconsumed block are simply skipped).

use tokio::sync::Mutex;
use tracing::debug;

use petrel_metadata_store::{MetaStoreClient, ReadModifyWriteError, ReadWriteError};
use petrel_types::keys;

const DEFAULT_BLOCK_SIZE: u64 = 1000;

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
struct HighWaterMark {
    #[prost(uint64, tag = "1")]
    value: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("failed advancing id high-water mark: {0}")]
pub struct AllocError(#[from] ReadWriteError);

#[derive(Default)]
struct Block {
    next: u64,
    limit: u64,
}

pub struct IdAllocator {
    client: MetaStoreClient,
    block: Mutex<Block>,
    block_size: u64,
}

impl IdAllocator {
    pub fn new(client: MetaStoreClient) -> Self {
        Self {
            client,
            block: Mutex::new(Block::default()),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub async fn alloc_one(&self) -> Result<u64, AllocError> {
        let (begin, _) = self.alloc_block(1).await?;
        Ok(begin)
    }

    /// Allocate `count` contiguous ids; returns the inclusive range
    /// `(begin, end)`.
    pub async fn alloc_block(&self, count: u64) -> Result<(u64, u64), AllocError> {
        assert!(count > 0, "allocation count must be positive");
        let mut block = self.block.lock().await;
        if block.limit - block.next < count {
            let reserve = self.block_size.max(count);
            let mark = self
                .client
                .read_modify_write::<HighWaterMark, _, std::convert::Infallible>(
                    keys::id_allocator_key(),
                    |current| {
                        let mut mark = current.unwrap_or(HighWaterMark { value: 1 });
                        mark.value += reserve;
                        Ok(mark)
                    },
                )
                .await
                .map_err(|err| match err {
                    ReadModifyWriteError::ReadWrite(err) => AllocError(err),
                    ReadModifyWriteError::FailedOperation(infallible) => match infallible {},
                })?;
            block.next = mark.value - reserve;
            block.limit = mark.value;
            debug!(next = block.next, limit = block.limit, "reserved id block");
        }
        let begin = block.next;
        block.next += count;
        Ok((begin, begin + count - 1))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use petrel_metadata_store::MemoryMetaStore;

    use super::*;

    fn allocator(store: Arc<MemoryMetaStore>) -> IdAllocator {
        IdAllocator::new(MetaStoreClient::new(store))
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let alloc = allocator(Arc::new(MemoryMetaStore::new()));
        let a = alloc.alloc_one().await.unwrap();
        let b = alloc.alloc_one().await.unwrap();
        let (begin, end) = alloc.alloc_block(11).await.unwrap();
        assert!(a < b);
        assert!(b < begin);
        assert_eq!(end - begin, 10);
    }

    #[tokio::test]
    async fn restart_skips_past_persisted_mark() {
        let store = Arc::new(MemoryMetaStore::new());
        let before = allocator(store.clone());
        let last = before.alloc_one().await.unwrap();

        let after = allocator(store);
        let first = after.alloc_one().await.unwrap();
        assert!(
            first > last,
            "restarted allocator must continue above {last}, got {first}"
        );
    }
}
