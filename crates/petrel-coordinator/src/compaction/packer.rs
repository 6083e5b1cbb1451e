// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Greedy bucket packing of compaction candidates.

use petrel_types::segment::SegmentRecord;

/// A pool of candidate segments a plan generator draws from. Packing
/// removes the chosen segments from the pool; rejected attempts leave
/// it untouched.
pub struct SegmentPacker {
    candidates: Vec<SegmentRecord>,
}

impl SegmentPacker {
    pub fn new(mut candidates: Vec<SegmentRecord>) -> Self {
        // largest first so buckets fill with few segments and the tail
        // of small segments merges together
        candidates.sort_by_key(|s| std::cmp::Reverse(s.size_bytes()));
        Self { candidates }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn into_candidates(self) -> Vec<SegmentRecord> {
        self.candidates
    }

    pub fn candidates(&self) -> &[SegmentRecord] {
        &self.candidates
    }

    /// Pack one bucket up to `expected` bytes. The bucket is accepted
    /// when it holds `min_count..=max_count` segments and leaves at
    /// most `max_left` unused capacity; otherwise the pool is left
    /// unchanged and `None` is returned.
    pub fn pack(
        &mut self,
        expected: u64,
        max_left: u64,
        min_count: usize,
        max_count: usize,
    ) -> Option<(Vec<SegmentRecord>, u64)> {
        self.pack_impl(expected, max_left, min_count, max_count, None)
    }

    /// Like [`SegmentPacker::pack`], but fills remaining capacity from
    /// a second pool after this one is exhausted.
    pub fn pack_with(
        &mut self,
        expected: u64,
        max_left: u64,
        min_count: usize,
        max_count: usize,
        filler: &mut SegmentPacker,
    ) -> Option<(Vec<SegmentRecord>, u64)> {
        self.pack_impl(expected, max_left, min_count, max_count, Some(filler))
    }

    fn pack_impl(
        &mut self,
        expected: u64,
        max_left: u64,
        min_count: usize,
        max_count: usize,
        filler: Option<&mut SegmentPacker>,
    ) -> Option<(Vec<SegmentRecord>, u64)> {
        let mut total = 0u64;
        let mut own: Vec<usize> = Vec::new();
        for (idx, segment) in self.candidates.iter().enumerate() {
            if own.len() >= max_count {
                break;
            }
            let size = segment.size_bytes();
            if total + size <= expected {
                total += size;
                own.push(idx);
            }
        }
        if own.is_empty() {
            return None;
        }

        let mut borrowed: Vec<usize> = Vec::new();
        if let Some(filler) = &filler {
            for (idx, segment) in filler.candidates.iter().enumerate() {
                if own.len() + borrowed.len() >= max_count {
                    break;
                }
                let size = segment.size_bytes();
                if total + size <= expected {
                    total += size;
                    borrowed.push(idx);
                }
            }
        }

        let count = own.len() + borrowed.len();
        let left = expected - total;
        if count < min_count.max(1) || left > max_left {
            return None;
        }

        let mut bucket = Vec::with_capacity(count);
        for idx in own.into_iter().rev() {
            bucket.push(self.candidates.remove(idx));
        }
        if let Some(filler) = filler {
            for idx in borrowed.into_iter().rev() {
                bucket.push(filler.candidates.remove(idx));
            }
        }
        Some((bucket, left))
    }
}

/// Squeeze expandable small segments into existing buckets without
/// growing any bucket beyond `max_bucket_size`. Returns the segments
/// that did not fit anywhere.
pub fn squeeze_into_buckets(
    small: Vec<SegmentRecord>,
    buckets: &mut [Vec<SegmentRecord>],
    max_bucket_size: u64,
) -> Vec<SegmentRecord> {
    let mut remaining = Vec::new();
    let mut bucket_sizes: Vec<u64> = buckets
        .iter()
        .map(|b| b.iter().map(|s| s.size_bytes()).sum())
        .collect();
    'next_segment: for segment in small {
        let size = segment.size_bytes();
        for (idx, bucket) in buckets.iter_mut().enumerate() {
            if bucket_sizes[idx] + size <= max_bucket_size {
                bucket_sizes[idx] += size;
                bucket.push(segment);
                continue 'next_segment;
            }
        }
        remaining.push(segment);
    }
    remaining
}
