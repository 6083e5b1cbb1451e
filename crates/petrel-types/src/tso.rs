// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Hybrid cluster timestamps handed out by the timestamp oracle.
//!
//! A timestamp packs a physical wall-clock part (milliseconds since
//! the Unix epoch) and an 18-bit logical counter. The coordination
//! plane only composes and compares them; the oracle itself is an
//! external collaborator.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::Debug,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
#[display("ts{}", _0)]
#[debug("ts{}", _0)]
pub struct TsoTimestamp(u64);

impl TsoTimestamp {
    pub const ZERO: TsoTimestamp = TsoTimestamp(0);

    pub const fn compose(physical_ms: u64, logical: u64) -> Self {
        TsoTimestamp((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub fn now() -> Self {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::compose(physical, 0)
    }

    pub const fn physical_ms(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical time elapsed from `earlier` to `self`, zero if
    /// `earlier` is not actually earlier.
    pub fn physical_since(self, earlier: TsoTimestamp) -> Duration {
        Duration::from_millis(self.physical_ms().saturating_sub(earlier.physical_ms()))
    }

    /// The timestamp `age` before `self`, clamped at the epoch.
    pub fn sub_duration(self, age: Duration) -> TsoTimestamp {
        let physical = self.physical_ms().saturating_sub(age.as_millis() as u64);
        Self::compose(physical, self.logical())
    }
}
