// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Test fakes for the cluster seams that are not RPC clients.
//!
//! The RPC client traits are mocked with mockall (see the generated
//! `Mock*` types next to the traits); the timestamp oracle instead
//! gets a settable fake because tests drive time explicitly.

use std::sync::Mutex;

use petrel_types::tso::TsoTimestamp;

use super::TimestampOracle;

/// Oracle whose notion of "now" is set by the test.
#[derive(Default)]
pub struct ManualOracle {
    now: Mutex<TsoTimestamp>,
}

impl ManualOracle {
    pub fn at(now: TsoTimestamp) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: TsoTimestamp) {
        *self.now.lock().unwrap() = now;
    }
}

impl TimestampOracle for ManualOracle {
    fn now(&self) -> TsoTimestamp {
        *self.now.lock().unwrap()
    }
}
