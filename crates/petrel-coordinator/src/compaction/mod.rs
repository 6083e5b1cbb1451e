// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

//! Background compaction planning and supervision.

pub mod inspector;
pub mod packer;
pub mod task;
pub mod trigger;

pub use inspector::{ChannelWatcherLookup, CompactionInfo, CompactionInspector, InspectorError};
pub use task::CompactionTask;
pub use trigger::{CompactionSignal, CompactionTrigger, TriggerError};
