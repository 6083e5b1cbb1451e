// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

/// The system is shutting down; reconcilers surface this to unwind
/// their loops promptly instead of retrying.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("system is shutting down")]
pub struct ShutdownError;

/// Error converting from a wire record into a typed value.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl ConversionError {
    pub fn missing_field(field: &'static str) -> Self {
        ConversionError::MissingField(field)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        ConversionError::InvalidData(message.into())
    }
}
