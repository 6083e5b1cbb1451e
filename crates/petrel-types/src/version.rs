// Copyright (c) 2024 - 2025 Petrel contributors.
// All rights reserved.
//
// Use of this software is governed by the Apache License, Version 2.0.

/// A type used for versioned metadata.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Ord,
    PartialOrd,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[display("v{}", _0)]
#[debug("v{}", _0)]
pub struct Version(u32);

impl Version {
    pub const INVALID: Version = Version(0);
    pub const MIN: Version = Version(1);

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

/// A trait for all metadata types that have a version.
pub trait Versioned {
    /// Returns the version of the versioned value.
    fn version(&self) -> Version;

    /// Is this a valid version?
    fn valid(&self) -> bool {
        self.version() >= Version::MIN
    }
}

impl<T: Versioned> Versioned for &T {
    fn version(&self) -> Version {
        (**self).version()
    }
}
