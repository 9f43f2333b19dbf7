//! Version numbering for schema snapshots
//!
//! Versions are `major.minor.patch`. Each new version bumps `patch`; `patch`
//! rolls over into `minor` at 100, and `minor` into `major` at 100.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const ROLLOVER: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionNumber {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Number given to the first version of a project
    pub const fn initial() -> Self {
        Self::new(1, 0, 0)
    }

    /// The number that follows this one
    pub fn next(&self) -> Self {
        let mut next = *self;
        next.patch += 1;
        if next.patch >= ROLLOVER {
            next.patch = 0;
            next.minor += 1;
        }
        if next.minor >= ROLLOVER {
            next.minor = 0;
            next.major += 1;
        }
        next
    }

    /// Next number after the latest stored one, or the initial number
    pub fn after(latest: Option<VersionNumber>) -> Self {
        latest.map(|v| v.next()).unwrap_or_else(Self::initial)
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionNumber {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(EngineError::Validation(format!(
                "Invalid version '{}' (expected major.minor.patch)",
                s
            )));
        }
        let parse = |p: &str| {
            p.parse::<u32>().map_err(|_| {
                EngineError::Validation(format!("Invalid version component '{}' in '{}'", p, s))
            })
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl Serialize for VersionNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
