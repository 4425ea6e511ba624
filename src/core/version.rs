//! Semantic version handling for plugin compatibility checks
//!
//! Versions are `major[.minor[.patch]]`. Missing components count as zero,
//! so `"3.3"` equals `"3.3.0"`. Pre-release and build tags are rejected:
//! callers treat an unparsable version as incompatible.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(semver::Version);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed version string '{0}'")]
pub struct VersionParseError(pub String);

impl Version {
    /// Parse a version string, returning `None` when it is malformed
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let components = trimmed.split('.').count();
        if trimmed.is_empty() || components > 3 {
            return None;
        }

        let padded = format!("{}{}", trimmed, ".0".repeat(3 - components));
        let version = semver::Version::parse(&padded).ok()?;
        if !version.pre.is_empty() || !version.build.is_empty() {
            return None;
        }
        Some(Self(version))
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| VersionParseError(s.to_string()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
