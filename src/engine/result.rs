//! Per-invocation plugin outcome

use chrono::{ DateTime, Utc };
use std::collections::BTreeMap;
use std::fmt;

use super::cache::CacheEntry;

/// Placeholder key -> value produced by one plugin invocation
pub type Placeholders = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Success,
    Failed(String),
    TimedOut,
}

impl PluginStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PluginStatus::Success)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Success => write!(f, "ok"),
            PluginStatus::Failed(reason) => write!(f, "failed: {}", reason),
            PluginStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginResult {
    pub plugin: String,
    /// Empty unless the invocation succeeded, or stale data is being served
    pub placeholders: Placeholders,
    pub status: PluginStatus,
    pub produced_at: DateTime<Utc>,
    pub from_cache: bool,
    /// Placeholders come from an expired cache entry after a failure
    pub stale: bool,
}

impl PluginResult {
    pub fn success(plugin: impl Into<String>, placeholders: Placeholders) -> Self {
        Self::with_status(plugin, placeholders, PluginStatus::Success)
    }

    pub fn failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_status(plugin, Placeholders::new(), PluginStatus::Failed(reason.into()))
    }

    pub fn timed_out(plugin: impl Into<String>) -> Self {
        Self::with_status(plugin, Placeholders::new(), PluginStatus::TimedOut)
    }

    pub fn from_cache(plugin: impl Into<String>, entry: CacheEntry) -> Self {
        Self {
            plugin: plugin.into(),
            placeholders: entry.placeholders,
            status: PluginStatus::Success,
            produced_at: entry.produced_at,
            from_cache: true,
            stale: false,
        }
    }

    fn with_status(plugin: impl Into<String>, placeholders: Placeholders, status: PluginStatus) -> Self {
        Self {
            plugin: plugin.into(),
            placeholders,
            status,
            produced_at: Utc::now(),
            from_cache: false,
            stale: false,
        }
    }

    /// Keep the failure status but expose the last known placeholders
    pub fn with_stale(mut self, entry: CacheEntry) -> Self {
        self.placeholders = entry.placeholders;
        self.produced_at = entry.produced_at;
        self.from_cache = true;
        self.stale = true;
        self
    }
}
