//! Plugin registry for discovered plugin units
//!
//! The registry keeps descriptors in registration order with unique names.
//! Registering a name twice replaces the earlier descriptor (last registration
//! wins) and moves it to the end, so the order is reproducible from the scan
//! order alone. Render cycles read an immutable snapshot through
//! [`SharedRegistry`]; updates publish a new snapshot.

use chrono::{ DateTime, NaiveDate, NaiveDateTime };
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::path::PathBuf;
use std::sync::{ Arc, RwLock };
use std::time::Duration;
use url::Url;

use crate::plugins::entrypoint::Entrypoint;

/// Plugin metadata parsed from meta.toml. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginMetaFile {
    pub plugin: PluginInfo,
    pub cache: CachePolicy,
    pub permissions: PluginPermissions,
}

impl PluginMetaFile {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(alias = "min_version", skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    pub placeholders: Vec<String>,
    /// Entry script inside the plugin directory (default: init.lua)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Remote entry script location, used by the updater
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_url: Option<String>,
    /// `sha256:<hex>` digest of the remote entry script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Whole-result TTL; the plugin is cacheable when this is set and positive
    pub ttl_secs: Option<f64>,
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPermissions {
    pub network: bool,
    /// Empty means every domain is allowed
    pub allowed_domains: Vec<String>,
    /// Subprocess execution through `exec`
    pub exec: bool,
    /// Keeps the Lua `io` library
    pub filesystem: bool,
    /// Environment variables from the plugins env file readable via `env_get`
    pub env_vars: Vec<String>,
    /// Custom User-Agent for HTTP requests (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Where a descriptor came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOrigin {
    Builtin,
    /// Plugin directory and the entry file name inside it
    Directory { dir: PathBuf, entry: String },
    File(PathBuf),
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOrigin::Builtin => write!(f, "builtin"),
            PluginOrigin::Directory { dir, .. } => write!(f, "{}", dir.display()),
            PluginOrigin::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpec {
    pub ttl: Duration,
    pub scope: String,
}

/// Identity and metadata of one plugin unit, independent of its logic.
///
/// Descriptors are never mutated: an update builds a new descriptor and
/// publishes it through [`SharedRegistry::replace`].
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub min_host_version: String,
    pub source_url: Option<Url>,
    pub last_updated: Option<NaiveDateTime>,
    pub description: Option<String>,
    pub help: Option<String>,
    pub placeholders: Vec<String>,
    pub timeout: Option<Duration>,
    pub cache: Option<CacheSpec>,
    pub enabled: bool,
    pub permissions: PluginPermissions,
    pub origin: PluginOrigin,
    pub entrypoint: Arc<dyn Entrypoint>,
}

pub const DEFAULT_PLUGIN_VERSION: &str = "0.0.0";

impl PluginDescriptor {
    /// Descriptor with documented defaults for every optional field
    pub fn new(name: impl Into<String>, origin: PluginOrigin, entrypoint: Arc<dyn Entrypoint>) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_PLUGIN_VERSION.to_string(),
            min_host_version: DEFAULT_PLUGIN_VERSION.to_string(),
            source_url: None,
            last_updated: None,
            description: None,
            help: None,
            placeholders: Vec::new(),
            timeout: None,
            cache: None,
            enabled: true,
            permissions: PluginPermissions::default(),
            origin,
            entrypoint,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_min_host_version(mut self, version: impl Into<String>) -> Self {
        self.min_host_version = version.into();
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_placeholders(mut self, placeholders: &[&str]) -> Self {
        self.placeholders = placeholders.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_cache(mut self, ttl: Duration, scope: impl Into<String>) -> Self {
        self.cache = Some(CacheSpec { ttl, scope: scope.into() });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("min_host_version", &self.min_host_version)
            .field("source_url", &self.source_url.as_ref().map(Url::as_str))
            .field("last_updated", &self.last_updated)
            .field("origin", &self.origin)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Parse a `last_updated` stamp. Accepts `2025-11-24 1:17:00`, RFC 3339 and
/// bare dates; returns `None` for anything else.
pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(input).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// A plugin unit that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<PluginDescriptor>>,
    failures: Vec<DiscoveryFailure>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, returning the one it replaced
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Option<Arc<PluginDescriptor>> {
        let replaced = self.plugins
            .iter()
            .position(|p| p.name == descriptor.name)
            .map(|index| self.plugins.remove(index));

        if let Some(previous) = &replaced {
            crate::log_notice!(
                "Plugin '{}' from {} overrides the one from {}",
                descriptor.name,
                descriptor.origin,
                previous.origin
            );
        } else {
            crate::log_debug!("Registered plugin '{}' v{}", descriptor.name, descriptor.version);
        }

        self.plugins.push(Arc::new(descriptor));
        replaced
    }

    pub fn record_failure(&mut self, path: impl Into<PathBuf>, reason: impl Into<String>) {
        self.failures.push(DiscoveryFailure {
            path: path.into(),
            reason: reason.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Descriptors in registration order
    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn failures(&self) -> &[DiscoveryFailure] {
        &self.failures
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Copy of this registry with `descriptor` swapped in at the position of
    /// the plugin with the same name. `None` if no such plugin exists.
    fn with_replaced(&self, descriptor: Arc<PluginDescriptor>) -> Option<Self> {
        let index = self.plugins.iter().position(|p| p.name == descriptor.name)?;
        let mut next = self.clone();
        next.plugins[index] = descriptor;
        Some(next)
    }
}

/// Copy-on-write registry handle shared by render cycles and the updater
#[derive(Default)]
pub struct SharedRegistry {
    current: RwLock<Arc<PluginRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// The registry as of now; later swaps do not affect the returned snapshot
    pub fn snapshot(&self) -> Arc<PluginRegistry> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, registry: PluginRegistry) {
        let next = Arc::new(registry);
        match self.current.write() {
            Ok(mut guard) => {
                *guard = next;
            }
            Err(poisoned) => {
                *poisoned.into_inner() = next;
            }
        }
    }

    /// Atomically replace the descriptor with the same name
    pub fn replace(&self, descriptor: Arc<PluginDescriptor>) -> bool {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.with_replaced(descriptor) {
            Some(next) => {
                *guard = Arc::new(next);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::Placeholders;
    use crate::plugins::entrypoint::InvocationContext;

    struct Static(&'static str);

    #[async_trait::async_trait]
    impl Entrypoint for Static {
        async fn invoke(&self, _ctx: InvocationContext) -> anyhow::Result<Placeholders> {
            Ok(Placeholders::from([("who".to_string(), self.0.to_string())]))
        }
    }

    fn descriptor(name: &str, tag: &'static str) -> PluginDescriptor {
        PluginDescriptor::new(name, PluginOrigin::File(PathBuf::from(tag)), Arc::new(Static(tag)))
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = PluginRegistry::new();
        registry.register(descriptor("cpu", "first"));
        registry.register(descriptor("mem", "mem"));
        let replaced = registry.register(descriptor("cpu", "second"));

        assert_eq!(replaced.map(|d| d.origin.to_string()), Some("first".to_string()));
        assert_eq!(registry.names(), vec!["mem", "cpu"]);
        assert_eq!(registry.get("cpu").unwrap().origin, PluginOrigin::File(PathBuf::from("second")));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let build = || {
            let mut registry = PluginRegistry::new();
            for (name, tag) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4"), ("b", "5")] {
                registry.register(descriptor(name, tag));
            }
            registry
                .plugins()
                .iter()
                .map(|p| format!("{}@{}", p.name, p.origin))
                .collect::<Vec<_>>()
        };

        let first = build();
        assert_eq!(first, vec!["a@3", "c@4", "b@5"]);
        for _ in 0..10 {
            assert_eq!(build(), first);
        }
    }

    #[test]
    fn test_snapshot_is_isolated_from_replace() {
        let mut registry = PluginRegistry::new();
        registry.register(descriptor("weather", "old").with_version("1.0.0"));
        let shared = SharedRegistry::new(registry);

        let before = shared.snapshot();
        assert!(shared.replace(Arc::new(descriptor("weather", "new").with_version("1.0.1"))));
        assert!(!shared.replace(Arc::new(descriptor("unknown", "x"))));

        assert_eq!(before.get("weather").unwrap().version, "1.0.0");
        assert_eq!(shared.snapshot().get("weather").unwrap().version, "1.0.1");
    }

    #[test]
    fn test_meta_defaults_and_aliases() {
        let meta = PluginMetaFile::parse(
            r#"
[plugin]
name = "multi-ping"
min_version = "3.3.0"

[cache]
ttl_secs = 5
"#
        ).unwrap();

        assert_eq!(meta.plugin.min_host_version.as_deref(), Some("3.3.0"));
        assert_eq!(meta.plugin.version, None);
        assert_eq!(meta.cache.ttl_secs, Some(5.0));
        assert_eq!(meta.permissions, PluginPermissions::default());
        assert!(PluginMetaFile::parse("").is_ok());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let unpadded = parse_timestamp("2025-11-24 1:17:00").unwrap();
        assert_eq!(unpadded.format("%H:%M").to_string(), "01:17");
        assert!(parse_timestamp("2025-11-23T23:00:00Z").is_some());
        assert!(parse_timestamp("2025-11-23").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
