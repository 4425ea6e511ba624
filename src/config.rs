use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use crate::error::{ EngineError, EngineResult };

// Configuration file lookup
pub const CONFIG_FILE_NAME: &str = "ping-status.toml";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/ping-status.toml";
pub const SYSTEM_PLUGINS_DIR: &str = "/usr/share/ping-status/plugins";
pub const APP_DIR_NAME: &str = "ping-status";

// Engine defaults
pub const DEFAULT_TEMPLATE: &str = "CPU:{cpu} MEM:{mem} {net_speed}";
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 86400; // 1 day
pub const DEFAULT_UPDATE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REFRESH_SECS: u64 = 2;
pub const CYCLE_DEADLINE_SLACK_MS: u64 = 250;

/// Keys in a plugin section that the engine consumes itself
pub const RESERVED_PLUGIN_KEYS: &[&str] = &["enabled", "timeout_ms", "cache_ttl_secs"];

/// The `[general]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub template: Option<String>,
    pub templates: Vec<String>,
    /// Substituted for tokens no plugin produced
    pub fallback: String,
    /// Render unmatched tokens as the literal `{token}` marker instead of `fallback`
    pub keep_unmatched: bool,
    pub timeout_ms: u64,
    pub workers: usize,
    pub cycle_deadline_ms: Option<u64>,
    pub plugin_dirs: Vec<PathBuf>,
    pub cache_dir: PathBuf,
    pub persist_cache: bool,
    pub serve_stale_on_error: bool,
    pub auto_update: bool,
    pub update_interval_secs: u64,
    pub update_timeout_secs: u64,
    pub refresh_secs: u64,
    pub env_file: PathBuf,
    /// Built-in plugins to register ahead of the plugin directories
    pub builtins: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));

        Self {
            template: None,
            templates: Vec::new(),
            fallback: String::new(),
            keep_unmatched: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            workers: DEFAULT_WORKERS,
            cycle_deadline_ms: None,
            plugin_dirs: vec![
                PathBuf::from(SYSTEM_PLUGINS_DIR),
                config_dir.join(APP_DIR_NAME).join("plugins")
            ],
            cache_dir: cache_dir.join(APP_DIR_NAME),
            persist_cache: true,
            serve_stale_on_error: false,
            auto_update: false,
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            update_timeout_secs: DEFAULT_UPDATE_TIMEOUT_SECS,
            refresh_secs: DEFAULT_REFRESH_SECS,
            env_file: config_dir.join(APP_DIR_NAME).join("plugins.env"),
            builtins: vec!["system".to_string(), "network-speed".to_string()],
        }
    }
}

/// Immutable configuration snapshot for one render cycle
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Every other top-level table, keyed by plugin name
    #[serde(flatten)]
    raw_sections: BTreeMap<String, toml::Value>,
    #[serde(skip)]
    plugins: BTreeMap<String, toml::Table>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Config {
    /// Load the configuration snapshot.
    ///
    /// An explicit path must exist. Otherwise the user file is tried, then the
    /// system-wide file, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> EngineResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in default_config_paths() {
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }

        crate::log_debug!("No configuration file found, using defaults");
        Ok(Self::default().normalized())
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::config(path, e))?;
        let mut config = Self::from_toml_str(&content).map_err(|e| EngineError::config(path, e))?;
        config.source = Some(path.to_path_buf());
        crate::log_debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let config: Config = toml::from_str(content)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        for (name, value) in std::mem::take(&mut self.raw_sections) {
            match value {
                toml::Value::Table(table) => {
                    self.plugins.insert(name, table);
                }
                other => {
                    crate::log_warn!(
                        "Ignoring top-level key '{}' ({}): plugin settings must be tables",
                        name,
                        other.type_str()
                    );
                }
            }
        }

        let general = &mut self.general;
        if general.workers == 0 {
            crate::log_warn!("general.workers must be at least 1, using 1");
            general.workers = 1;
        }
        if general.timeout_ms == 0 {
            general.timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        if general.refresh_secs == 0 {
            general.refresh_secs = DEFAULT_REFRESH_SECS;
        }
        general.plugin_dirs = general.plugin_dirs.iter().map(|p| expand_home(p)).collect();
        general.cache_dir = expand_home(&general.cache_dir);
        general.env_file = expand_home(&general.env_file);

        self
    }

    /// Path the snapshot was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Templates to render, one output line each
    pub fn templates(&self) -> Vec<String> {
        if !self.general.templates.is_empty() {
            self.general.templates.clone()
        } else if let Some(template) = &self.general.template {
            vec![template.clone()]
        } else {
            vec![DEFAULT_TEMPLATE.to_string()]
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.general.timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.general.refresh_secs)
    }

    pub fn plugin_section(&self, name: &str) -> Option<&toml::Table> {
        self.plugins.get(name)
    }

    /// `enabled` override from the plugin's section
    pub fn plugin_enabled(&self, name: &str) -> Option<bool> {
        self.plugin_section(name)?.get("enabled")?.as_bool()
    }

    pub fn plugin_timeout(&self, name: &str) -> Option<Duration> {
        let ms = self.plugin_section(name)?.get("timeout_ms")?.as_integer()?;
        u64::try_from(ms).ok().filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn plugin_cache_ttl(&self, name: &str) -> Option<Duration> {
        let secs = self.plugin_section(name)?.get("cache_ttl_secs")?;
        let secs = secs.as_float().or_else(|| secs.as_integer().map(|i| i as f64))?;
        if secs >= 0.0 { Duration::try_from_secs_f64(secs).ok() } else { None }
    }

    /// Plugin-facing settings: the section without engine-reserved keys
    pub fn plugin_settings(&self, name: &str) -> toml::Table {
        self.plugin_section(name)
            .map(|section| {
                section
                    .iter()
                    .filter(|(key, _)| !RESERVED_PLUGIN_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// User file first, then the system-wide fallback
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG_PATH));
    paths
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Render a status line from plugin placeholders")]
pub struct Cli {
    /// Configuration file (defaults to the user file, then /etc/ping-status.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Template to render instead of the configured ones (repeatable)
    #[arg(short, long)]
    pub template: Vec<String>,

    /// List admitted plugins with their placeholders and help text
    #[arg(short = 'p', long)]
    pub plugin_help: bool,

    /// Keep rendering every general.refresh_secs seconds
    #[arg(short, long)]
    pub watch: bool,

    /// Check every plugin with a source URL for updates and exit
    #[arg(long)]
    pub update: bool,

    /// Log informational messages to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Emit journald structured records on stderr
    #[arg(long)]
    pub journald: bool,
}
