//! Render cycle orchestration
//!
//! A cycle takes the current registry snapshot, admits the compatible
//! plugins, executes them, merges their placeholders in admission order and
//! renders every template. Background work (network sampling and plugin
//! updates) runs on its own tasks and never blocks a cycle.

pub mod cache;
pub mod executor;
pub mod monitor;
pub mod render;
pub mod result;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::logger::{ log_task_complete, log_task_start };
use crate::plugins::builtin::{ builtin_plugins, network_interval };
use crate::plugins::entrypoint::InvocationContext;
use crate::plugins::env::load_env_file;
use crate::plugins::gate::{ self, Admission };
use crate::plugins::loader;
use crate::plugins::registry::{ PluginOrigin, PluginRegistry, SharedRegistry };
use crate::plugins::updater::{ HttpSource, RemoteSource, UpdateSummary, Updater };
use crate::{ log_debug, log_info, log_warn };

pub use cache::{ CacheEntry, CacheKey, ResultCache };
pub use executor::Executor;
pub use monitor::NetworkMonitor;
pub use render::{ Fallback, RenderContext, Template };
pub use result::{ Placeholders, PluginResult, PluginStatus };

/// Cache key recording the last update check
const UPDATE_CHECK_PLUGIN: &str = "ping-status";
const UPDATE_CHECK_SCOPE: &str = "update-check";
const HELP_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one render cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// One rendered line per template
    pub lines: Vec<String>,
    /// Per-plugin results in admission order
    pub results: Vec<PluginResult>,
    pub admission: Admission,
}

#[derive(Default)]
struct Background {
    cancel: CancellationToken,
    monitor: Option<NetworkMonitor>,
    updater: Option<JoinHandle<()>>,
}

pub struct Engine {
    registry: Arc<SharedRegistry>,
    executor: Executor,
    updater: Option<Arc<Updater>>,
    host_version: String,
    background: Mutex<Option<Background>>,
}

impl Engine {
    /// Discover plugins and open the cache described by `config`
    pub fn new(config: &Config) -> Self {
        let general = &config.general;
        let registry = loader::discover(&general.plugin_dirs, builtin_plugins(&general.builtins));
        let cache = ResultCache::open(general);

        let env = load_env_file(&general.env_file).unwrap_or_else(|e| {
            log_warn!("Plugin env file unavailable: {:#}", e);
            HashMap::new()
        });

        let source: Option<Arc<dyn RemoteSource>> = match
            HttpSource::new(Duration::from_secs(general.update_timeout_secs.max(1)))
        {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                log_warn!("Plugin updates disabled: {:#}", e);
                None
            }
        };

        Self::from_parts(registry, cache, env, source)
    }

    pub fn from_parts(
        registry: PluginRegistry,
        cache: ResultCache,
        env: HashMap<String, String>,
        source: Option<Arc<dyn RemoteSource>>
    ) -> Self {
        let registry = Arc::new(SharedRegistry::new(registry));
        let updater = source.map(|source| {
            Arc::new(Updater::new(registry.clone(), source).with_cache(cache.clone()))
        });

        Self {
            registry,
            executor: Executor::new(cache, env),
            updater,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            background: Mutex::new(None),
        }
    }

    /// Compare plugins against `version` instead of this binary's version
    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        self.executor.cache()
    }

    pub fn admission(&self, config: &Config) -> Admission {
        gate::admit(self.registry.snapshot().plugins(), &self.host_version, config)
    }

    /// Run one cycle; `templates` overrides the configured templates
    pub async fn render_cycle(&self, config: &Config, templates: Option<&[String]>) -> CycleReport {
        let started = std::time::Instant::now();
        let admission = self.admission(config);
        let results = self.executor.run_cycle(&admission.admitted, config).await;

        let templates = templates
            .filter(|templates| !templates.is_empty())
            .map(|templates| templates.to_vec())
            .unwrap_or_else(|| config.templates());
        let ctx = RenderContext::new(
            render::merge(&results),
            &templates,
            Fallback::from_general(&config.general)
        );

        log_debug!(
            "Cycle finished in {:?}: {} plugin(s), {} failed",
            started.elapsed(),
            results.len(),
            results
                .iter()
                .filter(|r| !r.status.is_success())
                .count()
        );

        CycleReport {
            lines: ctx.render(),
            results,
            admission,
        }
    }

    /// Help listing for `--plugin-help`
    pub async fn plugin_help(&self, config: &Config) -> String {
        let admission = self.admission(config);
        let mut out = String::new();

        let _ = writeln!(out, "Plugins ({} loaded):", admission.admitted.len());
        for plugin in &admission.admitted {
            let _ = writeln!(out, "\n{} v{} ({})", plugin.name, plugin.version, plugin.origin);
            if let Some(description) = &plugin.description {
                let _ = writeln!(out, "  {}", description);
            }
            if !plugin.placeholders.is_empty() {
                let tokens: Vec<String> = plugin.placeholders
                    .iter()
                    .map(|p| format!("{{{}}}", p))
                    .collect();
                let _ = writeln!(out, "  Placeholders: {}", tokens.join(" "));
            }

            let help = match &plugin.help {
                Some(help) => Some(help.clone()),
                None => {
                    let mut ctx = InvocationContext::new(plugin.name.as_str(), self.cache().clone());
                    ctx.version = plugin.version.clone();
                    ctx.settings = config.plugin_settings(&plugin.name);
                    ctx.deadline = std::time::Instant::now() + HELP_TIMEOUT;
                    tokio::time::timeout(HELP_TIMEOUT, plugin.entrypoint.help(ctx)).await.ok().flatten()
                }
            };
            for line in help.iter().flat_map(|help| help.trim().lines()) {
                let _ = writeln!(out, "  {}", line);
            }
        }

        if !admission.excluded.is_empty() {
            let _ = writeln!(out, "\nExcluded:");
            for (plugin, reason) in &admission.excluded {
                let _ = writeln!(out, "  {} v{}: {}", plugin.name, plugin.version, reason);
            }
        }

        let snapshot = self.registry.snapshot();
        if !snapshot.failures().is_empty() {
            let _ = writeln!(out, "\nFailed to load:");
            for failure in snapshot.failures() {
                let _ = writeln!(out, "  {}: {}", failure.path.display(), failure.reason);
            }
        }

        out
    }

    /// Start the network monitor and, with `auto_update`, the updater. No-op
    /// when already running.
    pub fn start_background(&self, config: &Config) {
        let mut guard = match self.background.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }

        let mut background = Background::default();

        let network_builtin = self.admission(config)
            .admitted
            .iter()
            .any(|p| p.name == monitor::NETWORK_PLUGIN && p.origin == PluginOrigin::Builtin);
        if network_builtin {
            let settings = config.plugin_settings(monitor::NETWORK_PLUGIN);
            let interface = settings
                .get("interface")
                .and_then(|value| value.as_str())
                .unwrap_or("auto")
                .to_string();
            background.monitor = Some(
                NetworkMonitor::start(self.cache().clone(), network_interval(&settings), interface)
            );
        }

        if config.general.auto_update {
            if let Some(updater) = &self.updater {
                let interval = Duration::from_secs(config.general.update_interval_secs);
                background.updater = Some(updater.clone().spawn(interval, background.cancel.child_token()));
                log_info!("Plugin auto-update every {:?}", interval);
            }
        }

        *guard = Some(background);
    }

    /// Run one update pass now
    pub async fn update_now(&self) -> Option<UpdateSummary> {
        let updater = self.updater.as_ref()?;
        Some(updater.run_once().await)
    }

    /// One-shot mode: update when enabled and the last check has expired
    pub async fn update_if_due(&self, config: &Config) -> Option<UpdateSummary> {
        if !config.general.auto_update {
            return None;
        }

        let key = CacheKey::new(UPDATE_CHECK_PLUGIN, UPDATE_CHECK_SCOPE);
        if self.cache().lookup(&key).is_some() {
            log_debug!("Plugin update check not due yet");
            return None;
        }

        log_task_start("scheduled plugin update");
        let limit = Duration::from_secs(config.general.update_timeout_secs.max(1));
        let summary = match tokio::time::timeout(limit, self.update_now()).await {
            Ok(summary) => summary,
            Err(_) => {
                log_warn!("Plugin update check exceeded {:?}", limit);
                None
            }
        };

        let checked_at = Placeholders::from([("checked_at".to_string(), chrono::Utc::now().to_rfc3339())]);
        self.cache().insert(key, checked_at, Duration::from_secs(config.general.update_interval_secs));
        log_task_complete(
            "scheduled plugin update",
            &summary
                .as_ref()
                .map(|s| format!("{} updated", s.updated()))
                .unwrap_or_else(|| "no result".to_string())
        );
        summary
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        let background = match self.background.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(background) = background else {
            return;
        };

        background.cancel.cancel();
        if let Some(monitor) = background.monitor {
            monitor.stop().await;
        }
        if let Some(updater) = background.updater {
            let _ = updater.await;
        }
        log_debug!("Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::loader::{ DEFAULT_ENTRY, META_FILE_NAME };
    use anyhow::Context;
    use async_trait::async_trait;
    use std::fs;
    use std::path::{ Path, PathBuf };
    use tempfile::TempDir;
    use url::Url;

    /// In-memory remote plugin source
    #[derive(Default)]
    struct MemorySource {
        files: Mutex<HashMap<String, String>>,
    }

    impl MemorySource {
        fn serve(&self, url: &str, body: &str) {
            self.files.lock().unwrap().insert(url.to_string(), body.to_string());
        }
    }

    #[async_trait]
    impl RemoteSource for MemorySource {
        async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
            self.files.lock().unwrap().get(url.as_str()).cloned().context("unreachable")
        }
    }

    fn lua_plugin(dir: &Path, name: &str, meta: &str, body: &str) {
        let unit = dir.join(name);
        fs::create_dir_all(&unit).unwrap();
        fs::write(unit.join(META_FILE_NAME), meta).unwrap();
        fs::write(unit.join(DEFAULT_ENTRY), body).unwrap();
    }

    fn returning(pairs: &str) -> String {
        format!("function register() return {{ {} }} end", pairs)
    }

    fn engine(dirs: &[PathBuf], source: Option<Arc<dyn RemoteSource>>) -> Engine {
        let registry = loader::discover(dirs, Vec::new());
        Engine::from_parts(registry, ResultCache::in_memory(false), HashMap::new(), source).with_host_version(
            "3.3.0"
        )
    }

    fn config(toml: &str) -> Config {
        Config::from_toml_str(toml).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_incompatible_plugin_is_invisible() {
        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "cpu", "[plugin]\nmin_host_version = \"3.0\"\n", &returning("cpu = \"42%\""));
        lua_plugin(dir.path(), "future", "[plugin]\nmin_host_version = \"99.0.0\"\n", &returning("mem = \"10%\""));

        let engine = engine(&[dir.path().to_path_buf()], None);
        let report = engine.render_cycle(&config("[general]\ntemplate = \"CPU:{cpu} MEM:{mem}\"\n"), None).await;

        assert_eq!(report.lines, vec!["CPU:42% MEM:".to_string()]);
        assert_eq!(report.admission.names(), vec!["cpu"]);
        assert!(report.results.iter().all(|r| r.plugin != "future"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_names_resolve_deterministically() {
        let system = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        lua_plugin(system.path(), "clock", "", &returning("time = \"system\""));
        lua_plugin(user.path(), "clock", "", &returning("time = \"user\""));
        lua_plugin(user.path(), "zone", "", &returning("time = \"zone\", tz = \"UTC\""));

        let dirs = vec![system.path().to_path_buf(), user.path().to_path_buf()];
        let cfg = config("[general]\ntemplates = [\"{time} {tz}\"]\n");

        for _ in 0..3 {
            let report = engine(&dirs, None).render_cycle(&cfg, None).await;
            // user/clock replaces system/clock; zone registers later and wins `time`
            assert_eq!(report.admission.names(), vec!["clock", "zone"]);
            assert_eq!(report.lines, vec!["zone UTC".to_string()]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hanging_plugin_renders_fallback_within_deadline() {
        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "hang", "", "function register() while true do end end");
        lua_plugin(dir.path(), "ok", "", &returning("ok = \"yes\""));

        let engine = engine(&[dir.path().to_path_buf()], None);
        let cfg = config("[general]\ntimeout_ms = 150\nfallback = \"n/a\"\ntemplate = \"{hang}|{ok}\"\n");

        let started = std::time::Instant::now();
        let report = engine.render_cycle(&cfg, None).await;

        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(report.lines, vec!["n/a|yes".to_string()]);
        assert_eq!(report.results[0].status, PluginStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_hanging_plugin_releases_single_worker() {
        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "hang", "", "function register() while true do end end");
        lua_plugin(dir.path(), "ok", "", &returning("ok = \"yes\""));

        let engine = engine(&[dir.path().to_path_buf()], None);
        let cfg = config("[general]\ntimeout_ms = 100\ntemplate = \"[{hang}]{ok}\"\n");

        let started = std::time::Instant::now();
        for _ in 0..2 {
            let report = engine.render_cycle(&cfg, None).await;
            assert_eq!(report.lines, vec!["[]yes".to_string()]);
            assert_eq!(report.results[0].status, PluginStatus::TimedOut);
        }
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_plugin_does_not_break_the_line() {
        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "bad", "", "function register() error('no battery') end");
        lua_plugin(dir.path(), "good", "", &returning("good = 1"));

        let engine = engine(&[dir.path().to_path_buf()], None);
        let report = engine.render_cycle(&config("[general]\ntemplate = \"[{battery}] {good}\"\n"), None).await;

        assert_eq!(report.lines, vec!["[] 1".to_string()]);
        assert!(matches!(report.results[0].status, PluginStatus::Failed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cli_templates_override_config() {
        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "cpu", "", &returning("cpu = \"7%\""));

        let engine = engine(&[dir.path().to_path_buf()], None);
        let templates = vec!["a {cpu}".to_string(), "b {cpu}".to_string()];
        let report = engine.render_cycle(&Config::default(), Some(templates.as_slice())).await;
        assert_eq!(report.lines, vec!["a 7%".to_string(), "b 7%".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_update_applies_to_next_cycle() {
        const SOURCE: &str = "https://plugins.example.com/hello/meta.toml";
        let meta = |version: &str| {
            format!(
                "[plugin]\nname = \"hello\"\nversion = \"{}\"\nsource_url = \"{}\"\n[cache]\nttl_secs = 600\n",
                version,
                SOURCE
            )
        };

        let dir = TempDir::new().unwrap();
        lua_plugin(dir.path(), "hello", &meta("1.0.0"), &returning("hello = \"v1\""));

        let remote = Arc::new(MemorySource::default());
        let engine = engine(&[dir.path().to_path_buf()], Some(remote.clone()));
        let cfg = config("[general]\ntemplate = \"{hello}\"\n");

        assert_eq!(engine.render_cycle(&cfg, None).await.lines, vec!["v1".to_string()]);

        // Unreachable remote: 1.0.0 stays in effect
        let summary = engine.update_now().await.unwrap();
        assert_eq!(summary.failed(), 1);
        assert_eq!(engine.render_cycle(&cfg, None).await.lines, vec!["v1".to_string()]);
        assert_eq!(engine.registry().snapshot().get("hello").unwrap().version, "1.0.0");

        remote.serve(SOURCE, &meta("1.0.1"));
        remote.serve("https://plugins.example.com/hello/init.lua", &returning("hello = \"v2\""));
        let summary = engine.update_now().await.unwrap();
        assert_eq!(summary.updated(), 1);

        // The cached v1 result is dropped with the old descriptor
        let report = engine.render_cycle(&cfg, None).await;
        assert_eq!(report.lines, vec!["v2".to_string()]);
        assert!(!report.results[0].from_cache);
        assert_eq!(engine.registry().snapshot().get("hello").unwrap().version, "1.0.1");
    }

    #[tokio::test]
    async fn test_update_check_is_recorded() {
        let engine = engine(&[], Some(Arc::new(MemorySource::default())));
        let cfg = config("[general]\nauto_update = true\n");

        assert!(engine.update_if_due(&cfg).await.is_some());
        assert!(engine.update_if_due(&cfg).await.is_none());
        assert!(engine.update_if_due(&Config::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_plugin_help_lists_plugins() {
        let dir = TempDir::new().unwrap();
        lua_plugin(
            dir.path(),
            "weather",
            "[plugin]\nversion = \"2.1.0\"\nplaceholders = [\"weather\"]\n",
            "function get_help() return \"Current weather\" end\nfunction register() return {} end"
        );
        lua_plugin(dir.path(), "future", "[plugin]\nmin_version = \"99.0.0\"\n", &returning(""));
        fs::write(dir.path().join("broken.lua"), "function (").unwrap();

        let engine = engine(&[dir.path().to_path_buf()], None);
        let help = engine.plugin_help(&Config::default()).await;

        assert!(help.contains("weather v2.1.0"));
        assert!(help.contains("{weather}"));
        assert!(help.contains("Current weather"));
        assert!(help.contains("future v0.0.0: requires host 99.0.0"));
        assert!(help.contains("broken.lua"));
    }

    #[tokio::test]
    async fn test_background_tasks_shut_down() {
        let registry = loader::discover(&[], builtin_plugins(&["network-speed".to_string()]));
        let engine = Engine::from_parts(
            registry,
            ResultCache::in_memory(false),
            HashMap::new(),
            Some(Arc::new(MemorySource::default()))
        );
        let cfg = config("[general]\nauto_update = true\n[network-speed]\ninterval = 60\n");

        engine.start_background(&cfg);
        engine.start_background(&cfg);
        tokio::time::timeout(Duration::from_secs(3), engine.shutdown()).await.unwrap();
    }
}
