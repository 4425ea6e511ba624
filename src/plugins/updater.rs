//! Plugin auto-update
//!
//! For every directory plugin with a `source_url`, the remote `meta.toml` is
//! fetched and compared with the local descriptor. Only a strictly newer
//! remote is installed: the entry script is downloaded, verified, compiled,
//! written next to the old files and renamed into place, and the reloaded
//! descriptor is swapped into the shared registry. Any failure leaves the
//! running descriptor untouched.

use anyhow::{ Context, bail };
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sha2::{ Digest, Sha256 };
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::Version;
use crate::core::logger::{ log_task_complete, log_task_start };
use crate::engine::cache::{ CacheKey, ResultCache };
use crate::error::EngineError;
use crate::plugins::loader::{ META_FILE_NAME, compile_check, is_plain_file_name, load_plugin_from_dir };
use crate::plugins::registry::{
    PluginDescriptor,
    PluginMetaFile,
    PluginOrigin,
    SharedRegistry,
    parse_timestamp,
};
use crate::{ log_debug, log_info, log_warn };

const CHECKSUM_PREFIX: &str = "sha256:";
const UPDATE_SUFFIX: &str = ".update";

/// Where remote plugin files come from
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String>;
}

/// Fetches plugin files over HTTP(S)
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client
            ::builder()
            .timeout(timeout)
            .user_agent(format!("ping-status/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        let response = self.client
            .get(url.clone())
            .send().await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Bad response from {}", url))?;

        response.text().await.with_context(|| format!("Failed to read body from {}", url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated {
        from: String,
        to: String,
    },
    UpToDate,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub outcomes: Vec<(String, UpdateOutcome)>,
}

impl UpdateSummary {
    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, UpdateOutcome::Updated { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, UpdateOutcome::Failed(_)))
            .count()
    }
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcomes.is_empty() {
            return writeln!(f, "No plugins with an update source");
        }
        for (name, outcome) in &self.outcomes {
            match outcome {
                UpdateOutcome::Updated { from, to } => writeln!(f, "{}: updated {} -> {}", name, from, to)?,
                UpdateOutcome::UpToDate => writeln!(f, "{}: up to date", name)?,
                UpdateOutcome::Failed(reason) => writeln!(f, "{}: failed ({})", name, reason)?,
            }
        }
        Ok(())
    }
}

/// Remote is strictly newer than local
///
/// A malformed local version is older than any valid remote version. On
/// equal versions the `last_updated` stamps decide, and both must be known.
pub fn is_newer(
    local_version: &str,
    local_updated: Option<NaiveDateTime>,
    remote_version: Version,
    remote_updated: Option<NaiveDateTime>
) -> bool {
    let Some(local) = Version::parse(local_version) else {
        return true;
    };

    match remote_version.cmp(&local) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal =>
            matches!((local_updated, remote_updated), (Some(l), Some(r)) if r > l),
    }
}

/// Verify `code` against a `sha256:<hex>` checksum
pub fn verify_checksum(code: &str, checksum: &str) -> anyhow::Result<()> {
    let expected = checksum
        .trim()
        .strip_prefix(CHECKSUM_PREFIX)
        .with_context(|| format!("Unsupported checksum '{}'", checksum))?
        .to_lowercase();

    let actual = format!("{:x}", Sha256::digest(code.as_bytes()));
    if actual != expected {
        bail!("Checksum mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}

pub struct Updater {
    registry: Arc<SharedRegistry>,
    source: Arc<dyn RemoteSource>,
    cache: Option<ResultCache>,
}

impl Updater {
    pub fn new(registry: Arc<SharedRegistry>, source: Arc<dyn RemoteSource>) -> Self {
        Self { registry, source, cache: None }
    }

    /// Drop an updated plugin's cached results from `cache`
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Check every plugin with an update source once
    pub async fn run_once(&self) -> UpdateSummary {
        log_task_start("plugin update");
        let snapshot = self.registry.snapshot();
        let mut summary = UpdateSummary::default();

        for plugin in snapshot.plugins() {
            if plugin.source_url.is_none() {
                continue;
            }

            let outcome = match self.update_plugin(plugin).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log_warn!("{}", e);
                    UpdateOutcome::Failed(e.to_string())
                }
            };
            summary.outcomes.push((plugin.name.clone(), outcome));
        }

        log_task_complete(
            "plugin update",
            &format!("{} updated, {} failed", summary.updated(), summary.failed())
        );
        summary
    }

    /// Update one plugin if its remote is strictly newer
    pub async fn update_plugin(&self, plugin: &PluginDescriptor) -> Result<UpdateOutcome, EngineError> {
        self.try_update(plugin).await.map_err(|e| EngineError::update(&plugin.name, format!("{:#}", e)))
    }

    async fn try_update(&self, plugin: &PluginDescriptor) -> anyhow::Result<UpdateOutcome> {
        let source_url = plugin.source_url.as_ref().context("Plugin has no source_url")?;
        let PluginOrigin::Directory { dir, entry: local_entry } = &plugin.origin else {
            bail!("Only directory plugins can be updated");
        };

        let remote_text = self.source.fetch(source_url).await?;
        let remote = PluginMetaFile::parse(&remote_text).context("Failed to parse remote meta.toml")?;
        let info = &remote.plugin;

        let dir_name = dir.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        let remote_name = info.name.as_deref().map(str::trim).unwrap_or(dir_name);
        if remote_name != plugin.name {
            bail!("Remote plugin is named '{}'", remote_name);
        }

        let remote_version = info.version
            .as_deref()
            .and_then(Version::parse)
            .context("Remote meta.toml has no valid version")?;
        let remote_updated = info.last_updated.as_deref().and_then(parse_timestamp);

        if !is_newer(&plugin.version, plugin.last_updated, remote_version, remote_updated) {
            log_debug!("Plugin '{}' v{} is up to date", plugin.name, plugin.version);
            return Ok(UpdateOutcome::UpToDate);
        }

        let entry = info.entry.clone().unwrap_or_else(|| local_entry.clone());
        if !is_plain_file_name(&entry) {
            bail!("Remote entry '{}' is not a plain file name", entry);
        }

        let entry_url = match &info.entry_url {
            Some(raw) => Url::parse(raw).with_context(|| format!("Invalid entry_url '{}'", raw))?,
            None => source_url.join(&entry).context("Cannot derive entry URL from source_url")?,
        };

        let code = self.source.fetch(&entry_url).await?;
        if let Some(checksum) = &info.checksum {
            verify_checksum(&code, checksum)?;
        }
        compile_check(&code, &entry)?;

        install(dir, &entry, &code, &remote_text).await?;

        let descriptor = load_plugin_from_dir(dir).context("Failed to reload updated plugin")?;
        let to = descriptor.version.clone();
        let scopes = [plugin.cache.as_ref(), descriptor.cache.as_ref()].map(|spec| {
            spec.map(|spec| spec.scope.clone()).unwrap_or_default()
        });
        if !self.registry.replace(Arc::new(descriptor)) {
            bail!("Plugin disappeared from the registry during update");
        }
        if let Some(cache) = &self.cache {
            for scope in scopes {
                cache.invalidate(&CacheKey::new(plugin.name.as_str(), scope));
            }
        }

        log_info!("Updated plugin '{}' {} -> {}", plugin.name, plugin.version, to);
        Ok(UpdateOutcome::Updated {
            from: plugin.version.clone(),
            to,
        })
    }

    /// Run an update pass every `interval` until `cancel` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            summary = self.run_once() => {
                                log_debug!("Update pass finished: {} updated", summary.updated());
                            }
                        }
                    }
                }
            }

            log_debug!("Plugin updater stopped");
        })
    }
}

/// Write both files beside the old ones, then rename entry first, meta second
///
/// Temp files never outlive a failed install. If the meta rename fails the
/// previous entry is put back, so the unit on disk stays self-consistent.
async fn install(dir: &Path, entry: &str, code: &str, meta: &str) -> anyhow::Result<()> {
    let entry_path = dir.join(entry);
    let meta_path = dir.join(META_FILE_NAME);
    let entry_tmp = dir.join(format!(".{}{}", entry, UPDATE_SUFFIX));
    let meta_tmp = dir.join(format!(".{}{}", META_FILE_NAME, UPDATE_SUFFIX));

    if let Err(e) = stage(&entry_tmp, code, &meta_tmp, meta).await {
        discard(&[&entry_tmp, &meta_tmp]).await;
        return Err(e);
    }

    let previous = tokio::fs::read(&entry_path).await.ok();

    if let Err(e) = tokio::fs::rename(&entry_tmp, &entry_path).await {
        discard(&[&entry_tmp, &meta_tmp]).await;
        return Err(e).context("Failed to install updated entry");
    }

    if let Err(e) = tokio::fs::rename(&meta_tmp, &meta_path).await {
        discard(&[&meta_tmp]).await;
        restore_entry(&entry_path, previous).await;
        return Err(e).context("Failed to install updated meta.toml");
    }
    Ok(())
}

async fn stage(entry_tmp: &Path, code: &str, meta_tmp: &Path, meta: &str) -> anyhow::Result<()> {
    tokio::fs::write(entry_tmp, code).await.context("Failed to write updated entry")?;
    tokio::fs::write(meta_tmp, meta).await.context("Failed to write updated meta.toml")?;
    Ok(())
}

async fn discard(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

async fn restore_entry(entry_path: &Path, previous: Option<Vec<u8>>) {
    let restored = match previous {
        Some(bytes) => tokio::fs::write(entry_path, bytes).await,
        None => tokio::fs::remove_file(entry_path).await,
    };
    if let Err(e) = restored {
        log_warn!("Failed to restore {}: {}", entry_path.display(), e);
    }
}
