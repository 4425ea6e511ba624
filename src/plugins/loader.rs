//! Plugin discovery
//!
//! Scans the configured plugin directories and builds descriptors from each
//! unit's metadata. Entry scripts are read and compiled here, never run, so a
//! unit with a syntax error is rejected before any cycle sees it.

use anyhow::{ Context, bail };
use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::EngineError;
use crate::plugins::entrypoint::LuaEntrypoint;
use crate::plugins::registry::{
    CacheSpec,
    DEFAULT_PLUGIN_VERSION,
    PluginDescriptor,
    PluginMetaFile,
    PluginOrigin,
    PluginRegistry,
    parse_timestamp,
};
use crate::{ log_debug, log_info, log_warn };

pub const META_FILE_NAME: &str = "meta.toml";
pub const DEFAULT_ENTRY: &str = "init.lua";
const LUA_EXTENSION: &str = "lua";
const SINGLE_FILE_SUFFIX: &str = ".plugin";

/// Discover every plugin unit
///
/// `builtins` are registered first, then each directory in order with its
/// units sorted by file name. Later registrations of a name win. Units that
/// fail to load are recorded in the registry and skipped.
pub fn discover(dirs: &[PathBuf], builtins: Vec<PluginDescriptor>) -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    for builtin in builtins {
        registry.register(builtin);
    }

    for dir in dirs {
        scan_dir(dir, &mut registry);
    }

    log_info!(
        "Discovered {} plugin(s), {} failed",
        registry.len(),
        registry.failures().len()
    );

    registry
}

fn scan_dir(dir: &Path, registry: &mut PluginRegistry) {
    if !dir.is_dir() {
        log_debug!("Plugin directory {:?} does not exist, skipping", dir);
        return;
    }

    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect(),
        Err(e) => {
            let error = EngineError::discovery(dir, e);
            log_warn!("{}", error);
            registry.record_failure(dir, error.to_string());
            return;
        }
    };
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_none_or(|name| name.starts_with('.'));
        if hidden {
            continue;
        }

        let loaded = if path.is_dir() {
            load_plugin_from_dir(&path)
        } else if path.extension().is_some_and(|ext| ext == LUA_EXTENSION) {
            load_plugin_from_file(&path)
        } else {
            continue;
        };

        match loaded {
            Ok(descriptor) => {
                registry.register(descriptor);
            }
            Err(e) => {
                let error = EngineError::discovery(&path, format!("{:#}", e));
                log_warn!("{}", error);
                registry.record_failure(path, format!("{:#}", e));
            }
        }
    }
}

/// Load a plugin from a directory
///
/// The directory may contain:
/// - `meta.toml` - Plugin metadata (optional)
/// - the entry script, `init.lua` unless `plugin.entry` names another file
pub fn load_plugin_from_dir(dir: &Path) -> anyhow::Result<PluginDescriptor> {
    let meta_path = dir.join(META_FILE_NAME);
    let meta = if meta_path.exists() {
        read_metadata(&meta_path)?
    } else {
        PluginMetaFile::default()
    };

    let entry = meta.plugin.entry.clone().unwrap_or_else(|| DEFAULT_ENTRY.to_string());
    if !is_plain_file_name(&entry) {
        bail!("Entry '{}' must be a file name inside the plugin directory", entry);
    }

    let dir_name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .context("Plugin directory has no usable name")?
        .to_string();

    let entry_path = dir.join(&entry);
    let origin = PluginOrigin::Directory {
        dir: dir.to_path_buf(),
        entry,
    };
    build_descriptor(dir_name, meta, origin, entry_path)
}

/// Load a single-file plugin; the name is the file stem without `.plugin`
pub fn load_plugin_from_file(path: &Path) -> anyhow::Result<PluginDescriptor> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("Plugin file has no usable name")?;
    let name = stem.strip_suffix(SINGLE_FILE_SUFFIX).unwrap_or(stem).to_string();

    build_descriptor(
        name,
        PluginMetaFile::default(),
        PluginOrigin::File(path.to_path_buf()),
        path.to_path_buf()
    )
}

/// Read plugin metadata from meta.toml
pub fn read_metadata(path: &Path) -> anyhow::Result<PluginMetaFile> {
    let content = fs::read_to_string(path).context("Failed to read meta.toml")?;
    PluginMetaFile::parse(&content).context("Failed to parse meta.toml")
}

/// Compile `code` without running it
pub fn compile_check(code: &str, chunk_name: &str) -> anyhow::Result<()> {
    let lua = mlua::Lua::new();
    lua.load(code)
        .set_name(format!("@{}", chunk_name))
        .into_function()
        .map(|_| ())
        .context("Failed to compile plugin code")
}

/// A bare file name: no separators, not `.` or `..`
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && Path::new(name).file_name().is_some_and(|file| file == name)
}

fn build_descriptor(
    default_name: String,
    meta: PluginMetaFile,
    origin: PluginOrigin,
    entry_path: PathBuf
) -> anyhow::Result<PluginDescriptor> {
    let code = fs
        ::read_to_string(&entry_path)
        .with_context(|| format!("Failed to read {}", entry_path.display()))?;
    compile_check(&code, &entry_path.display().to_string())?;

    let info = meta.plugin;
    let name = info.name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or(default_name);

    let source_url = info.source_url.as_deref().and_then(|raw| {
        match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                log_warn!("Plugin '{}' has an invalid source_url '{}': {}", name, raw, e);
                None
            }
        }
    });

    let last_updated = info.last_updated.as_deref().and_then(|raw| {
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            log_warn!("Plugin '{}' has an unreadable last_updated '{}'", name, raw);
        }
        parsed
    });

    let cache = meta.cache.ttl_secs
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|ttl| CacheSpec {
            ttl,
            scope: meta.cache.scope.clone(),
        });

    let entrypoint = Arc::new(LuaEntrypoint::new(entry_path, code, meta.permissions.clone()));

    let mut descriptor = PluginDescriptor::new(name, origin, entrypoint);
    descriptor.version = info.version.unwrap_or_else(|| DEFAULT_PLUGIN_VERSION.to_string());
    descriptor.min_host_version = info.min_host_version.unwrap_or_else(||
        DEFAULT_PLUGIN_VERSION.to_string()
    );
    descriptor.source_url = source_url;
    descriptor.last_updated = last_updated;
    descriptor.description = info.description;
    descriptor.help = info.help;
    descriptor.placeholders = info.placeholders;
    descriptor.timeout = info.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
    descriptor.cache = cache;
    descriptor.enabled = info.enabled.unwrap_or(true);
    descriptor.permissions = meta.permissions;

    log_debug!(
        "Loaded plugin '{}' v{} from {}",
        descriptor.name,
        descriptor.version,
        descriptor.origin
    );

    Ok(descriptor)
}
