//! Secrets file for plugins
//!
//! Variables are read from `general.env_file` (dotenv syntax) and are never
//! exported to the process environment. Each plugin only sees the names
//! listed in its `permissions.env_vars`.

use anyhow::{ Context, Result };
use std::collections::HashMap;
use std::path::Path;

use crate::log_warn;

/// Load variables from a dotenv-style file
///
/// A missing file yields an empty map. Malformed lines are skipped.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    // Iterator form keeps the variables out of the process environment
    #[allow(deprecated)]
    let iter = dotenv
        ::from_path_iter(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut env_vars = HashMap::new();
    for (line, item) in iter.enumerate() {
        match item {
            Ok((key, value)) => {
                env_vars.insert(key, value);
            }
            Err(e) => {
                log_warn!("{} entry {} has invalid format: {}", path.display(), line + 1, e);
            }
        }
    }

    Ok(env_vars)
}

/// Get specific environment variables for a plugin
///
/// Given a list of variable names requested by the plugin,
/// return only those that exist in the loaded environment.
pub fn get_plugin_env_vars(
    requested_vars: &[String],
    env_vars: &HashMap<String, String>
) -> HashMap<String, String> {
    requested_vars
        .iter()
        .filter_map(|name| env_vars.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}
