//! Version compatibility gate
//!
//! A plugin is admitted iff its `min_host_version <= host_version`. Either
//! version failing to parse excludes the plugin. Exclusions are informational
//! and never surface as errors.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::core::Version;
use crate::error::EngineError;
use crate::plugins::registry::PluginDescriptor;
use crate::{ log_debug, log_info };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Incompatible {
        required: String,
    },
    Disabled,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Incompatible { required } => write!(f, "requires host {}", required),
            Exclusion::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    /// Admitted plugins in registry order
    pub admitted: Vec<Arc<PluginDescriptor>>,
    pub excluded: Vec<(Arc<PluginDescriptor>, Exclusion)>,
}

impl Admission {
    pub fn names(&self) -> Vec<&str> {
        self.admitted
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// `min_host_version <= host_version`; malformed versions are incompatible
pub fn is_compatible(min_host_version: &str, host_version: &str) -> bool {
    match (Version::parse(min_host_version), Version::parse(host_version)) {
        (Some(required), Some(host)) => required <= host,
        _ => false,
    }
}

/// Split `plugins` into admitted and excluded sets, preserving order
pub fn admit(plugins: &[Arc<PluginDescriptor>], host_version: &str, config: &Config) -> Admission {
    let mut admission = Admission::default();

    for plugin in plugins {
        let enabled = config.plugin_enabled(&plugin.name).unwrap_or(plugin.enabled);
        if !enabled {
            log_debug!("Plugin '{}' is disabled", plugin.name);
            admission.excluded.push((plugin.clone(), Exclusion::Disabled));
            continue;
        }

        if !is_compatible(&plugin.min_host_version, host_version) {
            let reason = EngineError::VersionIncompatible {
                name: plugin.name.clone(),
                required: plugin.min_host_version.clone(),
                host: host_version.to_string(),
            };
            log_info!("{}", reason);
            admission.excluded.push((
                plugin.clone(),
                Exclusion::Incompatible { required: plugin.min_host_version.clone() },
            ));
            continue;
        }

        admission.admitted.push(plugin.clone());
    }

    admission
}
