//! Plugin system
//!
//! Plugins produce named placeholders for the status line. Built-in plugins
//! are compiled in; external plugins are Lua scripts discovered in the
//! configured plugin directories.
//!
//! # Plugin Structure
//!
//! A plugin is either a directory containing:
//! - `meta.toml` - Plugin metadata (name, version, host requirement, cache policy, permissions)
//! - `init.lua` - Lua plugin code (or the file named by `entry`)
//!
//! or a single `<name>.lua` file with default metadata.
//!
//! # Plugin API
//!
//! Plugins must implement `register() -> table` returning placeholder names
//! mapped to values. `get_help() -> string` is optional.
//!
//! # Security
//!
//! Plugins run in a sandbox with:
//! - No file I/O unless `permissions.filesystem` is granted
//! - Command execution only with `permissions.exec`
//! - Network access restricted to whitelisted domains from meta.toml
//! - Resource limits (memory, execution time)

pub mod api;
pub mod builtin;
pub mod entrypoint;
pub mod env;
pub mod gate;
pub mod loader;
pub mod registry;
pub mod sandbox;
pub mod updater;

pub use entrypoint::{ Entrypoint, InvocationContext, LuaEntrypoint };
pub use gate::{ Admission, Exclusion };
pub use loader::discover;
pub use registry::{ PluginDescriptor, PluginOrigin, PluginRegistry, SharedRegistry };
pub use updater::{ RemoteSource, UpdateSummary, Updater };
