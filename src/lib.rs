//! # ping-status
//!
//! A status line renderer driven by plugins. Each render cycle executes the
//! admitted plugins concurrently under per-plugin timeouts, merges the
//! placeholders they produce and substitutes them into one or more templates.
//!
//! - Built-in plugins (`system`, `network-speed`) and sandboxed Lua plugins
//! - Host version gating from each plugin's `meta.toml`
//! - Per-plugin result caching, persisted in LMDB between runs
//! - Background network sampling and plugin auto-update
//!
//! Basic usage:
//! ```no_run
//! use ping_status::{ config::Config, render_status };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     for line in render_status(&config).await {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod plugins;
pub mod storage;

pub use engine::{ CycleReport, Engine };
pub use error::{ EngineError, EngineResult };

/// Run a single render cycle against `config` and return the rendered lines
pub async fn render_status(config: &config::Config) -> Vec<String> {
    let engine = Engine::new(config);
    engine.render_cycle(config, None).await.lines
}
