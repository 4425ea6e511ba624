/*
 * ping-status - plugin driven status line renderer
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::time::Duration;

use ping_status::config::{ Cli, Config };
use ping_status::core::logger::init_from_args;
use ping_status::{ Engine, log_debug, log_error, log_info, log_warn };

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if let Err(e) = init_from_args(args.verbose, args.debug, args.journald) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    };

    match config.source() {
        Some(path) => log_debug!("Using configuration {}", path.display()),
        None => log_debug!("Using built-in configuration defaults"),
    }

    let engine = Engine::new(&config);

    if args.plugin_help {
        print_lines(&[engine.plugin_help(&config).await.trim_end().to_string()]);
        return Ok(());
    }

    if args.update {
        match engine.update_now().await {
            Some(summary) => {
                print_lines(&[summary.to_string()]);
            }
            None => log_warn!("Plugin updates are unavailable"),
        }
        return Ok(());
    }

    if args.watch {
        return watch(engine, config, &args).await;
    }

    let report = engine.render_cycle(&config, Some(args.template.as_slice())).await;
    print_lines(&report.lines);
    engine.update_if_due(&config).await;

    Ok(())
}

/// Render every refresh interval until interrupted, reloading the
/// configuration before each cycle
async fn watch(engine: Engine, mut config: Config, args: &Cli) -> Result<()> {
    log_info!("Watching, refresh every {:?}", config.refresh_interval());
    engine.start_background(&config);

    loop {
        let report = engine.render_cycle(&config, Some(args.template.as_slice())).await;
        if !print_lines(&report.lines) {
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log_info!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(config.refresh_interval()) => {}
        }

        match Config::load(args.config.as_deref()) {
            Ok(next) => {
                config = next;
            }
            Err(e) => log_warn!("Keeping previous configuration: {}", e),
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await.is_err() {
        log_debug!("Background tasks did not stop in time");
    }
    Ok(())
}

/// Write the rendered lines to stdout; a closed stdout is logged, not fatal
fn print_lines(lines: &[String]) -> bool {
    let stdout = std::io::stdout();
    match write_lines(&mut stdout.lock(), lines) {
        Ok(()) => true,
        Err(e) => {
            log_warn!("Failed to write status line: {}", e);
            false
        }
    }
}

fn write_lines(out: &mut impl Write, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        writeln!(out, "{}", line)?;
    }
    out.flush()
}
