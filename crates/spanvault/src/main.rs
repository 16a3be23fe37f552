// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The spanvault binary: one executable, role selected with `--target`.
//!
//! Exit codes: 0 on clean shutdown, 1 on initialization errors, 2 when a
//! subservice fails at runtime.

mod app;
mod config;
mod http;
mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app::{App, Target};
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "spanvault", version, about = "distributed trace storage")]
struct Cli {
    /// Which role this process runs.
    #[arg(long = "target", value_enum, default_value = "all")]
    target: Target,

    /// Path to the TOML configuration file.
    #[arg(long = "config.file")]
    config_file: Option<PathBuf>,

    /// Expand ${VAR} references in the configuration file.
    #[arg(long = "config.expand-env", default_value_t = false)]
    config_expand_env: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config_file.as_deref(), cli.config_expand_env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed parsing config: {e:#}");
            return ExitCode::from(1);
        }
    };

    init_logging(&config.server.log_level);

    let app = match App::new(config, cli.target) {
        Ok(app) => app,
        Err(e) => {
            error!("initialization failed: {e:#}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    info!(target = ?cli.target, "starting spanvault");
    match runtime.block_on(app.run()) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("unrecoverable failure: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
