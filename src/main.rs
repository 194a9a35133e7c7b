mod app;
mod cli;
mod client;
mod config;
mod dataset;
mod session;
mod storage;
mod tui;
mod turn;
mod usage;

use anyhow::Result;
use clap::Parser;
use std::{fs::OpenOptions, path::PathBuf};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let mut config = config::AppConfig::load(cli.config_path.as_deref())?;
    if let Some(session) = &cli.session {
        config.storage.session_key = session.clone();
    }
    if let Some(data) = &cli.data {
        config.data.path = data.clone();
    }
    init_tracing(config.display.log_path.clone());

    let app = app::App::new(config);
    app.run(cli.mode()).await
}

fn init_tracing(log_path: PathBuf) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Keep the TUI clean: write all tracing output to a file instead of the terminal.
    let writer = move || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .expect("failed to open log file for tracing output")
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
}
