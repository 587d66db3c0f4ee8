// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Regression Analyser Web Dashboard
//!
//! Standalone server for the read-only failure dashboard.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use regression_analyser::config::AppConfig;
use regression_analyser::db::Database;
use regression_analyser::Result;

#[derive(Parser, Debug)]
#[command(name = "regression-analyser-web")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Regression Analyser Dashboard Server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Database file (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Open browser automatically
    #[arg(long)]
    open: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Regression Analyser Dashboard v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config)?;

    if let Some(host) = args.host {
        config.web.host = host;
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }
    if let Some(path) = args.db {
        config.database.path = path;
    }

    let db = Database::open(&config.database.path)?;
    info!("Database: {}", config.database.path);

    if args.open {
        let url = format!("http://{}:{}", config.web.host, config.web.port);
        if let Err(e) = open_browser(&url) {
            error!("Failed to open browser: {}", e);
        }
    }

    regression_analyser::web::start_server(config, db).await
}

fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd").args(["/c", "start", url]).spawn()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse() {
        let args = Args::try_parse_from([
            "regression-analyser-web", "-H", "0.0.0.0", "--port", "3000", "--db", "runs.db",
        ]).unwrap();
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(3000));
        assert_eq!(args.db.as_deref(), Some("runs.db"));
        assert!(!args.open);
    }
}
