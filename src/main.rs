// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Regression Analyser: LLM root-cause analysis for failing Cucumber runs
//!
//! Reads a Cucumber JSON report, collapses repeated failures, asks the
//! configured model for a root cause and fix per failure, and stores the
//! results for the dashboard.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use regression_analyser::analyzer::{AnalysisRun, FailureAnalyzer, ReportKind};
use regression_analyser::config::{AppConfig, Provider};
use regression_analyser::db::Database;
use regression_analyser::llm::client_from_config;
use regression_analyser::llm::ollama::OllamaClient;
use regression_analyser::{web, AnalyserError, Result};

/// Regression Analyser CLI
#[derive(Parser, Debug)]
#[command(name = "regression-analyser")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "LLM-assisted root-cause analysis for failing Cucumber test runs", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for results
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json", "jsonl"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze the failures in a Cucumber JSON report
    Analyze {
        /// Report file to analyze
        report: PathBuf,

        /// Kind of test run (api packs failures, ui attaches screenshots)
        #[arg(short, long, default_value = "api")]
        kind: ReportKind,

        /// Don't write the run to the database
        #[arg(long)]
        no_store: bool,

        /// Send every failure, even repeats
        #[arg(long)]
        no_dedup: bool,

        /// Write the results as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// LLM provider (overrides config)
        #[arg(long)]
        provider: Option<Provider>,

        /// Model name (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// Seconds to wait between request groups (overrides config)
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        action: DbCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show LLM and database status
    Status,

    /// Serve the dashboard
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new project directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Show database statistics
    Stats,

    /// List recent analysis runs
    Runs {
        /// Maximum number to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Search stored analyses by feature, scenario, step or error
    Search {
        /// Search query
        query: String,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Export all analyses to JSON
    Export {
        /// Output file
        output: PathBuf,
    },

    /// Vacuum database (reclaim space)
    Vacuum,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Analyze { report, kind, no_store, no_dedup, output, provider, model, delay } => {
            let mut config = config;
            if let Some(provider) = provider {
                config.llm.provider = provider;
                config.llm.model = provider.default_model().to_string();
            }
            if let Some(model) = model {
                config.llm.model = model;
            }
            if let Some(delay) = delay {
                config.batching.delay_between_batches_secs = delay;
            }
            if no_dedup {
                config.dedup.enabled = false;
            }
            run_analyze(config, &report, kind, !no_store, output, &cli.format).await
        }
        Commands::Db { action } => run_db_command(config, action, &cli.format),
        Commands::Config { action } => run_config_command(config, action, &cli.config),
        Commands::Status => run_status(config).await,
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.web.host = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            let db = Database::open(&config.database.path)?;
            web::start_server(config, db).await
        }
        Commands::Init { dir, force } => run_init(dir, force),
    }
}

/// Analyze one report
async fn run_analyze(
    config: AppConfig,
    report: &Path,
    kind: ReportKind,
    store: bool,
    output: Option<PathBuf>,
    format: &str,
) -> Result<()> {
    let client = client_from_config(&config.llm)?;
    info!("Using {} model {}", client.name(), client.model());

    let db = if store {
        Some(Database::open(&config.database.path)?)
    } else {
        None
    };

    let analyzer = FailureAnalyzer::new(config, client, kind);
    let run = analyzer.analyze_file(report, db.as_ref()).await?;

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&run.results)?)?;
        info!("Wrote {} analyses to {:?}", run.results.len(), path);
    }

    print_run(&run, format)?;

    if !run.errors.is_empty() {
        warn!("{} requests failed; their failures have no analysis", run.errors.len());
    }

    Ok(())
}

fn print_run(run: &AnalysisRun, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(run)?),
        "jsonl" => {
            for result in &run.results {
                println!("{}", serde_json::to_string(result)?);
            }
        }
        _ => {
            for result in &run.results {
                let a = &result.analysis;
                println!("{} / {}", a.feature_name, a.scenario_name);
                println!("  Step:     {}", a.step_details);
                if !a.file_path.is_empty() {
                    println!("  Location: {}:{}", a.file_path, a.line_number);
                }
                println!("  Error:    {}", a.error_message);
                println!("  Reason:   {}", a.detailed_reason);
                for fix in &a.recommended_fixes {
                    println!("  Fix:      {}", fix);
                }
                if let Some(category) = &a.error_category {
                    println!("  Category: {}", category);
                }
                if result.occurrences > 1 || result.reused {
                    println!(
                        "  Seen {} times{}",
                        result.occurrences,
                        if result.reused { " (analysis reused)" } else { "" }
                    );
                }
                println!();
            }

            println!(
                "{} failed steps, {} distinct, {} analysed ({} reused), {} unanalysed",
                run.total_failures,
                run.unique_failures,
                run.results.len(),
                run.reused,
                run.unanalysed()
            );
            for error in &run.errors {
                println!("  Request failed for {}: {}", error.scenarios.join(", "), error.message);
            }
            for dropped in &run.dropped {
                println!("  Too large to send: {}", dropped);
            }
        }
    }

    Ok(())
}

/// Run database commands
fn run_db_command(config: AppConfig, action: DbCommands, format: &str) -> Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        DbCommands::Stats => {
            let stats = db.get_stats()?;
            if format == "text" {
                println!("Database Statistics:");
                println!("  Runs: {}", stats.run_count);
                println!("  Analyses: {}", stats.analysis_count);
                println!("  Distinct failures: {}", stats.distinct_failures);
                println!("  Total occurrences: {}", stats.total_occurrences);
            } else {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        DbCommands::Runs { limit } => {
            let runs = db.get_runs(limit)?;
            if format == "text" {
                println!("Recent runs:");
                for run in runs {
                    println!(
                        "  {} {} [{}] {} failures, {} distinct, {} reused, {} errors  {}",
                        run.created_at.format("%Y-%m-%d %H:%M"),
                        run.id,
                        run.kind,
                        run.total_failures,
                        run.unique_failures,
                        run.reused,
                        run.error_count,
                        run.source
                    );
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            }
        }
        DbCommands::Search { query, limit } => {
            let results = db.search_results(&query, limit)?;
            if format == "text" {
                println!("Search results for '{}':", query);
                for r in results {
                    println!(
                        "  {} / {} / {}: {}",
                        r.analysis.feature_name,
                        r.analysis.scenario_name,
                        r.analysis.step_details,
                        r.analysis.detailed_reason
                    );
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }
        DbCommands::Export { output } => {
            let results = db.get_all_results()?;
            let json = serde_json::to_string_pretty(&results)?;
            std::fs::write(&output, json)?;
            println!("Exported {} analyses to {:?}", results.len(), output);
        }
        DbCommands::Vacuum => {
            db.vacuum()?;
            println!("Database vacuumed successfully");
        }
    }

    Ok(())
}

/// Run config commands
fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Provider: {} ({})", config.llm.provider, config.llm.base_url());
            println!("  Model: {}", config.llm.model);
            println!(
                "  Batching: {} parallel requests, {} items/request, {} chars max",
                config.batching.batch_size, config.batching.max_items_per_request, config.batching.max_chars
            );
            println!("  Database: {}", config.database.path);
            if let Err(e) = config.llm.api_key() {
                println!("  Warning: {}", e);
            }
        }
    }

    Ok(())
}

/// Run status check
async fn run_status(config: AppConfig) -> Result<()> {
    println!("Regression Analyser v{} Status", env!("CARGO_PKG_VERSION"));
    println!("==============================");

    match client_from_config(&config.llm) {
        Ok(client) => match client.health_check().await {
            Ok(()) => println!("LLM: {} reachable at {}", client.name(), config.llm.base_url()),
            Err(e) => println!("LLM: {} error - {}", client.name(), e),
        },
        Err(e) => println!("LLM: not configured - {}", e),
    }

    if config.llm.provider == Provider::Ollama {
        let client = OllamaClient::new(&config.llm.base_url(), &config.llm.model)?;
        match client.list_models().await {
            Ok(models) => {
                println!("\nAvailable models:");
                for m in &models {
                    let marker = if m.starts_with(config.llm.model.as_str()) { "→" } else { " " };
                    println!("  {} {}", marker, m);
                }
            }
            Err(e) => println!("  Error listing models: {}", e),
        }
    }

    match Database::open(&config.database.path) {
        Ok(db) => {
            let stats = db.get_stats()?;
            println!("\nDatabase ({}):", config.database.path);
            println!("  Runs: {}", stats.run_count);
            println!("  Analyses: {}", stats.analysis_count);
            println!("  Distinct failures: {}", stats.distinct_failures);
        }
        Err(e) => println!("\nDatabase: Error - {}", e),
    }

    println!("\nConfiguration:");
    println!("  Provider: {}", config.llm.provider);
    println!("  Model: {}", config.llm.model);
    println!("  Dedup: {} (reuse previous: {})", config.dedup.enabled, config.dedup.reuse_previous_analyses);

    Ok(())
}

/// Initialize a new project directory
fn run_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("config.json");

    if config_path.exists() && !force {
        return Err(AnalyserError::Config(
            "config.json already exists. Use --force to overwrite".to_string(),
        ));
    }

    std::fs::create_dir_all(target.join("reports"))?;

    let config = AppConfig::default();
    config.save(&config_path)?;

    let env_path = target.join(".env.example");
    if !env_path.exists() {
        std::fs::write(&env_path, format!("{}=\n", config.llm.provider.default_key_env()))?;
    }

    println!("Regression Analyser initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - config.json");
    println!("  - .env.example");
    println!("  - reports/");
    println!("\nNext steps:");
    println!("  1. Put your API key in .env");
    println!("  2. regression-analyser analyze reports/cucumber.json");
    println!("  3. regression-analyser serve");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_analyze_defaults() {
        let cli = Cli::try_parse_from(["regression-analyser", "analyze", "report.json"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.format, "text");

        match cli.command {
            Commands::Analyze { report, kind, no_store, no_dedup, output, .. } => {
                assert_eq!(report, PathBuf::from("report.json"));
                assert_eq!(kind, ReportKind::Api);
                assert!(!no_store);
                assert!(!no_dedup);
                assert!(output.is_none());
            }
            _ => panic!("Expected Analyze command"),
        }
    }

    #[test]
    fn test_cli_analyze_overrides() {
        let cli = Cli::try_parse_from([
            "regression-analyser", "analyze", "ui.json", "--kind", "ui", "--no-store", "--no-dedup",
            "--provider", "claude", "--format", "jsonl", "--output", "out.json",
        ]).unwrap();

        assert_eq!(cli.format, "jsonl");
        match cli.command {
            Commands::Analyze { kind, no_store, no_dedup, provider, output, .. } => {
                assert_eq!(kind, ReportKind::Ui);
                assert!(no_store && no_dedup);
                assert_eq!(provider, Some(Provider::Claude));
                assert_eq!(output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("Expected Analyze command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["regression-analyser", "analyze", "r.json", "--kind", "web"]).is_err());
    }

    #[test]
    fn test_cli_db_search() {
        let cli = Cli::try_parse_from(["regression-analyser", "db", "search", "Timeout", "-l", "5"]).unwrap();
        match cli.command {
            Commands::Db { action: DbCommands::Search { query, limit } } => {
                assert_eq!(query, "Timeout");
                assert_eq!(limit, 5);
            }
            _ => panic!("Expected Db Search command"),
        }
    }

    #[test]
    fn test_cli_serve_port() {
        let cli = Cli::try_parse_from(["regression-analyser", "serve", "--port", "9000"]).unwrap();
        match cli.command {
            Commands::Serve { host, port } => {
                assert!(host.is_none());
                assert_eq!(port, Some(9000));
            }
            _ => panic!("Expected Serve command"),
        }
    }
}
