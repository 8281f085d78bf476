use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use replica_router::config::{Config, ConfigError, LoggingConfig};
use replica_router::core::Value;
use replica_router::utils::format_age;
use replica_router::{QueryOptions, ReplicaRouter, ReportType};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replica-router")]
#[command(about = "Read replica query router for SQLite-backed services")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register replicas and keep them health-checked until Ctrl-C
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/router.toml")]
        config: PathBuf,
    },
    /// Route a single query and print the rows as JSON lines
    Query {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/router.toml")]
        config: PathBuf,
        /// SQL text to run
        #[arg(short, long)]
        sql: String,
        /// Positional parameter, repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Route as a report (dashboard, export, scheduled)
        #[arg(short, long)]
        report: Option<ReportType>,
    },
    /// Probe every configured replica once and print its status
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/router.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_router(config).await?,
        Commands::Query {
            config,
            sql,
            params,
            report,
        } => run_query(config, sql, params, report).await?,
        Commands::Status { config } => show_status(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn start_router(config_path: &Path) -> anyhow::Result<(Config, ReplicaRouter)> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.logging)?;
    info!(path = ?config_path, replicas = config.replicas.len(), "Configuration loaded");

    let router = ReplicaRouter::sqlite(config.router_options());
    if let Err(e) = router.apply_config(&config).await {
        router.shutdown().await;
        return Err(e).context("Failed to register replicas");
    }

    Ok((config, router))
}

async fn run_router(config_path: PathBuf) -> anyhow::Result<()> {
    let (config, router) = start_router(&config_path).await?;
    if config.replicas.is_empty() {
        router.shutdown().await;
        bail!("No replicas configured in {:?}", config_path);
    }

    info!("Starting replica-router v{}", env!("CARGO_PKG_VERSION"));
    router.start_health_checks()?;

    let mut ticker = tokio::time::interval(router.options().health_interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C");
                break;
            }
            _ = ticker.tick() => {
                let statuses = router.get_replica_status().await;
                let healthy = statuses.iter().filter(|s| s.healthy).count();
                info!(healthy, total = statuses.len(), "Replica pool status");
            }
        }
    }

    router.shutdown().await;
    Ok(())
}

async fn run_query(
    config_path: PathBuf,
    sql: String,
    params: Vec<String>,
    report: Option<ReportType>,
) -> anyhow::Result<()> {
    let (_, router) = start_router(&config_path).await?;
    let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();

    let result = match report {
        Some(report) => router.execute_reporting_query(&sql, &params, report).await,
        None => router.execute_query(&sql, &params, QueryOptions::default()).await,
    };
    router.shutdown().await;

    let rows = match result {
        Ok(rows) => rows,
        Err(e) => {
            error!(
                severity = %e.severity(),
                recoverable = e.is_recoverable(),
                error = %e,
                "Query failed"
            );
            return Err(e).context("Query failed");
        }
    };
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    info!(rows = rows.len(), "Query finished");

    Ok(())
}

/// Integers and reals are passed as numbers, `null` as NULL, anything else as text
fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::Text(raw.to_string())
    }
}

async fn show_status(config_path: PathBuf) -> anyhow::Result<()> {
    let (_, router) = start_router(&config_path).await?;
    let statuses = router.get_replica_status().await;
    router.shutdown().await;

    println!(
        "{:<16} {:<9} {:>12} {:>12} {:>8} {:>8}  {}",
        "NAME", "HEALTHY", "PROBE(ms)", "AVG(ms)", "QUERIES", "ERRORS", "LAST CHECK"
    );
    for status in statuses {
        let probe = status
            .last_probe_latency_ms
            .map(|ms| format!("{:.2}", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<9} {:>12} {:>12.2} {:>8} {:>8}  {}",
            status.name,
            if status.healthy { "yes" } else { "no" },
            probe,
            status.average_latency_ms,
            status.query_count,
            status.error_count,
            format_age(status.last_health_check),
        );
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  replica-router run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Health check interval: {}s", config.health.interval_sec);
            println!("  Reselect on failure: {}", config.executor.reselect_on_failure);
            println!("  Replicas: {}", config.replicas.len());
            for (i, replica) in config.replicas.iter().enumerate() {
                println!(
                    "    {}: {} ({}, weight {}, priority {}, tags [{}])",
                    i + 1,
                    replica.name,
                    replica.path,
                    replica.weight,
                    replica.priority,
                    replica.tags.join(", ")
                );
            }
            println!("  Routing rules: {}", config.rules.len());
            for (i, rule) in config.rules.iter().enumerate() {
                println!("    {}: /{}/ -> {}", i + 1, rule.pattern, rule.replicas.join(", "));
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("replica-router v{}", env!("CARGO_PKG_VERSION"));
    println!("Read replica query router for SQLite-backed services");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Pattern-based routing rules with first-match semantics");
    println!("  • Priority tiers with weighted selection inside a tier");
    println!("  • Periodic and on-failure replica health checks");
    println!("  • Bounded retries with optional cross-replica failover");
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42"), Value::Integer(42));
        assert_eq!(parse_param("1.5"), Value::Real(1.5));
        assert_eq!(parse_param("NULL"), Value::Null);
        assert_eq!(parse_param("open"), Value::Text("open".to_string()));
    }

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::parse_from([
            "replica-router",
            "query",
            "--sql",
            "SELECT * FROM tickets WHERE id = ?1",
            "--param",
            "7",
            "--report",
            "export",
        ]);
        match cli.command {
            Commands::Query { params, report, .. } => {
                assert_eq!(params, vec!["7".to_string()]);
                assert_eq!(report, Some(ReportType::Export));
            }
            _ => panic!("Expected query command"),
        }
    }
}
