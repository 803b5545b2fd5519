//! docrel-migrate CLI - infer relational schemas from documents and migrate them.

use clap::{Parser, Subcommand};
use docrel_migrate::enhance::NoSuggestions;
use docrel_migrate::source::{self, SourceData};
use docrel_migrate::{
    schema_script, Config, DialectImpl, InputFormat, MigrateError, MigrationPlan,
    MigrationReport, Orchestrator, TargetConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "docrel-migrate")]
#[command(about = "Infer relational schemas from document data and migrate it")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer tables from a document file and print them (or their DDL)
    Infer {
        /// JSON array or NDJSON file
        input: PathBuf,

        /// Root table name
        #[arg(long, default_value = "records")]
        root_table: String,

        /// Input format: json or ndjson
        #[arg(long, default_value = "json")]
        format: String,

        /// Render DDL for this dialect: postgres, mysql, mssql
        #[arg(long)]
        dialect: Option<String>,

        /// Schema to qualify table names with in rendered DDL
        #[arg(long)]
        schema: Option<String>,
    },

    /// Show write order, dependency waves and cycles for a document file
    Plan {
        /// JSON array or NDJSON file
        input: PathBuf,

        /// Root table name
        #[arg(long, default_value = "records")]
        root_table: String,

        /// Input format: json or ndjson
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Run a migration described by the configuration file
    Run {
        /// Override source path
        #[arg(long)]
        input: Option<PathBuf>,

        /// Override root table name
        #[arg(long)]
        root_table: Option<String>,

        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Dry run: write into an in-memory destination instead of the target
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let output_json = cli.output_json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let (true, Some(report)) = (output_json, e.report()) {
                if let Ok(json) = report.to_json() {
                    println!("{}", json);
                }
            }
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), MigrateError> {
    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Infer {
            input,
            root_table,
            format,
            dialect,
            schema,
        } => {
            let records = source::load_documents(&input, parse_format(&format)?)?;
            let plan = MigrationPlan::from_documents(&root_table, records)?;
            for warning in &plan.warnings {
                warn!("{}", warning);
            }

            match dialect {
                Some(name) => {
                    let dialect = DialectImpl::from_db_type(&name)?;
                    let tables: Vec<_> = plan.tables_in_write_order().into_iter().cloned().collect();
                    let schema = schema.unwrap_or_default();
                    for statement in schema_script(&dialect, &schema, &tables) {
                        println!("{};\n", statement);
                    }
                }
                None => {
                    let output = serde_json::json!({
                        "tables": plan.tables,
                        "warnings": plan.warnings,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }

        Commands::Plan {
            input,
            root_table,
            format,
        } => {
            let records = source::load_documents(&input, parse_format(&format)?)?;
            let plan = MigrationPlan::from_documents(&root_table, records)?;
            let summary = plan.summary();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Tables: {}", summary.tables.len());
                for table in &summary.tables {
                    println!(
                        "  {} ({} columns, primary key {})",
                        table.name, table.columns, table.primary_key
                    );
                }
                println!("Write order: {}", summary.write_order.join(", "));
                for (level, wave) in summary.waves.iter().enumerate() {
                    println!("  Wave {}: {}", level, wave.join(", "));
                }
                for cycle in &summary.cycles {
                    println!("Cycle: {}", cycle.join(" -> "));
                }
                for warning in &summary.warnings {
                    println!("Warning: {}", warning);
                }
            }
        }

        Commands::Run {
            input,
            root_table,
            target_schema,
            chunk_size,
            dry_run,
        } => {
            let mut config = Config::load(&cli.config)?;
            info!("Loaded configuration from {:?}", cli.config);

            // Apply overrides
            if let Some(path) = input {
                config.source.path = Some(path);
            }
            if let Some(name) = root_table {
                config.source.root_table = name;
            }
            if let Some(schema) = target_schema {
                config.target.schema = Some(schema);
            }
            if let Some(size) = chunk_size {
                config.migration.chunk_size = size;
            }
            if dry_run {
                info!("Dry run: writing into memory instead of {}", config.target.r#type);
                config.target = TargetConfig::memory();
            }
            config.validate()?;

            let mut plan = match source::load(&config.source)? {
                SourceData::Documents(records) => {
                    MigrationPlan::from_documents(&config.source.root_table, records)?
                }
                SourceData::Relational(input) => MigrationPlan::from_relational(input)?,
            };
            if let Ok(dialect) = DialectImpl::from_backend(config.target.r#type) {
                let timeout = Duration::from_secs(config.migration.suggestion_timeout_secs);
                plan = plan.with_suggestions(&NoSuggestions, &dialect, timeout).await;
            }

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout);

            let orchestrator = Orchestrator::new(config).with_cancellation(cancel_token.clone());
            let printer = cli.progress.then(|| spawn_progress_printer(&orchestrator));

            let report = tokio::select! {
                result = orchestrator.run(&plan) => result?,
                _ = shutdown_deadline(cancel_token, cli.shutdown_timeout) => {
                    return Err(MigrateError::Cancelled);
                }
            };
            // The printer drains buffered events once the run drops its context.
            if let Some(printer) = printer {
                let _ = printer.await;
            }

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report, dry_run);
            }
        }
    }

    Ok(())
}

fn parse_format(format: &str) -> Result<InputFormat, MigrateError> {
    match format.to_lowercase().as_str() {
        "json" => Ok(InputFormat::Json),
        "ndjson" | "jsonl" => Ok(InputFormat::Ndjson),
        other => Err(MigrateError::Config(format!(
            "unknown input format '{}'; expected json or ndjson",
            other
        ))),
    }
}

fn print_report(report: &MigrationReport, dry_run: bool) {
    let status_msg = if dry_run { "Dry run completed!" } else { "Migration completed!" };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {}/{}",
        report.tables_completed, report.tables_total
    );
    println!("  Rows: {}", report.rows_committed);
    println!("  Throughput: {:.0} rows/sec", report.rows_per_second);
    if !report.cycles.is_empty() {
        println!("  Cycles: {:?}", report.cycles);
    }
    if !report.warnings.is_empty() {
        println!("  Warnings: {}", report.warnings.len());
    }
}

/// Print migration events as JSON lines to stderr.
fn spawn_progress_printer(orchestrator: &Orchestrator) -> JoinHandle<()> {
    let mut events = orchestrator.context().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        eprintln!("{}", line);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Resolves `shutdown_timeout` seconds after cancellation, ending a run that
/// does not stop on its own.
async fn shutdown_deadline(token: CancellationToken, shutdown_timeout: u64) {
    token.cancelled().await;
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout of {}s exceeded", shutdown_timeout);
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (Kubernetes/Airflow shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to setup {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(_shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    cancel_token
}
