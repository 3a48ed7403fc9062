//! legacy-sync CLI - dependency-ordered, resumable legacy schema migration.

use clap::{Parser, Subcommand};
use legacy_sync::orchestrator::{load_run, open_state_backend};
use legacy_sync::{
    Config, MigrateError, Orchestrator, RunEvent, RunReport, TaskStatus, TransformRegistry, ValidationOutcome,
    ValidationReport,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "legacy-sync")]
#[command(about = "Dependency-ordered, resumable migration of a legacy schema")]
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

    /// Print run events as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run
    Run {
        /// Only these entities (comma separated); their dependencies must
        /// already be migrated
        #[arg(long, value_delimiter = ',')]
        entities: Vec<String>,

        /// Override the number of entities migrated at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Count the delta without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Use this run id instead of a generated one
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Resume an interrupted run
    Resume {
        /// Run to resume (default: latest run for this configuration)
        #[arg(long)]
        run_id: Option<String>,

        /// Resume even if the configuration changed
        #[arg(long)]
        force: bool,

        /// Override the number of entities migrated at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Run post-migration validation checks
    Validate,

    /// Print the leveled execution plan (no database access)
    Plan,

    /// Test database connections
    HealthCheck,

    /// List conflicts waiting for manual resolution
    Conflicts {
        /// Run to inspect (default: latest run for this configuration)
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Plan => {
            let plan = config.plan()?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Execution plan ({} entities):", plan.len());
                for (level, names) in plan.levels().iter().enumerate() {
                    println!("  Level {}: {}", level, names.join(", "));
                }
            }
            Ok(0)
        }

        Commands::Run {
            entities,
            concurrency,
            dry_run,
            run_id,
        } => {
            if !entities.is_empty() {
                config.run.entities = entities;
            }
            if concurrency.is_some() {
                config.run.concurrency = concurrency;
            }
            config.run.dry_run |= dry_run;
            config.validate()?;

            let mut orchestrator = Orchestrator::connect(config.with_auto_tuning(), TransformRegistry::new()).await?;
            if let Some(id) = run_id {
                orchestrator = orchestrator.with_run_id(id);
            }
            execute(orchestrator, cli.progress, cli.output_json).await
        }

        Commands::Resume {
            run_id,
            force,
            concurrency,
        } => {
            if concurrency.is_some() {
                config.run.concurrency = concurrency;
            }
            config.validate()?;

            let mut orchestrator = Orchestrator::connect(config.with_auto_tuning(), TransformRegistry::new())
                .await?
                .resume();
            if let Some(id) = run_id {
                orchestrator = orchestrator.with_run_id(id);
            }
            if force {
                orchestrator = orchestrator.force();
            }
            info!("Resuming previous run");
            execute(orchestrator, cli.progress, cli.output_json).await
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::connect(config.with_auto_tuning(), TransformRegistry::new()).await?;
            let report = orchestrator.validate().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation(&report);
            }
            Ok(match report.outcome() {
                ValidationOutcome::Pass | ValidationOutcome::Warn => 0,
                ValidationOutcome::Fail | ValidationOutcome::Error => 2,
            })
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config, TransformRegistry::new()).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target: {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::connectivity("health check", "one or more stores unreachable"));
            }
            Ok(0)
        }

        Commands::Conflicts { run_id } => {
            let backend = open_state_backend(&config).await?;
            let conflicts = load_run(backend.as_ref(), &config, run_id.as_deref())
                .await?
                .map(|s| s.pending_conflicts)
                .unwrap_or_default();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&conflicts)?);
            } else if conflicts.is_empty() {
                println!("No conflicts pending manual resolution");
            } else {
                println!("{} conflicts pending manual resolution:", conflicts.len());
                for c in &conflicts {
                    println!(
                        "  {} {} -> {} changed: {}",
                        c.entity,
                        c.legacy_id,
                        c.new_id,
                        c.changed_fields.join(", ")
                    );
                }
            }
            Ok(0)
        }
    }
}

/// Run the orchestrator with signal handling and print the report.
async fn execute(orchestrator: Orchestrator, progress: bool, output_json: bool) -> Result<u8, MigrateError> {
    let cancel = setup_signal_handler();

    let (orchestrator, printer) = if progress {
        let (tx, rx) = mpsc::unbounded_channel::<RunEvent>();
        (orchestrator.with_events(tx), Some(spawn_event_printer(rx, std::io::stderr())))
    } else {
        (orchestrator, None)
    };

    let result = orchestrator.run(cancel).await;
    // Closing the sender lets the printer drain the last events and exit.
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    let report = result?;
    if output_json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }
    Ok(report.outcome.exit_code())
}

/// Write each event as one JSON line until every sender is dropped.
fn spawn_event_printer<W>(mut rx: mpsc::UnboundedReceiver<RunEvent>, mut out: W) -> JoinHandle<W>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                let _ = writeln!(out, "{}", line);
            }
        }
        out
    })
}

fn print_report(report: &RunReport) {
    let title = if report.dry_run { "Dry run" } else { "Run" };
    println!("\n{} {}: {}", title, report.run_id, report.outcome);
    println!("  Duration: {:.2}s", report.duration_seconds);

    for entity in &report.entities {
        match &entity.diff {
            Some(diff) => println!(
                "  {:<24} {} source rows, {} to insert, {} conflict candidates, {} unchanged",
                entity.name, diff.source_rows, diff.missing, diff.conflict_candidates, diff.unchanged
            ),
            None => println!(
                "  {:<24} {:<11} inserted {}, updated {}, unchanged {}, skipped {}, failed {}",
                entity.name,
                format!("{:?}", entity.status).to_lowercase(),
                entity.inserted,
                entity.updated,
                entity.unchanged,
                entity.skipped,
                entity.failed
            ),
        }
        if matches!(entity.status, TaskStatus::Failed | TaskStatus::Skipped) {
            if let Some(ref reason) = entity.error {
                println!("    Reason: {}", reason);
            }
        }
        for skip in entity.skips.iter().take(5) {
            println!("    Skipped {:?}: {}", skip.legacy_id, skip.reason);
        }
    }

    if !report.conflicts.is_empty() {
        println!("  Conflicts pending manual resolution: {}", report.conflicts.len());
    }
    if let Some(ref validation) = report.validation {
        print_validation(validation);
    }
}

fn print_validation(report: &ValidationReport) {
    println!("\nValidation: {:?} ({} checks)", report.outcome(), report.len());
    for r in &report.results {
        if r.outcome != ValidationOutcome::Pass {
            println!("  {:?} {} {}: {}", r.outcome, r.entity, r.check, r.message);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    // RUST_LOG wins over --verbosity when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. The in-flight batch of
/// every entity finishes committing before the run stops.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing in-flight batches...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Could not install {} handler: {}", name, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight batches...");
            token.cancel();
        }
    });

    cancel_token
}
