use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stash_backup::config::{write_example_config, AppConfig};
use stash_backup::orchestrator::{self, RunOptions, RunSummary};
use stash_backup::process::ShellRunner;
use stash_backup::providers::Provider;
use stash_backup::report;
use stash_backup::targets::{AwsRdsApi, SnapshotApi, TargetContext};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stash-backup")]
#[command(about = "Backs up and restores files, archives, databases and RDS snapshots")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Descriptor file or directory of `*-backup.yaml` descriptors
    #[arg(short, long, global = true)]
    descriptors: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up this machine: `backup [s3|file|rds-snapshot] [SELECTORS...]`
    Backup {
        /// Act as this host instead of the local hostname
        #[arg(long)]
        hostname: Option<String>,
        /// Optional mode (default s3) followed by `kind.name` selectors
        args: Vec<String>,
    },
    /// Restore this machine: `restore [s3|file] [SELECTORS...]`
    Restore {
        /// Restore another host's backups onto this machine
        #[arg(long)]
        hostname: Option<String>,
        /// Optional mode (default s3) followed by `kind.name` selectors
        args: Vec<String>,
    },
    /// Download the latest backups without restoring them
    Download {
        #[arg(long)]
        hostname: Option<String>,
        selectors: Vec<String>,
    },
    /// Report stale backups for this machine's descriptors
    Check {
        #[arg(long)]
        hostname: Option<String>,
        selectors: Vec<String>,
    },
    /// Report stale backups across the whole bucket
    CheckAll,
    /// Print the effective configuration, or write an example one
    Config {
        #[arg(long)]
        example: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackupMode {
    S3,
    File,
    RdsSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RestoreMode {
    S3,
    File,
}

/// Takes a leading mode off the positional arguments; anything else is a
/// selector.
fn split_mode<M: ValueEnum>(args: Vec<String>, default: M) -> (M, Vec<String>) {
    match args.first().and_then(|arg| M::from_str(arg, true).ok()) {
        Some(mode) => (mode, args[1..].to_vec()),
        None => (default, args),
    }
}

fn local_hostname() -> Result<String> {
    hostname::get()
        .context("Failed to read hostname")?
        .into_string()
        .map_err(|h| anyhow!("hostname is not valid UTF-8: {:?}", h))
}

fn run_options(config: &AppConfig, hostname: Option<String>, selectors: Vec<String>) -> Result<RunOptions> {
    Ok(RunOptions {
        descriptors: config.descriptor_dir.clone(),
        hostname: match hostname {
            Some(hostname) => hostname,
            None => local_hostname()?,
        },
        selectors,
    })
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stash_backup={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn provider(config: &AppConfig) -> Result<Provider> {
    Provider::from_config(&config.bucket, &config.storage)
        .await
        .with_context(|| format!("Failed to set up {} storage", config.storage.provider))
}

fn summary_exit(summary: &RunSummary) -> ExitCode {
    info!(
        "{} descriptors processed, {} skipped, {} uploaded, {} downloaded",
        summary.processed,
        summary.skipped,
        summary.uploaded.len(),
        summary.downloaded.len()
    );
    for failure in &summary.failures {
        error!("failed: {}", failure);
    }
    for name in &summary.not_restored {
        error!("not restored: {}", name);
    }
    if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn problems_exit(problems: usize, summary: Option<&RunSummary>) -> ExitCode {
    if problems > 0 {
        return ExitCode::from(problems.min(255) as u8);
    }
    match summary {
        Some(summary) if summary.invalid_descriptor => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(descriptors) = cli.descriptors {
        config.descriptor_dir = descriptors;
    }
    init_logging(&config.logging.level);

    let runner = ShellRunner;
    let now = chrono::Local::now().naive_local();

    let code = match cli.command {
        Commands::Backup { hostname, args } => {
            let (mode, selectors) = split_mode(args, BackupMode::S3);
            let options = run_options(&config, hostname, selectors)?;
            let summary = match mode {
                BackupMode::S3 => {
                    let ctx = TargetContext {
                        config: &config,
                        runner: &runner,
                        snapshots: None,
                    };
                    let provider = provider(&config).await?;
                    orchestrator::s3_backup(&ctx, &provider, &options).await?
                }
                BackupMode::File => {
                    let ctx = TargetContext {
                        config: &config,
                        runner: &runner,
                        snapshots: None,
                    };
                    orchestrator::file_backup(&ctx, &options).await?
                }
                BackupMode::RdsSnapshot => {
                    let rds = AwsRdsApi::new(config.rds.region.as_deref()).await;
                    let ctx = TargetContext {
                        config: &config,
                        runner: &runner,
                        snapshots: Some(&rds as &dyn SnapshotApi),
                    };
                    orchestrator::rds_backup(&ctx, &options).await?
                }
            };
            summary_exit(&summary)
        }
        Commands::Restore { hostname, args } => {
            let (mode, selectors) = split_mode(args, RestoreMode::S3);
            let options = run_options(&config, hostname, selectors)?;
            let ctx = TargetContext {
                config: &config,
                runner: &runner,
                snapshots: None,
            };
            let summary = match mode {
                RestoreMode::S3 => {
                    let provider = provider(&config).await?;
                    orchestrator::s3_restore(&ctx, &provider, &options).await?
                }
                RestoreMode::File => orchestrator::file_restore(&ctx, &options).await?,
            };
            summary_exit(&summary)
        }
        Commands::Download { hostname, selectors } => {
            let options = run_options(&config, hostname, selectors)?;
            let ctx = TargetContext {
                config: &config,
                runner: &runner,
                snapshots: None,
            };
            let provider = provider(&config).await?;
            let summary = orchestrator::download(&ctx, &provider, &options).await?;
            for path in &summary.downloaded {
                println!("{}", path.display());
            }
            summary_exit(&summary)
        }
        Commands::Check { hostname, selectors } => {
            let options = run_options(&config, hostname, selectors)?;
            let provider = provider(&config).await?;
            let (problems, summary) = report::check(&provider, &config, &options, now).await?;
            problems_exit(problems.len(), Some(&summary))
        }
        Commands::CheckAll => {
            let provider = provider(&config).await?;
            let problems = report::check_all(&provider, &config.report, now).await?;
            problems_exit(problems.len(), None)
        }
        Commands::Config { example } => {
            match example {
                Some(path) => {
                    write_example_config(&path)?;
                    println!("Example configuration written to: {}", path.display());
                }
                None => print!("{}", config.redacted().to_toml()?),
            }
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
