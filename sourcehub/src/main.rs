use aggregator::session::PasswordHash;
use clap::Parser;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::{Config, ConfigError, LoggingConfig, MetricsConfig};

#[derive(Parser)]
#[command(name = "sourcehub", version, about)]
enum CliCommand {
    /// Serve cached spreadsheet, CSV and document sources over HTTP
    Serve {
        #[arg(long, short, default_value = "sourcehub.yaml")]
        config: PathBuf,
    },
    /// Print the value to put in `admin.password_sha256`
    HashPassword { password: String },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Aggregator(#[from] aggregator::AggregatorError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::HashPassword { password } => {
            println!("{}", PasswordHash::from_password(&password).to_hex());
            Ok(())
        }
        CliCommand::Serve { config } => serve(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(path: PathBuf) -> Result<(), CliError> {
    let config = Config::from_file(&path)?;

    let _sentry = init_logging(&config.common.logging);
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    tracing::info!(config = %path.display(), "Starting sourcehub");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(aggregator::run(config.aggregator))?;
    Ok(())
}

/// The returned guard flushes pending Sentry events when dropped.
fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let sentry = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_deref().unwrap_or("info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            sentry
                .as_ref()
                .map(|_| sentry::integrations::tracing::layer()),
        )
        .init();

    sentry
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(aggregator::metrics_defs::ALL_METRICS);
    Ok(())
}
