mod config;
mod telemetry;

use clap::Parser;
use cluster::memory::MemoryEnsemble;
use config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use telemetry::TelemetryError;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "shardgate", version, about = "Hedged request proxy for sharded clusters")]
enum CliCommand {
    /// Serve the fallback proxy
    Proxy {
        /// Path to the YAML config file
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("config has no `{0}` section")]
    MissingSection(&'static str),
    #[error("could not start the runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("proxy failed: {0}")]
    Proxy(#[from] proxy::errors::ServiceError),
    #[error("cluster member failed: {0}")]
    Member(#[from] cluster::MemberError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::Proxy { config } => run_proxy(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            eprintln!("shardgate: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_proxy(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    let _sentry = telemetry::init_logging(&config.common.logging)?;
    if let Some(metrics) = &config.common.metrics {
        telemetry::init_metrics(metrics)?;
    }
    let proxy_config = config.proxy.ok_or(CliError::MissingSection("proxy"))?;
    let membership = config.cluster;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received shutdown signal");
            }
            on_signal.cancel();
        });

        tracing::info!(config = %path.display(), "starting proxy");
        match membership {
            Some(membership) => {
                // No network ensemble client is built in, members share an
                // in-process ensemble.
                tracing::warn!("using the in-process ensemble, only this process is visible");
                cluster::member::run(membership, proxy_config, MemoryEnsemble::new(), shutdown)
                    .await?;
            }
            None => proxy::run(proxy_config, shutdown).await?,
        }
        Ok::<_, CliError>(())
    })?;

    Ok(())
}
