//! `nbd-verify`: run conformance checks or benchmarks against an NBD server.

use std::future::Future;
use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tokio_nbd_verify::bench::{run_iops, run_latency, IopsConfig, LatencyConfig};
use tokio_nbd_verify::connect::{RetryPolicy, TcpConnector};
use tokio_nbd_verify::harness::{ensure_device_empty, Outcome, Verifier, VerifyConfig};
use tokio_nbd_verify::rng::Lrand48;
use tokio_nbd_verify::session::{Session, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Run the conformance scenarios
    Verify,
    /// Random block I/O until interrupted
    Iops,
    /// Zero-length round trips for five seconds
    Latency,
}

#[derive(Debug, Parser)]
#[command(name = "nbd-verify", author, version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    #[arg(short = 'H', long)]
    host: String,

    /// Server port
    #[arg(short = 'P', long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    #[arg(short, long, value_enum, default_value_t = Action::Verify)]
    action: Action,

    /// Percentage of duplicate blocks written by the IOPS test
    #[arg(short = 'p', long, default_value_t = 7.0, value_parser = parse_percent)]
    dedup_percent: f64,

    /// Use reads instead of writes for the IOPS and latency tests
    #[arg(short, long)]
    reads: bool,

    /// Seconds to wait between closing and reopening a connection
    #[arg(short = 'i', long, default_value_t = 1.1, value_parser = parse_seconds)]
    settle: f64,

    /// Continue even if the device already contains data
    #[arg(short, long)]
    force: bool,

    /// Seconds to wait for the server before giving up
    #[arg(short, long, default_value_t = 5.0, value_parser = parse_seconds)]
    timeout: f64,

    /// Keep one connection for the whole verification run
    #[arg(short, long)]
    no_reconnect: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_percent(value: &str) -> Result<f64, String> {
    let percent: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("{percent} is not between 0 and 100"));
    }
    Ok(percent)
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("{seconds} is not a positive number of seconds"));
    }
    Ok(seconds)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let connector = TcpConnector::new(cli.host.clone(), cli.port);
    let session_config = SessionConfig {
        read_timeout: Duration::from_secs_f64(cli.timeout),
        verbose: cli.verbose,
        retry: RetryPolicy::default(),
    };
    let settle_delay = Duration::from_secs_f64(cli.settle);

    let startup = async {
        preflight(&connector, &session_config, cli.force).await?;
        tokio::time::sleep(settle_delay).await;
        anyhow::Ok(())
    };
    interruptible(startup, tokio::signal::ctrl_c()).await?;

    match cli.action {
        Action::Verify => {
            let config = VerifyConfig {
                reconnect: !cli.no_reconnect,
                settle_delay,
                ..VerifyConfig::default()
            };
            interruptible(
                verify(connector, session_config, config),
                tokio::signal::ctrl_c(),
            )
            .await
        }
        Action::Iops => {
            let config = IopsConfig {
                dedup_percent: cli.dedup_percent,
                writes: !cli.reads,
                ..IopsConfig::default()
            };
            iops(connector, session_config, config).await
        }
        Action::Latency => {
            let config = LatencyConfig {
                writes: !cli.reads,
                ..LatencyConfig::default()
            };
            interruptible(
                latency(connector, session_config, config),
                tokio::signal::ctrl_c(),
            )
            .await
        }
    }
}

/// Runs `work` unless `interrupt` completes first.
async fn interruptible<T>(
    work: impl Future<Output = anyhow::Result<T>>,
    interrupt: impl Future<Output = io::Result<()>>,
) -> anyhow::Result<T> {
    tokio::select! {
        result = work => result,
        _ = interrupt => bail!("interrupted"),
    }
}

async fn preflight(
    connector: &TcpConnector,
    config: &SessionConfig,
    force: bool,
) -> anyhow::Result<()> {
    info!("checking that the device is empty");
    match ensure_device_empty(connector.clone(), config.clone()).await {
        Ok(()) => Ok(()),
        Err(e) if force => {
            warn!("{e}, continuing anyway");
            Ok(())
        }
        Err(e) => Err(e).context("aborted (use -f to override this check)"),
    }
}

async fn verify(
    connector: TcpConnector,
    session_config: SessionConfig,
    config: VerifyConfig,
) -> anyhow::Result<()> {
    let session = Session::open(connector, session_config)
        .await
        .context("opening session")?;
    let report = Verifier::new(session, config)?.run().await?;

    let skipped = report
        .scenarios
        .iter()
        .filter(|report| matches!(report.outcome, Outcome::Skipped(_)))
        .count();
    if let Some(rate) = report.dedup_blocks_per_second {
        info!("dedup write rate: {rate:.1} blocks/s");
    }
    info!(
        passed = report.scenarios.len() - skipped,
        skipped, "all tests passed"
    );
    Ok(())
}

async fn iops(
    connector: TcpConnector,
    session_config: SessionConfig,
    config: IopsConfig,
) -> anyhow::Result<()> {
    let open = async {
        Session::open(connector, session_config)
            .await
            .context("opening session")
    };
    let mut session = interruptible(open, tokio::signal::ctrl_c()).await?;

    let stop = Arc::new(AtomicBool::new(false));
    let interrupt = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stopping after the current operation");
                stop.store(true, Ordering::Relaxed);
            }
        })
    };

    let report = run_iops(&mut session, &mut Lrand48::default(), &config, &stop).await;
    interrupt.abort();

    let report = report?;
    info!(
        operations = report.operations,
        "average IOPs: {:.0}",
        report.per_second()
    );
    session.close().await?;
    Ok(())
}

async fn latency(
    connector: TcpConnector,
    session_config: SessionConfig,
    config: LatencyConfig,
) -> anyhow::Result<()> {
    let mut session = Session::open(connector, session_config)
        .await
        .context("opening session")?;
    run_latency(&mut session, &config).await?;
    session.close().await?;
    Ok(())
}
