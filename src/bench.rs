//! Throughput and latency loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::connect::Connect;
use crate::errors::SessionError;
use crate::fixture::{block_with_tag, fill_block, BLOCK_SIZE, UNIQUE_TAG_BASE};
use crate::rng::Lrand48;
use crate::session::Session;

/// Content of the duplicate writes in the IOPS loop.
pub const IOPS_DEDUP_TAG: u64 = 0xfefe_fefe_fefe_fefe;

#[derive(Debug, Clone)]
pub struct IopsConfig {
    /// Share of writes, in percent, that carry the shared dedup block.
    pub dedup_percent: f64,
    /// Write blocks; otherwise read them.
    pub writes: bool,
    pub report_interval: Duration,
    /// Stop after this many operations; `None` runs until stopped.
    pub max_operations: Option<u64>,
}

impl Default for IopsConfig {
    fn default() -> Self {
        Self {
            dedup_percent: 7.0,
            writes: true,
            report_interval: Duration::from_secs(2),
            max_operations: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IopsReport {
    pub operations: u64,
    pub elapsed: Duration,
}

impl IopsReport {
    pub fn per_second(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.operations as f64 / self.elapsed.as_secs_f64()
    }
}

#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Zero-length writes; otherwise zero-length reads.
    pub writes: bool,
    pub window: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            writes: true,
            window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReport {
    pub round_trips: u64,
    pub elapsed: Duration,
}

impl LatencyReport {
    /// Mean round-trip time in milliseconds.
    pub fn mean_ms(&self) -> f64 {
        if self.round_trips == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1000.0 / self.round_trips as f64
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("device of {0} bytes holds no complete block")]
    DeviceTooSmall(u64),
}

/// One block-sized operation at a random block per iteration until `stop`
/// is set or `max_operations` is reached.
///
/// `stop` is only checked between operations, so an interrupted run never
/// leaves a command half sent.
pub async fn run_iops<C>(
    session: &mut Session<C>,
    rng: &mut Lrand48,
    config: &IopsConfig,
    stop: &AtomicBool,
) -> Result<IopsReport, BenchError>
where
    C: Connect,
{
    let n_blocks = session.size() / BLOCK_SIZE as u64;
    if n_blocks == 0 {
        return Err(BenchError::DeviceTooSmall(session.size()));
    }
    let dedup_probability = (config.dedup_percent / 100.0).clamp(0.0, 1.0);

    let dedup_block = block_with_tag(IOPS_DEDUP_TAG);
    let mut block = vec![0u8; BLOCK_SIZE];

    let start = Instant::now();
    let mut last_report = start;
    let mut operations: u64 = 0;

    while !stop.load(Ordering::Relaxed) && config.max_operations.map_or(true, |max| operations < max)
    {
        let offset = rng.block_index(n_blocks) * BLOCK_SIZE as u64;

        if config.writes {
            if rng.gen_bool(dedup_probability) {
                session.write(offset, &dedup_block).await?;
            } else {
                fill_block(&mut block, UNIQUE_TAG_BASE ^ operations);
                session.write(offset, &block).await?;
            }
        } else {
            session.read(offset, &mut block).await?;
        }
        operations += 1;

        if last_report.elapsed() >= config.report_interval {
            last_report = Instant::now();
            let report = IopsReport {
                operations,
                elapsed: start.elapsed(),
            };
            info!(operations, "IOPs: {:.0}", report.per_second());
        }
    }

    Ok(IopsReport {
        operations,
        elapsed: start.elapsed(),
    })
}

/// Zero-length round trips back to back for `config.window`.
pub async fn run_latency<C>(
    session: &mut Session<C>,
    config: &LatencyConfig,
) -> Result<LatencyReport, SessionError>
where
    C: Connect,
{
    let start = Instant::now();
    let mut round_trips: u64 = 0;

    loop {
        if config.writes {
            session.write(0, &[]).await?;
        } else {
            session.read(0, &mut []).await?;
        }
        round_trips += 1;

        if start.elapsed() >= config.window {
            break;
        }
    }

    let report = LatencyReport {
        round_trips,
        elapsed: start.elapsed(),
    };
    info!(round_trips, "average latency: {:.3} ms", report.mean_ms());
    Ok(report)
}
