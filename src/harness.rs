//! Conformance scenarios run against one long-lived session.
//!
//! The scenarios run in a fixed order and the first failure aborts the run.
//! When reconnects are enabled, every scenario that writes reconnects between
//! its writes and its reads, so data has to survive the server dropping the
//! connection.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connect::Connect;
use crate::errors::SessionError;
use crate::fixture::{
    block_with_tag, generate_batch, FixtureEntry, TagScheme, BLOCK_SIZE, DEDUP_TAG, OVERWRITE_TAG,
    UNIQUE_TAG_BASE,
};
use crate::flags::TransmissionFlags;
use crate::rng::Lrand48;
use crate::session::{Session, SessionConfig, MAX_DISCARD_CHUNK};

/// Blocks read by the empty-device check.
pub const PREFLIGHT_BLOCKS: usize = 256;

/// First of the two blocks used by the sub-block write scenario.
const SUB_BLOCK_INDEX: u64 = 9;

/// Smallest device that has blocks on both sides of the 2^32 byte offset.
pub const MIN_VERIFY_SIZE: u64 = (1 << 32) + 2 * BLOCK_SIZE as u64;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Blocks per random and dedup fill.
    pub batch_size: usize,
    /// Flush after this many writes of a fill; 0 disables flushing.
    pub flush_every: usize,
    /// Reconnect between the writes and the reads of each scenario.
    pub reconnect: bool,
    /// Pause between closing and reopening on reconnect.
    pub settle_delay: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 2501,
            flush_every: 7,
            reconnect: true,
            settle_delay: Duration::from_millis(1100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    BoundaryOffsets,
    RandomFill,
    DedupFill,
    SharedOverwrite,
    SubBlockWrite,
    Discard,
    ZeroLength,
    NegativeOffset,
    PastEnd,
}

impl Scenario {
    pub const ALL: [Scenario; 9] = [
        Self::BoundaryOffsets,
        Self::RandomFill,
        Self::DedupFill,
        Self::SharedOverwrite,
        Self::SubBlockWrite,
        Self::Discard,
        Self::ZeroLength,
        Self::NegativeOffset,
        Self::PastEnd,
    ];

    pub fn number(&self) -> usize {
        match self {
            Self::BoundaryOffsets => 1,
            Self::RandomFill => 2,
            Self::DedupFill => 3,
            Self::SharedOverwrite => 4,
            Self::SubBlockWrite => 5,
            Self::Discard => 6,
            Self::ZeroLength => 7,
            Self::NegativeOffset => 8,
            Self::PastEnd => 9,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::BoundaryOffsets => "write and verify blocks around the 2^31 and 2^32 offsets",
            Self::RandomFill => "fill random blocks with distinct content",
            Self::DedupFill => "fill random blocks with identical content",
            Self::SharedOverwrite => "overwrite the random fill with identical content",
            Self::SubBlockWrite => "4 byte write straddling two blocks",
            Self::Discard => "discard the whole device",
            Self::ZeroLength => "zero-length read and write",
            Self::NegativeOffset => "write at a negative offset is rejected",
            Self::PastEnd => "write past the end of the device is rejected",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TEST{:04} ({})", self.number(), self.description())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Skipped(&'static str),
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub scenarios: Vec<ScenarioReport>,
    /// Write rate of the dedup fill in blocks per second.
    pub dedup_blocks_per_second: Option<f64>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("device size {size} is not a multiple of 4096")]
    NotBlockAligned { size: u64 },

    #[error("device too small ({size} bytes), at least {required} bytes are needed")]
    DeviceTooSmall { size: u64, required: u64 },

    #[error("device is read-only")]
    ReadOnly,

    #[error(
        "data mismatch in block {index}: byte {position} is {found:02x}, expected {expected:02x}"
    )]
    Mismatch {
        index: u64,
        position: usize,
        expected: u8,
        found: u8,
    },

    #[error("server accepted {what}")]
    NotRejected { what: &'static str },

    #[error("device contains data (first non-zero byte at offset {offset})")]
    DeviceHasData { offset: u64 },
}

/// A run that stopped early, with the scenarios that passed before it.
#[derive(Debug, Error)]
#[error("{} failed: {error}", stage(.scenario))]
pub struct VerifyFailure {
    /// `None` when every scenario passed but the final close failed.
    pub scenario: Option<Scenario>,
    pub completed: Vec<ScenarioReport>,
    #[source]
    pub error: VerifyError,
}

fn stage(scenario: &Option<Scenario>) -> String {
    match scenario {
        Some(scenario) => scenario.to_string(),
        None => "closing the session".to_string(),
    }
}

/// Runs the scenarios against one session.
pub struct Verifier<C>
where
    C: Connect,
{
    session: Session<C>,
    config: VerifyConfig,
    rng: Lrand48,
    n_blocks: u64,
    random_batch: Vec<FixtureEntry>,
    /// Blocks expected to read back as zero after the discard.
    written_blocks: Vec<u64>,
    dedup_rate: Option<f64>,
}

impl<C> fmt::Debug for Verifier<C>
where
    C: Connect,
    Session<C>: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("session", &self.session)
            .field("config", &self.config)
            .field("rng", &self.rng)
            .field("n_blocks", &self.n_blocks)
            .field("random_batch", &self.random_batch)
            .field("written_blocks", &self.written_blocks)
            .field("dedup_rate", &self.dedup_rate)
            .finish()
    }
}

impl<C> Verifier<C>
where
    C: Connect,
{
    pub fn new(session: Session<C>, config: VerifyConfig) -> Result<Self, VerifyError> {
        Self::with_rng(session, config, Lrand48::default())
    }

    /// Checks the device geometry; `rng` drives block selection.
    pub fn with_rng(
        session: Session<C>,
        config: VerifyConfig,
        rng: Lrand48,
    ) -> Result<Self, VerifyError> {
        let size = session.size();
        if size % BLOCK_SIZE as u64 != 0 {
            return Err(VerifyError::NotBlockAligned { size });
        }
        if size < MIN_VERIFY_SIZE {
            return Err(VerifyError::DeviceTooSmall {
                size,
                required: MIN_VERIFY_SIZE,
            });
        }
        if session.flags().contains(TransmissionFlags::READ_ONLY) {
            return Err(VerifyError::ReadOnly);
        }

        Ok(Self {
            session,
            config,
            rng,
            n_blocks: size / BLOCK_SIZE as u64,
            random_batch: Vec::new(),
            written_blocks: Vec::new(),
            dedup_rate: None,
        })
    }

    /// Runs every scenario in order, then closes the session.
    pub async fn run(mut self) -> Result<VerifyReport, VerifyFailure> {
        let mut completed = Vec::with_capacity(Scenario::ALL.len());

        for scenario in Scenario::ALL {
            info!("* {scenario}");
            let start = Instant::now();

            match self.run_scenario(scenario).await {
                Ok(outcome) => {
                    let elapsed = start.elapsed();
                    match &outcome {
                        Outcome::Passed => info!(?elapsed, "{scenario}: ok"),
                        Outcome::Skipped(reason) => warn!("{scenario}: skipped, {reason}"),
                    }
                    completed.push(ScenarioReport {
                        scenario,
                        outcome,
                        elapsed,
                    });
                }
                Err(error) => {
                    error!(%error, "{scenario}: FAILED");
                    return Err(VerifyFailure {
                        scenario: Some(scenario),
                        completed,
                        error,
                    });
                }
            }
        }

        let dedup_blocks_per_second = self.dedup_rate;
        if let Err(e) = self.session.close().await {
            return Err(VerifyFailure {
                scenario: None,
                completed,
                error: e.into(),
            });
        }

        Ok(VerifyReport {
            scenarios: completed,
            dedup_blocks_per_second,
        })
    }

    pub async fn run_scenario(&mut self, scenario: Scenario) -> Result<Outcome, VerifyError> {
        match scenario {
            Scenario::BoundaryOffsets => self.boundary_offsets().await,
            Scenario::RandomFill => self.random_fill().await,
            Scenario::DedupFill => self.dedup_fill().await,
            Scenario::SharedOverwrite => self.shared_overwrite().await,
            Scenario::SubBlockWrite => self.sub_block_write().await,
            Scenario::Discard => self.discard().await,
            Scenario::ZeroLength => self.zero_length().await,
            Scenario::NegativeOffset => self.negative_offset().await,
            Scenario::PastEnd => self.past_end().await,
        }
    }

    async fn maybe_reconnect(&mut self) -> Result<(), VerifyError> {
        if self.config.reconnect {
            self.session.reconnect(self.config.settle_delay).await?;
        }
        Ok(())
    }

    async fn boundary_offsets(&mut self) -> Result<Outcome, VerifyError> {
        let block = BLOCK_SIZE as u64;
        let indices = [
            0,
            1,
            (1 << 31) / block - 1,
            (1 << 31) / block,
            (1 << 32) / block - 1,
            (1 << 32) / block,
            self.n_blocks - 1,
        ];
        let entries: Vec<FixtureEntry> = indices
            .iter()
            .map(|&index| FixtureEntry::new(index, TagScheme::PerBlock.tag_for(index)))
            .collect();

        for entry in &entries {
            self.session.write(entry.offset(), &entry.content).await?;
        }
        self.maybe_reconnect().await?;
        for entry in &entries {
            verify_block(&mut self.session, entry.offset(), &entry.content, entry.index).await?;
        }

        self.written_blocks.extend(indices);
        Ok(Outcome::Passed)
    }

    async fn random_fill(&mut self) -> Result<Outcome, VerifyError> {
        let batch = generate_batch(
            &mut self.rng,
            self.config.batch_size,
            self.n_blocks,
            TagScheme::PerBlock,
        );

        write_batch(&mut self.session, &batch, self.config.flush_every).await?;
        self.maybe_reconnect().await?;
        verify_batch(&mut self.session, &batch).await?;

        self.written_blocks.extend(batch.iter().map(|entry| entry.index));
        self.random_batch = batch;
        Ok(Outcome::Passed)
    }

    async fn dedup_fill(&mut self) -> Result<Outcome, VerifyError> {
        let batch = generate_batch(
            &mut self.rng,
            self.config.batch_size,
            self.n_blocks,
            TagScheme::Shared(DEDUP_TAG),
        );

        let start = Instant::now();
        write_batch(&mut self.session, &batch, self.config.flush_every).await?;
        let elapsed = start.elapsed();

        if !elapsed.is_zero() {
            let rate = batch.len() as f64 / elapsed.as_secs_f64();
            info!(blocks = batch.len(), ?elapsed, "dedup write rate {rate:.1} blocks/s");
            self.dedup_rate = Some(rate);
        }

        self.maybe_reconnect().await?;
        verify_batch(&mut self.session, &batch).await?;

        self.written_blocks.extend(batch.iter().map(|entry| entry.index));
        Ok(Outcome::Passed)
    }

    async fn shared_overwrite(&mut self) -> Result<Outcome, VerifyError> {
        let overwrite = block_with_tag(OVERWRITE_TAG);
        for entry in self.random_batch.iter_mut() {
            entry.content.copy_from_slice(&overwrite);
        }

        write_batch(&mut self.session, &self.random_batch, self.config.flush_every).await?;
        self.maybe_reconnect().await?;
        verify_batch(&mut self.session, &self.random_batch).await?;
        Ok(Outcome::Passed)
    }

    async fn sub_block_write(&mut self) -> Result<Outcome, VerifyError> {
        let offset = SUB_BLOCK_INDEX * BLOCK_SIZE as u64;
        let mut expected = vec![0x12u8; 2 * BLOCK_SIZE];
        self.session.write(offset, &expected).await?;

        let patch = [0xa9u8; 4];
        let patch_at = BLOCK_SIZE - patch.len() / 2;
        expected[patch_at..patch_at + patch.len()].copy_from_slice(&patch);
        self.session.write(offset + patch_at as u64, &patch).await?;

        self.maybe_reconnect().await?;
        verify_block(&mut self.session, offset, &expected, SUB_BLOCK_INDEX).await?;

        self.written_blocks
            .extend([SUB_BLOCK_INDEX, SUB_BLOCK_INDEX + 1]);
        Ok(Outcome::Passed)
    }

    async fn discard(&mut self) -> Result<Outcome, VerifyError> {
        if !self.session.flags().contains(TransmissionFlags::SEND_TRIM) {
            return Ok(Outcome::Skipped("server does not support discard"));
        }

        let size = self.session.size();
        let mut offset = 0;
        while offset < size {
            let length = (size - offset).min(MAX_DISCARD_CHUNK as u64) as u32;
            debug!(offset, length, "discarding");
            self.session.discard(offset, length).await?;
            offset += length as u64;
        }

        self.maybe_reconnect().await?;

        let zeroes = vec![0u8; BLOCK_SIZE];
        for &index in &self.written_blocks {
            verify_block(&mut self.session, index * BLOCK_SIZE as u64, &zeroes, index).await?;
        }
        Ok(Outcome::Passed)
    }

    async fn zero_length(&mut self) -> Result<Outcome, VerifyError> {
        self.session.read(0, &mut []).await?;
        self.session.write(0, &[]).await?;
        Ok(Outcome::Passed)
    }

    async fn negative_offset(&mut self) -> Result<Outcome, VerifyError> {
        let offset = 0u64.wrapping_sub(BLOCK_SIZE as u64 / 2);
        expect_rejection(&mut self.session, offset, "a write at a negative offset").await?;
        self.maybe_reconnect().await?;
        Ok(Outcome::Passed)
    }

    async fn past_end(&mut self) -> Result<Outcome, VerifyError> {
        let offset = self.session.size() - BLOCK_SIZE as u64 / 2;
        expect_rejection(&mut self.session, offset, "a write past the end of the device").await?;
        self.maybe_reconnect().await?;
        Ok(Outcome::Passed)
    }
}

async fn write_batch<C>(
    session: &mut Session<C>,
    batch: &[FixtureEntry],
    flush_every: usize,
) -> Result<(), VerifyError>
where
    C: Connect,
{
    // Servers that do not advertise flush may reject it
    let can_flush = flush_every > 0 && session.flags().contains(TransmissionFlags::SEND_FLUSH);

    for (written, entry) in batch.iter().enumerate() {
        session.write(entry.offset(), &entry.content).await?;
        if can_flush && (written + 1) % flush_every == 0 {
            session.flush().await?;
        }
    }
    Ok(())
}

async fn verify_batch<C>(session: &mut Session<C>, batch: &[FixtureEntry]) -> Result<(), VerifyError>
where
    C: Connect,
{
    for entry in batch {
        verify_block(session, entry.offset(), &entry.content, entry.index).await?;
    }
    Ok(())
}

/// Reads `expected.len()` bytes at `offset` and compares them byte for byte.
async fn verify_block<C>(
    session: &mut Session<C>,
    offset: u64,
    expected: &[u8],
    index: u64,
) -> Result<(), VerifyError>
where
    C: Connect,
{
    let mut actual = vec![0u8; expected.len()];
    session.read(offset, &mut actual).await?;

    match actual.iter().zip(expected).position(|(a, e)| a != e) {
        Some(position) => Err(VerifyError::Mismatch {
            index,
            position,
            expected: expected[position],
            found: actual[position],
        }),
        None => Ok(()),
    }
}

/// Sends one block at `offset` and requires a non-zero status back.
async fn expect_rejection<C>(
    session: &mut Session<C>,
    offset: u64,
    what: &'static str,
) -> Result<(), VerifyError>
where
    C: Connect,
{
    let block = block_with_tag(UNIQUE_TAG_BASE);
    match session.write(offset, &block).await {
        Ok(()) => Err(VerifyError::NotRejected { what }),
        Err(e) if e.is_rejection() => {
            debug!(status = ?e.status(), offset, "rejected as expected");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Opens a session, reads the first [`PREFLIGHT_BLOCKS`] blocks and fails if
/// any byte is non-zero.
pub async fn ensure_device_empty<C>(connector: C, config: SessionConfig) -> Result<(), VerifyError>
where
    C: Connect,
{
    let mut session = Session::open(connector, config).await?;

    let required = (PREFLIGHT_BLOCKS * BLOCK_SIZE) as u64;
    if session.size() < required {
        let size = session.size();
        session.close().await?;
        return Err(VerifyError::DeviceTooSmall { size, required });
    }

    let mut data = vec![0u8; PREFLIGHT_BLOCKS * BLOCK_SIZE];
    session.read(0, &mut data).await?;
    session.close().await?;

    match data.iter().position(|&byte| byte != 0) {
        Some(offset) => Err(VerifyError::DeviceHasData {
            offset: offset as u64,
        }),
        None => Ok(()),
    }
}
