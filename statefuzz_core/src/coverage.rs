use crate::config::OracleSettings;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum CoverageError {
    /// The target never reported quiescence within the configured bound.
    #[error("Target did not quiesce within {waited:?}")]
    QuiescenceTimeout { waited: Duration },

    #[error("Coverage checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Coverage I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoverageError {
    fn from(err: std::io::Error) -> Self {
        CoverageError::Io(err.to_string())
    }
}

/// What the oracle saw in the trace of the last output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathDiscovery {
    #[default]
    None,
    /// New hit counts on already-known edges.
    Path,
    /// An edge that was never hit before. Always also a new path.
    PathAndBranch,
}

impl PathDiscovery {
    pub fn is_new_path(self) -> bool {
        !matches!(self, PathDiscovery::None)
    }

    pub fn is_new_branch(self) -> bool {
        matches!(self, PathDiscovery::PathAndBranch)
    }
}

/// External binary-instrumentation oracle shared with the target process.
///
/// `new_path` answers both "new path?" and "new branch?" for the last output.
/// Checkpoints snapshot the oracle's cumulative state so a later session can resume
/// from the recorded iteration.
pub trait CoverageOracle: Send {
    /// Resets the per-execution trace before an output is sent.
    fn clear_trace(&mut self) -> Result<(), CoverageError> {
        Ok(())
    }

    /// Starts a quiescence-detection session for the output just sent.
    fn begin_session(&mut self) -> Result<(), CoverageError> {
        Ok(())
    }

    /// `true` once the target stopped producing new trace data.
    fn is_target_quiescent(&mut self) -> Result<bool, CoverageError>;

    fn new_path(&mut self) -> Result<PathDiscovery, CoverageError>;

    /// Cumulative number of distinct branches seen.
    fn branch_count(&self) -> u64;

    fn checkpoint(&mut self, next_iteration: u64) -> Result<(), CoverageError>;

    fn save_checkpoint(&self, _path: &Path) -> Result<(), CoverageError> {
        Ok(())
    }

    /// Restores a checkpoint written by `save_checkpoint` and returns its iteration.
    fn load_checkpoint(&mut self, _path: &Path) -> Result<Option<u64>, CoverageError> {
        Ok(None)
    }
}

/// Oracle for runs without instrumentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCoverage;

impl CoverageOracle for NullCoverage {
    fn is_target_quiescent(&mut self) -> Result<bool, CoverageError> {
        Ok(true)
    }

    fn new_path(&mut self) -> Result<PathDiscovery, CoverageError> {
        Ok(PathDiscovery::None)
    }

    fn branch_count(&self) -> u64 {
        0
    }

    fn checkpoint(&mut self, _next_iteration: u64) -> Result<(), CoverageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiescenceSettings {
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl QuiescenceSettings {
    /// No settling and no sleeping between polls.
    pub fn immediate(timeout: Duration) -> Self {
        Self {
            settle_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            timeout,
        }
    }
}

impl Default for QuiescenceSettings {
    fn default() -> Self {
        Self::from(&OracleSettings::default())
    }
}

impl From<&OracleSettings> for QuiescenceSettings {
    fn from(settings: &OracleSettings) -> Self {
        Self {
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            timeout: Duration::from_millis(settings.quiescence_timeout_ms),
        }
    }
}

/// Sleeps the settle delay, then polls the oracle until the target is quiescent.
/// Returns the number of polls taken.
pub fn wait_for_quiescence(
    oracle: &mut dyn CoverageOracle,
    settings: &QuiescenceSettings,
) -> Result<u32, CoverageError> {
    if !settings.settle_delay.is_zero() {
        std::thread::sleep(settings.settle_delay);
    }
    oracle.begin_session()?;
    let started = Instant::now();
    let mut polls = 0u32;
    loop {
        polls += 1;
        if oracle.is_target_quiescent()? {
            trace!(polls, "target quiescent");
            return Ok(polls);
        }
        let waited = started.elapsed();
        if waited >= settings.timeout {
            return Err(CoverageError::QuiescenceTimeout { waited });
        }
        if !settings.poll_interval.is_zero() {
            std::thread::sleep(settings.poll_interval);
        }
    }
}
