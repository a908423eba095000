use crate::config::FeedbackSettings;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const PATH_LOG_HEADER: &str = "Date,Amount";
pub const BRANCH_LOG_HEADER: &str = "Date,Amount";
pub const QUEUE_LOG_HEADER: &str = "Iteration,From last iteration,From seed pool,Seed pool size";

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Append-only CSV file. The header is written when the file is created.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: Option<PathBuf>,
    header: &'static str,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>, header: &'static str) -> Self {
        Self {
            path: Some(path.into()),
            header,
        }
    }

    pub fn disabled(header: &'static str) -> Self {
        Self { path: None, header }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Removes the file so the next append starts a fresh log.
    pub fn reset(&self) -> io::Result<()> {
        match &self.path {
            Some(path) if path.exists() => fs::remove_file(path),
            _ => Ok(()),
        }
    }

    pub fn append(&self, fields: &[String]) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            writeln!(file, "{}", self.header)?;
        }
        writeln!(file, "{}", fields.join(","))
    }
}

/// Observability side-channel of the corpus scheduler. Write failures are logged and
/// never interrupt fuzzing.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    paths: CsvLog,
    branches: CsvLog,
    queue: CsvLog,
}

impl Default for MetricsLog {
    fn default() -> Self {
        Self::disabled()
    }
}

impl MetricsLog {
    pub fn new(path_log: PathBuf, branch_log: PathBuf, queue_log: PathBuf) -> Self {
        Self {
            paths: CsvLog::new(path_log, PATH_LOG_HEADER),
            branches: CsvLog::new(branch_log, BRANCH_LOG_HEADER),
            queue: CsvLog::new(queue_log, QUEUE_LOG_HEADER),
        }
    }

    pub fn from_settings(settings: &FeedbackSettings) -> Self {
        Self::new(
            settings.path_log.clone(),
            settings.branch_log.clone(),
            settings.queue_log.clone(),
        )
    }

    pub fn disabled() -> Self {
        Self {
            paths: CsvLog::disabled(PATH_LOG_HEADER),
            branches: CsvLog::disabled(BRANCH_LOG_HEADER),
            queue: CsvLog::disabled(QUEUE_LOG_HEADER),
        }
    }

    /// Truncates all three logs; used when a run starts from scratch.
    pub fn reset_all(&self) {
        for log in [&self.paths, &self.branches, &self.queue] {
            if let Err(e) = log.reset() {
                warn!(path = ?log.path(), error = %e, "failed to reset metrics log");
            }
        }
    }

    fn write(log: &CsvLog, fields: &[String]) {
        if let Err(e) = log.append(fields) {
            warn!(path = ?log.path(), error = %e, "failed to append metrics record");
        }
    }

    pub fn record_path(&self, discovered_paths: u64) {
        Self::write(
            &self.paths,
            &[unix_timestamp().to_string(), discovered_paths.to_string()],
        );
    }

    pub fn record_branch(&self, branch_count: u64) {
        Self::write(
            &self.branches,
            &[unix_timestamp().to_string(), branch_count.to_string()],
        );
    }

    pub fn record_queue(&self, iteration: u64, from_queue: usize, from_pool: usize, pool_size: usize) {
        Self::write(
            &self.queue,
            &[
                iteration.to_string(),
                from_queue.to_string(),
                from_pool.to_string(),
                pool_size.to_string(),
            ],
        );
    }
}
