use crate::coverage::{CoverageError, CoverageOracle, PathDiscovery};
use crate::seed_store::bincode_config;
use bincode::{Decode, Encode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Where the instrumented target writes its per-execution edge hit counts.
pub trait TraceSource: Send {
    /// Copies the current trace into `buf`, zero-filling anything the source lacks.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn clear(&mut self) -> io::Result<()>;
}

/// In-process trace buffer, for harnesses that link the target.
#[derive(Debug, Clone, Default)]
pub struct SharedTrace(Arc<Mutex<Vec<u8>>>);

impl SharedTrace {
    pub fn new(map_size: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; map_size])))
    }

    /// Bumps the hit count of `edge`.
    pub fn hit(&self, edge: usize) {
        if let Ok(mut map) = self.0.lock() {
            let len = map.len();
            if len > 0 {
                let slot = &mut map[edge % len];
                *slot = slot.wrapping_add(1);
            }
        }
    }
}

impl TraceSource for SharedTrace {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let map = self
            .0
            .lock()
            .map_err(|_| io::Error::other("trace buffer lock poisoned"))?;
        let n = map.len().min(buf.len());
        buf[..n].copy_from_slice(&map[..n]);
        buf[n..].fill(0);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        let mut map = self
            .0
            .lock()
            .map_err(|_| io::Error::other("trace buffer lock poisoned"))?;
        map.fill(0);
        Ok(())
    }
}

/// Trace map exposed as a file, typically under `/dev/shm`.
#[derive(Debug, Clone)]
pub struct FileTrace {
    path: PathBuf,
    map_size: usize,
}

impl FileTrace {
    pub fn new(path: impl Into<PathBuf>, map_size: usize) -> Self {
        Self {
            path: path.into(),
            map_size,
        }
    }
}

impl TraceSource for FileTrace {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let map = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let n = map.len().min(buf.len());
        buf[..n].copy_from_slice(&map[..n]);
        buf[n..].fill(0);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        fs::write(&self.path, vec![0u8; self.map_size])
    }
}

const fn build_count_class() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match i {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

static COUNT_CLASS: [u8; 256] = build_count_class();

/// Buckets raw hit counts so loop-count jitter does not register as new behavior.
pub fn classify_counts(trace: &mut [u8]) {
    for byte in trace.iter_mut() {
        *byte = COUNT_CLASS[*byte as usize];
    }
}

/// Compares a classified trace against a virgin map and clears the seen bits.
/// Returns 2 for a never-hit edge, 1 for new hit counts only, 0 otherwise.
pub fn has_new_bits(virgin: &mut [u8], trace: &[u8]) -> u8 {
    let mut result = 0u8;
    for (v, t) in virgin.iter_mut().zip(trace.iter()) {
        if *t != 0 && (*t & *v) != 0 {
            result = result.max(if *v == 0xff { 2 } else { 1 });
            *v &= !*t;
        }
    }
    result
}

#[derive(Debug, Encode, Decode)]
struct CheckpointRecord {
    version: u32,
    iteration: u64,
    virgin: Vec<u8>,
}

/// AFL-style coverage oracle over a shared hit-count map.
pub struct BitmapCoverage {
    source: Box<dyn TraceSource>,
    trace: Vec<u8>,
    virgin: Vec<u8>,
    session_virgin: Vec<u8>,
    checkpoint: Option<(u64, Vec<u8>)>,
}

impl BitmapCoverage {
    pub fn new(source: Box<dyn TraceSource>, map_size: usize) -> Self {
        Self {
            source,
            trace: vec![0; map_size],
            virgin: vec![0xff; map_size],
            session_virgin: vec![0xff; map_size],
            checkpoint: None,
        }
    }

    pub fn map_size(&self) -> usize {
        self.virgin.len()
    }

    pub fn checkpoint_iteration(&self) -> Option<u64> {
        self.checkpoint.as_ref().map(|(iteration, _)| *iteration)
    }

    fn sample(&mut self) -> Result<(), CoverageError> {
        self.source.read_into(&mut self.trace)?;
        classify_counts(&mut self.trace);
        Ok(())
    }
}

impl CoverageOracle for BitmapCoverage {
    fn clear_trace(&mut self) -> Result<(), CoverageError> {
        self.source.clear()?;
        Ok(())
    }

    fn begin_session(&mut self) -> Result<(), CoverageError> {
        self.session_virgin.fill(0xff);
        Ok(())
    }

    fn is_target_quiescent(&mut self) -> Result<bool, CoverageError> {
        self.sample()?;
        Ok(has_new_bits(&mut self.session_virgin, &self.trace) == 0)
    }

    fn new_path(&mut self) -> Result<PathDiscovery, CoverageError> {
        self.sample()?;
        Ok(match has_new_bits(&mut self.virgin, &self.trace) {
            0 => PathDiscovery::None,
            1 => PathDiscovery::Path,
            _ => PathDiscovery::PathAndBranch,
        })
    }

    fn branch_count(&self) -> u64 {
        let unseen: u64 = self.virgin.iter().map(|b| b.count_ones() as u64).sum();
        self.virgin.len() as u64 * 8 - unseen
    }

    fn checkpoint(&mut self, next_iteration: u64) -> Result<(), CoverageError> {
        debug!(next_iteration, "coverage checkpoint");
        self.checkpoint = Some((next_iteration, self.virgin.clone()));
        Ok(())
    }

    fn save_checkpoint(&self, path: &Path) -> Result<(), CoverageError> {
        let (iteration, virgin) = self
            .checkpoint
            .as_ref()
            .ok_or_else(|| CoverageError::Checkpoint("no checkpoint has been taken".into()))?;
        let record = CheckpointRecord {
            version: CHECKPOINT_FORMAT_VERSION,
            iteration: *iteration,
            virgin: virgin.clone(),
        };
        let bytes = bincode::encode_to_vec(&record, bincode_config())
            .map_err(|e| CoverageError::Checkpoint(e.to_string()))?;
        fs::write(path, bytes)?;
        Ok(())
    }

    fn load_checkpoint(&mut self, path: &Path) -> Result<Option<u64>, CoverageError> {
        let bytes = fs::read(path)?;
        let (record, _): (CheckpointRecord, usize) =
            bincode::decode_from_slice(&bytes, bincode_config())
                .map_err(|e| CoverageError::Checkpoint(e.to_string()))?;
        if record.version != CHECKPOINT_FORMAT_VERSION {
            return Err(CoverageError::Checkpoint(format!(
                "unsupported checkpoint version {}",
                record.version
            )));
        }
        if record.virgin.len() != self.virgin.len() {
            return Err(CoverageError::Checkpoint(format!(
                "checkpoint map has {} bytes, oracle expects {}",
                record.virgin.len(),
                self.virgin.len()
            )));
        }
        info!(iteration = record.iteration, path = ?path, "restored coverage checkpoint");
        self.virgin.copy_from_slice(&record.virgin);
        self.checkpoint = Some((record.iteration, record.virgin));
        Ok(Some(record.iteration))
    }
}
