use crate::data_model::{DataModel, SEED_FORMAT_VERSION, SeedRecord};
use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the ordered seed index inside a store or fault directory.
pub const INDEX_FILENAME: &str = "seed_index.json";

/// Version of the JSON index layout.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Errors raised by seed persistence.
///
/// Persistence is a durability boundary, so every failure is surfaced to the caller
/// rather than logged and skipped.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error while reading or writing seed files or the index.
    #[error("Seed store I/O error: {0}")]
    Io(String),

    /// A seed or the index could not be encoded.
    #[error("Seed store serialization error: {0}")]
    Serialization(String),

    /// A seed or the index could not be decoded.
    #[error("Seed store deserialization error: {0}")]
    Deserialization(String),

    /// A persisted file was written by an incompatible format version.
    #[error("Unsupported format version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    /// The index references a seed that is not in the store.
    #[error("Seed {0} not found in store")]
    MissingSeed(u64),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Deserialization(format!("JSON operation error: {}", err))
    }
}
impl From<EncodeError> for StoreError {
    fn from(err: EncodeError) -> Self {
        StoreError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        StoreError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// Bincode settings shared by every on-disk record of this crate.
pub(crate) fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Persistence port for the valuable-seed ring.
///
/// Seeds are addressed by the monotonically increasing index the scheduler assigns
/// when a seed first enters the ring. The index list records ring order so the ring
/// can be rebuilt exactly on resume.
pub trait SeedStore: Send {
    /// Persists a seed under `index`, replacing any previous seed with that index.
    fn save_seed(&mut self, index: u64, model: &DataModel) -> Result<(), StoreError>;

    /// Loads the seed stored under `index`.
    ///
    /// # Errors
    /// [`StoreError::MissingSeed`] when nothing is stored under `index`.
    fn load_seed(&self, index: u64) -> Result<DataModel, StoreError>;

    /// Persists the ordered index list.
    fn save_index(&mut self, indices: &[u64]) -> Result<(), StoreError>;

    /// Loads the ordered index list. An empty store yields an empty list.
    fn load_index(&self) -> Result<Vec<u64>, StoreError>;
}

#[derive(Serialize, Deserialize, Debug)]
struct IndexFile {
    version: u32,
    indices: Vec<u64>,
}

/// A directory of individually numbered seed files plus a JSON index.
///
/// Each seed is a bincode-encoded [`SeedRecord`] named `<index>.seed`, zero-padded so
/// directory listings sort in index order.
pub struct DirSeedStore {
    dir: PathBuf,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl DirSeedStore {
    const SEED_FILE_EXTENSION: &'static str = "seed";

    /// Opens the store at `dir`, creating the directory when it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                StoreError::Io(format!("Failed to create seed directory at {:?}: {}", dir, e))
            })?;
        } else if !dir.is_dir() {
            return Err(StoreError::Io(format!(
                "Seed path {:?} exists but is not a directory",
                dir
            )));
        }
        Ok(Self {
            dir,
            bincode_config: bincode_config(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the seed file for `index`, e.g. `00000042.seed`.
    pub fn seed_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{:08}", index))
            .with_extension(Self::SEED_FILE_EXTENSION)
    }

    /// Writes an index list to an arbitrary file, e.g. inside a fault directory.
    pub fn write_index_file(path: &Path, indices: &[u64]) -> Result<(), StoreError> {
        let file = File::create(path).map_err(|e| {
            StoreError::Io(format!("Failed to create index file {:?}: {}", path, e))
        })?;
        let writer = BufWriter::new(file);
        let index = IndexFile {
            version: INDEX_FORMAT_VERSION,
            indices: indices.to_vec(),
        };
        serde_json::to_writer_pretty(writer, &index).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize index to {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Reads an index list written by [`DirSeedStore::write_index_file`]. A missing or
    /// empty file is an empty list.
    pub fn read_index_file(path: &Path) -> Result<Vec<u64>, StoreError> {
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .map_err(|e| StoreError::Io(format!("Failed to open index file {:?}: {}", path, e)))?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        let index: IndexFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            StoreError::Deserialization(format!(
                "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                path, e
            ))
        })?;
        if index.version != INDEX_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                found: index.version,
                expected: INDEX_FORMAT_VERSION,
            });
        }
        Ok(index.indices)
    }
}

impl SeedStore for DirSeedStore {
    fn save_seed(&mut self, index: u64, model: &DataModel) -> Result<(), StoreError> {
        let bytes = bincode::encode_to_vec(model.to_record(), self.bincode_config)?;
        let path = self.seed_path(index);
        fs::write(&path, bytes)
            .map_err(|e| StoreError::Io(format!("Failed to write seed file {:?}: {}", path, e)))?;
        Ok(())
    }

    fn load_seed(&self, index: u64) -> Result<DataModel, StoreError> {
        let path = self.seed_path(index);
        if !path.is_file() {
            return Err(StoreError::MissingSeed(index));
        }
        let content = fs::read(&path)
            .map_err(|e| StoreError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
        let (record, _length): (SeedRecord, usize) =
            bincode::decode_from_slice(&content, self.bincode_config).map_err(|e| {
                StoreError::Deserialization(format!(
                    "Bincode deserialization failed for seed file {:?}: {}",
                    path, e
                ))
            })?;
        if record.version != SEED_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                found: record.version,
                expected: SEED_FORMAT_VERSION,
            });
        }
        DataModel::from_record(record).map_err(|e| {
            StoreError::Deserialization(format!("Seed file {:?} is corrupt: {}", path, e))
        })
    }

    fn save_index(&mut self, indices: &[u64]) -> Result<(), StoreError> {
        Self::write_index_file(&self.dir.join(INDEX_FILENAME), indices)
    }

    fn load_index(&self) -> Result<Vec<u64>, StoreError> {
        Self::read_index_file(&self.dir.join(INDEX_FILENAME))
    }
}

/// Volatile store for feedback-disabled runs and tests.
#[derive(Debug, Default)]
pub struct MemorySeedStore {
    seeds: HashMap<u64, SeedRecord>,
    index: Vec<u64>,
}

impl MemorySeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

impl SeedStore for MemorySeedStore {
    fn save_seed(&mut self, index: u64, model: &DataModel) -> Result<(), StoreError> {
        self.seeds.insert(index, model.to_record());
        Ok(())
    }

    fn load_seed(&self, index: u64) -> Result<DataModel, StoreError> {
        let record = self
            .seeds
            .get(&index)
            .cloned()
            .ok_or(StoreError::MissingSeed(index))?;
        DataModel::from_record(record).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn save_index(&mut self, indices: &[u64]) -> Result<(), StoreError> {
        self.index = indices.to_vec();
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self.index.clone())
    }
}
