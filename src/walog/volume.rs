use log::debug;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom};

/// Durable-sync strength requested at file-create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Data leaves this process and reaches every replica's OS buffer.
    FlushOnly,
    /// Data persists on every replica's storage medium.
    SyncToDisk,
}

/// The durable-sync primitive the writer settled on after probing the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncChoice {
    /// Strongest available: data persisted on every replica's storage medium.
    SyncToDisk,
    /// Weaker fallback: data on every peer's OS buffer only.
    FlushToPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub replication: u16,
    pub block_size: u64,
    pub sync_mode: SyncMode,
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sink closed")]
    Closed,
}

/// Appendable byte stream backed by a single replicated file. Single-writer;
/// the WAL writer serializes concurrent appenders above this layer.
pub trait BlockSink: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), VolumeError>;
    /// Pushes buffered data to the replica peers.
    fn flush_to_peers(&mut self) -> Result<(), VolumeError>;
    /// Pushes buffered data and persists it on every replica's storage medium.
    fn sync_to_disk(&mut self) -> Result<(), VolumeError>;
    fn supports_sync_to_disk(&self) -> bool;
    fn close(&mut self) -> Result<(), VolumeError>;
}

/// Random positional reads over a finished log file.
pub trait BlockReader: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, VolumeError>;
    fn len(&self) -> Result<u64, VolumeError>;
}

/// Filesystem abstraction the WAL is layered over.
pub trait VolumeManager: Send + Sync {
    fn create(&self, path: &Path, options: &CreateOptions)
        -> Result<Box<dyn BlockSink>, VolumeError>;
    fn open_for_read(&self, path: &Path) -> Result<Box<dyn BlockReader>, VolumeError>;
    /// Replication used when the caller passes `0`.
    fn default_replication(&self, path: &Path) -> u16;
    /// Block size used when the caller passes `0`.
    fn default_block_size(&self) -> u64;
}

/// Volume-selection policy, called once per log-file open.
pub trait VolumeChooser: Send + Sync {
    fn choose(&self, candidates: &[PathBuf]) -> PathBuf;
}

pub struct RandomVolumeChooser;

impl VolumeChooser for RandomVolumeChooser {
    fn choose(&self, candidates: &[PathBuf]) -> PathBuf {
        match candidates.len() {
            0 => PathBuf::new(),
            1 => candidates[0].clone(),
            n => candidates[thread_rng().gen_range(0..n)].clone(),
        }
    }
}

/// Local-filesystem stand-in for the replicating DFS. Replication and block
/// size are accepted and logged but have no local effect; `flush_to_peers`
/// maps to an OS-buffer flush and `sync_to_disk` to `fdatasync`.
pub struct LocalVolumeManager {
    default_replication: u16,
    default_block_size: u64,
}

impl LocalVolumeManager {
    pub fn new() -> Self {
        Self {
            default_replication: 3,
            default_block_size: 64 << 20,
        }
    }

    pub fn with_defaults(default_replication: u16, default_block_size: u64) -> Self {
        Self {
            default_replication,
            default_block_size,
        }
    }
}

impl Default for LocalVolumeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeManager for LocalVolumeManager {
    fn create(
        &self,
        path: &Path,
        options: &CreateOptions,
    ) -> Result<Box<dyn BlockSink>, VolumeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(
            "event=volume_create path={} replication={} block_size={} sync_mode={:?}",
            path.display(),
            options.replication,
            options.block_size,
            options.sync_mode
        );
        Ok(Box::new(LocalBlockSink {
            inner: BufWriter::new(file),
        }))
    }

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn BlockReader>, VolumeError> {
        let file = File::open(path)?;
        Ok(Box::new(LocalBlockReader { file }))
    }

    fn default_replication(&self, _path: &Path) -> u16 {
        self.default_replication
    }

    fn default_block_size(&self) -> u64 {
        self.default_block_size
    }
}

struct LocalBlockSink {
    inner: BufWriter<File>,
}

impl BlockSink for LocalBlockSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), VolumeError> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    fn flush_to_peers(&mut self) -> Result<(), VolumeError> {
        self.inner.flush()?;
        Ok(())
    }

    fn sync_to_disk(&mut self) -> Result<(), VolumeError> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()?;
        Ok(())
    }

    fn supports_sync_to_disk(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), VolumeError> {
        self.inner.flush()?;
        Ok(())
    }
}

struct LocalBlockReader {
    file: File,
}

impl BlockReader for LocalBlockReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, VolumeError> {
        #[cfg(unix)]
        {
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            self.file.seek(SeekFrom::Start(offset))?;
            Ok(self.file.read(buf)?)
        }
    }

    fn len(&self) -> Result<u64, VolumeError> {
        Ok(self.file.metadata()?.len())
    }
}

/// Single underlying sink shared between the append path (through the cipher
/// wrapper) and the sync worker. Once closed, every operation reports
/// `VolumeError::Closed`.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Option<Box<dyn BlockSink>>>>,
}

impl SharedSink {
    pub fn new(sink: Box<dyn BlockSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(sink))),
        }
    }

    pub fn append(&self, bytes: &[u8]) -> Result<(), VolumeError> {
        let mut guard = self.inner.lock();
        guard.as_mut().ok_or(VolumeError::Closed)?.append(bytes)
    }

    pub fn flush_to_peers(&self) -> Result<(), VolumeError> {
        let mut guard = self.inner.lock();
        guard
            .as_mut()
            .ok_or(VolumeError::Closed)?
            .flush_to_peers()
    }

    pub fn sync(&self, choice: SyncChoice) -> Result<(), VolumeError> {
        let mut guard = self.inner.lock();
        let sink = guard.as_mut().ok_or(VolumeError::Closed)?;
        match choice {
            SyncChoice::SyncToDisk => sink.sync_to_disk(),
            SyncChoice::FlushToPeers => sink.flush_to_peers(),
        }
    }

    pub fn supports_sync_to_disk(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map(|sink| sink.supports_sync_to_disk())
            .unwrap_or(false)
    }

    /// Closes the underlying sink exactly once; later calls are no-ops.
    pub fn close(&self) -> Result<(), VolumeError> {
        let mut guard = self.inner.lock();
        match guard.take() {
            Some(mut sink) => sink.close(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}
