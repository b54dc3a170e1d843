use crate::config::{CipherConfig, WalConfig};
use crate::telemetry::{shared_registry, MetricsSnapshot, SharedMetricsRegistry};
use crate::walog::codec::{self, LogKey, LogValue, Mutation, TabletExtent};
use crate::walog::crypto::{CipherRegistry, CipherWriter, CryptoError};
use crate::walog::volume::{
    CreateOptions, SharedSink, SyncChoice, SyncMode, VolumeChooser, VolumeError, VolumeManager,
};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use uuid::Uuid;

pub const LOG_FILE_HEADER_V3: &str = "--- Log File Header (v3) ---";
pub const LOG_FILE_HEADER_V2: &str = "--- Log File Header (v2) ---";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalError {
    #[error("log closed")]
    LogClosed,
    #[error("WAL open failed: {0}")]
    OpenFailed(String),
    #[error("durable sync failed: {0}")]
    Sync(String),
    #[error("append failed: {0}")]
    Append(String),
    #[error("cipher failure: {0}")]
    Crypto(String),
}

impl From<VolumeError> for WalError {
    fn from(err: VolumeError) -> Self {
        match err {
            VolumeError::Closed => WalError::LogClosed,
            other => WalError::Append(other.to_string()),
        }
    }
}

impl From<CryptoError> for WalError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SinkClosed => WalError::LogClosed,
            other => WalError::Crypto(other.to_string()),
        }
    }
}

/// Everything the writer needs from its environment: the filesystem, the
/// volume-selection policy, the candidate WAL directories, and configuration.
pub struct WalResources {
    pub volumes: Arc<dyn VolumeManager>,
    pub chooser: Arc<dyn VolumeChooser>,
    pub wal_dirs: Vec<PathBuf>,
    pub config: WalConfig,
    pub cipher: CipherConfig,
    pub registry: Arc<CipherRegistry>,
}

/// One tablet's mutations for a `log_many` call.
#[derive(Debug, Clone)]
pub struct TabletMutations {
    pub tablet_id: i32,
    pub seq: i64,
    pub mutations: Vec<Mutation>,
}

impl TabletMutations {
    pub fn new(tablet_id: i32, seq: i64, mutations: Vec<Mutation>) -> Self {
        Self {
            tablet_id,
            seq,
            mutations,
        }
    }
}

struct WorkState {
    done: bool,
    error: Option<WalError>,
}

/// A single queued append awaiting the group sync. The error slot may be
/// written first by the append path and later overwritten by the sync worker;
/// the completion signal fires exactly once.
struct LogWork {
    state: Mutex<WorkState>,
    cond: Condvar,
}

impl LogWork {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkState {
                done: false,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn fail(&self, error: WalError) {
        self.state.lock().error = Some(error);
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<(), WalError> {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Completion handle for a batched append. `await_durable` blocks until the
/// sync worker has durably persisted (or failed) the bytes of this call.
pub struct OpHandle {
    work: Arc<LogWork>,
}

impl OpHandle {
    pub fn await_durable(&self) -> Result<(), WalError> {
        self.work.wait()
    }
}

enum QueueItem {
    Work(Arc<LogWork>),
    CloseMarker,
}

struct AppendState {
    stream: Option<Box<dyn CipherWriter>>,
}

struct CloseState {
    closed: bool,
    drained: bool,
}

struct WalShared {
    // Append mutex: serializes byte streaming into the cipher wrapper.
    append: Mutex<AppendState>,
    // Work queue feeding the sync worker.
    queue: Mutex<VecDeque<QueueItem>>,
    queue_cond: Condvar,
    // Close mutex: kept separate so enqueueing never waits on an in-flight sync.
    close: Mutex<CloseState>,
    close_cond: Condvar,
    sink: SharedSink,
    sync_choice: SyncChoice,
    metrics: SharedMetricsRegistry,
    path: PathBuf,
}

/// Group-commit write-ahead log writer.
///
/// Producers stream their records under the append mutex and enqueue a work
/// item; a dedicated sync worker drains the queue and invokes one durable
/// sync for the whole drained batch, then releases every completion handle
/// with the outcome that applied to its bytes.
pub struct WalWriter {
    shared: Arc<WalShared>,
    session: String,
}

impl WalWriter {
    /// Allocates a fresh log file for `address`, writes the self-describing
    /// header and an `OPEN` record, and durably syncs before returning. The
    /// session identifier equals the file name.
    pub fn open(resources: &WalResources, address: &str) -> Result<WalWriter, WalError> {
        let filename = Uuid::new_v4().to_string();
        let tag = server_tag(address);
        let volume = resources.chooser.choose(&resources.wal_dirs);
        let path = volume.join(&tag).join(&filename);
        debug!("event=wal_open_begin path={}", path.display());

        let mut replication = resources.config.replication;
        if replication == 0 {
            replication = resources.volumes.default_replication(&path);
        }
        let mut block_size = resources.config.effective_block_size();
        if block_size == 0 {
            block_size = resources.volumes.default_block_size();
        }
        let sync_mode = if resources.config.sync_mode {
            SyncMode::SyncToDisk
        } else {
            SyncMode::FlushOnly
        };
        let options = CreateOptions {
            replication,
            block_size,
            sync_mode,
        };
        let sink = resources
            .volumes
            .create(&path, &options)
            .map_err(|err| WalError::OpenFailed(err.to_string()))?;
        let sink = SharedSink::new(sink);

        match Self::write_header(resources, &sink, &filename) {
            Ok((stream, sync_choice)) => {
                let shared = Arc::new(WalShared {
                    append: Mutex::new(AppendState {
                        stream: Some(stream),
                    }),
                    queue: Mutex::new(VecDeque::new()),
                    queue_cond: Condvar::new(),
                    close: Mutex::new(CloseState {
                        closed: false,
                        drained: false,
                    }),
                    close_cond: Condvar::new(),
                    sink,
                    sync_choice,
                    metrics: shared_registry("tessera.wal"),
                    path: path.clone(),
                });
                let worker = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("tessera-wal-sync-{filename}"))
                    .spawn(move || run_sync_worker(worker));
                if let Err(err) = spawned {
                    let _ = shared.sink.close();
                    return Err(WalError::OpenFailed(err.to_string()));
                }
                debug!("event=wal_open path={}", path.display());
                Ok(WalWriter {
                    shared,
                    session: filename,
                })
            }
            Err(err) => {
                // Partial open: close the underlying file before surfacing a
                // single wrapped error. No retry at this layer.
                let _ = sink.close();
                error!(
                    "event=wal_open_failed path={} error={}",
                    path.display(),
                    err
                );
                Err(WalError::OpenFailed(err.to_string()))
            }
        }
    }

    fn write_header(
        resources: &WalResources,
        sink: &SharedSink,
        filename: &str,
    ) -> Result<(Box<dyn CipherWriter>, SyncChoice), WalError> {
        let sync_choice = if sink.supports_sync_to_disk() {
            SyncChoice::SyncToDisk
        } else {
            warn!(
                "event=wal_sync_degraded path_session={filename} \
                 durability=peer-os-buffer"
            );
            SyncChoice::FlushToPeers
        };

        let module = resources.registry.resolve(&resources.config.crypto_module)?;

        // Header: magic, the cipher module name, then the module's own
        // parameters, so the file bootstraps its own decryption.
        let mut header = Vec::new();
        header.extend_from_slice(LOG_FILE_HEADER_V3.as_bytes());
        codec::put_str(&mut header, module.name());
        sink.append(&header)?;
        let (mut stream, params) = module.wrap_writer(sink.clone(), &resources.cipher)?;
        sink.append(&params)?;

        let open_key = LogKey::open(filename, filename);
        let encoded = codec::encode_record(&open_key, &LogValue::empty());
        stream.write_all(&encoded)?;
        stream.flush_record()?;
        sink.sync(sync_choice)?;
        Ok((stream, sync_choice))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.lock().snapshot()
    }

    /// Synchronously writes a `DEFINE_TABLET` record and durably syncs it.
    /// Not batched: later records for this tablet must reference a definition
    /// that is already durable.
    pub fn define_tablet(
        &self,
        seq: i64,
        tablet_id: i32,
        extent: &TabletExtent,
    ) -> Result<(), WalError> {
        let key = LogKey::define_tablet(seq, tablet_id, extent.clone());
        let encoded = codec::encode_record(&key, &LogValue::empty());
        let mut append = self.shared.append.lock();
        let stream = append.stream.as_mut().ok_or(WalError::LogClosed)?;
        stream.write_all(&encoded)?;
        stream.flush_record()?;
        self.shared.sink.sync(self.shared.sync_choice)?;
        self.shared.metrics.lock().inc_counter("defines", 1);
        Ok(())
    }

    /// Single-mutation convenience over `log_many`.
    pub fn log(&self, seq: i64, tablet_id: i32, mutation: Mutation) -> Result<OpHandle, WalError> {
        self.log_many(vec![TabletMutations::new(tablet_id, seq, vec![mutation])])
    }

    /// Appends one `MANY_MUTATIONS` record per batch and returns a handle
    /// that resolves once the records are durable.
    pub fn log_many(&self, batches: Vec<TabletMutations>) -> Result<OpHandle, WalError> {
        let records: Vec<(LogKey, LogValue)> = batches
            .into_iter()
            .map(|batch| {
                (
                    LogKey::many_mutations(batch.seq, batch.tablet_id),
                    LogValue::with_mutations(batch.mutations),
                )
            })
            .collect();
        self.log_records(records)
    }

    pub fn compaction_start(
        &self,
        seq: i64,
        tablet_id: i32,
        filename: &str,
    ) -> Result<OpHandle, WalError> {
        let key = LogKey::compaction_start(seq, tablet_id, filename);
        self.log_records(vec![(key, LogValue::empty())])
    }

    pub fn compaction_finish(&self, seq: i64, tablet_id: i32) -> Result<OpHandle, WalError> {
        let key = LogKey::compaction_finish(seq, tablet_id);
        self.log_records(vec![(key, LogValue::empty())])
    }

    fn log_records(&self, records: Vec<(LogKey, LogValue)>) -> Result<OpHandle, WalError> {
        let work = Arc::new(LogWork::new());
        {
            let mut append = self.shared.append.lock();
            let stream = append.stream.as_mut().ok_or(WalError::LogClosed)?;
            let streamed: Result<(), WalError> = records.iter().try_for_each(|(key, value)| {
                let encoded = codec::encode_record(key, value);
                stream.write_all(&encoded)?;
                stream.flush_record()?;
                Ok(())
            });
            match streamed {
                // A closed channel fails this call only; followers drain
                // through the close sentinel.
                Err(WalError::LogClosed) => return Err(WalError::LogClosed),
                Err(err) => {
                    error!(
                        "event=wal_append_failed path={} error={}",
                        self.shared.path.display(),
                        err
                    );
                    work.fail(err);
                }
                Ok(()) => {}
            }
        }

        {
            let close = self.shared.close.lock();
            if close.closed {
                return Err(WalError::LogClosed);
            }
            let mut queue = self.shared.queue.lock();
            queue.push_back(QueueItem::Work(Arc::clone(&work)));
            self.shared.queue_cond.notify_one();
        }

        {
            let mut metrics = self.shared.metrics.lock();
            metrics.inc_counter("batches", 1);
            metrics.inc_counter("records", records.len() as u64);
        }
        Ok(OpHandle { work })
    }

    /// Quiesces the pipeline: marks the log closed, drains every queued work
    /// item through the sync worker, then closes the underlying file exactly
    /// once.
    pub fn close(&self) -> Result<(), WalError> {
        {
            let mut close = self.shared.close.lock();
            if close.closed {
                return Ok(());
            }
            // After the flag flips nothing else can enter the queue, so the
            // sentinel is the last item the worker will ever see.
            close.closed = true;
            {
                let mut queue = self.shared.queue.lock();
                queue.push_back(QueueItem::CloseMarker);
                self.shared.queue_cond.notify_one();
            }
            while !close.drained {
                self.shared.close_cond.wait(&mut close);
            }
        }

        {
            let mut append = self.shared.append.lock();
            if let Some(mut stream) = append.stream.take() {
                let _ = stream.finish();
            }
        }
        if let Err(err) = self.shared.sink.close() {
            error!(
                "event=wal_close_failed path={} error={}",
                self.shared.path.display(),
                err
            );
            return Err(WalError::LogClosed);
        }
        debug!("event=wal_closed path={}", self.shared.path.display());
        Ok(())
    }
}

impl PartialEq for WalWriter {
    // The path embeds a UUID and is unique per writer session.
    fn eq(&self, other: &Self) -> bool {
        self.shared.path == other.shared.path
    }
}

impl Eq for WalWriter {}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_sync_worker(shared: Arc<WalShared>) {
    let mut batch: Vec<QueueItem> = Vec::new();
    loop {
        batch.clear();
        {
            let mut queue = shared.queue.lock();
            while queue.is_empty() {
                shared.queue_cond.wait(&mut queue);
            }
            batch.extend(queue.drain(..));
        }

        {
            let close = shared.close.lock();
            if !close.closed {
                // One durable sync covers the whole drained batch.
                if let Err(err) = shared.sink.sync(shared.sync_choice) {
                    warn!(
                        "event=wal_sync_failed path={} error={}",
                        shared.path.display(),
                        err
                    );
                    let failure = WalError::Sync(err.to_string());
                    for item in &batch {
                        if let QueueItem::Work(work) = item {
                            work.fail(failure.clone());
                        }
                    }
                } else {
                    shared.metrics.lock().inc_counter("syncs", 1);
                }
            } else {
                for item in &batch {
                    if let QueueItem::Work(work) = item {
                        work.fail(WalError::LogClosed);
                    }
                }
            }
        }

        let mut saw_close_marker = false;
        for item in &batch {
            match item {
                QueueItem::Work(work) => work.finish(),
                QueueItem::CloseMarker => saw_close_marker = true,
            }
        }

        if saw_close_marker {
            let mut close = shared.close.lock();
            close.drained = true;
            shared.close_cond.notify_all();
            break;
        }
    }
}

fn server_tag(address: &str) -> String {
    address.split(':').collect::<Vec<_>>().join("+")
}
