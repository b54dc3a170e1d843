//! Durability and coordination substrate for a tablet-based key/value store:
//! a group-commit, optionally-encrypted write-ahead log over a replicating
//! filesystem, and a watch-driven cache over hierarchical coordination paths.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod coord;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod walog;

pub use config::{load_json, CipherConfig, ConfigError, CoordConfig, WalConfig};
pub use coord::{
    CacheRegistry, CoordCache, CoordClient, CoordClientFactory, CoordError, NodeStat,
    NodeEventKind, SessionEventKind, WatchChannel, WatchEvent, Watcher,
};
pub use error::TesseraError;
pub use retry::Backoff;
pub use telemetry::{shared_registry, MetricsRegistry, MetricsSnapshot, SharedMetricsRegistry};
pub use walog::{
    codec::{ColumnUpdate, LogEvent, LogKey, LogValue, Mutation, TabletExtent},
    reader::{read_log_streams, LogFormat, LogHeader, LogRecordReader, LogStreams},
    writer::{LOG_FILE_HEADER_V2, LOG_FILE_HEADER_V3},
    AesGcmCipher, BlockReader, BlockSink, CipherModule, CipherRegistry, CipherWriter, CodecError,
    CreateOptions, CryptoError, LocalVolumeManager, NullCipher, OpHandle, RandomVolumeChooser,
    ReadError, SharedSink, SyncChoice, SyncMode, TabletMutations, VolumeChooser, VolumeError,
    VolumeManager, WalError, WalResources, WalWriter, AES_GCM_CIPHER_MODULE, NULL_CIPHER_MODULE,
};
