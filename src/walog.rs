//! Write-ahead log subsystem: block sinks over a replicating filesystem,
//! self-describing encrypted log files, and the group-commit writer.

pub mod codec;
pub mod crypto;
pub mod reader;
pub mod volume;
pub mod writer;

pub use codec::{
    CodecError, ColumnUpdate, LogEvent, LogKey, LogValue, Mutation, TabletExtent,
};
pub use crypto::{
    AesGcmCipher, CipherModule, CipherRegistry, CipherWriter, CryptoError, NullCipher,
    AES_GCM_CIPHER_MODULE, NULL_CIPHER_MODULE,
};
pub use reader::{read_log_streams, LogFormat, LogHeader, LogRecordReader, LogStreams, ReadError};
pub use volume::{
    BlockReader, BlockSink, CreateOptions, LocalVolumeManager, RandomVolumeChooser, SharedSink,
    SyncChoice, SyncMode, VolumeChooser, VolumeError, VolumeManager,
};
pub use writer::{OpHandle, TabletMutations, WalError, WalResources, WalWriter};
