use crate::config::ConfigError;
use crate::coord::client::CoordError;
use crate::walog::codec::CodecError;
use crate::walog::crypto::CryptoError;
use crate::walog::reader::ReadError;
use crate::walog::volume::VolumeError;
use crate::walog::writer::WalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error("{0}")]
    Other(String),
}
