use crate::config::CipherConfig;
use crate::walog::codec::{self, CodecError, LogKey, LogValue};
use crate::walog::crypto::{CipherRegistry, CryptoError, AES_GCM_CIPHER_MODULE};
use crate::walog::volume::{BlockReader, VolumeError, VolumeManager};
use crate::walog::writer::{LOG_FILE_HEADER_V2, LOG_FILE_HEADER_V3};
use log::debug;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("log read I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// File format detected from the header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    V3,
    V2,
    /// No magic at all: the whole file is plaintext records.
    PreV2,
}

#[derive(Debug, Clone)]
pub struct LogHeader {
    pub format: LogFormat,
    /// Module named in a v3 header; `None` for v2 and pre-v2 files.
    pub cipher_module: Option<String>,
}

/// The decoded view of a finished log file: header metadata plus the
/// decrypting record stream.
pub struct LogStreams {
    pub header: LogHeader,
    pub records: LogRecordReader,
}

/// Sequential record decoder over the plaintext stream.
pub struct LogRecordReader {
    stream: Box<dyn Read + Send>,
}

impl LogRecordReader {
    pub fn next_record(&mut self) -> Result<Option<(LogKey, LogValue)>, ReadError> {
        Ok(codec::read_record(&mut self.stream)?)
    }

    /// Drains the remaining records; any decode failure aborts the scan.
    pub fn read_to_end(&mut self) -> Result<Vec<(LogKey, LogValue)>, ReadError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Sequential `Read` adaptor over a positional block reader, with rewind for
/// the magic-probe paths.
struct PositionalCursor {
    reader: Box<dyn BlockReader>,
    pos: u64,
}

impl PositionalCursor {
    fn rewind(&mut self, pos: u64) {
        self.pos = pos;
    }
}

impl Read for PositionalCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .reader
            .read_at(self.pos, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Opens a finished log file, decodes its self-describing header, and
/// returns the decrypting record stream. Handles the current v3 layout, the
/// legacy v2 flat-options layout, and headerless pre-v2 files.
pub fn read_log_streams(
    volumes: &dyn VolumeManager,
    path: &Path,
    registry: &CipherRegistry,
    cipher: &CipherConfig,
) -> Result<LogStreams, ReadError> {
    let reader = volumes.open_for_read(path)?;
    let mut cursor = PositionalCursor { reader, pos: 0 };

    let magic_len = LOG_FILE_HEADER_V3.len();
    let mut magic = vec![0u8; magic_len];
    let read = read_up_to(&mut cursor, &mut magic)?;

    if read == magic_len && magic == LOG_FILE_HEADER_V3.as_bytes() {
        let module_name = codec::read_str(&mut cursor)?;
        debug!(
            "event=wal_read_header path={} format=v3 module={}",
            path.display(),
            module_name
        );
        let module = registry.resolve(&module_name)?;
        let plaintext = module.wrap_reader(Box::new(cursor), cipher)?;
        return Ok(LogStreams {
            header: LogHeader {
                format: LogFormat::V3,
                cipher_module: Some(module_name),
            },
            records: LogRecordReader { stream: plaintext },
        });
    }

    if read == magic_len && magic == LOG_FILE_HEADER_V2.as_bytes() {
        // v2 files carry their cipher parameters as a flat string map. An
        // empty map means plaintext; anything else is decoded by the default
        // legacy module.
        let options = read_options_map(&mut cursor)?;
        debug!(
            "event=wal_read_header path={} format=v2 options={}",
            path.display(),
            options.len()
        );
        let plaintext: Box<dyn Read + Send> = if options.is_empty() {
            Box::new(cursor)
        } else {
            let module = registry.resolve(AES_GCM_CIPHER_MODULE)?;
            module.wrap_reader_legacy(Box::new(cursor), &options, cipher)?
        };
        return Ok(LogStreams {
            header: LogHeader {
                format: LogFormat::V2,
                cipher_module: None,
            },
            records: LogRecordReader { stream: plaintext },
        });
    }

    // No recognizable magic: rewind and treat the whole file as plaintext.
    debug!(
        "event=wal_read_header path={} format=pre-v2",
        path.display()
    );
    cursor.rewind(0);
    Ok(LogStreams {
        header: LogHeader {
            format: LogFormat::PreV2,
            cipher_module: None,
        },
        records: LogRecordReader {
            stream: Box::new(cursor),
        },
    })
}

fn read_options_map(reader: &mut impl Read) -> Result<HashMap<String, String>, ReadError> {
    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf)?;
    let count = u32::from_be_bytes(count_buf);
    let mut options = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = codec::read_str(reader)?;
        let value = codec::read_str(reader)?;
        options.insert(key, value);
    }
    Ok(options)
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, ReadError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walog::codec::{LogEvent, LogKey, LogValue};
    use crate::walog::crypto::CipherRegistry;
    use crate::walog::volume::LocalVolumeManager;
    use std::fs;
    use tempfile::tempdir;

    fn write_plaintext_records() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend(codec::encode_record(
            &LogKey::open("sess", "sess"),
            &LogValue::empty(),
        ));
        raw.extend(codec::encode_record(
            &LogKey::compaction_finish(4, 9),
            &LogValue::empty(),
        ));
        raw
    }

    #[test]
    fn pre_v2_file_rewinds_and_reads_plaintext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old-log");
        fs::write(&path, write_plaintext_records()).unwrap();
        let volumes = LocalVolumeManager::new();
        let registry = CipherRegistry::with_defaults();
        let mut streams =
            read_log_streams(&volumes, &path, &registry, &CipherConfig::default()).unwrap();
        assert_eq!(streams.header.format, LogFormat::PreV2);
        let records = streams.records.read_to_end().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.event, LogEvent::Open);
        assert_eq!(records[1].0.event, LogEvent::CompactionFinish);
    }

    #[test]
    fn v2_empty_options_reads_as_plaintext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v2-log");
        let mut raw = Vec::new();
        raw.extend_from_slice(LOG_FILE_HEADER_V2.as_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend(write_plaintext_records());
        fs::write(&path, raw).unwrap();
        let volumes = LocalVolumeManager::new();
        let registry = CipherRegistry::with_defaults();
        let mut streams =
            read_log_streams(&volumes, &path, &registry, &CipherConfig::default()).unwrap();
        assert_eq!(streams.header.format, LogFormat::V2);
        assert!(streams.header.cipher_module.is_none());
        let records = streams.records.read_to_end().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn v3_with_unknown_module_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v3-log");
        let mut raw = Vec::new();
        raw.extend_from_slice(LOG_FILE_HEADER_V3.as_bytes());
        let mut name = Vec::new();
        codec::put_str(&mut name, "ghost.module");
        raw.extend(name);
        fs::write(&path, raw).unwrap();
        let volumes = LocalVolumeManager::new();
        let registry = CipherRegistry::with_defaults();
        let err =
            read_log_streams(&volumes, &path, &registry, &CipherConfig::default())
                .err()
                .unwrap();
        assert!(matches!(
            err,
            ReadError::Crypto(CryptoError::UnknownModule(_))
        ));
    }

    #[test]
    fn short_file_is_treated_as_pre_v2() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny");
        fs::write(&path, b"").unwrap();
        let volumes = LocalVolumeManager::new();
        let registry = CipherRegistry::with_defaults();
        let mut streams =
            read_log_streams(&volumes, &path, &registry, &CipherConfig::default()).unwrap();
        assert_eq!(streams.header.format, LogFormat::PreV2);
        assert!(streams.records.next_record().unwrap().is_none());
    }
}
