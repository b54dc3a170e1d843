use crate::config::CipherConfig;
use crate::walog::volume::{SharedSink, VolumeError};
// aes-gcm relies on generic-array 0.14, so suppress the upstream deprecation locally.
#[allow(deprecated)]
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use thiserror::Error;

pub const NULL_CIPHER_MODULE: &str = "tessera.crypto.NullCipher";
pub const AES_GCM_CIPHER_MODULE: &str = "tessera.crypto.AesGcmCipher";

/// Legacy v2 option-map keys for the default cipher.
pub const LEGACY_KEY_EPOCH_OPTION: &str = "crypto.key.epoch";
pub const LEGACY_NONCE_SEED_OPTION: &str = "crypto.nonce.seed";

const PARAMS_VERSION: u8 = 1;
const NONCE_SEED_LEN: usize = 16;
const TAG_LEN: usize = 16;
const IV_DOMAIN: &[u8] = b"WAL-Chunk-IV v1";
const AAD_VERSION: u8 = 1;
// Sanity bound on a single sealed chunk during readback.
const MAX_CHUNK_BYTES: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown cipher module {0:?}")]
    UnknownModule(String),
    #[error("malformed cipher header params: {0}")]
    BadParams(String),
    #[error("key epoch mismatch: file={file}, configured={configured}")]
    KeyEpochMismatch { file: u32, configured: u32 },
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure")]
    Decrypt,
    #[error("sink closed")]
    SinkClosed,
    #[error("sink failure: {0}")]
    Sink(String),
}

impl From<VolumeError> for CryptoError {
    fn from(err: VolumeError) -> Self {
        match err {
            VolumeError::Closed => CryptoError::SinkClosed,
            other => CryptoError::Sink(other.to_string()),
        }
    }
}

/// Byte-oriented enciphering writer in front of a block sink. Record
/// boundaries are flush points; the sync worker handles durability below.
pub trait CipherWriter: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CryptoError>;
    /// Seals everything buffered since the previous record boundary.
    fn flush_record(&mut self) -> Result<(), CryptoError>;
    /// Final flush before the file is closed.
    fn finish(&mut self) -> Result<(), CryptoError>;
}

/// A named cipher implementation. `wrap_writer` returns the enciphering
/// writer plus the header params blob the log writer embeds after the module
/// name; `wrap_reader` consumes that blob from the head of the stream.
pub trait CipherModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap_writer(
        &self,
        sink: SharedSink,
        config: &CipherConfig,
    ) -> Result<(Box<dyn CipherWriter>, Vec<u8>), CryptoError>;

    fn wrap_reader(
        &self,
        reader: Box<dyn Read + Send>,
        config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError>;

    /// v2 compatibility: parameters arrive as a flat string map instead of a
    /// module-specific blob.
    fn wrap_reader_legacy(
        &self,
        reader: Box<dyn Read + Send>,
        options: &HashMap<String, String>,
        config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError>;
}

/// Maps stable module names to implementations, resolved once per file open.
pub struct CipherRegistry {
    modules: HashMap<String, Arc<dyn CipherModule>>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NullCipher));
        registry.register(Arc::new(AesGcmCipher));
        registry
    }

    pub fn register(&mut self, module: Arc<dyn CipherModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CipherModule>, CryptoError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownModule(name.to_string()))
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Identity module: bytes pass through unchanged and the header carries an
/// empty params blob.
pub struct NullCipher;

impl CipherModule for NullCipher {
    fn name(&self) -> &'static str {
        NULL_CIPHER_MODULE
    }

    fn wrap_writer(
        &self,
        sink: SharedSink,
        _config: &CipherConfig,
    ) -> Result<(Box<dyn CipherWriter>, Vec<u8>), CryptoError> {
        Ok((Box::new(NullWriter { sink }), Vec::new()))
    }

    fn wrap_reader(
        &self,
        reader: Box<dyn Read + Send>,
        _config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        Ok(reader)
    }

    fn wrap_reader_legacy(
        &self,
        reader: Box<dyn Read + Send>,
        _options: &HashMap<String, String>,
        _config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        Ok(reader)
    }
}

struct NullWriter {
    sink: SharedSink,
}

impl CipherWriter for NullWriter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CryptoError> {
        Ok(self.sink.append(bytes)?)
    }

    fn flush_record(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// AES-256-GCM module. Each record flush seals one chunk
/// `u32 len || ciphertext || tag`; nonces are derived from the key epoch,
/// a per-file random seed, and a chunk counter. The params blob is
/// `version || key_epoch || nonce_seed`, so the file plus the configured key
/// fully determine decryption.
pub struct AesGcmCipher;

impl CipherModule for AesGcmCipher {
    fn name(&self) -> &'static str {
        AES_GCM_CIPHER_MODULE
    }

    fn wrap_writer(
        &self,
        sink: SharedSink,
        config: &CipherConfig,
    ) -> Result<(Box<dyn CipherWriter>, Vec<u8>), CryptoError> {
        let mut seed = [0u8; NONCE_SEED_LEN];
        thread_rng().fill_bytes(&mut seed);
        let mut params = Vec::with_capacity(1 + 4 + NONCE_SEED_LEN);
        params.push(PARAMS_VERSION);
        params.extend_from_slice(&config.key_epoch.to_be_bytes());
        params.extend_from_slice(&seed);
        let writer = GcmWriter {
            sink,
            cipher: Aes256Gcm::new(key_ref(&config.key)),
            key_epoch: config.key_epoch,
            seed,
            counter: 0,
            buffer: Vec::new(),
        };
        Ok((Box::new(writer), params))
    }

    fn wrap_reader(
        &self,
        mut reader: Box<dyn Read + Send>,
        config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        let mut head = [0u8; 1 + 4 + NONCE_SEED_LEN];
        reader
            .read_exact(&mut head)
            .map_err(|err| CryptoError::BadParams(err.to_string()))?;
        if head[0] != PARAMS_VERSION {
            return Err(CryptoError::BadParams(format!(
                "unsupported params version {}",
                head[0]
            )));
        }
        let file_epoch = u32::from_be_bytes(
            head[1..5]
                .try_into()
                .map_err(|_| CryptoError::BadParams("short epoch".to_string()))?,
        );
        let mut seed = [0u8; NONCE_SEED_LEN];
        seed.copy_from_slice(&head[5..]);
        self.reader_for(reader, file_epoch, seed, config)
    }

    fn wrap_reader_legacy(
        &self,
        reader: Box<dyn Read + Send>,
        options: &HashMap<String, String>,
        config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        let epoch_raw = options
            .get(LEGACY_KEY_EPOCH_OPTION)
            .ok_or_else(|| CryptoError::BadParams("missing crypto.key.epoch".to_string()))?;
        let file_epoch: u32 = epoch_raw
            .parse()
            .map_err(|_| CryptoError::BadParams(format!("bad key epoch {epoch_raw:?}")))?;
        let seed_raw = options
            .get(LEGACY_NONCE_SEED_OPTION)
            .ok_or_else(|| CryptoError::BadParams("missing crypto.nonce.seed".to_string()))?;
        let seed = decode_hex_seed(seed_raw)?;
        self.reader_for(reader, file_epoch, seed, config)
    }
}

impl AesGcmCipher {
    fn reader_for(
        &self,
        reader: Box<dyn Read + Send>,
        file_epoch: u32,
        seed: [u8; NONCE_SEED_LEN],
        config: &CipherConfig,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        if file_epoch != config.key_epoch {
            return Err(CryptoError::KeyEpochMismatch {
                file: file_epoch,
                configured: config.key_epoch,
            });
        }
        Ok(Box::new(GcmReader {
            inner: reader,
            cipher: Aes256Gcm::new(key_ref(&config.key)),
            key_epoch: file_epoch,
            seed,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
        }))
    }
}

struct GcmWriter {
    sink: SharedSink,
    cipher: Aes256Gcm,
    key_epoch: u32,
    seed: [u8; NONCE_SEED_LEN],
    counter: u64,
    buffer: Vec<u8>,
}

impl CipherWriter for GcmWriter {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CryptoError> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn flush_record(&mut self) -> Result<(), CryptoError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let nonce_bytes = derive_nonce(self.key_epoch, &self.seed, self.counter);
        let aad = build_aad(self.key_epoch, &self.seed);
        let mut sealed = std::mem::take(&mut self.buffer);
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce_ref(&nonce_bytes), &aad, &mut sealed)
            .map_err(|_| CryptoError::Encrypt)?;
        sealed.extend(tag.iter().copied());
        let frame_len = u32::try_from(sealed.len()).map_err(|_| CryptoError::Encrypt)?;
        self.sink.append(&frame_len.to_be_bytes())?;
        self.sink.append(&sealed)?;
        self.counter += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CryptoError> {
        self.flush_record()
    }
}

struct GcmReader {
    inner: Box<dyn Read + Send>,
    cipher: Aes256Gcm,
    key_epoch: u32,
    seed: [u8; NONCE_SEED_LEN],
    counter: u64,
    plain: Vec<u8>,
    pos: usize,
}

impl GcmReader {
    fn refill(&mut self) -> io::Result<bool> {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&mut self.inner, &mut len_buf)? {
            return Ok(false);
        }
        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len < TAG_LEN || frame_len > MAX_CHUNK_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible sealed chunk length {frame_len}"),
            ));
        }
        let mut frame = vec![0u8; frame_len];
        self.inner.read_exact(&mut frame)?;
        let (data, tag_bytes) = frame.split_at(frame_len - TAG_LEN);
        let nonce_bytes = derive_nonce(self.key_epoch, &self.seed, self.counter);
        let aad = build_aad(self.key_epoch, &self.seed);
        let mut plain = data.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                nonce_ref(&nonce_bytes),
                &aad,
                &mut plain,
                tag_ref(tag_bytes),
            )
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, CryptoError::Decrypt))?;
        self.counter += 1;
        self.plain = plain;
        self.pos = 0;
        Ok(true)
    }
}

impl Read for GcmReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.plain.len() {
            if !self.refill()? {
                return Ok(0);
            }
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn build_aad(key_epoch: u32, seed: &[u8; NONCE_SEED_LEN]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 4 + NONCE_SEED_LEN);
    aad.push(AAD_VERSION);
    aad.extend_from_slice(&key_epoch.to_be_bytes());
    aad.extend_from_slice(seed);
    aad
}

fn derive_nonce(key_epoch: u32, seed: &[u8; NONCE_SEED_LEN], counter: u64) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(key_epoch.to_be_bytes());
    hasher.update(seed);
    hasher.update(counter.to_be_bytes());
    hasher.update(IV_DOMAIN);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&digest[..12]);
    iv
}

fn decode_hex_seed(raw: &str) -> Result<[u8; NONCE_SEED_LEN], CryptoError> {
    if raw.len() != NONCE_SEED_LEN * 2 {
        return Err(CryptoError::BadParams(format!(
            "nonce seed must be {} hex chars",
            NONCE_SEED_LEN * 2
        )));
    }
    let mut seed = [0u8; NONCE_SEED_LEN];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)
            .map_err(|_| CryptoError::BadParams("non-ascii nonce seed".to_string()))?;
        seed[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| CryptoError::BadParams(format!("bad hex pair {pair:?}")))?;
    }
    Ok(seed)
}

pub fn encode_hex_seed(seed: &[u8]) -> String {
    seed.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Reads the full buffer, or reports a clean end-of-stream when no byte at
/// all is available.
fn read_exact_or_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated sealed chunk",
            ));
        }
        filled += n;
    }
    Ok(true)
}

#[allow(deprecated)]
fn key_ref(bytes: &[u8; 32]) -> &Key<Aes256Gcm> {
    Key::<Aes256Gcm>::from_slice(bytes)
}

#[allow(deprecated)]
fn nonce_ref(bytes: &[u8; 12]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

#[allow(deprecated)]
fn tag_ref(bytes: &[u8]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::TagSize> {
    GenericArray::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walog::volume::{CreateOptions, LocalVolumeManager, SyncMode, VolumeManager};
    use std::fs;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn test_config() -> CipherConfig {
        CipherConfig {
            key_epoch: 7,
            key: [0x42u8; 32],
        }
    }

    fn sink_at(path: &std::path::Path) -> SharedSink {
        let volumes = LocalVolumeManager::new();
        let options = CreateOptions {
            replication: 1,
            block_size: 1 << 20,
            sync_mode: SyncMode::SyncToDisk,
        };
        SharedSink::new(volumes.create(path, &options).unwrap())
    }

    #[test]
    fn registry_resolves_defaults() {
        let registry = CipherRegistry::with_defaults();
        assert_eq!(
            registry.resolve(NULL_CIPHER_MODULE).unwrap().name(),
            NULL_CIPHER_MODULE
        );
        assert!(matches!(
            registry.resolve("no.such.module"),
            Err(CryptoError::UnknownModule(_))
        ));
    }

    #[test]
    fn null_module_passes_bytes_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let sink = sink_at(&path);
        let (mut writer, params) = NullCipher
            .wrap_writer(sink.clone(), &CipherConfig::default())
            .unwrap();
        assert!(params.is_empty());
        writer.write_all(b"plain bytes").unwrap();
        writer.flush_record().unwrap();
        writer.finish().unwrap();
        sink.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"plain bytes");
    }

    #[test]
    fn gcm_seal_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let config = test_config();
        let sink = sink_at(&path);
        let (mut writer, params) = AesGcmCipher.wrap_writer(sink.clone(), &config).unwrap();
        writer.write_all(b"first record").unwrap();
        writer.flush_record().unwrap();
        writer.write_all(b"second ").unwrap();
        writer.write_all(b"record").unwrap();
        writer.flush_record().unwrap();
        writer.finish().unwrap();
        sink.close().unwrap();

        let sealed = fs::read(&path).unwrap();
        assert_ne!(&sealed[..], b"first recordsecond record");

        // Reader expects params at the head of the stream, as on disk.
        let mut stream = params.clone();
        stream.extend_from_slice(&sealed);
        let mut reader = AesGcmCipher
            .wrap_reader(Box::new(Cursor::new(stream)), &config)
            .unwrap();
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"first recordsecond record");
    }

    #[test]
    fn gcm_rejects_key_epoch_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let config = test_config();
        let sink = sink_at(&path);
        let (mut writer, params) = AesGcmCipher.wrap_writer(sink.clone(), &config).unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();
        sink.close().unwrap();

        let mut stream = params;
        stream.extend_from_slice(&fs::read(&path).unwrap());
        let stale = CipherConfig {
            key_epoch: 8,
            ..config
        };
        let err = AesGcmCipher
            .wrap_reader(Box::new(Cursor::new(stream)), &stale)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CryptoError::KeyEpochMismatch {
                file: 7,
                configured: 8
            }
        ));
    }

    #[test]
    fn gcm_legacy_options_decode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let config = test_config();
        let sink = sink_at(&path);
        let (mut writer, params) = AesGcmCipher.wrap_writer(sink.clone(), &config).unwrap();
        writer.write_all(b"legacy payload").unwrap();
        writer.finish().unwrap();
        sink.close().unwrap();

        let seed = &params[5..];
        let mut options = HashMap::new();
        options.insert(LEGACY_KEY_EPOCH_OPTION.to_string(), "7".to_string());
        options.insert(LEGACY_NONCE_SEED_OPTION.to_string(), encode_hex_seed(seed));
        let sealed = fs::read(&path).unwrap();
        let mut reader = AesGcmCipher
            .wrap_reader_legacy(Box::new(Cursor::new(sealed)), &options, &config)
            .unwrap();
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"legacy payload");
    }

    #[test]
    fn tampered_chunk_fails_decrypt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let config = test_config();
        let sink = sink_at(&path);
        let (mut writer, params) = AesGcmCipher.wrap_writer(sink.clone(), &config).unwrap();
        writer.write_all(b"sensitive").unwrap();
        writer.finish().unwrap();
        sink.close().unwrap();

        let mut sealed = fs::read(&path).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        let mut stream = params;
        stream.extend_from_slice(&sealed);
        let mut reader = AesGcmCipher
            .wrap_reader(Box::new(Cursor::new(stream)), &config)
            .unwrap();
        let mut plain = Vec::new();
        let err = reader.read_to_end(&mut plain).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn hex_seed_roundtrip() {
        let seed = [0xabu8; NONCE_SEED_LEN];
        let encoded = encode_hex_seed(&seed);
        assert_eq!(decode_hex_seed(&encoded).unwrap(), seed);
        assert!(decode_hex_seed("zz").is_err());
    }
}
