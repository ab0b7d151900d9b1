//! Batch wire encoding: per-record JSON, batch header, compression, encryption.

use aes_gcm::{
    AeadCore, Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    context::DeviceContext,
    record::{Payload, QueueRecord},
    types::{RecordId, SeqNo},
};

/// SDK version reported in every batch header.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const NONCE_LEN: usize = 12;

/// Encoding pipeline failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A record could not be serialized.
    #[error("record {id} serialization failed: {source}")]
    Serialize {
        /// Offending record.
        id: RecordId,
        /// Underlying serializer error.
        source: serde_json::Error,
    },
    /// A record exceeds the per-record size limit.
    #[error("record {id} is {size} bytes, limit {limit}")]
    Oversized {
        /// Offending record.
        id: RecordId,
        /// Serialized size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
    /// The batch header could not be serialized.
    #[error("header serialization failed: {0}")]
    Header(serde_json::Error),
    /// The compressor failed.
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
    /// Encryption or decryption failed.
    #[error("crypto: {0}")]
    Crypto(String),
}

impl CodecError {
    /// Record-level failures quarantine the record; the rest fail the batch.
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::Serialize { id, .. } | Self::Oversized { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Reversible compression applied before encryption.
pub trait Compressor: Send + Sync {
    /// Compresses a whole batch body.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Pass-through compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// zstd stream compression.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Compressor at the given zstd level.
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(zstd::stream::encode_all(bytes, self.level)?)
    }
}

/// Encryption applied last, just before hand-off to the transport.
pub trait Cipher: Send + Sync {
    /// Encrypts a compressed batch body.
    fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Pass-through cipher for collectors reached over an already-encrypted channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Cipher for Plaintext {
    fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// AES-256-GCM with a host-supplied key. Output is `nonce (12 bytes) || ciphertext`.
#[derive(Clone)]
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl AesGcmCipher {
    /// Cipher keyed with a 256-bit key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Reverses [`Cipher::encrypt`]; used by collectors and tests.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.len() < NONCE_LEN {
            return Err(CodecError::Crypto(
                "ciphertext too short: missing nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CodecError::Crypto(format!("decryption failed: {e}")))
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, bytes)
            .map_err(|e| CodecError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Application identity stamped on every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppIdentity {
    /// Collector-issued application key.
    pub app_key: String,
    /// Host application version.
    pub app_version: String,
    /// Distribution channel.
    pub app_channel: String,
}

#[derive(Debug, Serialize)]
struct BatchHeader<'a> {
    #[serde(flatten)]
    app: &'a AppIdentity,
    sdk_version: &'static str,
    device: &'a DeviceContext,
    seq_first: SeqNo,
    seq_last: SeqNo,
    record_count: usize,
    sent_at_ms: u64,
}

#[derive(Serialize)]
struct WireRecord<'a> {
    record_id: RecordId,
    #[serde(flatten)]
    payload: &'a Payload,
}

/// A batch ready for the transport, plus the records it does and does not carry.
#[derive(Debug, Default)]
pub struct EncodedBatch {
    /// Records carried in `body`, in queue order.
    pub ids: Vec<RecordId>,
    /// Records that could not be encoded.
    pub rejected: Vec<(RecordId, String)>,
    /// Compressed, encrypted bytes; empty when `ids` is empty.
    pub body: Vec<u8>,
}

/// Serializes one record in its stable wire shape.
pub fn encode_record(record: &QueueRecord, max_bytes: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(&WireRecord {
        record_id: record.id,
        payload: &record.payload,
    })
    .map_err(|source| CodecError::Serialize {
        id: record.id,
        source,
    })?;
    if bytes.len() > max_bytes {
        return Err(CodecError::Oversized {
            id: record.id,
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

/// Encodes drained records into transport-ready batches.
pub struct BatchEncoder {
    app: AppIdentity,
    max_record_bytes: usize,
    compressor: Box<dyn Compressor>,
    cipher: Box<dyn Cipher>,
}

impl BatchEncoder {
    /// Encoder for one application identity.
    pub fn new(
        app: AppIdentity,
        max_record_bytes: usize,
        compressor: Box<dyn Compressor>,
        cipher: Box<dyn Cipher>,
    ) -> Self {
        Self {
            app,
            max_record_bytes,
            compressor,
            cipher,
        }
    }

    /// Plain JSON batch body before compression and encryption.
    pub fn encode_plain(
        &self,
        records: &[QueueRecord],
        device: &DeviceContext,
        sent_at_ms: u64,
    ) -> Result<EncodedBatch, CodecError> {
        let mut out = EncodedBatch::default();
        let mut encoded = Vec::with_capacity(records.len());
        let mut seq_range: Option<(SeqNo, SeqNo)> = None;

        for record in records {
            match encode_record(record, self.max_record_bytes) {
                Ok(bytes) => {
                    let seq = record.payload.seq();
                    seq_range = Some(match seq_range {
                        Some((lo, hi)) => (lo.min(seq), hi.max(seq)),
                        None => (seq, seq),
                    });
                    out.ids.push(record.id);
                    encoded.push(bytes);
                }
                Err(err) => match err.record_id() {
                    Some(id) => out.rejected.push((id, err.to_string())),
                    None => return Err(err),
                },
            }
        }

        let Some((seq_first, seq_last)) = seq_range else {
            return Ok(out);
        };

        let header = serde_json::to_vec(&BatchHeader {
            app: &self.app,
            sdk_version: SDK_VERSION,
            device,
            seq_first,
            seq_last,
            record_count: encoded.len(),
            sent_at_ms,
        })
        .map_err(CodecError::Header)?;

        let body_len = header.len() + encoded.iter().map(|r| r.len() + 1).sum::<usize>() + 24;
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(b"{\"header\":");
        body.extend_from_slice(&header);
        body.extend_from_slice(b",\"records\":[");
        for (i, rec) in encoded.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(rec);
        }
        body.extend_from_slice(b"]}");
        out.body = body;
        Ok(out)
    }

    /// Full pipeline: serialize, compress, encrypt.
    pub fn encode(
        &self,
        records: &[QueueRecord],
        device: &DeviceContext,
        sent_at_ms: u64,
    ) -> Result<EncodedBatch, CodecError> {
        let mut batch = self.encode_plain(records, device, sent_at_ms)?;
        if !batch.ids.is_empty() {
            let compressed = self.compressor.compress(&batch.body)?;
            batch.body = self.cipher.encrypt(&compressed)?;
        }
        Ok(batch)
    }
}
