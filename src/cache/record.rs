use time::OffsetDateTime;

use super::codec::{self, BodyReader, CodecError};
use super::key::{KeyError, normalize_key};

/// One cached resource: identity, response metadata, and the compressed body.
///
/// Immutable once stored; `compressed_length`, `content_length`, and
/// `content_hash` always describe the actual payload bytes.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    /// Normalized URL, the cache identity.
    pub key: String,
    /// Originally requested URL.
    pub url: String,
    /// Registrable domain used for store sharding.
    pub base_domain: String,
    /// Status code of the original response (only 200s are ever stored).
    pub status: u16,
    /// Protocol of the original response, e.g. `HTTP/1.1`.
    pub protocol: String,
    pub content_language: String,
    pub content_type: String,
    pub etag: String,
    pub last_modified: String,
    /// Zstd-compressed body bytes.
    pub body: Vec<u8>,
    pub compressed_length: i64,
    pub content_length: i64,
    /// Upstream fetch latency in milliseconds.
    pub response_ms: f64,
    /// Hex digest of the uncompressed body.
    pub content_hash: String,
    /// Capture timestamp, UTC.
    pub created: OffsetDateTime,
}

/// Response metadata carried from the upstream fetch into a record.
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    pub status: u16,
    pub protocol: String,
    pub content_language: String,
    pub content_type: String,
    pub etag: String,
    pub last_modified: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CacheRecord {
    /// Builds a record from a fetched body: normalizes the URL, compresses
    /// the payload, and computes lengths and the content hash.
    pub async fn build(
        uri: &str,
        meta: RecordMeta,
        body: &[u8],
        response_ms: f64,
        created: OffsetDateTime,
    ) -> Result<Self, RecordError> {
        let normalized = normalize_key(uri)?;
        let compressed = codec::compress(body).await?;

        Ok(Self {
            key: normalized.key,
            url: uri.to_string(),
            base_domain: normalized.base_domain,
            status: meta.status,
            protocol: meta.protocol,
            content_language: meta.content_language,
            content_type: meta.content_type,
            etag: meta.etag,
            last_modified: meta.last_modified,
            compressed_length: compressed.len() as i64,
            content_length: body.len() as i64,
            response_ms,
            content_hash: codec::content_hash(body),
            body: compressed,
            created: created.to_offset(time::UtcOffset::UTC),
        })
    }

    /// Lazy stream over the decompressed body.
    pub fn body_reader(&self) -> BodyReader {
        codec::decompress_reader(self.body.clone())
    }

    /// Consumes the record into a lazy body stream, avoiding a copy of the
    /// compressed payload.
    pub fn into_body_reader(self) -> BodyReader {
        codec::decompress_reader(self.body)
    }

    /// Decompresses the whole body into memory.
    pub async fn body(&self) -> Result<Vec<u8>, CodecError> {
        codec::decompress(&self.body).await
    }
}
