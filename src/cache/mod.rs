mod codec;
mod key;
mod record;
mod store;

pub use codec::{BodyReader, CodecError};
pub use key::{KeyError, NormalizedKey, base_domain_name, normalize_key};
pub use record::{CacheRecord, RecordError, RecordMeta};
pub use store::StorageError;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use store::ShardMap;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Expected control-flow signal, not a failure: the URL is not cached.
    #[error("cache miss")]
    Miss,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The Get/Put/Flush contract composing the URL normalizer, record codec,
/// and domain-sharded store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Looks up the record for a URL. Absence of the shard or the row is a
    /// [`CacheError::Miss`]; any other failure is a storage error and must
    /// not be treated as a miss.
    async fn get(&self, uri: &str) -> Result<CacheRecord, CacheError>;

    /// Persists a record. Idempotent per natural key: the first write wins,
    /// later duplicates succeed as silent no-ops.
    async fn put(&self, record: CacheRecord) -> Result<(), CacheError>;

    /// Invalidates every cached record for the URL's base domain.
    async fn flush(&self, uri: &str) -> Result<(), CacheError>;

    /// Closes every open shard handle; used once at shutdown.
    async fn close_all(&self) -> Result<(), CacheError>;
}

/// Persistent cache backed by one SQLite shard per base domain, lazily
/// created and discoverable from the filesystem across restarts.
pub struct SqliteCache {
    shards: ShardMap,
}

impl SqliteCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            shards: ShardMap::new(dir),
        }
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, uri: &str) -> Result<CacheRecord, CacheError> {
        let normalized = normalize_key(uri)?;
        let conn = match self.shards.open_existing(&normalized.base_domain).await? {
            Some(conn) => conn,
            None => return Err(CacheError::Miss),
        };
        match store::fetch_record(&conn, &normalized.key).await? {
            Some(record) => Ok(record),
            None => Err(CacheError::Miss),
        }
    }

    async fn put(&self, record: CacheRecord) -> Result<(), CacheError> {
        let conn = self.shards.open_or_create(&record.base_domain).await?;
        store::insert_record(&conn, record).await?;
        Ok(())
    }

    async fn flush(&self, uri: &str) -> Result<(), CacheError> {
        let normalized = normalize_key(uri)?;
        self.shards.flush(&normalized.base_domain).await?;
        Ok(())
    }

    async fn close_all(&self) -> Result<(), CacheError> {
        self.shards.close_all().await?;
        Ok(())
    }
}
