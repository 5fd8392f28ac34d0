use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::RwLock;
use tokio_rusqlite::{Connection, params, rusqlite};
use tracing::{debug, warn};

use super::record::CacheRecord;

const SHARD_EXT: &str = ".sqlite";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("sqlite failure: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("cache directory i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp encoding failure: {0}")]
    Time(#[from] time::error::Format),
}

/// Base domain to open shard handle, guarded by a reader/writer lock with a
/// double-checked create-on-miss discipline. Readers never block each other;
/// the write lock is only taken on first access per domain and is held across
/// shard creation so two racing requests cannot create the file twice.
#[derive(Debug)]
pub(super) struct ShardMap {
    dir: PathBuf,
    shards: RwLock<HashMap<String, Connection>>,
}

impl ShardMap {
    pub(super) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Read-only resolution. Opens the newest on-disk generation if one
    /// exists, but never creates a shard file.
    pub(super) async fn open_existing(
        &self,
        base_domain: &str,
    ) -> Result<Option<Connection>, StorageError> {
        if let Some(conn) = self.shards.read().await.get(base_domain) {
            return Ok(Some(conn.clone()));
        }
        let mut shards = self.shards.write().await;
        // Another task may have raced ahead between the two locks.
        if let Some(conn) = shards.get(base_domain) {
            return Ok(Some(conn.clone()));
        }
        match newest_shard_file(&self.dir, base_domain)? {
            Some(path) => {
                let conn = open_shard(&path).await?;
                shards.insert(base_domain.to_string(), conn.clone());
                Ok(Some(conn))
            }
            None => Ok(None),
        }
    }

    /// Get-or-create resolution for writes. A newer dated file dropped into
    /// the shard directory wins over creating a fresh one, which is what
    /// makes manual rotation work.
    pub(super) async fn open_or_create(
        &self,
        base_domain: &str,
    ) -> Result<Connection, StorageError> {
        if let Some(conn) = self.shards.read().await.get(base_domain) {
            return Ok(conn.clone());
        }
        let mut shards = self.shards.write().await;
        if let Some(conn) = shards.get(base_domain) {
            return Ok(conn.clone());
        }
        let path = match newest_shard_file(&self.dir, base_domain)? {
            Some(existing) => existing,
            None => self.dir.join(format!(
                "{base_domain}-{}{SHARD_EXT}",
                shard_timestamp(OffsetDateTime::now_utc())
            )),
        };
        debug!(base_domain, path = %path.display(), "opening cache shard");
        let conn = open_shard(&path).await?;
        shards.insert(base_domain.to_string(), conn.clone());
        Ok(conn)
    }

    /// Retires every generation of the domain's shard; subsequent gets miss
    /// until the domain is refetched.
    pub(super) async fn flush(&self, base_domain: &str) -> Result<(), StorageError> {
        let removed = self.shards.write().await.remove(base_domain);
        if let Some(conn) = removed {
            if let Err(err) = conn.close().await {
                warn!(base_domain, error = %err, "error closing flushed shard");
            }
        }
        for path in shard_files(&self.dir, base_domain)? {
            debug!(path = %path.display(), "removing flushed shard file");
            std::fs::remove_file(&path)?;
            remove_sidecar_files(&path);
        }
        Ok(())
    }

    pub(super) async fn close_all(&self) -> Result<(), StorageError> {
        let shards: Vec<(String, Connection)> = self.shards.write().await.drain().collect();
        for (base_domain, conn) in shards {
            if let Err(err) = conn.close().await {
                warn!(base_domain = %base_domain, error = %err, "error closing shard");
            }
        }
        Ok(())
    }
}

pub(super) async fn fetch_record(
    conn: &Connection,
    key: &str,
) -> Result<Option<CacheRecord>, StorageError> {
    let key = key.to_string();
    let record = conn
        .call(move |conn| {
            let mut stmt = conn.prepare_cached(QUERY_SQL)?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(read_record(row)?)),
                None => Ok(None),
            }
        })
        .await?;
    Ok(record)
}

pub(super) async fn insert_record(
    conn: &Connection,
    record: CacheRecord,
) -> Result<(), StorageError> {
    let created_at = record.created.format(&Rfc3339)?;
    conn.call(move |conn| {
        let mut stmt = conn.prepare_cached(INSERT_SQL)?;
        stmt.execute(params![
            record.key,
            record.url,
            record.base_domain,
            record.content_language,
            record.content_type,
            record.etag,
            record.last_modified,
            record.body,
            record.compressed_length,
            record.content_length,
            record.response_ms,
            record.content_hash,
            created_at,
        ])?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Rows matching the record count for a normalized URL, across all
/// language/type variants.
#[cfg(test)]
pub(super) async fn count_records(conn: &Connection, key: &str) -> Result<i64, StorageError> {
    let key = key.to_string();
    let count = conn
        .call(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM web_resource WHERE normalized_url = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await?;
    Ok(count)
}

async fn open_shard(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path.to_path_buf()).await?;
    conn.call(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute_batch(CREATE_DDL)?;
        Ok(())
    })
    .await?;
    Ok(conn)
}

fn shard_files(dir: &Path, base_domain: &str) -> Result<Vec<PathBuf>, StorageError> {
    let prefix = format!("{base_domain}-");
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(SHARD_EXT) {
            files.push(entry.path());
        }
    }
    // The embedded creation timestamp makes the lexicographically last
    // name the newest generation.
    files.sort();
    Ok(files)
}

fn newest_shard_file(dir: &Path, base_domain: &str) -> Result<Option<PathBuf>, StorageError> {
    Ok(shard_files(dir, base_domain)?.pop())
}

fn remove_sidecar_files(shard_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = shard_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

fn shard_timestamp(now: OffsetDateTime) -> String {
    let now = now.to_offset(time::UtcOffset::UTC);
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, _) = now.to_hms();
    let month_number: u8 = month.into();
    format!("{year:04}-{month_number:02}-{day:02}-{hour:02}{minute:02}")
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRecord> {
    let created_raw: String = row.get(12)?;
    let created = OffsetDateTime::parse(&created_raw, &Rfc3339).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(err))
    })?;

    // The shard schema does not persist status or protocol: only 200-status
    // responses are ever stored, and the protocol is response metadata the
    // hit path reconstructs without.
    Ok(CacheRecord {
        key: row.get(0)?,
        url: row.get(1)?,
        base_domain: row.get(2)?,
        status: 200,
        protocol: String::new(),
        content_language: row.get(3)?,
        content_type: row.get(4)?,
        etag: row.get(5)?,
        last_modified: row.get(6)?,
        body: row.get(7)?,
        compressed_length: row.get(8)?,
        content_length: row.get(9)?,
        response_ms: row.get(10)?,
        content_hash: row.get(11)?,
        created,
    })
}

const CREATE_DDL: &str = "
CREATE TABLE IF NOT EXISTS web_resource (
    normalized_url   TEXT NOT NULL,
    url              TEXT NOT NULL,
    base_domain      TEXT NOT NULL,
    content_language TEXT NOT NULL,
    content_type     TEXT NOT NULL,
    etag             TEXT NOT NULL,
    last_modified    TEXT NOT NULL,
    content          BLOB,
    compressed_size  INTEGER NOT NULL,
    content_length   INTEGER NOT NULL,
    response_ms      REAL NOT NULL,
    content_hash     TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    PRIMARY KEY (normalized_url, content_language, content_type)
);
CREATE INDEX IF NOT EXISTS idx_web_resource_url ON web_resource(url);
CREATE INDEX IF NOT EXISTS idx_web_resource_created_at ON web_resource(created_at);
";

const QUERY_SQL: &str = "SELECT normalized_url, url, base_domain, content_language, \
     content_type, etag, last_modified, content, compressed_size, content_length, \
     response_ms, content_hash, created_at \
     FROM web_resource WHERE normalized_url = ?1 LIMIT 1";

// First successful write for a natural key wins permanently; duplicate
// concurrent stores are a silent no-op, never a replace.
const INSERT_SQL: &str = "INSERT OR IGNORE INTO web_resource (normalized_url, url, \
     base_domain, content_language, content_type, etag, last_modified, content, \
     compressed_size, content_length, response_ms, content_hash, created_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";
