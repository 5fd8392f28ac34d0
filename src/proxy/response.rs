use bytes::Bytes;
use http::header::{CONTENT_LANGUAGE, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::AsyncRead;

use crate::cache::CacheRecord;
use crate::util::fixed_utc_timestamp;

/// Cache-disposition marker attached to every successful response.
pub const X_CACHE: &str = "x-cache";
/// Capture timestamp of the served record, fixed-precision UTC.
pub const X_CACHE_TIMESTAMP: &str = "x-cache-timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDisposition {
    Hit,
    Miss,
    Flushed,
}

impl CacheDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheDisposition::Hit => "HIT",
            CacheDisposition::Miss => "MISS",
            CacheDisposition::Flushed => "FLUSHED",
        }
    }
}

/// The response object handed back to the transport layer for transmission.
pub struct ProxyResponse {
    pub status: StatusCode,
    /// Overrides the canonical reason phrase when surfacing an upstream
    /// status verbatim.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Lazily produced body of known decoded length.
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: u64,
    },
}

impl ResponseBody {
    pub fn length(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Full(bytes) => bytes.len() as u64,
            ResponseBody::Stream { length, .. } => *length,
        }
    }
}

impl ProxyResponse {
    /// Shapes a plain-text response; every pipeline failure ends up here.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            reason: None,
            headers,
            body: ResponseBody::Full(Bytes::from(message.into())),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_cache(mut self, disposition: CacheDisposition) -> Self {
        self.headers
            .insert(X_CACHE, HeaderValue::from_static(disposition.as_str()));
        self
    }
}

/// Response headers reconstructed from record metadata. Each header is
/// emitted only when the corresponding field is non-empty.
pub fn record_headers(record: &CacheRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_nonempty(&mut headers, CONTENT_TYPE, &record.content_type);
    set_nonempty(&mut headers, ETAG, &record.etag);
    set_nonempty(&mut headers, LAST_MODIFIED, &record.last_modified);
    set_nonempty(&mut headers, CONTENT_LANGUAGE, &record.content_language);
    set_nonempty(
        &mut headers,
        HeaderName::from_static(X_CACHE_TIMESTAMP),
        &fixed_utc_timestamp(record.created),
    );
    headers
}

fn set_nonempty(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRecord, RecordMeta};
    use time::macros::datetime;

    async fn record_with_meta(meta: RecordMeta) -> CacheRecord {
        CacheRecord::build(
            "http://example.com/x",
            meta,
            b"body",
            1.0,
            datetime!(2026-08-07 10:00:00.250 UTC),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn emits_only_nonempty_metadata() {
        let record = record_with_meta(RecordMeta {
            status: 200,
            content_type: "text/html".to_string(),
            etag: "\"abc123\"".to_string(),
            ..RecordMeta::default()
        })
        .await;

        let headers = record_headers(&record);
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get("etag").unwrap(), "\"abc123\"");
        assert!(headers.get("last-modified").is_none());
        assert!(headers.get("content-language").is_none());
        assert_eq!(
            headers.get(X_CACHE_TIMESTAMP).unwrap(),
            "2026-08-07T10:00:00.250Z"
        );
    }

    #[test]
    fn text_response_has_plain_body() {
        let response = ProxyResponse::text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            .with_cache(CacheDisposition::Miss);
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers.get(X_CACHE).unwrap(), "MISS");
        assert_eq!(response.body.length(), "Method not allowed".len() as u64);
    }
}
