use http::header::{CONTENT_LANGUAGE, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheError, CacheRecord, RecordMeta};
use crate::settings::Scheme;

use super::AppContext;
use super::headers;
use super::response::{CacheDisposition, ProxyResponse, ResponseBody, record_headers};
use super::upstream::FetchError;

/// A decoded inbound request as handed over by the interception layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Absolute URL or origin-form path, as it appeared on the request line.
    pub target: String,
    /// Host header, used to absolutize origin-form targets.
    pub host: Option<String>,
    pub headers: HeaderMap,
}

/// Evaluates one request against the cache, fetching from origin on a miss.
/// Every failure is shaped into a status-coded response; nothing escapes as
/// an unhandled fault.
pub async fn handle_request(app: &AppContext, request: &ProxyRequest) -> ProxyResponse {
    if request.method != Method::GET && request.method != Method::HEAD {
        return ProxyResponse::text(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method not allowed ({})", request.method),
        );
    }

    let uri = match resolve_target(
        &request.target,
        request.host.as_deref(),
        app.settings.fallback_scheme,
    ) {
        Ok(uri) => uri,
        Err(message) => return ProxyResponse::text(StatusCode::BAD_REQUEST, message),
    };

    if headers::flush_requested(&request.headers) {
        return flush(app, &uri).await;
    }

    match app.cache.get(&uri).await {
        Ok(record) => hit_response(&request.method, record),
        Err(CacheError::Miss) => fetch_and_cache(app, request, &uri).await,
        Err(CacheError::Key(err)) => ProxyResponse::text(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            // Storage failures are fatal for this request, never a miss.
            warn!(url = %uri, error = %err, "cache lookup failed");
            ProxyResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Absolutizes the request target. Proxy-style requests may arrive with a
/// host-relative target and a separate Host header.
fn resolve_target(target: &str, host: Option<&str>, fallback: Scheme) -> Result<String, String> {
    match Url::parse(target) {
        Ok(url) if url.has_host() => return Ok(url.into()),
        Ok(_) => return Err(format!("unsupported request target '{target}'")),
        Err(url::ParseError::RelativeUrlWithoutBase) => {}
        Err(err) => return Err(format!("invalid request target '{target}': {err}")),
    }

    let host =
        host.ok_or_else(|| format!("request target '{target}' requires a Host header"))?;
    let base = Url::parse(&format!("{}://{}", fallback.as_str(), host))
        .map_err(|err| format!("invalid host '{host}': {err}"))?;
    let resolved = base
        .join(target)
        .map_err(|err| format!("invalid request target '{target}': {err}"))?;
    Ok(resolved.into())
}

async fn flush(app: &AppContext, uri: &str) -> ProxyResponse {
    match app.cache.flush(uri).await {
        Ok(()) => {
            debug!(url = %uri, "flushed cached entries for domain");
            ProxyResponse::text(StatusCode::OK, "Flushed").with_cache(CacheDisposition::Flushed)
        }
        Err(CacheError::Key(err)) => ProxyResponse::text(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            warn!(url = %uri, error = %err, "cache flush failed");
            ProxyResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Reconstructs a response from a stored record. Reject rules are not
/// re-applied to hits.
fn hit_response(method: &Method, record: CacheRecord) -> ProxyResponse {
    let mut headers = record_headers(&record);
    let length = record.content_length as u64;
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));

    let body = if *method == Method::HEAD {
        ResponseBody::Empty
    } else {
        ResponseBody::Stream {
            reader: Box::new(record.into_body_reader()),
            length,
        }
    };

    ProxyResponse {
        status: StatusCode::OK,
        reason: None,
        headers,
        body,
    }
    .with_cache(CacheDisposition::Hit)
}

async fn fetch_and_cache(app: &AppContext, request: &ProxyRequest, uri: &str) -> ProxyResponse {
    let outbound = headers::outbound_headers(&request.headers);
    let insecure = headers::insecure_requested(&request.headers);
    if insecure {
        debug!(url = %uri, "certificate validation disabled for this fetch");
    }

    let fetched = match app.upstream.fetch(uri, outbound, insecure).await {
        Ok(fetched) => fetched,
        Err(FetchError::BodyTooLarge { limit }) => {
            return ProxyResponse::text(
                StatusCode::PRECONDITION_FAILED,
                format!(
                    "Body exceeds maximum size ({})",
                    crate::util::byte_count_decimal(limit as u64)
                ),
            );
        }
        Err(FetchError::Transport(err)) => {
            warn!(url = %uri, error = %err, "upstream request failed");
            return ProxyResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upstream request failed: {err}"),
            );
        }
    };

    if fetched.status != StatusCode::OK {
        // Only 200s are cached; anything else is surfaced verbatim.
        let reason = fetched
            .status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();
        return ProxyResponse::text(
            fetched.status,
            format!(
                "Upstream server returned status {} {}",
                fetched.status.as_u16(),
                reason
            ),
        )
        .with_reason(reason);
    }

    let patterns = headers::reject_patterns(&request.headers);
    let matchers = match app.rules.get_all(&patterns) {
        Ok(matchers) => matchers,
        Err(err) => {
            return ProxyResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to compile X-Cache-Reject pattern: {err}"),
            );
        }
    };
    for (matcher, pattern) in matchers.iter().zip(&patterns) {
        if matcher.is_match(&fetched.body) {
            return ProxyResponse::text(
                StatusCode::PRECONDITION_FAILED,
                format!("Content rejected by match: {pattern}"),
            );
        }
    }

    let meta = RecordMeta {
        status: fetched.status.as_u16(),
        protocol: fetched.protocol.clone(),
        content_language: header_string(&fetched.headers, CONTENT_LANGUAGE.as_str()),
        content_type: header_string(&fetched.headers, CONTENT_TYPE.as_str()),
        etag: header_string(&fetched.headers, ETAG.as_str()),
        last_modified: header_string(&fetched.headers, LAST_MODIFIED.as_str()),
    };

    let record = match CacheRecord::build(
        uri,
        meta,
        &fetched.body,
        fetched.response_ms,
        OffsetDateTime::now_utc(),
    )
    .await
    {
        Ok(record) => record,
        Err(err) => {
            warn!(url = %uri, error = %err, "failed to build cache record");
            return ProxyResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    let mut headers = record_headers(&record);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(record.content_length as u64));

    if let Err(err) = app.cache.put(record).await {
        warn!(url = %uri, error = %err, "cache store failed");
        return ProxyResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    let body = if request.method == Method::HEAD {
        ResponseBody::Empty
    } else {
        ResponseBody::Full(fetched.body)
    };

    ProxyResponse {
        status: StatusCode::OK,
        reason: None,
        headers,
        body,
    }
    .with_cache(CacheDisposition::Miss)
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
