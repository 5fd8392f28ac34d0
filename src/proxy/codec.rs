use std::time::Duration;

use anyhow::{Context, Result, bail};
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

use super::response::{ProxyResponse, ResponseBody};

/// Parsed request line and header block of one inbound HTTP/1.1 request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
}

/// Reads one request head, bounded by `max_header_size` total bytes.
/// Returns `None` on a clean EOF before any request bytes.
pub async fn read_request_head<R>(
    reader: &mut R,
    max_header_size: usize,
) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut budget = max_header_size;

    let n = read_limited_line(reader, &mut line, budget).await?;
    if n == 0 {
        return Ok(None);
    }
    budget -= n.min(budget);

    let request_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("empty request line")?;
    let target = parts.next().context("request line missing target")?;
    let version = parts.next().context("request line missing HTTP version")?;
    if parts.next().is_some() {
        bail!("malformed request line '{request_line}'");
    }
    if !version.starts_with("HTTP/") {
        bail!("unsupported protocol '{version}'");
    }

    let method: Method = method
        .parse()
        .with_context(|| format!("invalid method '{method}'"))?;
    let target = target.to_string();

    let mut headers = HeaderMap::new();
    loop {
        line.clear();
        let n = read_limited_line(reader, &mut line, budget).await?;
        if n == 0 {
            bail!("unexpected end of stream in request headers");
        }
        budget -= n.min(budget);

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .with_context(|| format!("malformed header line '{trimmed}'"))?;
        let name: HeaderName = name
            .trim()
            .parse()
            .with_context(|| format!("invalid header name '{}'", name.trim()))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid value for header '{name}'"))?;
        headers.append(name, value);
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

async fn read_limited_line<R>(reader: &mut R, buf: &mut String, remaining: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    if remaining == 0 {
        bail!("request head exceeds maximum size");
    }
    // `read_line` is unbounded on its own; `take` enforces the head budget.
    let mut limited = reader.take(remaining as u64 + 2);
    let n = limited
        .read_line(buf)
        .await
        .context("reading request head")?;
    if n > remaining {
        bail!("request head exceeds maximum size");
    }
    Ok(n)
}

/// Serializes a response and writes it to the client. The body is skipped
/// for HEAD, but `Content-Length` still reports the full representation
/// size. Returns the number of bytes written.
pub async fn write_response<W>(
    stream: &mut W,
    response: ProxyResponse,
    head_only: bool,
    timeout_dur: Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let ProxyResponse {
        status,
        reason,
        mut headers,
        body,
    } = response;

    let reason_text = reason
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown"));

    if !headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.length()));
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason_text);
    for (name, value) in &headers {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    timeout_with_context(
        timeout_dur,
        stream.write_all(head.as_bytes()),
        "writing response head",
    )
    .await?;
    let mut written = head.len() as u64;

    if !head_only {
        match body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => {
                timeout_with_context(
                    timeout_dur,
                    stream.write_all(&bytes),
                    "writing response body",
                )
                .await?;
                written += bytes.len() as u64;
            }
            ResponseBody::Stream { mut reader, .. } => {
                let copied = timeout_with_context(
                    timeout_dur,
                    tokio::io::copy(&mut reader, stream),
                    "writing response body",
                )
                .await?;
                written += copied;
            }
        }
    }

    timeout_with_context(timeout_dur, stream.flush(), "flushing response").await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use tokio::io::BufReader;

    async fn parse(input: &str) -> Result<Option<RequestHead>> {
        let mut reader = BufReader::new(input.as_bytes());
        read_request_head(&mut reader, 32 * 1024).await
    }

    #[tokio::test]
    async fn parses_a_simple_request() {
        let head = parse("GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nX-Cache-Reject: sold out\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.com/x");
        assert_eq!(head.headers.get("host").unwrap(), "example.com");
        assert_eq!(head.headers.get("x-cache-reject").unwrap(), "sold out");
    }

    #[tokio::test]
    async fn repeated_headers_accumulate() {
        let head = parse(
            "GET / HTTP/1.1\r\nHost: h\r\nX-Cache-Reject: a\r\nX-Cache-Reject: b\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        let values: Vec<_> = head.headers.get_all("x-cache-reject").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        assert!(parse("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        assert!(parse("GET / HTTP/1.1\r\nHost: h\r\n").await.is_err());
    }

    #[tokio::test]
    async fn malformed_request_line_is_an_error() {
        assert!(parse("GET /\r\n\r\n").await.is_err());
        assert!(parse("GET / HTTP/1.1 extra\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn oversized_head_is_an_error() {
        let mut request = String::from("GET / HTTP/1.1\r\n");
        for i in 0..2000 {
            request.push_str(&format!("X-Filler-{i}: {}\r\n", "v".repeat(64)));
        }
        request.push_str("\r\n");
        let mut reader = BufReader::new(request.as_bytes());
        let err = read_request_head(&mut reader, 1024).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn writes_a_full_response() {
        let response = ProxyResponse {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Full(Bytes::from_static(b"hello")),
        };
        let mut out = Vec::new();
        let written = write_response(&mut out, response, false, Duration::from_secs(5))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
        assert_eq!(written, text.len() as u64);
    }

    #[tokio::test]
    async fn head_requests_omit_the_body_but_keep_the_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(5u64));
        let response = ProxyResponse {
            status: StatusCode::OK,
            reason: None,
            headers,
            body: ResponseBody::Empty,
        };
        let mut out = Vec::new();
        write_response(&mut out, response, true, Duration::from_secs(5))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn custom_reason_is_used_verbatim() {
        let response = ProxyResponse {
            status: StatusCode::IM_A_TEAPOT,
            reason: Some("I'm a teapot".to_string()),
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        };
        let mut out = Vec::new();
        write_response(&mut out, response, false, Duration::from_secs(5))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 418 I'm a teapot\r\n"));
    }
}
