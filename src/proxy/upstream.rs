use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use thiserror::Error;
use tracing::debug;

use crate::settings::Settings;

/// Retrying origin-fetch client.
///
/// Two underlying clients are built at startup: one validating certificates
/// normally, one skipping validation for requests that explicitly opt in.
/// Both negotiate transfer encoding themselves, so decompression of
/// transport-level encodings never becomes the pipeline's problem.
pub struct UpstreamClient {
    secure: reqwest::Client,
    insecure: reqwest::Client,
    retry_max: u32,
    wait_min: Duration,
    wait_max: Duration,
    max_body_size: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("body exceeds maximum size of {limit} bytes")]
    BodyTooLarge { limit: usize },
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub protocol: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Upstream fetch latency in milliseconds, retries included.
    pub response_ms: f64,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            secure: build_client(settings, false)?,
            insecure: build_client(settings, true)?,
            retry_max: settings.retry_max,
            wait_min: settings.retry_wait_min(),
            wait_max: settings.retry_wait_max(),
            max_body_size: settings.max_body_size,
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        headers: HeaderMap,
        insecure: bool,
    ) -> Result<UpstreamResponse, FetchError> {
        let client = if insecure { &self.insecure } else { &self.secure };
        let started = Instant::now();

        let response = self.send_with_retries(client, url, headers).await?;
        let status = response.status();
        let protocol = protocol_name(response.version()).to_string();
        let resp_headers = response.headers().clone();
        let body = self.read_bounded_body(response).await?;
        let response_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(UpstreamResponse {
            status,
            protocol,
            headers: resp_headers,
            body,
            response_ms,
        })
    }

    async fn send_with_retries(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, FetchError> {
        let mut wait = self.wait_min;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match client.get(url).headers(headers.clone()).send().await {
                Ok(response) if !retryable_status(response.status()) => return Ok(response),
                Ok(response) if attempt > self.retry_max => return Ok(response),
                Ok(response) => {
                    debug!(url, status = %response.status(), attempt, "retrying upstream fetch");
                }
                Err(err) if err.is_builder() || attempt > self.retry_max => {
                    return Err(err.into());
                }
                Err(err) => {
                    debug!(url, error = %err, attempt, "retrying upstream fetch");
                }
            }
            tokio::time::sleep(wait).await;
            wait = (wait * 2).min(self.wait_max);
        }
    }

    async fn read_bounded_body(&self, mut response: reqwest::Response) -> Result<Bytes, FetchError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_body_size {
                // Discard the remainder of the stream; nothing over the
                // limit is cached.
                return Err(FetchError::BodyTooLarge {
                    limit: self.max_body_size,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Transient failures worth another attempt: throttling and server errors,
/// except 501 which no retry will fix.
fn retryable_status(status: StatusCode) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED
}

fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP",
    }
}

fn build_client(settings: &Settings, insecure: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(settings.upstream_timeout())
        .use_rustls_tls()
        .gzip(true)
        .brotli(true)
        .deflate(true);

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &settings.upstream_proxy {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy)
                .with_context(|| format!("invalid upstream proxy url '{proxy}'"))?,
        );
    }

    builder.build().context("failed to build upstream HTTP client")
}
