#![allow(dead_code)]

pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use packrat::{
    cache::{Cache, SqliteCache},
    cli::LogFormat,
    proxy::{AppContext, listener, upstream::UpstreamClient},
    rules::RuleCache,
    settings::{Scheme, Settings},
};

pub fn test_settings(cache_dir: PathBuf) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        cache_dir,
        log: LogFormat::Text,
        fallback_scheme: Scheme::Http,
        max_body_size: 64 * 1024 * 1024,
        max_header_size: 32 * 1024,
        client_timeout: 10,
        upstream_timeout: 5,
        // No retries by default so error-path tests stay fast.
        retry_max: 0,
        retry_wait_min: 1,
        retry_wait_max: 1,
        shutdown_drain: 2,
        upstream_proxy: None,
    }
}

pub struct ProxyHarness {
    _cache_dir: TempDir,
    pub cache_path: PathBuf,
    pub addr: SocketAddr,
    pub app: AppContext,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(mutate: impl FnOnce(&mut Settings)) -> Result<Self> {
        let cache_dir = TempDir::new()?;
        let cache_path = cache_dir.path().to_path_buf();
        let mut settings = test_settings(cache_path.clone());
        mutate(&mut settings);
        let settings = Arc::new(settings);

        let cache: Arc<dyn Cache> = Arc::new(SqliteCache::new(settings.cache_dir.clone()));
        let rules = Arc::new(RuleCache::new());
        let upstream_client = Arc::new(UpstreamClient::new(&settings)?);
        let app = AppContext::new(settings, cache, rules, upstream_client);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let serve_app = app.clone();
        let handle = tokio::spawn(async move {
            let _ = listener::serve(listener, serve_app).await;
        });

        Ok(Self {
            _cache_dir: cache_dir,
            cache_path,
            addr,
            app,
            handle,
        })
    }

    /// Names of shard files currently on disk.
    pub fn shard_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.cache_path)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(|s| s.to_string()))
            .filter(|name| name.ends_with(".sqlite"))
            .collect();
        names.sort();
        names
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a raw request and reads the whole response (the proxy closes the
/// connection after each response).
pub async fn send_raw(addr: SocketAddr, raw: &str) -> Result<RawResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw.as_bytes()).await?;

    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    parse_response(&data)
}

/// Issues a proxy-style request with an absolute-form target.
pub async fn proxy_request(
    addr: SocketAddr,
    method: &str,
    url: &str,
    extra_headers: &[(&str, &str)],
) -> Result<RawResponse> {
    let mut raw = format!("{method} {url} HTTP/1.1\r\n");
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    send_raw(addr, &raw).await
}

fn parse_response(data: &[u8]) -> Result<RawResponse> {
    let split = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("response has no header terminator")?;
    let head = std::str::from_utf8(&data[..split]).context("response head is not UTF-8")?;
    let body = data[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("missing status line")?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(anyhow!("malformed status line '{status_line}'"));
    }
    let status: u16 = parts
        .next()
        .context("status line missing code")?
        .parse()
        .context("unparseable status code")?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RawResponse {
        status,
        reason,
        headers,
        body,
    })
}
