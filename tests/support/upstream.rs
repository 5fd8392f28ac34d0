use std::net::Ipv4Addr;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP upstream that counts requests and replies with a canned
/// response.
pub struct MockUpstream {
    listener: TcpListener,
    pub requests: Arc<AtomicUsize>,
    status: u16,
    reason: String,
    headers: String,
    body: Vec<u8>,
}

impl MockUpstream {
    /// 200 response with the given body and extra header lines
    /// (`"Name: value\r\n"` each, possibly empty).
    pub async fn ok(body: impl Into<Vec<u8>>, headers: &str) -> Result<Self> {
        Self::with_status(200, "OK", body, headers).await
    }

    pub async fn with_status(
        status: u16,
        reason: &str,
        body: impl Into<Vec<u8>>,
        headers: &str,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            listener,
            requests: Arc::new(AtomicUsize::new(0)),
            status,
            reason: reason.to_string(),
            headers: headers.to_string(),
            body: body.into(),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port(), path)
    }

    pub fn request_count(&self) -> Arc<AtomicUsize> {
        self.requests.clone()
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (mut socket, _) = self.listener.accept().await?;
            let requests = self.requests.clone();
            let status = self.status;
            let reason = self.reason.clone();
            let headers = self.headers.clone();
            let body = self.body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut data = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                if data.is_empty() {
                    return;
                }

                requests.fetch_add(1, Ordering::SeqCst);

                let response_head = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n{headers}\r\n",
                    body.len(),
                );
                socket.write_all(response_head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                socket.shutdown().await.ok();
            });
        }
    }
}
