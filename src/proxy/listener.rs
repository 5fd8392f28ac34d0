use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::{Method, StatusCode, header::HOST};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::logging::AccessLogBuilder;

use super::AppContext;
use super::codec;
use super::pipeline::{self, ProxyRequest};
use super::response::{ProxyResponse, X_CACHE};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    info!(address = %local_addr, "proxy listener started");
    serve(listener, app).await
}

/// Accept loop: one spawned task per connection, no admission control.
/// Shutdown is cooperative: stop accepting on ctrl-c, drain in-flight
/// requests up to the configured period, then close every open shard.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                }
                let connection_app = app.clone();
                connections.spawn(async move {
                    if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
                // Reap finished connection tasks as we go.
                while connections.try_join_next().is_some() {}
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received; draining in-flight requests");
                break;
            }
        }
    }

    drain(&mut connections, app.settings.shutdown_drain()).await;
    if let Err(err) = app.cache.close_all().await {
        warn!(error = %err, "error closing cache");
    }
    info!("proxy stopped");
    Ok(())
}

async fn drain(connections: &mut JoinSet<()>, period: Duration) {
    let all_done = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(period, all_done).await.is_err() {
        warn!(
            remaining = connections.len(),
            "drain period elapsed; aborting remaining connections"
        );
        connections.abort_all();
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let start = Instant::now();

    let head = match codec::read_request_head(&mut reader, app.settings.max_header_size).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()), // closed without sending a request
        Err(err) => {
            let response = ProxyResponse::text(StatusCode::BAD_REQUEST, err.to_string());
            let stream = reader.get_mut();
            let _ = codec::write_response(stream, response, false, app.settings.client_timeout())
                .await;
            let _ = stream.shutdown().await;
            return Err(err);
        }
    };

    let host = head
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = ProxyRequest {
        method: head.method,
        target: head.target,
        host,
        headers: head.headers,
    };

    let response = pipeline::handle_request(&app, &request).await;

    let status = response.status;
    let disposition = response
        .headers
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase());

    let head_only = request.method == Method::HEAD;
    let stream = reader.get_mut();
    let written =
        codec::write_response(stream, response, head_only, app.settings.client_timeout()).await?;
    let _ = stream.shutdown().await;

    let mut log = AccessLogBuilder::new(peer)
        .method(request.method.as_str())
        .url(&request.target)
        .status(status)
        .bytes_out(written)
        .elapsed(start.elapsed());
    if let Some(disposition) = disposition {
        log = log.cache(disposition);
    }
    log.log();

    Ok(())
}
