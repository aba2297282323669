//! Forwards CLI commands to a running daemon.
//!
//! Used when the state store is locked by `fleetgridd run`: the command is
//! sent to the daemon's control API and executed there.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::api::ApiResponse;
use crate::commands::Request;

pub async fn forward(addr: SocketAddr, timeout: Duration, request: &Request) -> anyhow::Result<String> {
    tokio::time::timeout(timeout, send(addr, request))
        .await
        .map_err(|_| anyhow!("daemon at {addr} did not answer within {timeout:?}"))?
}

async fn send(addr: SocketAddr, request: &Request) -> anyhow::Result<String> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("state store is locked and no daemon answers at {addr}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "control API connection closed");
        }
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/api/v1/commands"))
        .header("host", addr.to_string())
        .header("content-type", "application/json")
        .header("user-agent", concat!("fleetgridd/", env!("CARGO_PKG_VERSION")))
        .body(Full::new(Bytes::from(serde_json::to_vec(request)?)))?;

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();

    let reply: ApiResponse<String> = serde_json::from_slice(&body).map_err(|_| {
        anyhow!("daemon answered {status}: {}", String::from_utf8_lossy(&body))
    })?;
    if reply.success {
        Ok(reply.data.unwrap_or_default())
    } else {
        Err(anyhow!(reply.error.unwrap_or_else(|| status.to_string())))
    }
}
