//! Metrics HTTP Server
//!
//! Minimal scrape endpoint: `/metrics` (prometheus text), `/health`, and
//! `/pairs` (JSON statistics of every live relay pair).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::relay::RelayEngine;
use crate::shutdown::ShutdownListener;
use crate::Result;

/// HTTP server for serving relay metrics
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
    engine: Arc<RelayEngine>,
    prometheus_enabled: bool,
}

impl MetricsServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        metrics: Arc<Metrics>,
        engine: Arc<RelayEngine>,
        prometheus_enabled: bool,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", bind_addr))?;
        info!(bind_addr = %bind_addr, "Metrics server started");

        Ok(Self {
            listener,
            metrics,
            engine,
            prometheus_enabled,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until shutdown
    pub async fn run(self, mut shutdown: ShutdownListener) {
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = server.listener.accept() => match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(client_addr = %addr, "Metrics request received");
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_request(&mut stream).await {
                                error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept metrics connection"),
                },
                _ = shutdown.recv() => {
                    info!("Metrics server stopping");
                    break;
                }
            }
        }
    }

    async fn handle_request(&self, stream: &mut TcpStream) -> Result<()> {
        // Only the request line matters; one read is enough for a scrape.
        let mut buffer = [0; 1024];
        let bytes_read = stream.read(&mut buffer).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        let request = String::from_utf8_lossy(&buffer[..bytes_read]);
        let path = request
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("GET "))
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or("");

        let response = match path {
            "/metrics" if self.prometheus_enabled => http_response(
                "200 OK",
                "text/plain; version=0.0.4; charset=utf-8",
                &self.metrics.export_prometheus(),
            ),
            "/health" => http_response("200 OK", "text/plain", "OK"),
            "/pairs" => {
                let body = serde_json::to_string(&self.engine.get_active_session_stats())?;
                http_response("200 OK", "application/json", &body)
            }
            _ => http_response("404 Not Found", "text/plain", "Not Found"),
        };

        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}
