//! HTTP long-poll transport.
//!
//! No persistent socket: every outgoing frame is POSTed and the response
//! body carries the next incoming frame. The engine keeps a request parked
//! server-side via `http_wait` so updates can be pushed without a socket.

use std::io;

use crate::connection::ConnectionConfig;

/// Stateless HTTP channel to one data center.
pub struct HttpLink {
    client: reqwest::Client,
    url: String,
}

impl HttpLink {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}:{}/api", config.ip, config.port),
        }
    }

    /// POST one wire frame and return the response body.
    ///
    /// An HTTP error status is translated into the protocol's 4-byte
    /// transport-error frame (for example 404 becomes `-404`), so the
    /// receive path classifies it like a TCP-level error code.
    pub async fn roundtrip(&self, frame: Vec<u8>) -> io::Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(frame)
            .send()
            .await
            .map_err(io::Error::other)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "http transport error status");
            return Ok((-(status.as_u16() as i32)).to_le_bytes().to_vec());
        }
        let body = response.bytes().await.map_err(io::Error::other)?;
        Ok(body.to_vec())
    }
}
