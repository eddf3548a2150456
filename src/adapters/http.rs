//! HTTP/HTTPS client adapter (implements [`HttpClientPort`]).
//!
//! - **`target_os = "espidf"`** — `esp_idf_svc::http::client::EspHttpConnection`
//!   with the bundled root CA store attached (`esp_crt_bundle_attach`), so
//!   `https://` URLs verify the usual way without per-fleet certificate
//!   pinning.
//! - **`not(target_os = "espidf"))`** — a scripted byte-stream stub for
//!   host-side tests, fed a status/headers/body fixture up front.

use crate::error::{OtaError, Result};
use crate::ports::{HttpClientPort, HttpResponseInfo};

#[cfg(target_os = "espidf")]
pub struct EspHttpAdapter {
    conn: Option<esp_idf_svc::http::client::EspHttpConnection>,
}

#[cfg(target_os = "espidf")]
impl EspHttpAdapter {
    pub fn new() -> Self {
        Self { conn: None }
    }
}

#[cfg(target_os = "espidf")]
impl Default for EspHttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl HttpClientPort for EspHttpAdapter {
    fn open(&mut self, url: &str, timeout_ms: u32) -> Result<HttpResponseInfo> {
        use embedded_svc::http::Method;
        use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection, FollowRedirectsPolicy};

        let mut conn = EspHttpConnection::new(&HttpConfig {
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            timeout: Some(core::time::Duration::from_millis(timeout_ms as u64)),
            follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
            buffer_size: Some(4096),
            ..Default::default()
        })
        .map_err(|_| OtaError::TransportTransient)?;

        conn.initiate_request(Method::Get, url, &[])
            .map_err(|_| OtaError::TransportTransient)?;
        conn.initiate_response().map_err(|_| OtaError::TransportTransient)?;

        let status = conn.status();
        let content_length = conn.header("Content-Length").and_then(|v| v.parse().ok());
        self.conn = Some(conn);
        Ok(HttpResponseInfo { status, content_length })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use embedded_svc::io::Read;
        let Some(conn) = self.conn.as_mut() else {
            return Err(OtaError::InvalidState);
        };
        Read::read(conn, buf).map_err(|_| OtaError::TransportTransient)
    }

    fn close(&mut self) {
        self.conn = None;
    }
}

/// Scripted HTTP stub for host-side tests: returns a fixed status/headers
/// once, then streams the given body in caller-sized chunks.
#[cfg(not(target_os = "espidf"))]
pub struct StubHttpClient {
    status: u16,
    content_length: Option<u32>,
    body: Vec<u8>,
    cursor: usize,
    opened: bool,
}

#[cfg(not(target_os = "espidf"))]
impl StubHttpClient {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        let content_length = Some(body.len() as u32);
        Self {
            status,
            content_length,
            body,
            cursor: 0,
            opened: false,
        }
    }

    /// Omit `Content-Length` from the simulated response, as a server might.
    pub fn without_content_length(mut self) -> Self {
        self.content_length = None;
        self
    }

    /// Lie about the body length, to exercise the mismatch-detection path.
    pub fn with_declared_length(mut self, len: u32) -> Self {
        self.content_length = Some(len);
        self
    }
}

#[cfg(not(target_os = "espidf"))]
impl HttpClientPort for StubHttpClient {
    fn open(&mut self, _url: &str, _timeout_ms: u32) -> Result<HttpResponseInfo> {
        self.opened = true;
        self.cursor = 0;
        Ok(HttpResponseInfo {
            status: self.status,
            content_length: self.content_length,
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.opened {
            return Err(OtaError::InvalidState);
        }
        let remaining = &self.body[self.cursor..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.opened = false;
    }
}
