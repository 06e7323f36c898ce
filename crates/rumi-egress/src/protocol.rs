// SPDX-License-Identifier: MIT OR Apache-2.0
//! Egress wire protocol: 4-byte big-endian length prefix, then JSON.

use rumi_core::{ErrorKind, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Methods the proxy will forward.
pub const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];

/// Caps on request headers.
pub const MAX_HEADER_COUNT: usize = 64;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;

/// Request a pack sends over its socket.
#[derive(Debug, Clone, Deserialize)]
pub struct EgressRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

/// Response sent back over the socket.
#[derive(Debug, Clone, Serialize)]
pub struct EgressResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub latency_ms: f64,
    pub redirect_hops: u32,
    pub bytes_read: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
}

impl EgressResponse {
    /// A denial carrying the generic message; detail goes to audit only.
    pub fn denied(kind: ErrorKind, latency_ms: f64) -> Self {
        Self {
            success: false,
            status_code: None,
            headers: None,
            body: None,
            error: Some("Request blocked".into()),
            error_type: Some(kind.as_str().to_string()),
            latency_ms,
            redirect_hops: 0,
            bytes_read: 0,
            final_url: None,
        }
    }
}

/// Validate the parts of a request that need no network access.
/// Returns the parsed method on success.
pub fn validate_request(req: &EgressRequest) -> Result<(), KernelError> {
    let method = req.method.to_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(KernelError::new(
            ErrorKind::InvalidRequest,
            format!("method not allowed: {}", req.method),
        ));
    }
    if req.headers.len() > MAX_HEADER_COUNT {
        return Err(KernelError::new(
            ErrorKind::InvalidRequest,
            format!("too many headers (max {MAX_HEADER_COUNT})"),
        ));
    }
    for (name, value) in &req.headers {
        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "header name too long",
            ));
        }
        let text = value.as_str().unwrap_or_default();
        if text.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(KernelError::new(
                ErrorKind::InvalidRequest,
                "header value too long",
            ));
        }
    }
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Value, KernelError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| KernelError::internal(format!("read frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(KernelError::new(
            ErrorKind::PayloadTooLarge,
            format!("frame too large: {len} > {MAX_FRAME_BYTES}"),
        ));
    }
    if len == 0 {
        return Ok(Value::Object(Map::new()));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| KernelError::internal(format!("read frame payload: {e}")))?;
    serde_json::from_slice(&payload).map_err(KernelError::from)
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<S: AsyncWriteExt + Unpin, T: Serialize>(
    stream: &mut S,
    value: &T,
) -> Result<(), KernelError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(KernelError::new(
            ErrorKind::PayloadTooLarge,
            "response frame too large",
        ));
    }
    let len = (payload.len() as u32).to_be_bytes();
    stream
        .write_all(&len)
        .await
        .map_err(|e| KernelError::internal(format!("write frame: {e}")))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| KernelError::internal(format!("write frame: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| KernelError::internal(format!("flush frame: {e}")))?;
    Ok(())
}
