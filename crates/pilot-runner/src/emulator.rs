//! Frame source over an emulator control socket: newline-delimited
//! JSON requests, one reply per line.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use pilot_core::frame::{Button, CapturedFrame, FrameError, FrameSource};

struct ControlConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Connects the coordinator to an emulator's control port. The
/// connection is serialized behind a lock; the coordinator never issues
/// concurrent calls anyway.
pub struct RemoteFrameSource {
    conn: Mutex<ControlConn>,
}

pub(crate) fn capture_request() -> Value {
    json!({ "op": "capture" })
}

pub(crate) fn press_request(button: Button, hold_ms: u64) -> Value {
    json!({ "op": "press", "button": button.name(), "holdMs": hold_ms })
}

pub(crate) fn set_volume_request(volume: f32) -> Value {
    json!({ "op": "set_volume", "volume": volume })
}

pub(crate) fn save_state_request() -> Value {
    json!({ "op": "save_state" })
}

pub(crate) fn load_state_request(state: &[u8]) -> Value {
    json!({
        "op": "load_state",
        "state": base64::engine::general_purpose::STANDARD.encode(state),
    })
}

pub(crate) fn read_memory_request(addr: u32, len: usize) -> Value {
    json!({ "op": "read_memory", "addr": addr, "len": len })
}

impl RemoteFrameSource {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect emulator control port {addr}"))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            conn: Mutex::new(ControlConn {
                reader: BufReader::new(read),
                writer: write,
            }),
        })
    }

    async fn request_json(&self, req: Value) -> Result<Value, FrameError> {
        let line = format!("{req}\n");
        let mut conn = self.conn.lock().await;
        conn.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FrameError::AdapterLost(format!("control write: {e}")))?;
        conn.writer.flush().await.ok();

        let mut resp_line = String::new();
        let n = conn
            .reader
            .read_line(&mut resp_line)
            .await
            .map_err(|e| FrameError::AdapterLost(format!("control read: {e}")))?;
        if n == 0 {
            return Err(FrameError::AdapterLost(
                "control connection closed".to_string(),
            ));
        }
        serde_json::from_str(resp_line.trim())
            .map_err(|e| FrameError::FrameUnavailable(format!("invalid control response: {e}")))
    }

    /// Sends a request and unwraps the `ok` envelope. An explicit
    /// `unsupported` error maps to `FrameError::Unsupported`.
    async fn expect_ok(&self, req: Value) -> Result<Value, FrameError> {
        let v = self.request_json(req).await?;
        if v.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = v
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown control error");
            if error == "unsupported" {
                return Err(FrameError::Unsupported);
            }
            return Err(FrameError::FrameUnavailable(error.to_string()));
        }
        Ok(v)
    }

    fn field_bytes(v: &Value, field: &str) -> Result<Vec<u8>, FrameError> {
        let encoded = v
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| FrameError::FrameUnavailable(format!("missing {field} field")))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| FrameError::FrameUnavailable(format!("{field} is not valid base64: {e}")))
    }
}

impl FrameSource for RemoteFrameSource {
    fn capture<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<CapturedFrame, FrameError>> + Send + 'a>> {
        Box::pin(async move {
            let v = self.expect_ok(capture_request()).await?;
            let frame = v
                .get("frame")
                .and_then(Value::as_str)
                .ok_or_else(|| FrameError::FrameUnavailable("missing frame field".to_string()))?;
            CapturedFrame::from_data_url(frame, Utc::now())
        })
    }

    fn press_and_release<'a>(
        &'a self,
        button: Button,
        hold_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.expect_ok(press_request(button, hold_ms)).await?;
            Ok(())
        })
    }

    fn set_volume<'a>(
        &'a self,
        volume: f32,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.expect_ok(set_volume_request(volume)).await?;
            Ok(())
        })
    }

    fn pause<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.expect_ok(json!({ "op": "pause" })).await?;
            Ok(())
        })
    }

    fn resume<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.expect_ok(json!({ "op": "resume" })).await?;
            Ok(())
        })
    }

    fn save_state<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FrameError>> + Send + 'a>> {
        Box::pin(async move {
            let v = self.expect_ok(save_state_request()).await?;
            Self::field_bytes(&v, "state")
        })
    }

    fn load_state<'a>(
        &'a self,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.expect_ok(load_state_request(&state)).await?;
            Ok(())
        })
    }

    fn read_memory<'a>(
        &'a self,
        addr: u32,
        len: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FrameError>> + Send + 'a>> {
        Box::pin(async move {
            let v = self.expect_ok(read_memory_request(addr, len)).await?;
            Self::field_bytes(&v, "bytes")
        })
    }
}
