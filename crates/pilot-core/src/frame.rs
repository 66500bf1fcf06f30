//! Emulator boundary: button vocabulary, frame validation, and the
//! `FrameSource` trait the coordinator drives.

use std::future::Future;
use std::pin::Pin;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum decoded frame payload accepted as a real screen capture.
///
/// Anything smaller is assumed to be a placeholder or a half-written
/// capture and is rejected with `FrameError::FrameUnavailable`.
pub const MIN_FRAME_BYTES: usize = 1000;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// The externally observable button vocabulary.
///
/// `Wait` is a coordinator-only convention meaning "no input this step";
/// it is never transmitted to a `FrameSource`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Button {
    A,
    B,
    Start,
    Select,
    Up,
    Down,
    Left,
    Right,
    L,
    R,
    Wait,
}

pub const ALL_BUTTONS: [Button; 11] = [
    Button::A,
    Button::B,
    Button::Start,
    Button::Select,
    Button::Up,
    Button::Down,
    Button::Left,
    Button::Right,
    Button::L,
    Button::R,
    Button::Wait,
];

impl Button {
    pub fn name(&self) -> &'static str {
        match self {
            Button::A => "A",
            Button::B => "B",
            Button::Start => "START",
            Button::Select => "SELECT",
            Button::Up => "UP",
            Button::Down => "DOWN",
            Button::Left => "LEFT",
            Button::Right => "RIGHT",
            Button::L => "L",
            Button::R => "R",
            Button::Wait => "WAIT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Button::A),
            "B" => Some(Button::B),
            "START" => Some(Button::Start),
            "SELECT" => Some(Button::Select),
            "UP" => Some(Button::Up),
            "DOWN" => Some(Button::Down),
            "LEFT" => Some(Button::Left),
            "RIGHT" => Some(Button::Right),
            "L" => Some(Button::L),
            "R" => Some(Button::R),
            "WAIT" => Some(Button::Wait),
            _ => None,
        }
    }

    /// Directional pad buttons, used by the wall-collision classifier.
    pub fn is_directional(&self) -> bool {
        matches!(
            self,
            Button::Up | Button::Down | Button::Left | Button::Right
        )
    }
}

impl std::fmt::Display for Button {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Transient: the emulator could not produce a frame right now.
    #[error("frame unavailable: {0}")]
    FrameUnavailable(String),
    /// Terminal: the adapter connection is gone for this run.
    #[error("adapter lost: {0}")]
    AdapterLost(String),
    /// The adapter does not implement this optional operation.
    #[error("operation unsupported by this frame source")]
    Unsupported,
}

/// A validated screen capture: a PNG data URL plus its capture time.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CapturedFrame {
    pub data_url: String,
    pub captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    /// Validates and wraps a data URL. Rejects non-PNG payloads and
    /// anything whose decoded size is below `MIN_FRAME_BYTES`.
    pub fn from_data_url(data_url: impl Into<String>, now: DateTime<Utc>) -> Result<Self, FrameError> {
        let data_url = data_url.into();
        let payload = data_url
            .strip_prefix(PNG_DATA_URL_PREFIX)
            .ok_or_else(|| FrameError::FrameUnavailable("not a png data url".to_string()))?;
        let decoded_len = decoded_base64_len(payload);
        if decoded_len < MIN_FRAME_BYTES {
            return Err(FrameError::FrameUnavailable(format!(
                "frame too small: {decoded_len} bytes"
            )));
        }
        Ok(Self {
            data_url,
            captured_at: now,
        })
    }

    /// The base64 payload without the data URL prefix.
    pub fn payload(&self) -> &str {
        self.data_url
            .strip_prefix(PNG_DATA_URL_PREFIX)
            .unwrap_or(&self.data_url)
    }

    pub fn decode_bytes(&self) -> anyhow::Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.payload())
            .map_err(|e| anyhow::anyhow!("frame payload is not valid base64: {e}"))
    }
}

/// Decoded length of a base64 payload without allocating the decode.
fn decoded_base64_len(payload: &str) -> usize {
    let trimmed = payload.trim_end();
    let padding = trimmed.bytes().rev().take_while(|b| *b == b'=').count();
    (trimmed.len() / 4) * 3 - padding
}

/// Boundary the coordinator uses to read frames and inject inputs.
///
/// All input calls are serialized by the coordinator; implementations only
/// need to guarantee a `press_and_release` with `hold_ms >= 100` is
/// observable to the emulator before the future resolves.
pub trait FrameSource: Send + Sync {
    fn capture<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<CapturedFrame, FrameError>> + Send + 'a>>;

    fn press_and_release<'a>(
        &'a self,
        button: Button,
        hold_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>>;

    fn set_volume<'a>(
        &'a self,
        volume: f32,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>>;

    fn pause<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>>;

    fn resume<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>>;

    fn save_state<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FrameError>> + Send + 'a>>;

    fn load_state<'a>(
        &'a self,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>>;

    /// Optional: read emulator memory. Adapters without this capability
    /// return `FrameError::Unsupported`; callers must not depend on it.
    fn read_memory<'a>(
        &'a self,
        _addr: u32,
        _len: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FrameError>> + Send + 'a>> {
        Box::pin(async { Err(FrameError::Unsupported) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::png_data_url;

    #[test]
    fn frame_below_minimum_is_rejected() {
        let err = CapturedFrame::from_data_url(png_data_url(999), Utc::now()).unwrap_err();
        assert!(matches!(err, FrameError::FrameUnavailable(_)));
    }

    #[test]
    fn frame_above_minimum_is_accepted() {
        let frame = CapturedFrame::from_data_url(png_data_url(1001), Utc::now()).unwrap();
        assert!(frame.data_url.starts_with(PNG_DATA_URL_PREFIX));
    }

    #[test]
    fn non_png_payload_is_rejected() {
        let err =
            CapturedFrame::from_data_url("data:image/jpeg;base64,AAAA", Utc::now()).unwrap_err();
        assert!(matches!(err, FrameError::FrameUnavailable(_)));
    }

    #[test]
    fn decoded_len_accounts_for_padding() {
        let url = png_data_url(1000);
        let frame = CapturedFrame::from_data_url(url, Utc::now()).unwrap();
        assert_eq!(frame.decode_bytes().unwrap().len(), 1000);
    }

    #[test]
    fn button_names_round_trip() {
        for b in ALL_BUTTONS {
            assert_eq!(Button::from_name(b.name()), Some(b));
        }
        assert_eq!(Button::from_name("start"), Some(Button::Start));
        assert_eq!(Button::from_name("turbo"), None);
    }
}
