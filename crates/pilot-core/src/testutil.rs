//! Shared fakes for module tests: scripted frame sources and model
//! clients, mirroring the queue-of-results style used across the crate.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use base64::Engine;
use chrono::Utc;

use crate::frame::{Button, CapturedFrame, FrameError, FrameSource};
use crate::model::{ModelClient, ModelReply, ModelRequest, TokenUsage};

/// A valid PNG data URL whose decoded payload is `decoded_len` bytes.
pub fn png_data_url(decoded_len: usize) -> String {
    png_data_url_with(decoded_len, 0)
}

/// Like `png_data_url`, but seeded so different seeds produce different
/// fingerprints.
pub fn png_data_url_with(decoded_len: usize, seed: u8) -> String {
    let bytes: Vec<u8> = (0..decoded_len).map(|i| (i as u8).wrapping_add(seed)).collect();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

#[derive(Default)]
pub struct FakeModel {
    replies: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

enum Script {
    Text(String, Option<TokenUsage>),
    Error(String),
    Stall,
}

impl FakeModel {
    pub fn push_text(&self, text: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Script::Text(text.to_string(), None));
    }

    pub fn push_text_with_usage(&self, text: &str, usage: TokenUsage) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Script::Text(text.to_string(), Some(usage)));
    }

    pub fn push_error(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Script::Error(message.to_string()));
    }

    /// The next call never resolves (exercises timeout paths).
    pub fn stall_next(&self) {
        self.replies.lock().unwrap().push_back(Script::Stall);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelClient for FakeModel {
    fn complete<'a>(
        &'a self,
        request: ModelRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ModelReply>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let script = self.replies.lock().unwrap().pop_front();
            match script {
                Some(Script::Text(text, usage)) => Ok(ModelReply { text, usage }),
                Some(Script::Error(message)) => anyhow::bail!("{message}"),
                Some(Script::Stall) => {
                    futures_never().await;
                    unreachable!()
                }
                None => anyhow::bail!("no model reply queued"),
            }
        })
    }
}

async fn futures_never() {
    std::future::pending::<()>().await
}

#[derive(Default)]
pub struct FakeFrameSource {
    frames: Mutex<VecDeque<Result<String, FrameError>>>,
    pressed: Mutex<Vec<(Button, u64)>>,
    save_states: Mutex<VecDeque<Result<Vec<u8>, FrameError>>>,
    loaded: Mutex<Vec<Vec<u8>>>,
}

impl FakeFrameSource {
    pub fn push_frame(&self, data_url: String) {
        self.frames.lock().unwrap().push_back(Ok(data_url));
    }

    pub fn push_frame_error(&self, err: FrameError) {
        self.frames.lock().unwrap().push_back(Err(err));
    }

    pub fn push_save_state(&self, bytes: Vec<u8>) {
        self.save_states.lock().unwrap().push_back(Ok(bytes));
    }

    pub fn pressed(&self) -> Vec<(Button, u64)> {
        self.pressed.lock().unwrap().clone()
    }

    pub fn loaded(&self) -> Vec<Vec<u8>> {
        self.loaded.lock().unwrap().clone()
    }
}

impl FrameSource for FakeFrameSource {
    fn capture<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<CapturedFrame, FrameError>> + Send + 'a>> {
        Box::pin(async move {
            let next = self
                .frames
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FrameError::FrameUnavailable("no frame queued".into())));
            let data_url = next?;
            CapturedFrame::from_data_url(data_url, Utc::now())
        })
    }

    fn press_and_release<'a>(
        &'a self,
        button: Button,
        hold_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.pressed.lock().unwrap().push((button, hold_ms));
            Ok(())
        })
    }

    fn set_volume<'a>(
        &'a self,
        _volume: f32,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn pause<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn resume<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn save_state<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.save_states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FrameError::Unsupported))
        })
    }

    fn load_state<'a>(
        &'a self,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FrameError>> + Send + 'a>> {
        Box::pin(async move {
            self.loaded.lock().unwrap().push(state);
            Ok(())
        })
    }
}
