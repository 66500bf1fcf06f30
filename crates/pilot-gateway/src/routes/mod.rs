pub mod assets;
pub mod control;
pub mod decide;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use pilot_core::model::{ModelClient, ModelReply, ModelRequest};
    use pilot_core::store::{MemoryBlobStore, MemoryKv};

    use crate::server::AppState;

    /// Model stub that always answers with the queued pair of replies
    /// (screen phase, then decision phase), repeating forever.
    pub struct LoopingModel {
        pub screen: String,
        pub decision: String,
        calls: std::sync::Mutex<usize>,
    }

    impl LoopingModel {
        pub fn new(screen: &str, decision: &str) -> Self {
            Self {
                screen: screen.to_string(),
                decision: decision.to_string(),
                calls: std::sync::Mutex::new(0),
            }
        }
    }

    impl ModelClient for LoopingModel {
        fn complete<'a>(
            &'a self,
            _request: ModelRequest,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = anyhow::Result<ModelReply>> + Send + 'a>,
        > {
            Box::pin(async move {
                let mut calls = self.calls.lock().unwrap();
                let text = if *calls % 2 == 0 {
                    self.screen.clone()
                } else {
                    self.decision.clone()
                };
                *calls += 1;
                Ok(ModelReply { text, usage: None })
            })
        }
    }

    pub fn state() -> AppState {
        state_with_model(Arc::new(LoopingModel::new(
            r#"{"screenType":"overworld","briefDescription":"d"}"#,
            r#"{"gameState":{"area":"pallet-town"},"decision":{"screenAnalysis":"s","reasoning":"r","buttonSequence":[{"A":0.9}],"progressConfidence":0.5}}"#,
        )))
    }

    pub fn state_with_model(model: Arc<dyn ModelClient>) -> AppState {
        AppState::new(
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryBlobStore::new()),
            model,
        )
    }

    pub fn png_data_url(decoded_len: usize) -> String {
        use base64::Engine;
        let bytes = vec![7u8; decoded_len];
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }
}
