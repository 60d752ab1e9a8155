use digestpipe_core::{ChatBackend, ChatRequest, Credential, Error, Result};
use std::sync::Arc;
use std::time::Instant;

pub const SYSTEM_PROMPT: &str = "You are MiMo, an AI assistant developed by Xiaomi. \
Today is date: Tuesday, December 16, 2025. \
Your knowledge cutoff date is December 2024.";

/// User turn: caller prompt, a separator, then the article body.
pub fn user_message(prompt: &str, content: &str) -> String {
    format!("{prompt}\n\n---\n\n{content}")
}

/// Runs the blocking chat backend on tokio's blocking pool so the serving
/// loop keeps polling other sessions while a completion is outstanding.
#[derive(Clone)]
pub struct InferenceDelegate {
    backend: Arc<dyn ChatBackend>,
}

impl InferenceDelegate {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn infer(&self, prompt: &str, content: &str, credential: Credential) -> Result<String> {
        let backend = self.backend.clone();
        let req = ChatRequest::system_user(SYSTEM_PROMPT, user_message(prompt, content));
        let t0 = Instant::now();
        let out = tokio::task::spawn_blocking(move || backend.complete(&req, &credential))
            .await
            .map_err(|e| Error::Inference(format!("inference worker join failed: {e}")))??;
        tracing::debug!(
            backend = self.backend.name(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            chars = out.chars().count(),
            "inference finished"
        );
        Ok(out)
    }
}
