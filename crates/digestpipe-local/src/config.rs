use crate::openai_compat::{self, OpenAiCompatClient};
use crate::{LocalFetcher, DEFAULT_FETCH_MAX_BYTES};
use digestpipe_core::{Credential, Defaults, Error, Result, DEFAULT_FETCH_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_URL: &str = "https://mp.weixin.qq.com/s/8KiDOoosF4cMyOOEltq28g";

/// Names checked (in order) for the process-wide fallback API key.
pub const API_KEY_VARS: &[&str] = &["DIGESTPIPE_API_KEY", "MIMO_API_KEY"];

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env(key)
        .map(|s| {
            s.parse::<u64>()
                .map_err(|e| Error::NotConfigured(format!("{key}={s:?}: {e}")))
        })
        .transpose()
}

pub fn has_env(key: &str) -> bool {
    env(key).is_some()
}

/// Everything the server needs, read once before serving.
#[derive(Debug, Clone)]
pub struct Settings {
    pub default_url: String,
    /// Prompt text; `prompt_source` says where it came from.
    pub default_prompt: String,
    pub prompt_source: PromptSource,
    pub fallback_api_key: Option<Credential>,
    pub fetch_timeout: Duration,
    pub fetch_max_bytes: u64,
    pub llm_base_url: String,
    pub llm_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Bundled,
    File(PathBuf),
}

impl Settings {
    /// `bundled_prompt` is the compiled-in default, used unless
    /// `DIGESTPIPE_PROMPT_FILE` points somewhere else.
    pub fn from_env(bundled_prompt: &str) -> Result<Self> {
        let (default_prompt, prompt_source) = match env("DIGESTPIPE_PROMPT_FILE") {
            Some(p) => {
                let path = PathBuf::from(p);
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    Error::NotConfigured(format!("prompt file {}: {e}", path.display()))
                })?;
                (text, PromptSource::File(path))
            }
            None => (bundled_prompt.to_string(), PromptSource::Bundled),
        };

        let fallback_api_key = API_KEY_VARS.iter().find_map(|k| env(k)).map(Credential::new);

        Ok(Self {
            default_url: env("DIGESTPIPE_DEFAULT_URL").unwrap_or_else(|| DEFAULT_URL.to_string()),
            default_prompt,
            prompt_source,
            fallback_api_key,
            fetch_timeout: env_u64("DIGESTPIPE_FETCH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FETCH_TIMEOUT),
            fetch_max_bytes: env_u64("DIGESTPIPE_FETCH_MAX_BYTES")?
                .unwrap_or(DEFAULT_FETCH_MAX_BYTES),
            llm_base_url: env("DIGESTPIPE_OPENAI_COMPAT_BASE_URL")
                .unwrap_or_else(|| openai_compat::DEFAULT_BASE_URL.to_string()),
            llm_model: env("DIGESTPIPE_OPENAI_COMPAT_MODEL")
                .unwrap_or_else(|| openai_compat::DEFAULT_MODEL.to_string()),
        })
    }

    pub fn defaults(&self) -> Result<Defaults> {
        Defaults::new(self.default_prompt.clone(), self.default_url.clone())
    }

    pub fn fetcher(&self) -> Result<LocalFetcher> {
        LocalFetcher::new(Some(self.fetch_timeout), Some(self.fetch_max_bytes))
    }

    pub fn chat_client(&self) -> OpenAiCompatClient {
        OpenAiCompatClient::new(self.llm_base_url.clone(), self.llm_model.clone())
    }
}
