use digestpipe_core::{ChatBackend, ChatMessage, ChatRequest, Credential, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

pub const DEFAULT_BASE_URL: &str = "https://api.xiaomimimo.com/v1";
pub const DEFAULT_MODEL: &str = "mimo-v2-flash";

/// Sampling knobs sent with every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_completion_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_completion_tokens: 1024,
            temperature: 0.3,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// Blocking OpenAI-compatible `chat/completions` client.
///
/// `base_url` already includes the API version segment (e.g. `.../v1`).
/// The underlying `reqwest::blocking::Client` is built on the first
/// [`ChatBackend::complete`] call (a blocking thread) and shared by clones.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    params: SamplingParams,
    http: Arc<OnceLock<reqwest::blocking::Client>>,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            params: SamplingParams::default(),
            http: Arc::default(),
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn http(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(c) = self.http.get() {
            return Ok(c);
        }
        // No request timeout; the blocking builder defaults to 30s.
        let built = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| Error::Inference(e.to_string()))?;
        Ok(self.http.get_or_init(|| built))
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn body<'a>(&'a self, req: &'a ChatRequest) -> ChatCompletionsRequest<'a> {
        ChatCompletionsRequest {
            model: &self.model,
            messages: &req.messages,
            max_completion_tokens: self.params.max_completion_tokens,
            temperature: self.params.temperature,
            top_p: self.params.top_p,
            stream: false,
            stop: None,
            frequency_penalty: self.params.frequency_penalty,
            presence_penalty: self.params.presence_penalty,
            thinking: Thinking { kind: "disabled" },
        }
    }
}

impl ChatBackend for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    fn complete(&self, req: &ChatRequest, credential: &Credential) -> Result<String> {
        let resp = self
            .http()?
            .post(self.endpoint_chat_completions())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .bearer_auth(credential.expose())
            .json(&self.body(req))
            .send()
            .map_err(|e| Error::Inference(e.without_url().to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Inference(format!(
                "openai_compat chat.completions HTTP {status}"
            )));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .map_err(|e| Error::Inference(e.without_url().to_string()))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_completion_tokens: u64,
    temperature: f64,
    top_p: f64,
    stream: bool,
    stop: Option<Vec<String>>,
    frequency_penalty: f64,
    presence_penalty: f64,
    thinking: Thinking,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
