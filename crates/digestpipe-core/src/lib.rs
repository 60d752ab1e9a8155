use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("fetch failed: invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("auth failed: {0}")]
    Auth(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Pipeline stage that produced this error (stable, machine-readable).
    pub fn stage(&self) -> &'static str {
        match self {
            Error::UnknownTool(_) | Error::InvalidArguments(_) => "dispatch",
            Error::InvalidUrl(_) | Error::Fetch(_) => "fetch",
            Error::Auth(_) => "auth",
            Error::Inference(_) => "inference",
            Error::NotConfigured(_) => "config",
        }
    }

    /// Caller mistakes (as opposed to upstream/network failures).
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::UnknownTool(_) | Error::InvalidArguments(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque per-invocation secret.
///
/// `Debug`/`Display` never print the value; use [`Credential::expose`] at the
/// single place that puts it on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Process-wide defaults, built once before serving and shared read-only.
#[derive(Debug, Clone, Serialize)]
pub struct Defaults {
    pub prompt: String,
    pub url: String,
}

impl Defaults {
    pub fn new(prompt: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let prompt = prompt.into().trim().to_string();
        let url = url.into().trim().to_string();
        if prompt.is_empty() {
            return Err(Error::NotConfigured("default prompt is empty".to_string()));
        }
        url::Url::parse(&url)
            .map_err(|e| Error::NotConfigured(format!("default url {url:?}: {e}")))?;
        Ok(Self { prompt, url })
    }
}

/// Tool arguments as sent by the caller. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ToolRequest {
    pub fn from_arguments(arguments: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(arguments.clone()))
            .map_err(|e| Error::InvalidArguments(e.to_string()))
    }

    /// Prompt actually used: the trimmed argument, or the default when blank.
    pub fn prompt_or<'a>(&'a self, defaults: &'a Defaults) -> &'a str {
        non_blank(self.prompt.as_deref()).unwrap_or(&defaults.prompt)
    }

    pub fn url_or<'a>(&'a self, defaults: &'a Defaults) -> &'a str {
        non_blank(self.url.as_deref()).unwrap_or(&defaults.url)
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Structured fields pulled out of an article page.
///
/// Fields are private so `content_length` can only come from [`ParsedArticle::new`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ParsedArticle {
    title: String,
    author: String,
    publish_time: String,
    content: String,
    content_length: usize,
}

impl ParsedArticle {
    pub fn new(title: String, author: String, publish_time: String, content: String) -> Self {
        let content_length = content.chars().count();
        Self {
            title,
            author,
            publish_time,
            content,
            content_length,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn publish_time(&self) -> &str {
        &self.publish_time
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length of `content` in Unicode scalar values.
    pub fn content_length(&self) -> usize {
        self.content_length
    }
}

/// Final tool payload. Built only when every stage succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResponse {
    pub prompt: String,
    pub parsed_result: String,
}

impl ToolResponse {
    pub fn to_json(&self) -> String {
        // A struct of two Strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
    pub elapsed_ms: u128,
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    /// One GET, no retries. Non-200 maps to [`Error::Fetch`].
    async fn fetch(&self, url: &str) -> Result<FetchedDocument>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn system_user(system: &str, user: String) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
        }
    }
}

/// Blocking chat-completion backend.
///
/// Implementations may block the calling thread for the whole upstream round
/// trip; async callers must go through a worker (see `spawn_blocking`).
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn complete(&self, req: &ChatRequest, credential: &Credential) -> Result<String>;
}

/// Upper bound used by fetch backends when no explicit timeout is given.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
