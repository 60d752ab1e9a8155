//! The single-tool dispatcher.
//!
//! One invocation walks `Dispatching -> Fetching -> Extracting -> Resolving ->
//! Inferring -> Assembling` and ends in `Done` or `Failed`. Any failing stage
//! ends the walk; no partial response is built.

use crate::credential;
use crate::extract;
use crate::inference::InferenceDelegate;
use digestpipe_core::{
    Credential, Defaults, Error, FetchBackend, Result, ToolDescriptor, ToolRequest, ToolResponse,
};
use reqwest::header::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

pub const TOOL_NAME: &str = "parse_wechat_article";
pub const TOOL_DESCRIPTION: &str =
    "Fetch a WeChat official-account article and analyze its body text with an LLM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Dispatching,
    Fetching,
    Extracting,
    Resolving,
    Inferring,
    Assembling,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Dispatching => "dispatching",
            Stage::Fetching => "fetching",
            Stage::Extracting => "extracting",
            Stage::Resolving => "resolving",
            Stage::Inferring => "inferring",
            Stage::Assembling => "assembling",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn tool_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: TOOL_NAME,
        description: TOOL_DESCRIPTION,
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Analysis prompt (optional; server default when omitted)"
                },
                "url": {
                    "type": "string",
                    "description": "WeChat article URL (optional; server default when omitted)"
                }
            },
            "required": []
        }),
    }
}

#[derive(Clone)]
pub struct ToolDispatcher {
    defaults: Arc<Defaults>,
    fallback_key: Option<Credential>,
    fetcher: Arc<dyn FetchBackend>,
    inference: InferenceDelegate,
}

impl ToolDispatcher {
    pub fn new(
        defaults: Arc<Defaults>,
        fallback_key: Option<Credential>,
        fetcher: Arc<dyn FetchBackend>,
        inference: InferenceDelegate,
    ) -> Self {
        Self {
            defaults,
            fallback_key,
            fetcher,
            inference,
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![tool_descriptor()]
    }

    /// Run one invocation. `headers` are the active request's metadata (if the
    /// transport has any); they are consulted only by credential resolution.
    #[instrument(skip_all, fields(tool = %name))]
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        headers: Option<&HeaderMap>,
    ) -> Result<ToolResponse> {
        tracing::debug!(stage = %Stage::Idle, "tool call received");
        let t0 = Instant::now();
        let out = self.run(name, arguments, headers).await;
        match &out {
            Ok(_) => tracing::info!(
                stage = %Stage::Done,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "tool call finished"
            ),
            Err(e) => tracing::warn!(
                stage = %Stage::Failed,
                failed_stage = e.stage(),
                error = %e,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "tool call failed"
            ),
        }
        out
    }

    /// Same as [`ToolDispatcher::call_tool`], serialized to the tool's text output.
    pub async fn call_tool_text(
        &self,
        name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        headers: Option<&HeaderMap>,
    ) -> Result<String> {
        Ok(self.call_tool(name, arguments, headers).await?.to_json())
    }

    async fn run(
        &self,
        name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        headers: Option<&HeaderMap>,
    ) -> Result<ToolResponse> {
        tracing::debug!(stage = %Stage::Dispatching);
        if name != TOOL_NAME {
            return Err(Error::UnknownTool(name.to_string()));
        }
        let req = ToolRequest::from_arguments(arguments)?;
        let prompt = req.prompt_or(&self.defaults);
        let url = req.url_or(&self.defaults);

        tracing::debug!(stage = %Stage::Fetching, %url);
        let doc = self.fetcher.fetch(url).await?;

        tracing::debug!(stage = %Stage::Extracting, bytes = doc.body.len());
        let article = extract::extract(&doc.body);
        tracing::debug!(
            title = article.title(),
            content_length = article.content_length(),
            "article extracted"
        );

        tracing::debug!(stage = %Stage::Resolving);
        let key = credential::resolve(headers, self.fallback_key.as_ref())?;

        tracing::debug!(stage = %Stage::Inferring, backend = self.inference.backend_name());
        let parsed_result = self.inference.infer(prompt, article.content(), key).await?;

        tracing::debug!(stage = %Stage::Assembling);
        Ok(ToolResponse {
            prompt: prompt.to_string(),
            parsed_result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use digestpipe_core::{ChatBackend, ChatRequest, FetchedDocument};
    use reqwest::header::{HeaderValue, AUTHORIZATION};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ARTICLE: &str = r#"<html><head><meta property="og:title" content="Deal"></head>
        <body><div id="js_content"><p>Company X closed a Series A.</p></div></body></html>"#;

    struct FakeFetcher {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        status: u16,
        body: &'static str,
    }

    impl FakeFetcher {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                status,
                body,
            })
        }

        fn ok(body: &'static str) -> Arc<Self> {
            Self::new(200, body)
        }

        fn status(status: u16) -> Arc<Self> {
            Self::new(status, "")
        }
    }

    #[async_trait::async_trait]
    impl FetchBackend for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if self.status != 200 {
                return Err(Error::Fetch(format!("HTTP {}", self.status)));
            }
            Ok(FetchedDocument {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                content_type: Some("text/html".to_string()),
                body: self.body.to_string(),
                truncated: false,
                elapsed_ms: 0,
            })
        }
    }

    struct FakeChat {
        calls: AtomicUsize,
        keys: Mutex<Vec<String>>,
        requests: Mutex<Vec<ChatRequest>>,
        reply: Result<String>,
    }

    impl FakeChat {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                keys: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                keys: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                reply: Err(Error::Inference("HTTP 500".to_string())),
            })
        }
    }

    impl ChatBackend for FakeChat {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn complete(&self, req: &ChatRequest, credential: &Credential) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().unwrap().push(credential.expose().to_string());
            self.requests.lock().unwrap().push(req.clone());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(Error::Inference(e.to_string())),
            }
        }
    }

    fn defaults() -> Arc<Defaults> {
        Arc::new(Defaults::new("Default analysis prompt", "https://example.test/default").unwrap())
    }

    fn dispatcher(
        fetcher: Arc<FakeFetcher>,
        chat: Arc<FakeChat>,
        fallback: Option<&str>,
    ) -> ToolDispatcher {
        ToolDispatcher::new(
            defaults(),
            fallback.map(Credential::new),
            fetcher,
            InferenceDelegate::new(chat),
        )
    }

    fn args(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn auth(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn stage_names_are_stable_log_values() {
        let names: Vec<String> = [
            Stage::Idle,
            Stage::Dispatching,
            Stage::Fetching,
            Stage::Extracting,
            Stage::Resolving,
            Stage::Inferring,
            Stage::Assembling,
            Stage::Done,
            Stage::Failed,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            names,
            [
                "idle",
                "dispatching",
                "fetching",
                "extracting",
                "resolving",
                "inferring",
                "assembling",
                "done",
                "failed"
            ]
        );
    }

    #[test]
    fn list_tools_is_single_fixed_descriptor() {
        let d = dispatcher(FakeFetcher::ok(""), FakeChat::replying(""), None);
        let tools = d.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "parse_wechat_article");
        let schema = &tools[0].input_schema;
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["prompt"]["type"], "string");
        assert_eq!(schema["properties"]["url"]["type"], "string");
        assert_eq!(schema["required"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn empty_arguments_use_defaults_and_fallback_key() {
        let fetcher = FakeFetcher::ok(ARTICLE);
        let chat = FakeChat::replying("Company X raised $10M.");
        let d = dispatcher(fetcher.clone(), chat.clone(), Some("env-key"));

        let text = d.call_tool_text(TOOL_NAME, &args(serde_json::json!({})), None).await.unwrap();
        assert_eq!(
            text,
            r#"{"prompt":"Default analysis prompt","parsed_result":"Company X raised $10M."}"#
        );
        assert_eq!(
            fetcher.urls.lock().unwrap().as_slice(),
            ["https://example.test/default"]
        );
        assert_eq!(chat.keys.lock().unwrap().as_slice(), ["env-key"]);
        let reqs = chat.requests.lock().unwrap();
        assert_eq!(
            reqs[0].messages[1].content,
            "Default analysis prompt\n\n---\n\nCompany X closed a Series A."
        );
    }

    #[tokio::test]
    async fn unknown_tool_touches_nothing() {
        let fetcher = FakeFetcher::ok(ARTICLE);
        let chat = FakeChat::replying("x");
        let d = dispatcher(fetcher.clone(), chat.clone(), Some("k"));

        let err = d
            .call_tool("get_forecast", &args(serde_json::json!({})), Some(&auth("Bearer k")))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::UnknownTool(n) if n == "get_forecast"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_stops_before_auth_and_inference() {
        let fetcher = FakeFetcher::status(404);
        let chat = FakeChat::replying("x");
        // No key anywhere: an auth error here would mean resolution ran too early.
        let d = dispatcher(fetcher.clone(), chat.clone(), None);

        let err = d
            .call_tool(
                TOOL_NAME,
                &args(serde_json::json!({ "url": "https://example.test/bad" })),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Fetch(m) if m.contains("404")), "{err}");
        assert_eq!(fetcher.urls.lock().unwrap().as_slice(), ["https://example.test/bad"]);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_inference() {
        let fetcher = FakeFetcher::ok(ARTICLE);
        let chat = FakeChat::replying("x");
        let d = dispatcher(fetcher.clone(), chat.clone(), None);

        let err = d
            .call_tool(TOOL_NAME, &args(serde_json::json!({})), Some(&HeaderMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_header_key_is_stripped_and_preferred() {
        let chat = FakeChat::replying("ok");
        let d = dispatcher(FakeFetcher::ok(ARTICLE), chat.clone(), Some("env-key"));

        d.call_tool(
            TOOL_NAME,
            &args(serde_json::json!({ "prompt": "  Who invested?  " })),
            Some(&auth("Bearer sk-abc123")),
        )
        .await
        .unwrap();
        assert_eq!(chat.keys.lock().unwrap().as_slice(), ["sk-abc123"]);
        assert!(chat.requests.lock().unwrap()[0].messages[1]
            .content
            .starts_with("Who invested?\n\n---\n\n"));
    }

    #[tokio::test]
    async fn inference_failure_yields_no_partial_response() {
        let d = dispatcher(FakeFetcher::ok(ARTICLE), FakeChat::failing(), Some("k"));
        let err = d
            .call_tool_text(TOOL_NAME, &args(serde_json::json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "inference");
    }

    #[tokio::test]
    async fn invalid_argument_types_are_rejected_before_fetch() {
        let fetcher = FakeFetcher::ok(ARTICLE);
        let d = dispatcher(fetcher.clone(), FakeChat::replying("x"), Some("k"));
        let err = d
            .call_tool(TOOL_NAME, &args(serde_json::json!({ "url": 7 })), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_completion_is_a_valid_result() {
        let d = dispatcher(FakeFetcher::ok("<html></html>"), FakeChat::replying(""), Some("k"));
        let resp = d
            .call_tool(TOOL_NAME, &args(serde_json::json!({ "prompt": "p" })), None)
            .await
            .unwrap();
        assert_eq!(resp.prompt, "p");
        assert_eq!(resp.parsed_result, "");
    }

    #[tokio::test]
    async fn identical_upstreams_give_identical_payloads() {
        let d = dispatcher(FakeFetcher::ok(ARTICLE), FakeChat::replying("融资 $10M"), Some("k"));
        let a = args(serde_json::json!({ "prompt": "总结", "url": "https://example.test/a" }));
        let first = d.call_tool_text(TOOL_NAME, &a, None).await.unwrap();
        let second = d.call_tool_text(TOOL_NAME, &a, None).await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(first.contains("融资"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_do_not_share_credentials() {
        let chat = FakeChat::replying("ok");
        let d = dispatcher(FakeFetcher::ok(ARTICLE), chat.clone(), None);

        let mut handles = Vec::new();
        for i in 0..16 {
            let d = d.clone();
            handles.push(tokio::spawn(async move {
                let h = auth(&format!("Bearer key-{i}"));
                d.call_tool(TOOL_NAME, &args(serde_json::json!({})), Some(&h))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut keys = chat.keys.lock().unwrap().clone();
        keys.sort();
        let mut expected: Vec<String> = (0..16).map(|i| format!("key-{i}")).collect();
        expected.sort();
        assert_eq!(keys, expected);
    }
}
