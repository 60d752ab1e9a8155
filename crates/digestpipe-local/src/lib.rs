use digestpipe_core::{Error, FetchBackend, FetchedDocument, Result, DEFAULT_FETCH_TIMEOUT};
use std::time::{Duration, Instant};

pub mod config;
pub mod credential;
pub mod dispatch;
pub mod extract;
pub mod inference;
pub mod openai_compat;

/// Fixed browser identity sent on every article fetch.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

pub const DEFAULT_FETCH_MAX_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl LocalFetcher {
    pub fn new(timeout: Option<Duration>, max_bytes: Option<u64>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            max_bytes: max_bytes.unwrap_or(DEFAULT_FETCH_MAX_BYTES),
        })
    }
}

#[async_trait::async_trait]
impl FetchBackend for LocalFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
        let t0 = Instant::now();
        let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;

        let resp = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        if status != 200 {
            tracing::warn!(%url, %final_url, status, "fetch returned non-200");
            return Err(Error::Fetch(format!("HTTP {status}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let max_bytes = self.max_bytes as usize;
        let mut truncated = false;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        if truncated {
            tracing::warn!(%url, max_bytes, "response body truncated");
        }

        let body = decode_body(&bytes, content_type.as_deref());
        let elapsed_ms = t0.elapsed().as_millis();
        tracing::debug!(%url, %final_url, bytes = bytes.len(), elapsed_ms, "fetched document");
        Ok(FetchedDocument {
            url: url.to_string(),
            final_url,
            status,
            content_type,
            body,
            truncated,
            elapsed_ms,
        })
    }
}

fn parse_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| v.trim().trim_matches('"'))
    })
}

/// Decode with the `Content-Type` charset when it names a known encoding,
/// otherwise as UTF-8. Invalid sequences become U+FFFD.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let enc = content_type
        .and_then(parse_charset)
        .and_then(|cs| encoding_rs::Encoding::for_label(cs.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = enc.decode(bytes);
    text.into_owned()
}
