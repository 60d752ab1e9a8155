use anyhow::Context;
use digestpipe_core::ToolDescriptor;
use digestpipe_local::config::Settings;
use digestpipe_local::dispatch::ToolDispatcher;
use digestpipe_local::inference::InferenceDelegate;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    transport::stdio,
    transport::streamable_http_server::session::local::LocalSessionManager,
    transport::StreamableHttpService,
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8523;
pub const DEFAULT_HTTP_PATH: &str = "/mcp";

#[derive(Clone)]
pub struct DigestMcp {
    dispatcher: ToolDispatcher,
}

impl DigestMcp {
    pub fn new(dispatcher: ToolDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let defaults = settings.defaults().context("building defaults")?;
        let fetcher = settings.fetcher().context("building fetcher")?;
        let inference = InferenceDelegate::new(Arc::new(settings.chat_client()));
        Ok(Self::new(ToolDispatcher::new(
            Arc::new(defaults),
            settings.fallback_api_key.clone(),
            Arc::new(fetcher),
            inference,
        )))
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    fn tools(&self) -> Vec<Tool> {
        self.dispatcher
            .list_tools()
            .into_iter()
            .map(rmcp_tool)
            .collect()
    }
}

fn rmcp_tool(d: ToolDescriptor) -> Tool {
    let schema = match d.input_schema {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    Tool::new(d.name, d.description, Arc::new(schema))
}

/// Headers of the HTTP request carrying this MCP message, when there is one.
///
/// The streamable-HTTP transport attaches `http::request::Parts` to every
/// request it forwards; stdio sessions have none.
fn request_headers(ctx: &RequestContext<RoleServer>) -> Option<&http::HeaderMap> {
    ctx.extensions
        .get::<http::request::Parts>()
        .map(|parts| &parts.headers)
}

impl ServerHandler for DigestMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Fetches a WeChat article and returns {prompt, parsed_result} as JSON text. \
                 Pass the LLM API key as `Authorization: Bearer <key>` on the HTTP transport."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        let headers = request_headers(&context);
        match self
            .dispatcher
            .call_tool_text(&request.name, &arguments, headers)
            .await
        {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(e) if e.is_caller_error() => Err(McpError::invalid_params(e.to_string(), None)),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

/// Streamable-HTTP MCP endpoint nested at `path`, plus `GET /health`.
pub fn http_router(server: DigestMcp, path: &str) -> anyhow::Result<axum::Router> {
    if !path.starts_with('/') || path == "/" {
        anyhow::bail!("mount path must start with '/' and not be the root: {path:?}");
    }
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    Ok(axum::Router::new()
        .nest_service(path, service)
        .route("/health", axum::routing::get(health)))
}

async fn health() -> &'static str {
    "OK"
}

pub async fn serve_http(server: DigestMcp, addr: SocketAddr, path: &str) -> anyhow::Result<()> {
    let app = http_router(server, path)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let local = listener.local_addr()?;
    tracing::info!(url = %format!("http://{local}{path}"), "MCP streamable HTTP listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn serve_stdio(server: DigestMcp) -> anyhow::Result<()> {
    let running = server.serve(stdio()).await?;
    tracing::info!("MCP stdio session started");
    // Keep the stdio server alive until the client closes.
    let reason = running.waiting().await?;
    tracing::info!(?reason, "MCP stdio session ended");
    Ok(())
}
