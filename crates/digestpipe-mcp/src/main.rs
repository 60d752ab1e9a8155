use anyhow::Result;
use clap::{Parser, Subcommand};
use digestpipe::server::{self, DigestMcp};
use digestpipe::BUNDLED_PROMPT;
use digestpipe_local::config::{self, PromptSource, Settings};
use digestpipe_local::dispatch::TOOL_NAME;
use std::net::{IpAddr, SocketAddr};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "digestpipe")]
#[command(about = "Article fetch + LLM digest as an MCP tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve MCP over streamable HTTP (per-request `Authorization` header).
    McpHttp(McpHttpCmd),
    /// Serve MCP over stdio (fallback API key only).
    McpStdio,
    /// Run the tool once and print the JSON payload.
    Parse(ParseCmd),
    /// Report configuration (json; no secrets).
    Doctor,
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct McpHttpCmd {
    /// Bind host.
    #[arg(long, env = "DIGESTPIPE_HTTP_HOST", default_value = server::DEFAULT_HTTP_HOST)]
    host: IpAddr,
    /// Bind port.
    #[arg(long, env = "DIGESTPIPE_HTTP_PORT", default_value_t = server::DEFAULT_HTTP_PORT)]
    port: u16,
    /// Mount path of the MCP endpoint.
    #[arg(long, default_value = server::DEFAULT_HTTP_PATH)]
    path: String,
}

#[derive(clap::Args, Debug)]
struct ParseCmd {
    /// Article URL (default: DIGESTPIPE_DEFAULT_URL or the bundled default).
    #[arg(long)]
    url: Option<String>,
    /// Analysis prompt (default: DIGESTPIPE_PROMPT_FILE or the bundled prompt).
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Optional env-file loader (`DIGESTPIPE_ENV_FILE`).
///
/// Sets a variable only if the process environment does not already have it,
/// and never logs values.
fn load_env_file() {
    let Ok(p) = std::env::var("DIGESTPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn init_tracing() {
    // stdout carries MCP frames (stdio) and JSON output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn doctor_report() -> serde_json::Value {
    let mut v = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "name": "digestpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "tool": TOOL_NAME,
    });
    match Settings::from_env(BUNDLED_PROMPT) {
        Ok(s) => {
            let prompt_source = match &s.prompt_source {
                PromptSource::Bundled => "bundled".to_string(),
                PromptSource::File(p) => p.display().to_string(),
            };
            v["ok"] = serde_json::json!(s.defaults().is_ok());
            // Only report booleans / key names, never values.
            v["configured"] = serde_json::json!({
                "fallback_api_key": s.fallback_api_key.is_some(),
                "fallback_api_key_vars": config::API_KEY_VARS
                    .iter()
                    .map(|k| serde_json::json!({ "name": k, "set": config::has_env(k) }))
                    .collect::<Vec<_>>(),
                "default_url": s.default_url,
                "prompt_source": prompt_source,
                "fetch": {
                    "timeout_ms": s.fetch_timeout.as_millis() as u64,
                    "max_bytes": s.fetch_max_bytes,
                },
                "llm": {
                    "base_url": s.llm_base_url,
                    "model": s.llm_model,
                },
            });
        }
        Err(e) => {
            v["ok"] = serde_json::json!(false);
            v["error"] = serde_json::json!(e.to_string());
        }
    }
    v
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::McpHttp(args) => {
            let settings = Settings::from_env(BUNDLED_PROMPT)?;
            let svc = DigestMcp::from_settings(&settings)?;
            server::serve_http(svc, SocketAddr::new(args.host, args.port), &args.path).await?;
        }
        Commands::McpStdio => {
            let settings = Settings::from_env(BUNDLED_PROMPT)?;
            let svc = DigestMcp::from_settings(&settings)?;
            server::serve_stdio(svc).await?;
        }
        Commands::Parse(args) => {
            let settings = Settings::from_env(BUNDLED_PROMPT)?;
            let svc = DigestMcp::from_settings(&settings)?;
            let mut arguments = serde_json::Map::new();
            if let Some(u) = args.url {
                arguments.insert("url".to_string(), u.into());
            }
            if let Some(p) = args.prompt {
                arguments.insert("prompt".to_string(), p.into());
            }
            let text = svc
                .dispatcher()
                .call_tool_text(TOOL_NAME, &arguments, None)
                .await?;
            println!("{text}");
        }
        Commands::Doctor => {
            println!("{}", doctor_report());
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "digestpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("digestpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }

    Ok(())
}
