//! `digestpipe` crate (library surface).
//!
//! The primary entrypoint for end users is the `digestpipe` binary (MCP over
//! streamable HTTP or stdio, plus a one-shot `parse` command). The library
//! exposes the MCP handler so it can be embedded or driven in-process.

pub mod server;

pub use digestpipe_core as core;
pub use digestpipe_local as local;

/// Default analysis prompt compiled into the binary.
pub const BUNDLED_PROMPT: &str = include_str!("../prompts/default.prompt");
