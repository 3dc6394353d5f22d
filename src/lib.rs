//! Notula is a terminal companion that captures conversational memory and
//! grounds chat questions in the user's Granola meeting notes.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns configuration, string-keyed persistent storage, the access
//!   credential lifecycle, and the OAuth2/PKCE discovery flow used to obtain
//!   a Granola session.
//! - [`mcp`] provides the JSON-RPC transport for the Granola MCP endpoint,
//!   including decoding of event-stream response bodies.
//! - [`granola`] parses meeting records out of the service's loosely
//!   structured payloads and drives the list/consolidate and chat-grounding
//!   sessions, exposed to hosts through [`granola::bridge`].
//! - [`memory`] persists FIFO conversational memories and context handoffs.
//! - [`compress`] turns chat transcripts into structured handoff documents
//!   via an OpenAI-compatible completion call.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod compress;
pub mod core;
pub mod granola;
pub mod mcp;
pub mod memory;
