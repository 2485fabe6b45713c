//! Atrium: the chat assistant backend for a portfolio website.
//!
//! Visitors ask questions about the site's owner; answers are grounded in
//! stored context retrieved by keyword search and re-ranked by embedding
//! similarity, then streamed back over SSE. The crate is organised around
//! a handful of seams:
//!
//! - [`limiter`] and [`governor`] bound anonymous traffic and per-session
//!   tool use, both against an injected [`clock::Clock`].
//! - [`chunker`], [`embeddings`], and [`ingest`] turn uploaded documents
//!   into embedded context chunks.
//! - [`store`] persists sessions, messages, and context in SQLite.
//! - [`retrieval`] ranks context for a query and exposes it to the model
//!   as a function-calling tool.
//! - [`llm`] defines the provider seam and ships the Gemini streaming
//!   implementation.
//! - [`pipeline`] orchestrates one chat turn end to end; [`http`] is the
//!   axum surface over it.

pub mod chunker;
pub mod clock;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod governor;
pub mod http;
pub mod ingest;
pub mod limiter;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod store;
