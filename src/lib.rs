//! Tandem is a chat client engine for working with remote LLM backends over
//! a streaming event protocol, optionally fanning a single user turn out to
//! several models at once for side-by-side comparison.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversation state, per-turn orchestration, the tool-call
//!   delta reducer, per-target history construction, and the streaming
//!   transport that feeds typed events back into the engine.
//! - [`api`] defines the wire payloads exchanged with the backend: the
//!   outgoing chat request and the inbound discriminated event union.
//! - [`cli`] provides the one-shot binary flow (send a prompt, print the
//!   streamed reply and any comparison results).
//! - [`utils`] holds small shared helpers.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`) and
//! routes through [`crate::cli::run`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
