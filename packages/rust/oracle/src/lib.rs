//! Judgment oracle gateway for Errata.
//!
//! Every expensive natural-language judgment (error analysis, cluster
//! generation, classification) goes through the [`Oracle`] trait. The
//! production implementation ([`OracleClient`]) talks to an OpenAI-compatible
//! chat-completions endpoint behind one process-wide worker gate; the
//! [`MockOracle`] answers offline with deterministic canned judgments.

pub mod client;
pub mod mock;
pub mod prompts;

pub use client::{Oracle, OracleClient, OracleResponse};
pub use mock::MockOracle;
pub use prompts::PromptLibrary;
