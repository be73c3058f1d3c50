//! Parley core library — conversation model, LLM backends, persistence,
//! and the turn coordinator used by the CLI.

pub mod config;
pub mod conversation;
pub mod init;
pub mod llm;
pub mod metadata;
pub mod store;
pub mod turn;
