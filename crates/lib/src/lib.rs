//! Rentline messaging core: multi-tenant chat-channel sessions, authenticated
//! webhook ingress with dedup, workflow-first dispatch with a local agent
//! fallback, and per-client conversation state.

pub mod agent;
pub mod cache;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod functions;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod session;
pub mod workflow;
