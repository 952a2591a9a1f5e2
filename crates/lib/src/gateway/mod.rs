//! Webhook ingress and dashboard-facing session endpoints.

pub mod auth;
pub mod protocol;
pub mod server;

pub use server::{build_router, run_gateway, AppState};
