//! # TaskClaw Gateway
//!
//! Axum server carrying the worker pull protocol (poll / report) and the
//! operator endpoints for queue inspection and on-demand chain runs.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
