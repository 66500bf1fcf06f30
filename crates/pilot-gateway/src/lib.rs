//! HTTP surface for the agent loops: decide, liveness, persisted state,
//! checkpoints, frames, and notes.

pub mod error;
pub mod routes;
pub mod server;

pub use server::{router, serve, AppState};
