//! Decision-loop core for vision-model-driven emulator agents: frame
//! source boundary, persistence seams, heuristics, and the per-agent
//! coordinator.

pub mod agent;
pub mod config;
pub mod frame;
pub mod model;
pub mod savestate;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
