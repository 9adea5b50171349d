//! smartscale autoscaler library.
//!
//! This crate primarily ships an `autoscaler` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod clients;
pub mod config;
pub mod drain;
pub mod engine;
pub mod orchestrator;
pub mod placement;
pub mod retry;
pub mod state;
pub mod store;
pub mod ticker;
