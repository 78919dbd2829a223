//! Market-data fan-out gateway. `main.rs` wires these modules into a single
//! axum `Router`; exposed as a library too so `project_tests` can exercise
//! them directly without spawning a separate process.

pub mod abuse;
pub mod admin;
pub mod audit;
pub mod broadcast;
pub mod config;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod multiplexer;
pub mod resolve;
pub mod rest;
pub mod state;
pub mod ws;
