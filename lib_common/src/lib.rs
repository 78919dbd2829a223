//! Shared provider, cache, batching, and persistence primitives for the
//! market-data gateway.
//!
//! This crate owns everything that isn't specific to one network surface:
//! the broker provider abstraction and its two concrete adapters, the
//! distributed per-endpoint request gate, the two-tier LTP cache, the
//! per-second request batcher, api-key validation/usage tracking, and the
//! relational/shared-store connection wrappers. The `gateway` binary wires
//! these into its WebSocket and REST surfaces.

pub mod batch;
pub mod cache;
pub mod connections;
pub mod error;
pub mod http;
pub mod model;
pub mod provider;
pub mod usage;

pub use error::{GatewayError, Result};
