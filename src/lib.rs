//! Zero-downtime consolidation of per-tenant search indices.
//!
//! The crate moves every tenant's documents into one versioned destination
//! index through an ordered pipeline of idempotent steps: resolve, block
//! writes, back up, copy, verify, clean up. A status document in the cluster
//! serves as the distributed run lock, and every step with a durable effect
//! carries a compensation so a failed run rolls the cluster back to its
//! pre-migration state.

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod repository;
pub mod status;
pub mod steps;
