//! Shared building blocks of the vigil agents.
//!
//! - [`model`]: constraints, actions and events exchanged with the server
//! - [`matching`]: label selector rules used by the validator and the enforcement engine
//! - [`cache`]: read-mostly policy snapshots kept in sync with the server
//! - [`service`]: the configuration and event service contracts
//! - [`pdk`]: configuration and shutdown plumbing used by every module

pub mod cache;
pub mod matching;
pub mod model;
pub mod pdk;
pub mod service;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use cache::PolicyCache;
