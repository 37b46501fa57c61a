//! Core types, provider contract, and client facade for the bezoek visitor
//! parking adapters.

/// Client facade for provider discovery and adapter construction.
pub mod client;
/// The error type shared across the workspace.
pub mod error;
/// Request execution policy: timeouts, GET retries, rate-limit back-off.
pub mod http;
/// Capability manifests, their schema, and the TTL cache.
pub mod manifest;
/// Domain models shared by all providers.
pub mod model;
/// Canonical license plate and timestamp forms.
pub mod normalize;
/// Provider contract and shared adapter plumbing.
pub mod provider;
/// Provider registrations and manifest-backed lookup.
pub mod registry;
/// Payload redaction applied before anything is logged.
pub mod sanitize;

pub use client::*;
pub use error::*;
pub use http::*;
pub use manifest::*;
pub use model::*;
pub use normalize::*;
pub use provider::*;
pub use registry::*;
pub use sanitize::*;
