//! Consul KV operator - keeps Kubernetes Secrets in sync with Consul KV
//!
//! A `KVSecret` custom resource names a Consul server and a list of keys.
//! The operator reads every key, writes the values into a Secret owned by the
//! `KVSecret`, and repeats on a fixed interval so later changes in Consul
//! propagate to the cluster.
//!
//! # Modules
//!
//! - [`crd`] - The KVSecret Custom Resource Definition
//! - [`consul`] - Consul KV HTTP client and response decoding
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`backoff`] - Requeue backoff after failed cycles
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod backoff;
pub mod consul;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Refresh interval for KVSecrets that declare none
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Field manager for Secret writes and CRD server-side apply
pub const FIELD_MANAGER: &str = "consul-kv-operator";

/// Standard Kubernetes label marking the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on Secrets created by this operator
pub const LABEL_MANAGED_BY_OPERATOR: &str = "consul-kv-operator";
