//! Controller implementations for the Consul KV operator
//!
//! This module contains the reconciliation logic for KVSecret resources.
//! Controllers follow the Kubernetes controller pattern with observe-diff-act loops.

mod kv_secret;

pub use kv_secret::{
    assemble_secret_data, desired_secret, error_policy, reconcile, reconcile_instance,
    refresh_interval, upsert_secret, Context, ContextBuilder, KubeClient, KubeClientImpl,
};
