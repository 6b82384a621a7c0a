//! Custom Resource Definitions for the Consul KV operator

mod kv_secret;

pub use kv_secret::{
    KVSecret, KVSecretSpec, KVSecretStatus, KeyMapping, OutputSpec, SourceSpec,
    MAX_REFRESH_INTERVAL_SECS,
};

use kube::CustomResourceExt;

/// Render the KVSecret CRD as YAML
pub fn crd_yaml() -> Result<String, crate::Error> {
    serde_yaml::to_string(&KVSecret::crd()).map_err(|e| crate::Error::serialization(e.to_string()))
}
