//! KVSecret Custom Resource Definition
//!
//! A KVSecret declares which Consul keys to read, the Secret field each one
//! lands in, and how often to refresh. The operator owns the generated Secret.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Longest accepted `refreshInterval` (one year)
///
/// kube-runtime's scheduler cannot hold deadlines much beyond two years.
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Specification for a KVSecret
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "consul-kv.dev",
    version = "v1alpha1",
    kind = "KVSecret",
    plural = "kvsecrets",
    shortname = "kvs",
    status = "KVSecretStatus",
    namespaced,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.source.address"}"#,
    printcolumn = r#"{"name":"Refresh","type":"integer","jsonPath":".spec.refreshInterval"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KVSecretSpec {
    /// Consul server to read from
    pub source: SourceSpec,

    /// Consul keys and the Secret fields they map to
    #[serde(default)]
    pub values: Vec<KeyMapping>,

    /// Generated Secret settings
    #[serde(default)]
    pub output: OutputSpec,

    /// Seconds between refreshes (defaults to 60, at most one year)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1, max = 31536000))]
    pub refresh_interval: Option<u64>,
}

/// Consul endpoint and credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// `host[:port]` or full URL of the Consul HTTP API
    pub address: String,

    /// ACL token sent as a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Maps one Consul key to one Secret data field
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyMapping {
    /// Key in the Consul KV store
    pub source_key: String,

    /// Field name in the generated Secret
    pub output_key: String,
}

impl KeyMapping {
    /// Create a mapping from a Consul key to a Secret field
    pub fn new(source_key: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            output_key: output_key.into(),
        }
    }
}

/// Generated Secret settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    /// Secret name; defaults to the KVSecret name. Changing it later leaves
    /// the old Secret behind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Status for a KVSecret
///
/// Intentionally empty: progress is visible through the generated Secret and
/// operator logs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct KVSecretStatus {}

impl KVSecretSpec {
    /// Validate the spec before any remote call is made
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.source.address.trim().is_empty() {
            return Err(crate::Error::validation("source.address must not be empty"));
        }

        for (i, mapping) in self.values.iter().enumerate() {
            if mapping.source_key.trim().is_empty() {
                return Err(crate::Error::validation(format!(
                    "values[{i}].sourceKey must not be empty"
                )));
            }
            if mapping.output_key.trim().is_empty() {
                return Err(crate::Error::validation(format!(
                    "values[{i}].outputKey must not be empty"
                )));
            }
            if !is_valid_secret_key(&mapping.output_key) {
                return Err(crate::Error::validation(format!(
                    "values[{i}].outputKey '{}' may only contain alphanumerics, '-', '_' and '.'",
                    mapping.output_key
                )));
            }
        }

        match self.refresh_interval {
            Some(0) => {
                return Err(crate::Error::validation(
                    "refreshInterval must be at least 1 second",
                ))
            }
            Some(secs) if secs > MAX_REFRESH_INTERVAL_SECS => {
                return Err(crate::Error::validation(format!(
                    "refreshInterval must be at most {MAX_REFRESH_INTERVAL_SECS} seconds"
                )))
            }
            _ => {}
        }

        Ok(())
    }

    /// Declared refresh interval, if any
    pub fn declared_refresh(&self) -> Option<Duration> {
        self.refresh_interval.map(Duration::from_secs)
    }

    /// Output keys that appear more than once, in first-seen order
    ///
    /// Later mappings overwrite earlier ones during assembly.
    pub fn duplicate_output_keys(&self) -> Vec<&str> {
        let mut seen = std::collections::BTreeSet::new();
        let mut dups = Vec::new();
        for mapping in &self.values {
            let key = mapping.output_key.as_str();
            if !seen.insert(key) && !dups.contains(&key) {
                dups.push(key);
            }
        }
        dups
    }
}

/// Secret data keys follow the ConfigMap key rules: `[-._a-zA-Z0-9]+`
fn is_valid_secret_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 253
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl KVSecret {
    /// Name of the Secret this KVSecret produces
    pub fn output_name(&self) -> String {
        match self.spec.output.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => kube::ResourceExt::name_any(self),
        }
    }

    /// True once the API server has set a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn sample_spec() -> KVSecretSpec {
        KVSecretSpec {
            source: SourceSpec {
                address: "kv.local:8500".to_string(),
                token: None,
            },
            values: vec![KeyMapping::new("db/user", "username")],
            output: OutputSpec::default(),
            refresh_interval: None,
        }
    }

    fn sample_kv_secret(name: &str) -> KVSecret {
        KVSecret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: sample_spec(),
            status: None,
        }
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    #[test]
    fn story_minimal_spec_is_valid() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn story_empty_values_is_valid() {
        let mut spec = sample_spec();
        spec.values.clear();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn story_empty_address_rejected() {
        let mut spec = sample_spec();
        spec.source.address = "  ".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("source.address"));
    }

    #[test]
    fn story_blank_keys_rejected_with_index() {
        let mut spec = sample_spec();
        spec.values.push(KeyMapping::new("", "password"));
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("values[1].sourceKey"));

        let mut spec = sample_spec();
        spec.values[0].output_key = String::new();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("values[0].outputKey"));
    }

    #[test]
    fn story_zero_refresh_interval_rejected() {
        let mut spec = sample_spec();
        spec.refresh_interval = Some(0);
        assert!(spec.validate().is_err());

        spec.refresh_interval = Some(1);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.declared_refresh(), Some(Duration::from_secs(1)));
    }

    /// Story: intervals the controller runtime cannot schedule are rejected
    #[test]
    fn story_huge_refresh_interval_rejected() {
        let mut spec = sample_spec();
        spec.refresh_interval = Some(100_000_000);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("refreshInterval must be at most"));

        spec.refresh_interval = Some(MAX_REFRESH_INTERVAL_SECS);
        assert!(spec.validate().is_ok());
        spec.refresh_interval = Some(MAX_REFRESH_INTERVAL_SECS + 1);
        assert!(spec.validate().is_err());
    }

    /// Story: output keys the API server would refuse fail validation up front
    #[test]
    fn story_output_key_charset_enforced() {
        for bad in ["db user", "creds/user", "pass:word", "ключ", ".."] {
            let mut spec = sample_spec();
            spec.values[0].output_key = bad.to_string();
            let err = spec.validate().unwrap_err();
            assert!(
                err.to_string().contains("values[0].outputKey"),
                "{bad} should be rejected"
            );
        }

        for good in ["username", "tls.crt", "DB_PASS", "api-key.v2"] {
            let mut spec = sample_spec();
            spec.values[0].output_key = good.to_string();
            assert!(spec.validate().is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn story_crd_schema_bounds_refresh_interval() {
        use kube::CustomResourceExt;
        let crd = serde_json::to_value(KVSecret::crd()).unwrap();
        let refresh = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["refreshInterval"];
        assert!(refresh.is_object(), "refreshInterval missing from schema");
        assert!(refresh.to_string().contains("31536000"));
    }

    #[test]
    fn story_duplicate_output_keys_reported_once() {
        let mut spec = sample_spec();
        spec.values.push(KeyMapping::new("db/admin", "username"));
        spec.values.push(KeyMapping::new("db/root", "username"));
        spec.values.push(KeyMapping::new("db/pass", "password"));
        assert_eq!(spec.duplicate_output_keys(), vec!["username"]);
        // duplicates do not fail validation
        assert!(spec.validate().is_ok());
    }

    // =========================================================================
    // Output Naming Stories
    // =========================================================================

    #[test]
    fn story_output_name_defaults_to_kv_secret_name() {
        let kv = sample_kv_secret("db-creds");
        assert_eq!(kv.output_name(), "db-creds");
    }

    #[test]
    fn story_explicit_output_name_wins() {
        let mut kv = sample_kv_secret("db-creds");
        kv.spec.output.name = Some("postgres-login".to_string());
        assert_eq!(kv.output_name(), "postgres-login");

        kv.spec.output.name = Some(String::new());
        assert_eq!(kv.output_name(), "db-creds");
    }

    #[test]
    fn story_deletion_timestamp_marks_deleting() {
        let mut kv = sample_kv_secret("db-creds");
        assert!(!kv.is_deleting());
        kv.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert!(kv.is_deleting());
    }

    // =========================================================================
    // Serialization Stories
    // =========================================================================

    /// Story: the user-facing YAML uses camelCase field names
    #[test]
    fn story_spec_deserializes_from_user_yaml() {
        let yaml = r#"
source:
  address: http://consul.service:8500
  token: s3cr3t
values:
  - sourceKey: db/user
    outputKey: username
  - sourceKey: db/pass
    outputKey: password
output:
  name: db-login
refreshInterval: 30
"#;
        let spec: KVSecretSpec = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(spec.source.token.as_deref(), Some("s3cr3t"));
        assert_eq!(spec.values.len(), 2);
        assert_eq!(spec.values[1], KeyMapping::new("db/pass", "password"));
        assert_eq!(spec.output.name.as_deref(), Some("db-login"));
        assert_eq!(spec.refresh_interval, Some(30));
    }

    #[test]
    fn story_optional_sections_default() {
        let spec: KVSecretSpec =
            serde_json::from_value(serde_json::json!({"source": {"address": "kv:8500"}}))
                .expect("valid json");
        assert!(spec.values.is_empty());
        assert_eq!(spec.output, OutputSpec::default());
        assert_eq!(spec.refresh_interval, None);
    }

    #[test]
    fn story_crd_is_namespaced_with_expected_names() {
        use kube::CustomResourceExt;
        let crd = KVSecret::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("kvsecrets.consul-kv.dev"));
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "KVSecret");
    }
}
