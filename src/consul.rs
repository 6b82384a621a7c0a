//! Consul KV client
//!
//! Reads single keys from the Consul HTTP API (`GET {address}/v1/kv/{key}`)
//! and decodes the base64 value Consul wraps them in. No retries happen here;
//! a failed read fails the reconciliation cycle and the controller requeues.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::SourceSpec;
use crate::Error;

/// Default per-request timeout for Consul reads
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait abstracting reads from a remote KV store
///
/// This trait allows mocking Consul in controller tests while using
/// [`ConsulClient`] in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvFetcher: Send + Sync {
    /// Return the raw bytes stored under `key` on the given source
    ///
    /// An existing key with no data yields an empty vector.
    async fn fetch(&self, source: &SourceSpec, key: &str) -> Result<Vec<u8>, Error>;
}

/// One record of a Consul KV read response
///
/// Consul itself emits `Key`/`Value`; lowercase is accepted as well.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KvEntry {
    /// Full key path
    #[serde(rename = "key", alias = "Key", default)]
    pub key: String,

    /// Base64-encoded value; `null` for keys without data
    #[serde(rename = "value", alias = "Value", default)]
    pub value: Option<String>,
}

/// Consul HTTP API client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
}

impl ConsulClient {
    /// Create a client wrapping the given HTTP client
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Create a client with its own HTTP client and request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport("<client>", format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(http))
    }
}

#[async_trait]
impl KvFetcher for ConsulClient {
    async fn fetch(&self, source: &SourceSpec, key: &str) -> Result<Vec<u8>, Error> {
        let url = kv_url(&source.address, key)?;

        let mut request = self.http.get(url.clone());
        if let Some(token) = source.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(url.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::remote_lookup(key, status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(url.as_str(), format!("failed to read body: {e}")))?;

        let value = decode_kv_response(key, &body)?;
        debug!(key = %key, bytes = value.len(), "fetched value from Consul");
        Ok(value)
    }
}

/// Build the KV read URL for `key` on `address`
///
/// Addresses without a scheme are treated as plain HTTP. Each `/`-separated
/// segment of the key is percent-encoded, so `#`, `?` and `%` reach Consul as
/// part of the key.
pub fn kv_url(address: &str, key: &str) -> Result<Url, Error> {
    let address = address.trim().trim_end_matches('/');
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };

    let mut url = Url::parse(&base)
        .map_err(|e| Error::validation(format!("invalid Consul address '{address}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::validation(format!("invalid Consul address '{address}'")))?
        .pop_if_empty()
        .extend(["v1", "kv"])
        .extend(key.trim_start_matches('/').split('/'));
    Ok(url)
}

/// Decode a Consul KV read response body into the raw value
///
/// An empty body means the key exists without data. Otherwise the body must
/// be a JSON array holding exactly one record.
pub fn decode_kv_response(key: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<KvEntry> = serde_json::from_slice(body)
        .map_err(|e| Error::decode(key, format!("invalid response body: {e}")))?;

    let [entry] = entries.as_slice() else {
        return Err(Error::shape(key, entries.len()));
    };

    match entry.value.as_deref() {
        None => Ok(Vec::new()),
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| Error::decode(key, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // URL Construction
    // =========================================================================

    fn url(address: &str, key: &str) -> String {
        kv_url(address, key).expect("valid url").to_string()
    }

    #[test]
    fn kv_url_adds_http_scheme_to_host_port() {
        assert_eq!(
            url("kv.local:8500", "db/user"),
            "http://kv.local:8500/v1/kv/db/user"
        );
    }

    #[test]
    fn kv_url_keeps_explicit_scheme() {
        assert_eq!(
            url("https://consul.example.com", "app/token"),
            "https://consul.example.com/v1/kv/app/token"
        );
        assert_eq!(url("http://10.0.0.5:8500/", "/a"), "http://10.0.0.5:8500/v1/kv/a");
    }

    #[test]
    fn kv_url_keeps_address_path_prefix() {
        assert_eq!(
            url("https://gateway.example.com/consul/", "a/b"),
            "https://gateway.example.com/consul/v1/kv/a/b"
        );
    }

    /// Reserved URL characters stay inside the key instead of cutting it short
    #[test]
    fn kv_url_escapes_reserved_characters_per_segment() {
        assert_eq!(
            url("kv.local:8500", "db/a#b"),
            "http://kv.local:8500/v1/kv/db/a%23b"
        );
        assert_eq!(
            url("kv.local:8500", "db/a?b"),
            "http://kv.local:8500/v1/kv/db/a%3Fb"
        );
        assert_eq!(
            url("kv.local:8500", "db/50%"),
            "http://kv.local:8500/v1/kv/db/50%25"
        );
        assert_eq!(url("kv.local:8500", "folder/"), "http://kv.local:8500/v1/kv/folder/");
    }

    #[test]
    fn kv_url_rejects_unparseable_address() {
        assert!(matches!(
            kv_url("http://bad host:8500", "a"),
            Err(Error::Validation(_))
        ));
    }

    // =========================================================================
    // Response Decoding
    // =========================================================================

    #[test]
    fn decodes_single_record() {
        let body = br#"[{"key":"db/user","value":"YWRtaW4="}]"#;
        assert_eq!(decode_kv_response("db/user", body).unwrap(), b"admin");
    }

    #[test]
    fn decodes_native_consul_casing() {
        let body = br#"[{"LockIndex":0,"Key":"db/user","Flags":0,"Value":"YWRtaW4=","CreateIndex":5,"ModifyIndex":5}]"#;
        assert_eq!(decode_kv_response("db/user", body).unwrap(), b"admin");
    }

    #[test]
    fn empty_body_is_empty_value() {
        assert_eq!(decode_kv_response("k", b"").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn null_value_is_empty_value() {
        let body = br#"[{"Key":"folder/","Value":null}]"#;
        assert_eq!(decode_kv_response("folder/", body).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn zero_or_many_records_is_shape_error() {
        match decode_kv_response("k", b"[]") {
            Err(Error::Shape { count, .. }) => assert_eq!(count, 0),
            other => panic!("expected shape error, got {other:?}"),
        }

        let body = br#"[{"key":"a","value":"YQ=="},{"key":"ab","value":"YWI="}]"#;
        match decode_kv_response("a", body) {
            Err(Error::Shape { count, .. }) => assert_eq!(count, 2),
            other => panic!("expected shape error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_base64_is_decode_error() {
        let body = br#"[{"key":"k","value":"not base64!"}]"#;
        assert!(matches!(
            decode_kv_response("k", body),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn non_json_body_is_decode_error() {
        assert!(matches!(
            decode_kv_response("k", b"<html>oops</html>"),
            Err(Error::Decode { .. })
        ));
    }

    /// Any byte sequence survives base64 encoding and decoding unchanged
    #[test]
    fn decode_round_trips_arbitrary_bytes() {
        let samples: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"admin".to_vec(),
            (0u8..=255).collect(),
            vec![0, 0, 0xff, 0x10],
            "pässwörd ✓".as_bytes().to_vec(),
        ];

        for bytes in samples {
            let body = serde_json::to_vec(&serde_json::json!([
                {"key": "k", "value": STANDARD.encode(&bytes)}
            ]))
            .unwrap();
            assert_eq!(decode_kv_response("k", &body).unwrap(), bytes);
        }
    }
}
