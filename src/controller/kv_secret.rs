//! KVSecret controller implementation
//!
//! Each cycle loads the KVSecret, fetches every declared Consul key, writes the
//! complete data set into the owned Secret and asks to be requeued after the
//! refresh interval. A cycle either converges fully or fails without touching
//! the Secret.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::backoff::{BackoffConfig, FailureTracker};
use crate::consul::{ConsulClient, KvFetcher, DEFAULT_REQUEST_TIMEOUT};
use crate::crd::{KVSecret, KVSecretSpec, MAX_REFRESH_INTERVAL_SECS};
use crate::{
    Error, DEFAULT_REFRESH_INTERVAL, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_OPERATOR,
};

/// Trait abstracting Kubernetes object store operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a KVSecret, returning `None` if it does not exist
    async fn get_kv_secret(&self, namespace: &str, name: &str)
        -> Result<Option<KVSecret>, Error>;

    /// Get a Secret, returning `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace an existing Secret
    ///
    /// The Secret's `resourceVersion` is sent along, so a concurrent writer
    /// makes this fail with a conflict instead of being overwritten.
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_kv_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KVSecret>, Error> {
        let api: Api<KVSecret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), secret).await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("secret has no name"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &post_params(), secret).await?;
        Ok(())
    }
}

/// Controller context containing injected collaborators
///
/// The context is shared across all reconciliation calls. It owns no
/// per-instance state except the failure counters used by [`error_policy`].
pub struct Context {
    /// Kubernetes object store (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Remote KV reader
    pub fetcher: Arc<dyn KvFetcher>,
    /// Requeue interval when a KVSecret declares none
    pub default_refresh: Duration,
    /// Consecutive failures per KVSecret, for requeue backoff
    pub failures: FailureTracker,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    ///
    /// Backoff jitter is disabled so requeue delays are deterministic.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, fetcher: Arc<dyn KvFetcher>) -> Self {
        Self {
            kube,
            fetcher,
            default_refresh: DEFAULT_REFRESH_INTERVAL,
            failures: FailureTracker::new(BackoffConfig {
                jitter: false,
                ..Default::default()
            }),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .default_refresh(Duration::from_secs(120))
///     .request_timeout(Duration::from_secs(5))
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    fetcher: Option<Arc<dyn KvFetcher>>,
    default_refresh: Duration,
    request_timeout: Duration,
    backoff: BackoffConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            fetcher: None,
            default_refresh: DEFAULT_REFRESH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    /// Set the requeue interval used when a KVSecret declares none
    pub fn default_refresh(mut self, interval: Duration) -> Self {
        self.default_refresh = interval;
        self
    }

    /// Set the per-request timeout of the default Consul client
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the requeue backoff after failed cycles
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the KV fetcher
    pub fn fetcher(mut self, fetcher: Arc<dyn KvFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let fetcher: Arc<dyn KvFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ConsulClient::with_timeout(self.request_timeout)?),
        };

        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            fetcher,
            default_refresh: self.default_refresh,
            failures: FailureTracker::new(self.backoff),
        })
    }
}

/// Key identifying a KVSecret in the failure tracker
fn instance_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Reconcile a KVSecret resource
///
/// Entry point for the controller runtime. The cached object only supplies
/// the identity; [`reconcile_instance`] reloads the latest copy.
#[instrument(skip(kv_secret, ctx), fields(kv_secret = %kv_secret.name_any()))]
pub async fn reconcile(kv_secret: Arc<KVSecret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = kv_secret.name_any();
    let namespace = kv_secret
        .namespace()
        .ok_or_else(|| Error::validation(format!("KVSecret {name} has no namespace")))?;

    let action = reconcile_instance(&namespace, &name, &ctx).await?;
    ctx.failures.reset(&instance_key(&namespace, &name));
    Ok(action)
}

/// Run one reconciliation cycle for the KVSecret `namespace/name`
///
/// Returns `Action::requeue(refresh)` after a successful sync and
/// `Action::await_change()` when there is nothing to do (instance gone,
/// being deleted, or invalid). Any fetch or store failure is returned as an
/// error with the Secret left as it was.
pub async fn reconcile_instance(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    info!(namespace = %namespace, "reconciling KVSecret");

    let Some(kv_secret) = ctx.kube.get_kv_secret(namespace, name).await? else {
        debug!(namespace = %namespace, "KVSecret no longer exists, nothing to do");
        return Ok(Action::await_change());
    };

    if kv_secret.is_deleting() {
        debug!(namespace = %namespace, "KVSecret is being deleted, skipping sync");
        return Ok(Action::await_change());
    }

    // Only a spec change can fix validation errors
    if let Err(e) = kv_secret.spec.validate() {
        warn!(error = %e, "KVSecret validation failed");
        return Ok(Action::await_change());
    }

    for output_key in kv_secret.spec.duplicate_output_keys() {
        warn!(output_key = %output_key, "outputKey declared more than once, last mapping wins");
    }

    let data = assemble_secret_data(&kv_secret.spec, ctx.fetcher.as_ref())
        .await
        .inspect_err(|e| error!(error = %e, "failed to fetch secret data from Consul"))?;

    let secret_name = upsert_secret(ctx.kube.as_ref(), &kv_secret, data)
        .await
        .inspect_err(|e| error!(error = %e, "failed to write secret"))?;

    let requeue = refresh_interval(&kv_secret.spec, ctx.default_refresh);
    info!(
        secret = %secret_name,
        requeue_secs = requeue.as_secs(),
        "finished reconciling KVSecret"
    );
    Ok(Action::requeue(requeue))
}

/// Fetch every declared key and build the Secret data mapping
///
/// Keys are fetched in declared order. The first failure aborts and is
/// returned; nothing fetched so far escapes. A repeated `outputKey` keeps the
/// value of its last mapping.
pub async fn assemble_secret_data(
    spec: &KVSecretSpec,
    fetcher: &dyn KvFetcher,
) -> Result<BTreeMap<String, ByteString>, Error> {
    let mut data = BTreeMap::new();
    for mapping in &spec.values {
        let value = fetcher.fetch(&spec.source, &mapping.source_key).await?;
        data.insert(mapping.output_key.clone(), ByteString(value));
    }
    Ok(data)
}

/// Compute the delay before the next cycle
///
/// Clamped to [`MAX_REFRESH_INTERVAL_SECS`], the longest delay the runtime
/// scheduler accepts with margin.
pub fn refresh_interval(spec: &KVSecretSpec, default: Duration) -> Duration {
    spec.declared_refresh()
        .unwrap_or(default)
        .min(Duration::from_secs(MAX_REFRESH_INTERVAL_SECS))
}

/// Build the Secret a KVSecret should produce for the given data
pub fn desired_secret(
    kv_secret: &KVSecret,
    data: BTreeMap<String, ByteString>,
) -> Result<Secret, Error> {
    let name = kv_secret.output_name();
    let namespace = kv_secret.namespace().ok_or_else(|| {
        Error::validation(format!("KVSecret {} has no namespace", kv_secret.name_any()))
    })?;
    let owner = kv_secret.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation(format!(
            "KVSecret {} has no uid, cannot set owner reference",
            kv_secret.name_any()
        ))
    })?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_OPERATOR.to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Create or update the Secret owned by `kv_secret` so its data equals `data`
///
/// Existing Secrets keep their labels, annotations and other owner
/// references; `data` is replaced wholesale. No write happens when the Secret
/// already matches. Returns the Secret name.
pub async fn upsert_secret(
    kube: &dyn KubeClient,
    kv_secret: &KVSecret,
    data: BTreeMap<String, ByteString>,
) -> Result<String, Error> {
    let desired = desired_secret(kv_secret, data)?;
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    match kube.get_secret(&namespace, &name).await? {
        None => {
            kube.create_secret(&namespace, &desired).await?;
            info!(secret = %name, keys = data_len(&desired), "created secret");
        }
        Some(existing) => match updated_secret(existing, &desired)? {
            None => debug!(secret = %name, "secret already up to date"),
            Some(updated) => {
                kube.replace_secret(&namespace, &updated).await?;
                info!(secret = %name, keys = data_len(&updated), "updated secret");
            }
        },
    }

    Ok(name)
}

fn data_len(secret: &Secret) -> usize {
    secret.data.as_ref().map(BTreeMap::len).unwrap_or(0)
}

/// Apply the desired data and owner reference onto an existing Secret
///
/// Returns `None` when the existing Secret needs no change.
fn updated_secret(existing: Secret, desired: &Secret) -> Result<Option<Secret>, Error> {
    let owner = desired
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .ok_or_else(|| Error::validation("desired secret has no owner reference"))?;

    let existing_refs = existing.metadata.owner_references.as_deref().unwrap_or(&[]);
    if let Some(other) = existing_refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(Error::ownership_conflict(
            existing.name_any(),
            format!("{}/{}", other.kind, other.name),
        ));
    }

    let owned = existing_refs.iter().any(|r| r.uid == owner.uid);
    let desired_data = desired.data.clone().unwrap_or_default();
    let existing_data = existing.data.clone().unwrap_or_default();
    if owned && existing_data == desired_data {
        return Ok(None);
    }

    let mut updated = existing;
    updated.data = Some(desired_data);
    if !owned {
        updated
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner.clone());
    }
    Ok(Some(updated))
}

/// Error policy for the controller
///
/// Logs the failure and requeues with exponential backoff per KVSecret. The
/// counter resets on the next successful cycle.
pub fn error_policy(kv_secret: Arc<KVSecret>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = kv_secret.name_any();
    let namespace = kv_secret.namespace().unwrap_or_default();
    let key = instance_key(&namespace, &name);
    let delay = ctx.failures.record_failure(&key);

    error!(
        %error,
        kv_secret = %name,
        namespace = %namespace,
        retryable = error.is_retryable(),
        attempt = ctx.failures.failures(&key),
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );

    Action::requeue(delay)
}
