//! Kubernetes destination
//!
//! Talks to the API server with dynamic objects. Kinds are resolved through
//! API discovery once and cached. Writes use server-side apply with the
//! `kubesync` field manager.
//!
//! Client construction honours the usual proxy environment. Internal cluster
//! hosts (private addresses, `.local`/`.internal` names) bypass any configured
//! proxy unless `NO_PROXY` already lists them.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, Scope};
use kube::{Api, Client, Config};
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use super::{Destination, LabelSelector};
use crate::error::DestinationError;
use crate::models::{Manifest, PropagationPolicy, ResourceKey};

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "kubesync";

/// Build a client from the kubeconfig.
///
/// With `context` set, that kubeconfig context is used; otherwise the
/// default inference applies (in-cluster config, `KUBECONFIG`, `~/.kube/config`).
pub async fn create_client(context: Option<&str>) -> Result<Client> {
    let mut config = match context {
        Some(context) => Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to load kubeconfig context '{}'", context))?,
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    let cluster_url = config.cluster_url.to_string();
    if let Ok(url) = Url::parse(&cluster_url) {
        if let Some(host) = url.host_str() {
            if config.proxy_url.is_some() && should_bypass_proxy(host, &no_proxy_env()) {
                tracing::debug!(host = %host, "bypassing proxy for internal cluster host");
                config.proxy_url = None;
            }
        }
    }

    Client::try_from(config).context("Failed to create Kubernetes client")
}

fn no_proxy_env() -> String {
    let upper = std::env::var("NO_PROXY").unwrap_or_default();
    if !upper.is_empty() {
        return upper;
    }
    std::env::var("no_proxy").unwrap_or_default()
}

/// Internal hosts bypass the proxy; hosts already covered by NO_PROXY are
/// left to the HTTP stack.
fn should_bypass_proxy(host: &str, no_proxy: &str) -> bool {
    is_internal_host(host) && !no_proxy_contains(no_proxy, host)
}

fn is_internal_host(host: &str) -> bool {
    if host.starts_with("10.")
        || host.starts_with("192.168.")
        || host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
    {
        return true;
    }
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next().and_then(|s| s.parse::<u8>().ok()) {
            return (16..=31).contains(&second);
        }
    }
    host.ends_with(".local") || host.ends_with(".internal") || host.ends_with(".svc")
}

fn no_proxy_contains(no_proxy: &str, host: &str) -> bool {
    no_proxy
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .any(|pattern| {
            if pattern == "*" || pattern == host {
                return true;
            }
            let suffix = pattern.strip_prefix('.').unwrap_or(pattern);
            host == suffix || host.ends_with(&format!(".{}", suffix))
        })
}

/// Destination backed by a Kubernetes API server.
pub struct KubeDestination {
    client: Client,
    /// (group, kind) pairs listed during prune discovery.
    prune_kinds: Vec<(String, String)>,
    /// (group, version, kind) -> resolved API; empty version = preferred version.
    resources: RwLock<HashMap<(String, String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeDestination {
    /// `prune_kinds` are `group/Kind` or `Kind` (core group) strings.
    pub fn new(client: Client, prune_kinds: &[String]) -> Self {
        let prune_kinds = prune_kinds
            .iter()
            .map(|entry| match entry.rsplit_once('/') {
                Some((group, kind)) => (group.to_string(), kind.to_string()),
                None => (String::new(), entry.to_string()),
            })
            .collect();
        Self {
            client,
            prune_kinds,
            resources: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(
        &self,
        group: &str,
        version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), DestinationError> {
        let cache_key = (group.to_string(), version.to_string(), kind.to_string());
        if let Some(found) = self.resources.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let not_served = |err: kube::Error| discovery_error(map_kube_error(err), group, kind);
        let resolved = if version.is_empty() {
            let api_group = kube::discovery::group(&self.client, group)
                .await
                .map_err(not_served)?;
            api_group
                .recommended_kind(kind)
                .ok_or_else(|| discovery_error(DestinationError::NotFound(String::new()), group, kind))?
        } else {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            kube::discovery::pinned_kind(&self.client, &gvk)
                .await
                .map_err(not_served)?
        };

        tracing::debug!(group = %group, kind = %kind, plural = %resolved.0.plural, "discovered API resource");
        self.resources
            .write()
            .await
            .insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    fn api(&self, resource: &ApiResource, caps: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
        if caps.scope == Scope::Namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        } else {
            Api::all_with(self.client.clone(), resource)
        }
    }
}

/// Convert an API object into a manifest, filling in type information that
/// list responses leave out.
fn to_manifest(object: DynamicObject, resource: &ApiResource) -> Result<Manifest, DestinationError> {
    let mut value =
        serde_json::to_value(&object).map_err(|e| DestinationError::Other(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    Manifest::new(value).map_err(DestinationError::Other)
}

/// Discovery answers 404 for groups and kinds the server does not serve.
fn discovery_error(err: DestinationError, group: &str, kind: &str) -> DestinationError {
    match err {
        DestinationError::NotFound(_) => DestinationError::KindNotServed(format!(
            "no API serves kind {} in group '{}'",
            kind, group
        )),
        other => other,
    }
}

/// `Ok(None)` for a kind the server does not serve, other errors unchanged.
fn served<T>(resolved: Result<T, DestinationError>) -> Result<Option<T>, DestinationError> {
    match resolved {
        Ok(found) => Ok(Some(found)),
        Err(DestinationError::KindNotServed(message)) => {
            tracing::debug!("{}", message);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn version_of(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((_, version)) => version,
        None => api_version,
    }
}

fn propagation(policy: PropagationPolicy) -> kube::api::PropagationPolicy {
    match policy {
        PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
        PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
        PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
    }
}

/// Map API errors onto the destination taxonomy by HTTP status.
fn classify_status(code: u16, message: String) -> DestinationError {
    match code {
        429 => DestinationError::Throttled(message),
        409 => DestinationError::WriteConflict(message),
        401 | 403 => DestinationError::PermissionDenied(message),
        400 | 422 => DestinationError::Rejected(message),
        404 => DestinationError::NotFound(message),
        500..=599 => DestinationError::Unreachable(message),
        _ => DestinationError::Other(message),
    }
}

fn map_kube_error(err: kube::Error) -> DestinationError {
    match err {
        kube::Error::Api(response) => classify_status(response.code, response.message.clone()),
        kube::Error::Auth(e) => DestinationError::PermissionDenied(e.to_string()),
        kube::Error::SerdeError(e) => DestinationError::Other(e.to_string()),
        other => DestinationError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl Destination for KubeDestination {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Manifest>, DestinationError> {
        // No API for the kind means no object; the apply in its wave reports
        // the real error if the kind is still missing by then.
        let Some((resource, caps)) = served(self.resolve(&key.group, "", &key.kind).await)? else {
            return Ok(None);
        };
        let api = self.api(&resource, &caps, &key.namespace);
        match api.get_opt(&key.name).await.map_err(map_kube_error)? {
            Some(object) => Ok(Some(to_manifest(object, &resource)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest, DestinationError> {
        let (resource, caps) = self
            .resolve(manifest.group(), version_of(manifest.api_version()), manifest.kind())
            .await?;
        let api = self.api(&resource, &caps, manifest.namespace().unwrap_or_default());
        let params = PatchParams::apply(FIELD_MANAGER).force();

        tracing::debug!(resource = %manifest.key(), "server-side apply");
        let object = api
            .patch(manifest.name(), &params, &Patch::Apply(manifest.as_value()))
            .await
            .map_err(map_kube_error)?;
        to_manifest(object, &resource)
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        policy: PropagationPolicy,
    ) -> Result<(), DestinationError> {
        let Some((resource, caps)) = served(self.resolve(&key.group, "", &key.kind).await)? else {
            return Ok(());
        };
        let api = self.api(&resource, &caps, &key.namespace);
        let params = DeleteParams {
            propagation_policy: Some(propagation(policy)),
            ..Default::default()
        };

        match api.delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => match map_kube_error(e) {
                DestinationError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn is_namespaced(
        &self,
        group: &str,
        kind: &str,
    ) -> Result<Option<bool>, DestinationError> {
        Ok(served(self.resolve(group, "", kind).await)?
            .map(|(_, caps)| caps.scope == Scope::Namespaced))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Manifest>, DestinationError> {
        let params = ListParams::default().labels(&selector.to_query());
        let mut out = Vec::new();

        for (group, kind) in &self.prune_kinds {
            // A kind the cluster does not serve has nothing to prune
            let Some((resource, _caps)) = served(self.resolve(group, "", kind).await)? else {
                tracing::debug!(group = %group, kind = %kind, "kind not served, skipping");
                continue;
            };
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
            let objects = api.list(&params).await.map_err(map_kube_error)?;
            for object in objects.items {
                out.push(to_manifest(object, &resource)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_hosts() {
        assert!(is_internal_host("10.0.0.1"));
        assert!(is_internal_host("172.20.1.1"));
        assert!(!is_internal_host("172.64.1.1"));
        assert!(is_internal_host("192.168.1.1"));
        assert!(is_internal_host("api.cluster.local"));
        assert!(is_internal_host("kubernetes.default.svc"));
        assert!(!is_internal_host("api.github.com"));
    }

    #[test]
    fn test_no_proxy_patterns() {
        assert!(no_proxy_contains("localhost, .corp.local", "k8s.corp.local"));
        assert!(no_proxy_contains("corp.local", "k8s.corp.local"));
        assert!(no_proxy_contains("*", "anything"));
        assert!(!no_proxy_contains(".prod.local", "devprod.local"));
        assert!(!no_proxy_contains("", "10.0.0.1"));
    }

    #[test]
    fn test_bypass_decision() {
        assert!(should_bypass_proxy("10.0.0.1", ""));
        assert!(!should_bypass_proxy("10.0.0.1", "10.0.0.1"));
        assert!(!should_bypass_proxy("api.example.com", ""));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(429, "slow down".into()).is_retryable());
        assert!(classify_status(409, "conflict".into()).is_retryable());
        assert!(classify_status(503, "unavailable".into()).is_retryable());
        assert!(matches!(
            classify_status(403, "forbidden".into()),
            DestinationError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(422, "invalid".into()),
            DestinationError::Rejected(_)
        ));
    }

    #[test]
    fn test_unserved_kinds_read_as_absent() {
        let err = discovery_error(DestinationError::NotFound("404".into()), "example.com", "Widget");
        assert!(matches!(err, DestinationError::KindNotServed(_)));
        assert!(err.is_retryable());
        assert_eq!(served::<()>(Err(err)), Ok(None));

        let denied = discovery_error(DestinationError::PermissionDenied("no".into()), "", "Secret");
        assert!(matches!(denied, DestinationError::PermissionDenied(_)));
        assert!(served::<()>(Err(denied)).is_err());
        assert_eq!(served(Ok(3)), Ok(Some(3)));
    }

    #[test]
    fn test_version_of() {
        assert_eq!(version_of("apps/v1"), "v1");
        assert_eq!(version_of("v1"), "v1");
    }
}
