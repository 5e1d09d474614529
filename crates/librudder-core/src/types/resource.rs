use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Dependency tier used to sequence apply operations.
///
/// Prerequisite kinds live in lower phases and are always applied first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Namespaces = 0,
    Crds = 1,
    Config = 2,
    Workloads = 3,
    NetworkPolicy = 4,
    Ingress = 5,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 6] = [
        SyncPhase::Namespaces,
        SyncPhase::Crds,
        SyncPhase::Config,
        SyncPhase::Workloads,
        SyncPhase::NetworkPolicy,
        SyncPhase::Ingress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Namespaces => "namespaces",
            SyncPhase::Crds => "crds",
            SyncPhase::Config => "config",
            SyncPhase::Workloads => "workloads",
            SyncPhase::NetworkPolicy => "network_policy",
            SyncPhase::Ingress => "ingress",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource kind: the kinds the controller orders explicitly, plus an
/// opaque variant so unknown kinds (custom resources) pass through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Namespace,
    CustomResourceDefinition,
    ConfigMap,
    Secret,
    ServiceAccount,
    PersistentVolumeClaim,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Pod,
    Service,
    NetworkPolicy,
    Ingress,
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::CustomResourceDefinition => "CustomResourceDefinition",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Other(kind) => kind,
        }
    }

    /// Fixed phase table. Unknown kinds are treated as workloads.
    pub fn phase(&self) -> SyncPhase {
        match self {
            ResourceKind::Namespace => SyncPhase::Namespaces,
            ResourceKind::CustomResourceDefinition => SyncPhase::Crds,
            ResourceKind::ConfigMap
            | ResourceKind::Secret
            | ResourceKind::ServiceAccount
            | ResourceKind::PersistentVolumeClaim => SyncPhase::Config,
            ResourceKind::Deployment
            | ResourceKind::StatefulSet
            | ResourceKind::DaemonSet
            | ResourceKind::Job
            | ResourceKind::CronJob
            | ResourceKind::Pod
            | ResourceKind::Service
            | ResourceKind::Other(_) => SyncPhase::Workloads,
            ResourceKind::NetworkPolicy => SyncPhase::NetworkPolicy,
            ResourceKind::Ingress => SyncPhase::Ingress,
        }
    }

    /// Cluster-scoped kinds never carry a namespace
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceKind::Namespace | ResourceKind::CustomResourceDefinition
        )
    }
}

impl From<String> for ResourceKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "Namespace" => ResourceKind::Namespace,
            "CustomResourceDefinition" => ResourceKind::CustomResourceDefinition,
            "ConfigMap" => ResourceKind::ConfigMap,
            "Secret" => ResourceKind::Secret,
            "ServiceAccount" => ResourceKind::ServiceAccount,
            "PersistentVolumeClaim" => ResourceKind::PersistentVolumeClaim,
            "Deployment" => ResourceKind::Deployment,
            "StatefulSet" => ResourceKind::StatefulSet,
            "DaemonSet" => ResourceKind::DaemonSet,
            "Job" => ResourceKind::Job,
            "CronJob" => ResourceKind::CronJob,
            "Pod" => ResourceKind::Pod,
            "Service" => ResourceKind::Service,
            "NetworkPolicy" => ResourceKind::NetworkPolicy,
            "Ingress" => ResourceKind::Ingress,
            _ => ResourceKind::Other(kind),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(kind: &str) -> Self {
        ResourceKind::from(kind.to_string())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource: (kind, namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Metadata fields owned by the cluster, never part of desired state
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
];

/// A single resource, either rendered (desired) or observed (live)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// Full manifest payload
    pub spec: Value,
    /// Version token reported by the cluster; live descriptors only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str, spec: Value) -> Self {
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            namespace.map(String::from)
        };
        Self {
            kind,
            namespace,
            name: name.to_string(),
            spec,
            resource_version: None,
        }
    }

    /// Build a descriptor from a parsed manifest object.
    ///
    /// Namespaced kinds without `metadata.namespace` land in `default_namespace`.
    pub fn from_manifest(manifest: Value, default_namespace: Option<&str>) -> Result<Self, CoreError> {
        let kind = manifest
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidManifest("missing 'kind'".to_string()))?;
        let kind = ResourceKind::from(kind);

        let metadata = manifest.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::InvalidManifest(format!("{} without 'metadata.name'", kind)))?
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .or(default_namespace)
            .map(String::from);

        Ok(Self::new(kind, namespace.as_deref(), &name, manifest))
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.kind.phase()
    }

    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    /// Payload with server-managed fields, nulls and empty objects removed
    pub fn normalized_spec(&self) -> Value {
        let mut spec = self.spec.clone();
        if let Value::Object(map) = &mut spec {
            map.remove("status");
            if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
                for field in SERVER_MANAGED_METADATA {
                    metadata.remove(*field);
                }
            }
        }
        normalize(spec)
    }

    /// Same identity and same normalized payload. Resource versions are ignored.
    pub fn semantically_eq(&self, other: &ResourceDescriptor) -> bool {
        self.id() == other.id() && self.normalized_spec() == other.normalized_spec()
    }
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                match normalize(value) {
                    Value::Null => {}
                    Value::Object(inner) if inner.is_empty() => {}
                    other => {
                        out.insert(key, other);
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_table_order() {
        assert!(ResourceKind::Namespace.phase() < ResourceKind::CustomResourceDefinition.phase());
        assert!(ResourceKind::CustomResourceDefinition.phase() < ResourceKind::ConfigMap.phase());
        assert_eq!(ResourceKind::Secret.phase(), SyncPhase::Config);
        assert!(ResourceKind::ConfigMap.phase() < ResourceKind::Deployment.phase());
        assert!(ResourceKind::Deployment.phase() < ResourceKind::NetworkPolicy.phase());
        assert!(ResourceKind::NetworkPolicy.phase() < ResourceKind::Ingress.phase());
        assert_eq!(
            ResourceKind::from("Certificate").phase(),
            SyncPhase::Workloads
        );
    }

    #[test]
    fn test_kind_string_roundtrip() {
        let kind: ResourceKind = serde_json::from_value(json!("Deployment")).unwrap();
        assert_eq!(kind, ResourceKind::Deployment);
        let kind: ResourceKind = serde_json::from_value(json!("Rollout")).unwrap();
        assert_eq!(kind, ResourceKind::Other("Rollout".to_string()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("Rollout"));
    }

    #[test]
    fn test_from_manifest_defaults_namespace() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg" },
            "data": { "a": "1" }
        });
        let desc = ResourceDescriptor::from_manifest(manifest, Some("prod")).unwrap();
        assert_eq!(desc.kind, ResourceKind::ConfigMap);
        assert_eq!(desc.namespace.as_deref(), Some("prod"));
        assert_eq!(desc.name, "cfg");
    }

    #[test]
    fn test_from_manifest_keeps_own_namespace() {
        let manifest = json!({
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "staging" },
            "spec": { "replicas": 1 }
        });
        let desc = ResourceDescriptor::from_manifest(manifest, Some("prod")).unwrap();
        assert_eq!(desc.namespace.as_deref(), Some("staging"));
        assert_eq!(desc.spec["metadata"]["namespace"], "staging");
    }

    #[test]
    fn test_from_manifest_cluster_scoped_drops_namespace() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "prod" }
        });
        let desc = ResourceDescriptor::from_manifest(manifest, Some("default")).unwrap();
        assert_eq!(desc.namespace, None);
        assert_eq!(desc.id().to_string(), "Namespace/prod");
    }

    #[test]
    fn test_from_manifest_requires_name() {
        let manifest = json!({ "kind": "Service", "metadata": {} });
        let err = ResourceDescriptor::from_manifest(manifest, None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidManifest(_)));
    }

    #[test]
    fn test_semantic_equality_ignores_server_fields_and_key_order() {
        let desired = ResourceDescriptor::new(
            ResourceKind::Deployment,
            Some("prod"),
            "app",
            json!({
                "metadata": { "name": "app", "labels": {} },
                "spec": { "replicas": 2, "paused": null }
            }),
        );
        let live = ResourceDescriptor::new(
            ResourceKind::Deployment,
            Some("prod"),
            "app",
            json!({
                "spec": { "replicas": 2 },
                "status": { "readyReplicas": 2 },
                "metadata": { "uid": "abc", "resourceVersion": "17", "name": "app" }
            }),
        )
        .with_resource_version("17");

        assert!(desired.semantically_eq(&live));
    }

    #[test]
    fn test_semantic_equality_detects_changes() {
        let a = ResourceDescriptor::new(
            ResourceKind::Deployment,
            Some("prod"),
            "app",
            json!({ "spec": { "replicas": 1 } }),
        );
        let b = ResourceDescriptor::new(
            ResourceKind::Deployment,
            Some("prod"),
            "app",
            json!({ "spec": { "replicas": 2 } }),
        );
        assert!(!a.semantically_eq(&b));
    }

    #[test]
    fn test_resource_id_ordering() {
        let mut ids = vec![
            ResourceId::new(ResourceKind::Service, Some("b"), "x"),
            ResourceId::new(ResourceKind::Deployment, Some("a"), "z"),
            ResourceId::new(ResourceKind::Deployment, Some("a"), "y"),
        ];
        ids.sort();
        let names: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(
            names,
            vec!["Deployment/a/y", "Deployment/a/z", "Service/b/x"]
        );
    }
}
