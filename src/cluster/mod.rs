//! Cluster-side collaborators: the `Course` custom resource and the namespace, volume,
//! secret and role primitives a classroom needs.

mod memory;
#[cfg(feature = "kube-provider")]
mod k8s;

pub use memory::MemoryCluster;
#[cfg(feature = "kube-provider")]
pub use k8s::KubeCluster;

use crate::error::ResourceError;
use crate::model::AccessType;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Cascade policy for deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
  /// Dependents are removed before the owner disappears.
  Foreground,
  Background,
}

/// Volume the course controller provisions for a user's writable mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "kube-provider", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct WritableVolume {
  pub owner: String,
  pub uid: i64,
  pub storage_class: String,
  pub mount_point: String,
}

/// Spec of the `Course` custom resource reconciled by the course controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
  feature = "kube-provider",
  derive(::kube::CustomResource, schemars::JsonSchema),
  kube(
    group = "nchc.ai",
    version = "v1alpha1",
    kind = "Course",
    root = "CourseObject",
    namespaced,
    status = "CourseResourceStatus"
  )
)]
#[serde(rename_all = "camelCase")]
pub struct CourseResourceSpec {
  pub access_type: AccessType,
  pub image: String,
  pub gpu: i32,
  pub schedule: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dataset: Option<Vec<String>>,
  pub port: BTreeMap<String, i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub writable_volume: Option<WritableVolume>,
}

/// Status written by the course controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "kube-provider", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct CourseResourceStatus {
  pub accessible: bool,
  /// Ingress sub-path per port name.
  pub sub_path: BTreeMap<String, String>,
  /// Node port per port name.
  pub node_port: BTreeMap<String, i32>,
}

/// A `Course` custom resource as the core sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseResource {
  pub name: String,
  pub namespace: String,
  pub annotations: BTreeMap<String, String>,
  pub spec: CourseResourceSpec,
  pub status: Option<CourseResourceStatus>,
}

impl CourseResource {
  pub fn is_accessible(&self) -> bool {
    self.status.as_ref().map_or(false, |s| s.accessible)
  }

  /// Endpoints the user can reach, as `(port name, address)` pairs.
  pub fn endpoints(&self, node_port_dns: &str) -> Vec<(String, String)> {
    let Some(status) = &self.status else {
      return Vec::new();
    };
    match self.spec.access_type {
      AccessType::Ingress => status
        .sub_path
        .iter()
        .map(|(name, path)| (name.clone(), format!("http://{path}")))
        .collect(),
      AccessType::NodePort => status
        .node_port
        .iter()
        .map(|(name, port)| (name.clone(), format!("{node_port_dns}:{port}")))
        .collect(),
    }
  }
}

/// A persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
  pub name: String,
  pub namespace: String,
  pub labels: BTreeMap<String, String>,
  pub annotations: BTreeMap<String, String>,
  pub access_modes: Vec<String>,
  /// Requested capacity, e.g. `1Mi`.
  pub storage_request: String,
  pub storage_class: Option<String>,
}

/// Secret payload copied between namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretData {
  pub name: String,
  pub type_: String,
  pub data: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
  pub api_groups: Vec<String>,
  pub resources: Vec<String>,
  pub resource_names: Vec<String>,
  pub verbs: Vec<String>,
}

/// A namespaced role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRole {
  pub name: String,
  pub rules: Vec<AccessRule>,
}

/// Binds a role to a service account of the same namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRoleBinding {
  pub name: String,
  pub role_name: String,
  pub service_account: String,
}

/// Client for `Course` custom resources.
#[async_trait]
pub trait CourseResourceClient: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<CourseResource, ResourceError>;
  async fn create(&self, resource: &CourseResource) -> Result<CourseResource, ResourceError>;
  async fn list(&self, namespace: &str) -> Result<Vec<CourseResource>, ResourceError>;
  /// Overwrites `spec.schedule`.
  async fn update_schedule(
    &self,
    namespace: &str,
    name: &str,
    schedule: &[String],
  ) -> Result<(), ResourceError>;
  async fn delete(
    &self,
    namespace: &str,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError>;
}

/// Namespace, volume, secret and role operations.
///
/// Label selectors use the `key=value[,key=value]` form.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
  async fn create_namespace(
    &self,
    name: &str,
    labels: &BTreeMap<String, String>,
  ) -> Result<(), ResourceError>;
  async fn delete_namespace(
    &self,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError>;

  async fn list_volume_claims(
    &self,
    namespace: &str,
    selector: &str,
  ) -> Result<Vec<VolumeClaim>, ResourceError>;
  async fn volume_claim_exists(&self, namespace: &str, name: &str) -> Result<bool, ResourceError>;
  async fn create_volume_claim(&self, claim: &VolumeClaim) -> Result<(), ResourceError>;

  /// Names of cluster-scoped volumes matching `selector`.
  async fn list_volumes(&self, selector: &str) -> Result<Vec<String>, ResourceError>;
  async fn delete_volume(
    &self,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError>;

  async fn get_secret(&self, namespace: &str, name: &str)
    -> Result<Option<SecretData>, ResourceError>;
  async fn create_secret(&self, namespace: &str, secret: &SecretData)
    -> Result<(), ResourceError>;

  async fn create_role(&self, namespace: &str, role: &AccessRole) -> Result<(), ResourceError>;
  async fn create_role_binding(
    &self,
    namespace: &str,
    binding: &AccessRoleBinding,
  ) -> Result<(), ResourceError>;
}

/// Parses `key=value[,key=value]` into pairs; malformed terms are ignored.
pub(crate) fn parse_selector(selector: &str) -> Vec<(String, String)> {
  selector
    .split(',')
    .filter_map(|term| {
      let (k, v) = term.split_once('=')?;
      Some((k.trim().to_string(), v.trim().to_string()))
    })
    .collect()
}

pub(crate) fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
  parse_selector(selector)
    .iter()
    .all(|(k, v)| labels.get(k) == Some(v))
}
