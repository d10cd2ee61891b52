use super::{
  AccessRole, AccessRoleBinding, ClusterProvider, CourseObject, CourseResource,
  CourseResourceClient, DeletePropagation, SecretData, VolumeClaim,
};
use crate::error::ResourceError;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

fn map_err(kind: &'static str, name: &str, err: kube::Error) -> ResourceError {
  match err {
    kube::Error::Api(ae) if ae.code == 404 => ResourceError::NotFound {
      kind,
      name: name.to_string(),
    },
    kube::Error::Api(ae) if ae.code == 409 => ResourceError::AlreadyExists {
      kind,
      name: name.to_string(),
    },
    other => ResourceError::Api(format!("{kind} `{name}`: {other}")),
  }
}

fn delete_params(propagation: DeletePropagation) -> DeleteParams {
  match propagation {
    DeletePropagation::Foreground => DeleteParams::foreground(),
    DeletePropagation::Background => DeleteParams::background(),
  }
}

fn to_resource(obj: CourseObject) -> CourseResource {
  CourseResource {
    name: obj.name_any(),
    namespace: obj.namespace().unwrap_or_default(),
    annotations: obj.annotations().clone(),
    spec: obj.spec,
    status: obj.status,
  }
}

fn to_volume_claim(pvc: PersistentVolumeClaim) -> VolumeClaim {
  let name = pvc.name_any();
  let namespace = pvc.namespace().unwrap_or_default();
  let labels = pvc.labels().clone();
  let annotations = pvc.annotations().clone();
  let spec = pvc.spec.unwrap_or_default();
  let storage_request = spec
    .resources
    .and_then(|r| r.requests)
    .and_then(|mut requests| requests.remove("storage"))
    .map(|q| q.0)
    .unwrap_or_default();
  VolumeClaim {
    name,
    namespace,
    labels,
    annotations,
    access_modes: spec.access_modes.unwrap_or_default(),
    storage_request,
    storage_class: spec.storage_class_name,
  }
}

/// Kubernetes-backed cluster collaborators.
///
/// `Course` objects go through the `nchc.ai/v1alpha1` custom resource; everything else uses
/// the core and RBAC APIs.
#[derive(Clone)]
pub struct KubeCluster {
  client: Client,
}

impl KubeCluster {
  pub fn new(client: Client) -> Self {
    Self { client }
  }

  /// Connects using the in-cluster or kubeconfig defaults.
  pub async fn try_default() -> Result<Self, ResourceError> {
    let client = Client::try_default()
      .await
      .map_err(|e| ResourceError::Api(format!("client construction failed: {e}")))?;
    Ok(Self::new(client))
  }

  fn courses(&self, namespace: &str) -> Api<CourseObject> {
    Api::namespaced(self.client.clone(), namespace)
  }
}

#[async_trait]
impl CourseResourceClient for KubeCluster {
  async fn get(&self, namespace: &str, name: &str) -> Result<CourseResource, ResourceError> {
    let obj = self
      .courses(namespace)
      .get(name)
      .await
      .map_err(|e| map_err("Course", name, e))?;
    Ok(to_resource(obj))
  }

  async fn create(&self, resource: &CourseResource) -> Result<CourseResource, ResourceError> {
    let mut obj = CourseObject::new(&resource.name, resource.spec.clone());
    obj.metadata.namespace = Some(resource.namespace.clone());
    obj.metadata.annotations = Some(resource.annotations.clone());
    let created = self
      .courses(&resource.namespace)
      .create(&PostParams::default(), &obj)
      .await
      .map_err(|e| map_err("Course", &resource.name, e))?;
    debug!(namespace = %resource.namespace, name = %resource.name, "Course object created.");
    Ok(to_resource(created))
  }

  async fn list(&self, namespace: &str) -> Result<Vec<CourseResource>, ResourceError> {
    let list = self
      .courses(namespace)
      .list(&ListParams::default())
      .await
      .map_err(|e| map_err("Course", namespace, e))?;
    Ok(list.items.into_iter().map(to_resource).collect())
  }

  async fn update_schedule(
    &self,
    namespace: &str,
    name: &str,
    schedule: &[String],
  ) -> Result<(), ResourceError> {
    let patch = json!({ "spec": { "schedule": schedule } });
    self
      .courses(namespace)
      .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
      .await
      .map_err(|e| map_err("Course", name, e))?;
    Ok(())
  }

  async fn delete(
    &self,
    namespace: &str,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    self
      .courses(namespace)
      .delete(name, &delete_params(propagation))
      .await
      .map_err(|e| map_err("Course", name, e))?;
    Ok(())
  }
}

#[async_trait]
impl ClusterProvider for KubeCluster {
  async fn create_namespace(
    &self,
    name: &str,
    labels: &BTreeMap<String, String>,
  ) -> Result<(), ResourceError> {
    let ns = Namespace {
      metadata: ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
      },
      ..Default::default()
    };
    let api: Api<Namespace> = Api::all(self.client.clone());
    api
      .create(&PostParams::default(), &ns)
      .await
      .map_err(|e| map_err("Namespace", name, e))?;
    Ok(())
  }

  async fn delete_namespace(
    &self,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    let api: Api<Namespace> = Api::all(self.client.clone());
    api
      .delete(name, &delete_params(propagation))
      .await
      .map_err(|e| map_err("Namespace", name, e))?;
    Ok(())
  }

  async fn list_volume_claims(
    &self,
    namespace: &str,
    selector: &str,
  ) -> Result<Vec<VolumeClaim>, ResourceError> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
    let list = api
      .list(&ListParams::default().labels(selector))
      .await
      .map_err(|e| map_err("PersistentVolumeClaim", namespace, e))?;
    Ok(list.items.into_iter().map(to_volume_claim).collect())
  }

  async fn volume_claim_exists(&self, namespace: &str, name: &str) -> Result<bool, ResourceError> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
    let found = api
      .get_opt(name)
      .await
      .map_err(|e| map_err("PersistentVolumeClaim", name, e))?;
    Ok(found.is_some())
  }

  async fn create_volume_claim(&self, claim: &VolumeClaim) -> Result<(), ResourceError> {
    // Built from JSON so the resources field type does not depend on the API version.
    let pvc: PersistentVolumeClaim = serde_json::from_value(json!({
      "metadata": {
        "name": claim.name,
        "namespace": claim.namespace,
        "labels": claim.labels,
        "annotations": claim.annotations,
      },
      "spec": {
        "accessModes": claim.access_modes,
        "storageClassName": claim.storage_class,
        "resources": { "requests": { "storage": claim.storage_request } },
      },
    }))
    .map_err(|e| ResourceError::Api(format!("volume claim `{}` is malformed: {e}", claim.name)))?;
    let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &claim.namespace);
    api
      .create(&PostParams::default(), &pvc)
      .await
      .map_err(|e| map_err("PersistentVolumeClaim", &claim.name, e))?;
    Ok(())
  }

  async fn list_volumes(&self, selector: &str) -> Result<Vec<String>, ResourceError> {
    let api: Api<PersistentVolume> = Api::all(self.client.clone());
    let list = api
      .list(&ListParams::default().labels(selector))
      .await
      .map_err(|e| map_err("PersistentVolume", selector, e))?;
    Ok(list.items.iter().map(|pv| pv.name_any()).collect())
  }

  async fn delete_volume(
    &self,
    name: &str,
    propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    let api: Api<PersistentVolume> = Api::all(self.client.clone());
    api
      .delete(name, &delete_params(propagation))
      .await
      .map_err(|e| map_err("PersistentVolume", name, e))?;
    Ok(())
  }

  async fn get_secret(
    &self,
    namespace: &str,
    name: &str,
  ) -> Result<Option<SecretData>, ResourceError> {
    let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
    let secret = api
      .get_opt(name)
      .await
      .map_err(|e| map_err("Secret", name, e))?;
    Ok(secret.map(|s| SecretData {
      name: s.name_any(),
      type_: s.type_.unwrap_or_default(),
      data: s
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect(),
    }))
  }

  async fn create_secret(
    &self,
    namespace: &str,
    secret: &SecretData,
  ) -> Result<(), ResourceError> {
    let obj = Secret {
      metadata: ObjectMeta {
        name: Some(secret.name.clone()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
      },
      type_: Some(secret.type_.clone()),
      data: Some(
        secret
          .data
          .iter()
          .map(|(k, v)| (k.clone(), ByteString(v.clone())))
          .collect(),
      ),
      ..Default::default()
    };
    let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
    api
      .create(&PostParams::default(), &obj)
      .await
      .map_err(|e| map_err("Secret", &secret.name, e))?;
    Ok(())
  }

  async fn create_role(&self, namespace: &str, role: &AccessRole) -> Result<(), ResourceError> {
    let obj = Role {
      metadata: ObjectMeta {
        name: Some(role.name.clone()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
      },
      rules: Some(
        role
          .rules
          .iter()
          .map(|rule| PolicyRule {
            api_groups: Some(rule.api_groups.clone()),
            resources: Some(rule.resources.clone()),
            resource_names: Some(rule.resource_names.clone()),
            verbs: rule.verbs.clone(),
            ..Default::default()
          })
          .collect(),
      ),
    };
    let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
    api
      .create(&PostParams::default(), &obj)
      .await
      .map_err(|e| map_err("Role", &role.name, e))?;
    Ok(())
  }

  async fn create_role_binding(
    &self,
    namespace: &str,
    binding: &AccessRoleBinding,
  ) -> Result<(), ResourceError> {
    let obj = RoleBinding {
      metadata: ObjectMeta {
        name: Some(binding.name.clone()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
      },
      role_ref: RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: binding.role_name.clone(),
      },
      subjects: Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: binding.service_account.clone(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
      }]),
    };
    let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
    api
      .create(&PostParams::default(), &obj)
      .await
      .map_err(|e| map_err("RoleBinding", &binding.name, e))?;
    Ok(())
  }
}
