use super::{
  matches_selector, AccessRole, AccessRoleBinding, ClusterProvider, CourseResource,
  CourseResourceClient, CourseResourceStatus, DeletePropagation, SecretData, VolumeClaim,
};
use crate::error::ResourceError;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct Namespace {
  labels: BTreeMap<String, String>,
  claims: BTreeMap<String, VolumeClaim>,
  secrets: BTreeMap<String, SecretData>,
  roles: BTreeMap<String, AccessRole>,
  bindings: BTreeMap<String, AccessRoleBinding>,
  courses: BTreeMap<String, CourseResource>,
}

#[derive(Debug, Default)]
struct Inner {
  namespaces: RwLock<BTreeMap<String, Namespace>>,
  volumes: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
  failpoints: Mutex<HashSet<String>>,
  calls: Mutex<HashMap<&'static str, usize>>,
  course_gets: AtomicUsize,
}

impl Inner {
  fn enter(&self, op: &'static str) -> Result<(), ResourceError> {
    *self.calls.lock().entry(op).or_default() += 1;
    if self.failpoints.lock().contains(op) {
      debug!(failpoint = op, "Injected cluster failure.");
      return Err(ResourceError::Injected(op.to_string()));
    }
    Ok(())
  }
}

fn missing_namespace(name: &str) -> ResourceError {
  ResourceError::NotFound {
    kind: "Namespace",
    name: name.to_string(),
  }
}

/// In-process cluster implementing both [`CourseResourceClient`] and [`ClusterProvider`].
///
/// Objects live under their namespace and vanish with it. Failpoints are keyed by trait
/// method name (`create_role_binding`, `get`, ...). Tests drive the watcher by flipping
/// [`MemoryCluster::set_accessible`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
  inner: Arc<Inner>,
}

impl MemoryCluster {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_on(&self, op: &str) {
    self.inner.failpoints.lock().insert(op.to_string());
  }

  pub fn clear_failure(&self, op: &str) {
    self.inner.failpoints.lock().remove(op);
  }

  /// How many times a trait method was called.
  pub fn calls(&self, op: &str) -> usize {
    self.inner.calls.lock().get(op).copied().unwrap_or(0)
  }

  /// Custom-resource reads so far (successful or not).
  pub fn course_gets(&self) -> usize {
    self.inner.course_gets.load(Ordering::SeqCst)
  }

  // --- Seeding ---

  pub fn put_namespace(&self, name: &str, labels: BTreeMap<String, String>) {
    let mut namespaces = self.inner.namespaces.write();
    namespaces.entry(name.to_string()).or_default().labels = labels;
  }

  pub fn put_claim(&self, claim: VolumeClaim) {
    let mut namespaces = self.inner.namespaces.write();
    namespaces
      .entry(claim.namespace.clone())
      .or_default()
      .claims
      .insert(claim.name.clone(), claim);
  }

  pub fn put_secret(&self, namespace: &str, secret: SecretData) {
    let mut namespaces = self.inner.namespaces.write();
    namespaces
      .entry(namespace.to_string())
      .or_default()
      .secrets
      .insert(secret.name.clone(), secret);
  }

  pub fn put_volume(&self, name: &str, labels: BTreeMap<String, String>) {
    self.inner.volumes.write().insert(name.to_string(), labels);
  }

  /// Sets the controller-side status of a custom resource. Returns false if it does not exist.
  pub fn set_status(&self, namespace: &str, name: &str, status: CourseResourceStatus) -> bool {
    let mut namespaces = self.inner.namespaces.write();
    match namespaces
      .get_mut(namespace)
      .and_then(|ns| ns.courses.get_mut(name))
    {
      Some(resource) => {
        resource.status = Some(status);
        true
      }
      None => false,
    }
  }

  pub fn set_accessible(&self, namespace: &str, name: &str, accessible: bool) -> bool {
    let mut status = self.course(namespace, name).and_then(|r| r.status).unwrap_or_default();
    status.accessible = accessible;
    self.set_status(namespace, name, status)
  }

  // --- Inspection ---

  pub fn has_namespace(&self, name: &str) -> bool {
    self.inner.namespaces.read().contains_key(name)
  }

  pub fn namespace_names(&self) -> Vec<String> {
    self.inner.namespaces.read().keys().cloned().collect()
  }

  pub fn namespace_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
    self.inner.namespaces.read().get(name).map(|ns| ns.labels.clone())
  }

  pub fn course(&self, namespace: &str, name: &str) -> Option<CourseResource> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .and_then(|ns| ns.courses.get(name).cloned())
  }

  pub fn course_names(&self, namespace: &str) -> Vec<String> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .map(|ns| ns.courses.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn claim(&self, namespace: &str, name: &str) -> Option<VolumeClaim> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .and_then(|ns| ns.claims.get(name).cloned())
  }

  pub fn claim_names(&self, namespace: &str) -> Vec<String> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .map(|ns| ns.claims.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretData> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .and_then(|ns| ns.secrets.get(name).cloned())
  }

  pub fn role(&self, namespace: &str, name: &str) -> Option<AccessRole> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .and_then(|ns| ns.roles.get(name).cloned())
  }

  pub fn role_binding(&self, namespace: &str, name: &str) -> Option<AccessRoleBinding> {
    self
      .inner
      .namespaces
      .read()
      .get(namespace)
      .and_then(|ns| ns.bindings.get(name).cloned())
  }

  pub fn volume_names(&self) -> Vec<String> {
    self.inner.volumes.read().keys().cloned().collect()
  }
}

#[async_trait]
impl CourseResourceClient for MemoryCluster {
  async fn get(&self, namespace: &str, name: &str) -> Result<CourseResource, ResourceError> {
    self.inner.course_gets.fetch_add(1, Ordering::SeqCst);
    self.inner.enter("get")?;
    self.course(namespace, name).ok_or_else(|| ResourceError::NotFound {
      kind: "Course",
      name: name.to_string(),
    })
  }

  async fn create(&self, resource: &CourseResource) -> Result<CourseResource, ResourceError> {
    self.inner.enter("create")?;
    let mut namespaces = self.inner.namespaces.write();
    let ns = namespaces
      .get_mut(&resource.namespace)
      .ok_or_else(|| missing_namespace(&resource.namespace))?;
    if ns.courses.contains_key(&resource.name) {
      return Err(ResourceError::AlreadyExists {
        kind: "Course",
        name: resource.name.clone(),
      });
    }
    ns.courses.insert(resource.name.clone(), resource.clone());
    Ok(resource.clone())
  }

  async fn list(&self, namespace: &str) -> Result<Vec<CourseResource>, ResourceError> {
    self.inner.enter("list")?;
    let namespaces = self.inner.namespaces.read();
    Ok(
      namespaces
        .get(namespace)
        .map(|ns| ns.courses.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn update_schedule(
    &self,
    namespace: &str,
    name: &str,
    schedule: &[String],
  ) -> Result<(), ResourceError> {
    self.inner.enter("update_schedule")?;
    let mut namespaces = self.inner.namespaces.write();
    let resource = namespaces
      .get_mut(namespace)
      .and_then(|ns| ns.courses.get_mut(name))
      .ok_or_else(|| ResourceError::NotFound {
        kind: "Course",
        name: name.to_string(),
      })?;
    resource.spec.schedule = schedule.to_vec();
    Ok(())
  }

  async fn delete(
    &self,
    namespace: &str,
    name: &str,
    _propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    self.inner.enter("delete")?;
    let mut namespaces = self.inner.namespaces.write();
    namespaces
      .get_mut(namespace)
      .and_then(|ns| ns.courses.remove(name))
      .map(|_| ())
      .ok_or_else(|| ResourceError::NotFound {
        kind: "Course",
        name: name.to_string(),
      })
  }
}

#[async_trait]
impl ClusterProvider for MemoryCluster {
  async fn create_namespace(
    &self,
    name: &str,
    labels: &BTreeMap<String, String>,
  ) -> Result<(), ResourceError> {
    self.inner.enter("create_namespace")?;
    let mut namespaces = self.inner.namespaces.write();
    if namespaces.contains_key(name) {
      return Err(ResourceError::AlreadyExists {
        kind: "Namespace",
        name: name.to_string(),
      });
    }
    namespaces.insert(
      name.to_string(),
      Namespace {
        labels: labels.clone(),
        ..Namespace::default()
      },
    );
    Ok(())
  }

  async fn delete_namespace(
    &self,
    name: &str,
    _propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    self.inner.enter("delete_namespace")?;
    self
      .inner
      .namespaces
      .write()
      .remove(name)
      .map(|_| ())
      .ok_or_else(|| missing_namespace(name))
  }

  async fn list_volume_claims(
    &self,
    namespace: &str,
    selector: &str,
  ) -> Result<Vec<VolumeClaim>, ResourceError> {
    self.inner.enter("list_volume_claims")?;
    let namespaces = self.inner.namespaces.read();
    Ok(
      namespaces
        .get(namespace)
        .map(|ns| {
          ns.claims
            .values()
            .filter(|c| matches_selector(&c.labels, selector))
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn volume_claim_exists(&self, namespace: &str, name: &str) -> Result<bool, ResourceError> {
    self.inner.enter("volume_claim_exists")?;
    Ok(self.claim(namespace, name).is_some())
  }

  async fn create_volume_claim(&self, claim: &VolumeClaim) -> Result<(), ResourceError> {
    self.inner.enter("create_volume_claim")?;
    let mut namespaces = self.inner.namespaces.write();
    let ns = namespaces
      .get_mut(&claim.namespace)
      .ok_or_else(|| missing_namespace(&claim.namespace))?;
    if ns.claims.contains_key(&claim.name) {
      return Err(ResourceError::AlreadyExists {
        kind: "PersistentVolumeClaim",
        name: claim.name.clone(),
      });
    }
    ns.claims.insert(claim.name.clone(), claim.clone());
    Ok(())
  }

  async fn list_volumes(&self, selector: &str) -> Result<Vec<String>, ResourceError> {
    self.inner.enter("list_volumes")?;
    let volumes = self.inner.volumes.read();
    Ok(
      volumes
        .iter()
        .filter(|(_, labels)| matches_selector(labels, selector))
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  async fn delete_volume(
    &self,
    name: &str,
    _propagation: DeletePropagation,
  ) -> Result<(), ResourceError> {
    self.inner.enter("delete_volume")?;
    self
      .inner
      .volumes
      .write()
      .remove(name)
      .map(|_| ())
      .ok_or_else(|| ResourceError::NotFound {
        kind: "PersistentVolume",
        name: name.to_string(),
      })
  }

  async fn get_secret(
    &self,
    namespace: &str,
    name: &str,
  ) -> Result<Option<SecretData>, ResourceError> {
    self.inner.enter("get_secret")?;
    Ok(self.secret(namespace, name))
  }

  async fn create_secret(
    &self,
    namespace: &str,
    secret: &SecretData,
  ) -> Result<(), ResourceError> {
    self.inner.enter("create_secret")?;
    let mut namespaces = self.inner.namespaces.write();
    let ns = namespaces
      .get_mut(namespace)
      .ok_or_else(|| missing_namespace(namespace))?;
    ns.secrets.insert(secret.name.clone(), secret.clone());
    Ok(())
  }

  async fn create_role(&self, namespace: &str, role: &AccessRole) -> Result<(), ResourceError> {
    self.inner.enter("create_role")?;
    let mut namespaces = self.inner.namespaces.write();
    let ns = namespaces
      .get_mut(namespace)
      .ok_or_else(|| missing_namespace(namespace))?;
    ns.roles.insert(role.name.clone(), role.clone());
    Ok(())
  }

  async fn create_role_binding(
    &self,
    namespace: &str,
    binding: &AccessRoleBinding,
  ) -> Result<(), ResourceError> {
    self.inner.enter("create_role_binding")?;
    let mut namespaces = self.inner.namespaces.write();
    let ns = namespaces
      .get_mut(namespace)
      .ok_or_else(|| missing_namespace(namespace))?;
    ns.bindings.insert(binding.name.clone(), binding.clone());
    Ok(())
  }
}
