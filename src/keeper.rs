//! The top-level handle and its builder.

use crate::admission::{Admission, AdmissionController};
use crate::cache::ListCache;
use crate::cluster::{ClusterProvider, CourseResourceClient};
use crate::config::KeeperConfig;
use crate::error::{BuildError, CoreError, ShutdownError};
use crate::model::{
  Classroom, ClassroomDetail, ClassroomRequest, JobView, LaunchRequest, LaunchTicket, OauthUser,
};
use crate::orchestrator::JobLifecycle;
use crate::provision::ClassroomProvisioner;
use crate::registry::CancellationRegistry;
use crate::saga::Compensator;
use crate::schedule::ScheduleEvaluator;
use crate::stack::{DisabledJobStack, JobStack};
use crate::store::Store;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// Assembles a [`CourseKeeper`] from its collaborators.
///
/// A store, a custom-resource client, a cluster provider and a list cache are required.
/// Without a job stack, VM courses fail with [`StackError::Disabled`](crate::StackError).
///
/// # Example
///
/// ```no_run
/// use coursekeeper::{CourseKeeper, KeeperConfig, MemoryCache, MemoryCluster, MemoryStore};
///
/// # fn build() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = MemoryCluster::new();
/// let keeper = CourseKeeper::builder()
///     .store(MemoryStore::new())
///     .cluster_backend(cluster)
///     .cache(MemoryCache::new())
///     .config(KeeperConfig::default())
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct CourseKeeperBuilder {
  store: Option<Arc<dyn Store>>,
  resources: Option<Arc<dyn CourseResourceClient>>,
  cluster: Option<Arc<dyn ClusterProvider>>,
  cache: Option<Arc<dyn ListCache>>,
  job_stack: Option<Arc<dyn JobStack>>,
  config: KeeperConfig,
}

impl CourseKeeperBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn store(mut self, store: impl Store + 'static) -> Self {
    self.store = Some(Arc::new(store));
    self
  }

  pub fn resources(mut self, resources: impl CourseResourceClient + 'static) -> Self {
    self.resources = Some(Arc::new(resources));
    self
  }

  pub fn cluster(mut self, cluster: impl ClusterProvider + 'static) -> Self {
    self.cluster = Some(Arc::new(cluster));
    self
  }

  /// Uses one backend for both the custom-resource client and the cluster provider.
  pub fn cluster_backend<C>(mut self, backend: C) -> Self
  where
    C: ClusterProvider + CourseResourceClient + 'static,
  {
    let backend = Arc::new(backend);
    self.resources = Some(backend.clone());
    self.cluster = Some(backend);
    self
  }

  pub fn cache(mut self, cache: impl ListCache + 'static) -> Self {
    self.cache = Some(Arc::new(cache));
    self
  }

  pub fn job_stack(mut self, job_stack: impl JobStack + 'static) -> Self {
    self.job_stack = Some(Arc::new(job_stack));
    self
  }

  pub fn config(mut self, config: KeeperConfig) -> Self {
    self.config = config;
    self
  }

  /// Validates the configuration and wires the components. Spawns nothing; call
  /// [`CourseKeeper::resume`] to re-arm watchers of unfinished jobs.
  pub fn build(self) -> Result<CourseKeeper, BuildError> {
    let store = self.store.ok_or(BuildError::MissingCollaborator("store"))?;
    let resources = self
      .resources
      .ok_or(BuildError::MissingCollaborator("resources"))?;
    let cluster = self.cluster.ok_or(BuildError::MissingCollaborator("cluster"))?;
    let cache = self.cache.ok_or(BuildError::MissingCollaborator("cache"))?;
    let job_stack = self.job_stack.unwrap_or_else(|| {
      warn!("No job stack configured; VM courses are disabled.");
      Arc::new(DisabledJobStack)
    });

    let config = self.config;
    config.validate()?;
    let evaluator = ScheduleEvaluator::new(&config.timezone)
      .map_err(|_| BuildError::UnknownTimezone(config.timezone.clone()))?;

    let registry = Arc::new(CancellationRegistry::new());
    let admission = AdmissionController::new(store.clone(), evaluator, config.reserved());
    let compensator = Compensator::new(cluster.clone(), resources.clone());

    let jobs = JobLifecycle::new(
      store.clone(),
      resources.clone(),
      cache.clone(),
      job_stack,
      admission,
      compensator,
      registry.clone(),
      config.clone(),
    );
    let classrooms = ClassroomProvisioner::new(
      store,
      cluster,
      resources,
      cache,
      registry.clone(),
      config.clone(),
    );

    info!(prefix = %config.namespace_prefix, timezone = %config.timezone, "CourseKeeper built.");
    Ok(CourseKeeper {
      inner: Arc::new(Inner {
        jobs,
        classrooms,
        registry,
        config,
      }),
    })
  }
}

struct Inner {
  jobs: JobLifecycle,
  classrooms: ClassroomProvisioner,
  registry: Arc<CancellationRegistry>,
  config: KeeperConfig,
}

/// Handle to the classroom and job core. Cheap to clone.
#[derive(Clone)]
pub struct CourseKeeper {
  inner: Arc<Inner>,
}

impl CourseKeeper {
  pub fn builder() -> CourseKeeperBuilder {
    CourseKeeperBuilder::new()
  }

  pub fn config(&self) -> &KeeperConfig {
    &self.inner.config
  }

  /// Watcher channel registry, for inspection.
  pub fn registry(&self) -> &CancellationRegistry {
    &self.inner.registry
  }

  // --- Jobs ---

  /// Runs admission only. Denials are `Ok(Admission::Deny(..))`.
  pub async fn check_launch(&self, request: &LaunchRequest) -> Result<Admission, CoreError> {
    self.inner.jobs.admission().check_launch(request).await
  }

  pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchTicket, CoreError> {
    self.inner.jobs.launch(request).await
  }

  /// `actor` is recorded on the job's audit row.
  pub async fn delete_job(
    &self,
    job_id: &str,
    actor: &str,
    auth_token: Option<String>,
  ) -> Result<(), CoreError> {
    self.inner.jobs.delete_job(job_id, actor, auth_token).await
  }

  pub async fn list_jobs(&self, owner: &OauthUser) -> Result<Vec<JobView>, CoreError> {
    self.inner.jobs.list_jobs(owner).await
  }

  pub async fn delete_course(&self, course_id: &str) -> Result<(), CoreError> {
    self.inner.jobs.delete_course(course_id).await
  }

  /// Re-arms a watcher for every job not yet `Ready`; returns how many.
  pub async fn resume(&self) -> Result<usize, CoreError> {
    self.inner.jobs.resume().await
  }

  /// Stops all watchers and waits for them. Defaults to the configured timeout.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let timeout = timeout.unwrap_or_else(|| self.inner.config.shutdown_timeout());
    self.inner.jobs.shutdown(Some(timeout)).await
  }

  // --- Classrooms ---

  /// `provider` is recorded on the teacher and student rows.
  pub async fn create_classroom(
    &self,
    request: ClassroomRequest,
    provider: &str,
  ) -> Result<Classroom, CoreError> {
    self.inner.classrooms.create_classroom(request, provider).await
  }

  pub async fn update_classroom(
    &self,
    request: ClassroomRequest,
    provider: &str,
  ) -> Result<Classroom, CoreError> {
    self.inner.classrooms.update_classroom(request, provider).await
  }

  pub async fn delete_classroom(&self, id: &str) -> Result<(), CoreError> {
    self.inner.classrooms.delete_classroom(id).await
  }

  pub async fn classroom_detail(&self, id: &str) -> Result<ClassroomDetail, CoreError> {
    self.inner.classrooms.classroom_detail(id).await
  }

  pub async fn list_classrooms(&self) -> Result<Vec<Classroom>, CoreError> {
    self.inner.classrooms.list_classrooms().await
  }

  pub async fn user_classrooms(&self, user: &OauthUser) -> Result<Vec<Classroom>, CoreError> {
    self.inner.classrooms.user_classrooms(user).await
  }
}
