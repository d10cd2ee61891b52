//! Job launch, deletion, listing and watcher bookkeeping.
//!
//! A course is either resource-backed (a `Course` custom resource plus a job row, watched
//! until the controller reports it accessible) or externally backed (handed whole to the
//! VM job stack). Launch decides which only after admission; deletion decides by looking
//! for the job row.

use crate::admission::{Admission, AdmissionController};
use crate::cache::ListCache;
use crate::cluster::{CourseResourceClient, DeletePropagation};
use crate::config::{KeeperConfig, ReservedClassrooms};
use crate::error::{CoreError, ShutdownError, StoreError};
use crate::message;
use crate::model::{
  AuditRecord, CourseKind, Job, JobStatus, JobView, LabelValue, LaunchRequest, LaunchTicket,
  OauthUser,
};
use crate::registry::CancellationRegistry;
use crate::saga::{Compensation, Compensator, Saga};
use crate::spec_builder::ResourceSpecBuilder;
use crate::stack::{JobStack, StackLaunchRequest};
use crate::store::Store;
use crate::watcher::{ReconciliationWatcher, WatchOutcome};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct JobLifecycle {
  store: Arc<dyn Store>,
  resources: Arc<dyn CourseResourceClient>,
  cache: Arc<dyn ListCache>,
  job_stack: Arc<dyn JobStack>,
  admission: AdmissionController,
  builder: ResourceSpecBuilder,
  compensator: Compensator,
  registry: Arc<CancellationRegistry>,
  reserved: ReservedClassrooms,
  config: KeeperConfig,
  // Watcher tasks, awaited on shutdown.
  handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl JobLifecycle {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    store: Arc<dyn Store>,
    resources: Arc<dyn CourseResourceClient>,
    cache: Arc<dyn ListCache>,
    job_stack: Arc<dyn JobStack>,
    admission: AdmissionController,
    compensator: Compensator,
    registry: Arc<CancellationRegistry>,
    config: KeeperConfig,
  ) -> Self {
    Self {
      builder: ResourceSpecBuilder::new(
        store.clone(),
        config.runs_privileged(),
        config.storage_class.clone(),
      ),
      reserved: config.reserved(),
      store,
      resources,
      cache,
      job_stack,
      admission,
      compensator,
      registry,
      config,
      handles: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn admission(&self) -> &AdmissionController {
    &self.admission
  }

  // --- Launch ---

  /// Admits and starts a job.
  ///
  /// Resource-backed launches return as soon as the resource and job row exist; readiness
  /// is tracked by a watcher. Externally backed launches return the stack's answer.
  pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchTicket, CoreError> {
    if let Admission::Deny(denial) = self.admission.check_launch(&request).await? {
      return Err(denial.into());
    }

    let kind = self
      .store
      .course_kind(&request.course_id)
      .await
      .map_err(|e| CoreError::storage(&e, message::launch_build(&request.course_id)))?;
    debug!(course_id = %request.course_id, ?kind, "Resolved course kind.");

    match kind {
      CourseKind::ResourceBacked => self.launch_resource(request).await,
      CourseKind::ExternallyBacked => self.launch_external(request).await,
    }
  }

  async fn launch_external(&self, request: LaunchRequest) -> Result<LaunchTicket, CoreError> {
    let body = StackLaunchRequest {
      user: request.user.user.clone(),
      course_id: request.course_id.clone(),
    };
    match self.job_stack.launch(request.auth_token.clone(), body).await {
      Ok(ticket) => {
        info!(job_id = %ticket.job_id, user = %request.user, "VM job launched.");
        Ok(ticket)
      }
      Err(e) => {
        error!(course_id = %request.course_id, error = %e, "VM job launch failed.");
        Err(e.into())
      }
    }
  }

  async fn launch_resource(&self, request: LaunchRequest) -> Result<LaunchTicket, CoreError> {
    let account = self
      .store
      .user(&request.user)
      .await
      .map_err(|e| CoreError::from_store(&e, message::launch_build(&request.course_id)))?;
    let namespace = self
      .reserved
      .namespace_for(request.classroom_id.as_deref())
      .to_string();
    let blueprint = self
      .builder
      .build(&namespace, &request.course_id, &account)
      .await?;

    let job = Job {
      id: blueprint.resource.name.clone(),
      owner: request.user.clone(),
      course_id: request.course_id.clone(),
      classroom_id: request.classroom_id.clone(),
      status: JobStatus::Created,
      created_at: Utc::now(),
    };

    let resource = &blueprint.resource;
    let course_name = blueprint.course_name.as_str();
    let job_row = &job;
    let applied = Saga::new(format!("launch {}", job.id))
      .step(
        "course-resource",
        Some(Compensation::DeleteCourseResource {
          namespace: namespace.clone(),
          name: job.id.clone(),
        }),
        move || {
          async move {
            self
              .resources
              .create(resource)
              .await
              .map(|_| ())
              .map_err(|e| CoreError::resource(&e, message::launch_run(course_name)))
          }
          .boxed()
        },
      )
      .step("job-row", None, move || {
        async move {
          self
            .store
            .insert_job(job_row)
            .await
            .map_err(|e| CoreError::storage(&e, message::launch_run(course_name)))
        }
        .boxed()
      })
      .execute(&self.compensator)
      .await
      .map_err(|failure| failure.error)?;
    applied.finish();

    self.invalidate(&job.owner).await;

    let audit = AuditRecord {
      id: job.id.clone(),
      owner: job.owner.clone(),
      course_id: job.course_id.clone(),
      classroom_id: job.classroom_id.clone(),
      deleted_by: None,
      created_at: job.created_at,
    };
    if let Err(e) = self.store.insert_audit(&audit).await {
      warn!(job_id = %job.id, error = %e, "Failed to record job audit row.");
    }

    self.spawn_watcher(&job);
    info!(job_id = %job.id, user = %job.owner, %namespace, "Course resource launched.");

    Ok(LaunchTicket {
      job_id: job.id,
      ready: false,
      status: JobStatus::Created.to_string(),
    })
  }

  // --- Delete ---

  /// Deletes a job. Ids unknown to the job table belong to the VM stack.
  pub async fn delete_job(
    &self,
    job_id: &str,
    actor: &str,
    auth_token: Option<String>,
  ) -> Result<(), CoreError> {
    if job_id.trim().is_empty() {
      return Err(CoreError::validation(
        "job id cannot be empty",
        message::job_delete(job_id),
      ));
    }

    let job = match self.store.job(job_id).await {
      Ok(job) => job,
      Err(e) if e.is_not_found() => {
        debug!(%job_id, "Job not in the job table; delegating to the VM stack.");
        return self
          .job_stack
          .delete(auth_token, job_id.to_string())
          .await
          .map_err(|e| {
            error!(%job_id, error = %e, "VM job deletion failed.");
            CoreError::from(e)
          });
      }
      Err(e) => return Err(CoreError::storage(&e, message::job_delete(job_id))),
    };

    if let Err(e) = self.store.mark_audit_deleted(&job.id, actor).await {
      warn!(%job_id, error = %e, "Failed to mark audit row deleted.");
    }
    self.tear_down(&job, message::job_delete(job_id)).await?;
    info!(%job_id, %actor, "Job deleted.");
    Ok(())
  }

  /// Deletes a course and every job launched from it.
  pub async fn delete_course(&self, course_id: &str) -> Result<(), CoreError> {
    let course = self
      .store
      .course(course_id)
      .await
      .map_err(|e| CoreError::from_store(&e, message::course_delete_info(course_id)))?;
    let jobs = self
      .store
      .jobs_for_course(course_id)
      .await
      .map_err(|e| CoreError::storage(&e, message::course_delete_job(&course.name)))?;

    for job in &jobs {
      self
        .tear_down(job, message::course_delete_job(&course.name))
        .await?;
    }
    self
      .store
      .delete_course(course_id)
      .await
      .map_err(|e| CoreError::storage(&e, message::course_delete_info(&course.name)))?;

    info!(%course_id, jobs = jobs.len(), "Course deleted.");
    Ok(())
  }

  /// Resource, row, cache entry, watcher: in that order.
  async fn tear_down(&self, job: &Job, failure_message: String) -> Result<(), CoreError> {
    let namespace = self.reserved.namespace_for(job.classroom_id.as_deref());
    match self
      .resources
      .delete(namespace, &job.id, DeletePropagation::Foreground)
      .await
    {
      Ok(()) => {}
      Err(e) if e.is_not_found() => warn!(job_id = %job.id, "Course resource already gone."),
      Err(e) => {
        error!(job_id = %job.id, error = %e, "Failed to delete course resource.");
        return Err(CoreError::resource(&e, failure_message));
      }
    }

    self.store.delete_job(&job.id).await.map_err(|e| {
      error!(job_id = %job.id, error = %e, "Failed to delete job row.");
      CoreError::storage(&e, failure_message)
    })?;
    self.invalidate(&job.owner).await;
    self.registry.signal_stop(&job.id);
    Ok(())
  }

  // --- Watchers ---

  /// Re-arms a watcher for every job that has not reached `Ready`.
  pub async fn resume(&self) -> Result<usize, CoreError> {
    let jobs = self
      .store
      .unready_jobs()
      .await
      .map_err(|e| CoreError::storage(&e, message::storage_failure()))?;
    for job in &jobs {
      self.spawn_watcher(job);
    }
    info!(count = jobs.len(), "Watchers resumed.");
    Ok(jobs.len())
  }

  fn spawn_watcher(&self, job: &Job) {
    let namespace = self.reserved.namespace_for(job.classroom_id.as_deref());
    let channel = self.registry.arm(&job.id);
    let armed = channel.rearm.clone();
    let watcher = ReconciliationWatcher::new(
      job,
      namespace,
      self.store.clone(),
      self.resources.clone(),
      self.cache.clone(),
      channel,
      self.config.watch.build(),
    );
    let registry = self.registry.clone();
    let job_id = job.id.clone();
    let handle = tokio::spawn(async move {
      match watcher.run().await {
        WatchOutcome::Ready | WatchOutcome::Exhausted => {
          registry.release(&job_id, &armed);
        }
        WatchOutcome::Stopped => {}
      }
    });

    let mut handles = self.handles.lock();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Stops every watcher and waits for their tasks, up to `timeout` when given.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let stopped = self.registry.signal_stop_all();
    let handles = std::mem::take(&mut *self.handles.lock());
    info!(stopped, tasks = handles.len(), "Stopping watchers.");

    let joined = join_all(handles);
    let results = match timeout {
      Some(limit) => tokio::time::timeout(limit, joined).await.map_err(|_| {
        error!("Watcher shutdown timed out after {:?}", limit);
        ShutdownError::Timeout
      })?,
      None => joined.await,
    };

    if let Some(e) = results.into_iter().find_map(Result::err) {
      error!("A watcher task panicked: {:?}", e);
      return Err(ShutdownError::TaskPanic);
    }
    info!("All watcher tasks joined.");
    Ok(())
  }

  // --- Listing ---

  /// The owner's jobs with course details and reachable endpoints. Served from the cache
  /// when possible.
  pub async fn list_jobs(&self, owner: &OauthUser) -> Result<Vec<JobView>, CoreError> {
    let key = owner.cache_key();
    match self.cache.get(&key).await {
      Ok(Some(value)) => match serde_json::from_value::<Vec<JobView>>(value) {
        Ok(views) => {
          debug!(cache_key = %key, "Job list served from cache.");
          return Ok(views);
        }
        Err(e) => warn!(cache_key = %key, error = %e, "Discarding undecodable cache entry."),
      },
      Ok(None) => {}
      Err(e) => warn!(cache_key = %key, error = %e, "Job list cache read failed."),
    }

    let read = |e: StoreError| CoreError::storage(&e, message::storage_failure());
    let jobs = self.store.jobs_owned_by(owner).await.map_err(read)?;
    let mut views = Vec::with_capacity(jobs.len());
    for job in jobs {
      let course = match self.store.course(&job.course_id).await {
        Ok(course) => course,
        Err(e) if e.is_not_found() => {
          warn!(job_id = %job.id, course_id = %job.course_id, "Job refers to a missing course.");
          continue;
        }
        Err(e) => return Err(read(e)),
      };
      let namespace = self.reserved.namespace_for(job.classroom_id.as_deref());
      let service = match self.resources.get(namespace, &job.id).await {
        Ok(resource) => resource
          .endpoints(&self.config.node_port_dns)
          .into_iter()
          .map(|(name, address)| LabelValue::new(name, address))
          .collect(),
        Err(e) => {
          debug!(job_id = %job.id, error = %e, "No endpoints for job.");
          Vec::new()
        }
      };
      views.push(JobView {
        id: job.id,
        course_id: job.course_id,
        start_at: job.created_at,
        status: job.status,
        can_snapshot: course.owner == *owner,
        name: course.name,
        introduction: course.introduction.unwrap_or_default(),
        image: course.image,
        level: course.level,
        gpu: course.gpu,
        service,
      });
    }

    match serde_json::to_value(&views) {
      Ok(value) => {
        if let Err(e) = self.cache.set(&key, value).await {
          warn!(cache_key = %key, error = %e, "Failed to fill job list cache.");
        }
      }
      Err(e) => warn!(cache_key = %key, error = %e, "Job list could not be encoded for cache."),
    }
    Ok(views)
  }

  async fn invalidate(&self, owner: &OauthUser) {
    let key = owner.cache_key();
    if let Err(e) = self.cache.delete(&key).await {
      warn!(cache_key = %key, error = %e, "Failed to invalidate job list cache.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryCache;
  use crate::cluster::MemoryCluster;
  use crate::error::StackError;
  use crate::schedule::ScheduleEvaluator;
  use crate::stack::MockJobStack;
  use crate::store::MemoryStore;

  fn lifecycle(store: &MemoryStore, stack: MockJobStack) -> JobLifecycle {
    let cluster = MemoryCluster::new();
    let config = KeeperConfig::default();
    let store: Arc<dyn Store> = Arc::new(store.clone());
    JobLifecycle::new(
      store.clone(),
      Arc::new(cluster.clone()),
      Arc::new(MemoryCache::new()),
      Arc::new(stack),
      AdmissionController::new(
        store,
        ScheduleEvaluator::new(&config.timezone).unwrap(),
        config.reserved(),
      ),
      Compensator::new(Arc::new(cluster.clone()), Arc::new(cluster)),
      Arc::new(CancellationRegistry::new()),
      config,
    )
  }

  #[tokio::test]
  async fn unknown_job_is_deleted_through_the_stack() {
    let mut stack = MockJobStack::new();
    stack
      .expect_delete()
      .withf(|token, id| token.as_deref() == Some("Bearer t") && id == "vm-7")
      .times(1)
      .returning(|_, _| Ok(()));

    lifecycle(&MemoryStore::new(), stack)
      .delete_job("vm-7", "alice", Some("Bearer t".into()))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn external_launch_passes_the_stack_answer_through() {
    let store = MemoryStore::new();
    let owner = OauthUser::new("alice", "github");
    store.put_external_course("vm-course", owner.clone());

    let mut stack = MockJobStack::new();
    stack
      .expect_launch()
      .withf(|_, body| body.user == "alice" && body.course_id == "vm-course")
      .times(1)
      .returning(|_, _| {
        Err(StackError::Rejected {
          message: "no capacity".into(),
        })
      });

    let err = lifecycle(&store, stack)
      .launch(LaunchRequest::new(owner, "vm-course", None))
      .await
      .unwrap_err();
    assert!(matches!(err, CoreError::Stack { .. }));
    assert_eq!(err.message(), "no capacity");
  }

  #[tokio::test]
  async fn denial_becomes_denied_error() {
    let store = MemoryStore::new();
    let mut stack = MockJobStack::new();
    stack.expect_launch().never();
    let err = lifecycle(&store, stack)
      .launch(LaunchRequest::new(OauthUser::new("bob", "github"), "nobody-owns", None))
      .await
      .unwrap_err();
    assert!(matches!(err, CoreError::Denied { .. }));
  }
}
