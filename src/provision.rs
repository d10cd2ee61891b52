//! Classroom tenancy: the storage rows of a classroom plus its namespace, dataset claims,
//! TLS secret and access role.
//!
//! Storage mutations of one operation share a single transaction. The cluster has no
//! transaction, so the create path runs its cluster work as a [`Saga`] whose compensation
//! deletes the namespace; the storage transaction is committed only after the saga applied.

use crate::cache::ListCache;
use crate::cluster::{
  AccessRole, AccessRoleBinding, AccessRule, ClusterProvider, CourseResourceClient,
  DeletePropagation, SecretData, VolumeClaim,
};
use crate::config::{KeeperConfig, ReservedClassrooms};
use crate::error::{CoreError, ResourceError, StoreError};
use crate::message;
use crate::model::{
  Classroom, ClassroomDetail, ClassroomRequest, MemberRole, OauthUser, ScheduleWindow,
};
use crate::registry::CancellationRegistry;
use crate::saga::{Compensation, Compensator, Saga};
use crate::schedule::CronExpr;
use crate::store::{RelationRows, Store, StoreTx};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

pub const SCC_ROLE_NAME: &str = "scc-role";
pub const SCC_ROLE_BINDING_NAME: &str = "scc-role-binding";
/// Label tying namespaces and source dataset claims to one platform instance.
pub const INSTANCE_LABEL: &str = "instance";
/// Label on cluster-scoped volumes that belong to a classroom.
pub const VOLUME_CLASSROOM_LABEL: &str = "classroom";
pub const DATASET_PREFIX: &str = "dataset-";

const LINK_DATA_ANNOTATION: &str = "nchc.ai/link-data";
const SOURCE_NAMESPACE_ANNOTATION: &str = "nchc.ai/src-pvc-namespace";
const SOURCE_NAME_ANNOTATION: &str = "nchc.ai/src-pvc-name";
const DATASET_CLAIM_REQUEST: &str = "1Mi";
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

#[derive(Clone)]
pub struct ClassroomProvisioner {
  store: Arc<dyn Store>,
  cluster: Arc<dyn ClusterProvider>,
  resources: Arc<dyn CourseResourceClient>,
  cache: Arc<dyn ListCache>,
  compensator: Compensator,
  registry: Arc<CancellationRegistry>,
  config: KeeperConfig,
  reserved: ReservedClassrooms,
}

impl ClassroomProvisioner {
  pub fn new(
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterProvider>,
    resources: Arc<dyn CourseResourceClient>,
    cache: Arc<dyn ListCache>,
    registry: Arc<CancellationRegistry>,
    config: KeeperConfig,
  ) -> Self {
    Self {
      compensator: Compensator::new(cluster.clone(), resources.clone()),
      reserved: config.reserved(),
      store,
      cluster,
      resources,
      cache,
      registry,
      config,
    }
  }

  // --- Create ---

  /// Creates a classroom: storage rows first (uncommitted), then the cluster tenancy, then
  /// the commit. Any failure leaves neither rows nor namespace behind.
  pub async fn create_classroom(
    &self,
    request: ClassroomRequest,
    provider: &str,
  ) -> Result<Classroom, CoreError> {
    if request.name.trim().is_empty() {
      return Err(CoreError::validation(
        "classroom name cannot be empty",
        message::classroom_create_name_missing(),
      ));
    }
    validate_schedules(&request.schedule, message::classroom_create_schedule_invalid)?;

    let id = self.config.new_classroom_id();
    let name = request.name.clone();
    let classroom = classroom_row(&id, &request);

    let mut tx = self
      .store
      .begin()
      .await
      .map_err(|e| storage_error(&id, &e, message::classroom_create_info(&name)))?;
    if let Err(e) = self.stage_new_classroom(tx.as_mut(), &classroom, &request, provider).await {
      rollback(tx, &id).await;
      return Err(e);
    }

    let applied = Saga::new(format!("create classroom {id}"))
      .step(
        "namespace",
        Some(Compensation::DeleteNamespace { name: id.clone() }),
        || in_cluster(self.create_namespace(&id), message::classroom_create_namespace(&name)),
      )
      .step("datasets", None, || {
        in_cluster(self.replicate_datasets(&id), message::classroom_create_dataset(&name))
      })
      .step("tls-secret", None, || {
        in_cluster(self.copy_tls_secret(&id), message::classroom_create_secret(&name))
      })
      .step("role", None, || {
        in_cluster(self.create_scc_role(&id), message::classroom_create_role(&name))
      })
      .step("role-binding", None, || {
        in_cluster(self.create_scc_role_binding(&id), message::classroom_create_role(&name))
      })
      .execute(&self.compensator)
      .await;

    let applied = match applied {
      Ok(applied) => applied,
      Err(failure) => {
        rollback(tx, &id).await;
        error!(
          classroom_id = %id,
          step = failure.step,
          compensation_failures = failure.compensation_errors.len(),
          error = %failure.error,
          "Classroom creation failed in the cluster phase."
        );
        return Err(failure.error);
      }
    };

    if let Err(e) = tx.commit().await {
      error!(classroom_id = %id, error = %e, "Commit failed after cluster phase; unwinding.");
      let failures = applied.unwind(&self.compensator).await;
      if !failures.is_empty() {
        warn!(classroom_id = %id, count = failures.len(), "Some compensations failed.");
      }
      return Err(CoreError::storage(&e, message::classroom_create_info(&name)));
    }
    applied.finish();

    info!(classroom_id = %id, name = %classroom.name, "Classroom created.");
    Ok(classroom)
  }

  async fn stage_new_classroom(
    &self,
    tx: &mut dyn StoreTx,
    classroom: &Classroom,
    request: &ClassroomRequest,
    provider: &str,
  ) -> Result<(), CoreError> {
    let id = classroom.id.as_str();
    let name = classroom.name.as_str();
    tx.insert_classroom(classroom)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_create_info(name)))?;

    let courses = RelationRows::Courses(request.courses.iter().map(|c| c.value.clone()).collect());
    tx.insert_relation(id, &courses)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_create_course(name)))?;

    let schedules = RelationRows::Schedules(request.schedule.cron_format.clone());
    tx.insert_relation(id, &schedules)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_create_schedule(name)))?;

    if let Some(teachers) = &request.teachers {
      let rows = RelationRows::Teachers {
        provider: provider.to_string(),
        members: teachers.clone(),
      };
      tx.insert_relation(id, &rows)
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_create_teacher(name)))?;
    }
    if let Some(students) = &request.students {
      let rows = RelationRows::Students {
        provider: provider.to_string(),
        members: students.clone(),
      };
      tx.insert_relation(id, &rows)
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_create_student(name)))?;
    }
    if let Some(calendar) = &request.calendar {
      tx.insert_relation(id, &RelationRows::Calendar(calendar.clone()))
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_create_calendar(name)))?;
    }

    let options = RelationRows::SelectedOptions(request.schedule.selected_option.clone());
    tx.insert_relation(id, &options)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_create_schedule(name)))?;

    debug!(classroom_id = %id, "Classroom rows staged.");
    Ok(())
  }

  async fn create_namespace(&self, namespace: &str) -> Result<(), ResourceError> {
    let labels = BTreeMap::from([(
      INSTANCE_LABEL.to_string(),
      self.config.namespace_prefix.clone(),
    )]);
    self.cluster.create_namespace(namespace, &labels).await?;
    debug!(%namespace, "Namespace created.");
    Ok(())
  }

  /// Links every instance dataset claim of the source namespace into `namespace`.
  async fn replicate_datasets(&self, namespace: &str) -> Result<(), ResourceError> {
    let source_namespace = &self.config.dataset_source_namespace;
    let selector = format!("{INSTANCE_LABEL}={}", self.config.namespace_prefix);
    let sources = self
      .cluster
      .list_volume_claims(source_namespace, &selector)
      .await?;

    for source in sources
      .into_iter()
      .filter(|claim| claim.name.starts_with(DATASET_PREFIX))
    {
      if self.cluster.volume_claim_exists(namespace, &source.name).await? {
        debug!(%namespace, claim = %source.name, "Dataset claim already present.");
        continue;
      }
      let claim = VolumeClaim {
        name: source.name.clone(),
        namespace: namespace.to_string(),
        labels: BTreeMap::from([("type".to_string(), "dataset".to_string())]),
        annotations: BTreeMap::from([
          (LINK_DATA_ANNOTATION.to_string(), "true".to_string()),
          (SOURCE_NAMESPACE_ANNOTATION.to_string(), source_namespace.clone()),
          (SOURCE_NAME_ANNOTATION.to_string(), source.name.clone()),
        ]),
        access_modes: vec!["ReadOnlyMany".to_string()],
        storage_request: DATASET_CLAIM_REQUEST.to_string(),
        storage_class: Some(self.config.storage_class.clone()),
      };
      self.cluster.create_volume_claim(&claim).await?;
      debug!(%namespace, claim = %claim.name, "Dataset claim linked.");
    }
    Ok(())
  }

  async fn copy_tls_secret(&self, namespace: &str) -> Result<(), ResourceError> {
    let secret_name = &self.config.tls_secret_name;
    if self.cluster.get_secret(namespace, secret_name).await?.is_some() {
      debug!(%namespace, secret = %secret_name, "TLS secret already present.");
      return Ok(());
    }
    let source = self
      .cluster
      .get_secret(&self.reserved.system_namespace, secret_name)
      .await?
      .ok_or_else(|| ResourceError::NotFound {
        kind: "Secret",
        name: format!("{}/{secret_name}", self.reserved.system_namespace),
      })?;
    let secret = SecretData {
      name: secret_name.clone(),
      type_: TLS_SECRET_TYPE.to_string(),
      data: source.data,
    };
    self.cluster.create_secret(namespace, &secret).await
  }

  async fn create_scc_role(&self, namespace: &str) -> Result<(), ResourceError> {
    let role = AccessRole {
      name: SCC_ROLE_NAME.to_string(),
      rules: vec![AccessRule {
        api_groups: vec!["security.openshift.io".to_string()],
        resources: vec!["securitycontextconstraints".to_string()],
        resource_names: vec!["anyuid".to_string(), "hostmount-anyuid".to_string()],
        verbs: vec!["use".to_string()],
      }],
    };
    self.cluster.create_role(namespace, &role).await
  }

  async fn create_scc_role_binding(&self, namespace: &str) -> Result<(), ResourceError> {
    let binding = AccessRoleBinding {
      name: SCC_ROLE_BINDING_NAME.to_string(),
      role_name: SCC_ROLE_NAME.to_string(),
      service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
    };
    self.cluster.create_role_binding(namespace, &binding).await
  }

  // --- Update ---

  /// Rewrites a classroom and its relation sets in one transaction, then pushes the new
  /// schedule to every course resource running in the classroom.
  ///
  /// The public classroom keeps its members whatever the request says.
  pub async fn update_classroom(
    &self,
    request: ClassroomRequest,
    provider: &str,
  ) -> Result<Classroom, CoreError> {
    let id = match request.id.as_deref().map(str::trim) {
      Some(id) if !id.is_empty() => id.to_string(),
      _ => {
        return Err(CoreError::validation(
          "classroom id cannot be empty",
          message::classroom_id_missing(),
        ))
      }
    };
    if id == self.reserved.teacher {
      return Err(CoreError::Reserved {
        detail: format!("classroom `{id}` is reserved and cannot be updated"),
        message: message::classroom_update_reserved(&id),
      });
    }
    validate_schedules(&request.schedule, message::classroom_update_schedule_invalid)?;

    let existing = self
      .store
      .classroom(&id)
      .await
      .map_err(|e| CoreError::from_store(&e, message::classroom_update_info(&request.name)))?;
    let classroom = Classroom {
      created_at: existing.created_at,
      ..classroom_row(&id, &request)
    };

    let mut tx = self
      .store
      .begin()
      .await
      .map_err(|e| storage_error(&id, &e, message::classroom_update_info(&classroom.name)))?;
    if let Err(e) = self.stage_update(tx.as_mut(), &classroom, &request, provider).await {
      rollback(tx, &id).await;
      return Err(e);
    }
    tx.commit()
      .await
      .map_err(|e| storage_error(&id, &e, message::classroom_update_info(&classroom.name)))?;
    info!(classroom_id = %id, "Classroom rows updated.");

    self
      .sync_resource_schedules(&id, &request.schedule.cron_format)
      .await
      .map_err(|e| {
        error!(classroom_id = %id, error = %e, "Failed to sync course resource schedules.");
        CoreError::resource(&e, message::classroom_update_resources(&classroom.name))
      })?;

    Ok(classroom)
  }

  async fn stage_update(
    &self,
    tx: &mut dyn StoreTx,
    classroom: &Classroom,
    request: &ClassroomRequest,
    provider: &str,
  ) -> Result<(), CoreError> {
    let id = classroom.id.as_str();
    let name = classroom.name.as_str();
    tx.update_classroom(classroom)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_update_info(name)))?;
    tx.set_public_flag(id, classroom.public_flag())
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_update_info(name)))?;

    if self.reserved.is_public(id) {
      debug!(classroom_id = %id, "Membership of the public classroom is left untouched.");
    } else {
      let students = RelationRows::Students {
        provider: provider.to_string(),
        members: request.students.clone().unwrap_or_default(),
      };
      tx.replace_relation(id, &students)
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_update_student(name)))?;
      let teachers = RelationRows::Teachers {
        provider: provider.to_string(),
        members: request.teachers.clone().unwrap_or_default(),
      };
      tx.replace_relation(id, &teachers)
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_update_teacher(name)))?;
    }

    let schedules = RelationRows::Schedules(request.schedule.cron_format.clone());
    tx.replace_relation(id, &schedules)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_update_schedule(name)))?;

    let courses = RelationRows::Courses(request.courses.iter().map(|c| c.value.clone()).collect());
    tx.replace_relation(id, &courses)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_update_course(name)))?;

    if let Some(calendar) = &request.calendar {
      tx.replace_relation(id, &RelationRows::Calendar(calendar.clone()))
        .await
        .map_err(|e| storage_error(id, &e, message::classroom_update_calendar(name)))?;
    }

    let options = RelationRows::SelectedOptions(request.schedule.selected_option.clone());
    tx.replace_relation(id, &options)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_update_schedule(name)))?;
    Ok(())
  }

  async fn sync_resource_schedules(
    &self,
    namespace: &str,
    schedule: &[String],
  ) -> Result<(), ResourceError> {
    let resources = self.resources.list(namespace).await?;
    for resource in &resources {
      self
        .resources
        .update_schedule(namespace, &resource.name, schedule)
        .await?;
    }
    debug!(%namespace, count = resources.len(), "Course resource schedules rewritten.");
    Ok(())
  }

  // --- Delete ---

  /// Deletes a classroom row, its namespace and its labelled volumes, and stops the
  /// watchers of the jobs it held. Volume deletion is best effort.
  pub async fn delete_classroom(&self, id: &str) -> Result<(), CoreError> {
    if self.reserved.is_reserved(id) {
      return Err(CoreError::Reserved {
        detail: format!("classroom `{id}` is reserved and cannot be deleted"),
        message: message::classroom_delete_reserved(id),
      });
    }

    let classroom = self
      .store
      .classroom(id)
      .await
      .map_err(|e| CoreError::from_store(&e, message::classroom_delete_info(id)))?;
    let jobs = self
      .store
      .jobs_in_classroom(id)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_delete_info(&classroom.name)))?;

    self
      .store
      .delete_classroom(id)
      .await
      .map_err(|e| storage_error(id, &e, message::classroom_delete_info(&classroom.name)))?;

    let mut owners = BTreeSet::new();
    for job in &jobs {
      self.registry.signal_stop(&job.id);
      owners.insert(job.owner.cache_key());
    }
    for key in owners {
      if let Err(e) = self.cache.delete(&key).await {
        warn!(cache_key = %key, error = %e, "Failed to invalidate job list cache.");
      }
    }

    match self.cluster.delete_namespace(id, DeletePropagation::Foreground).await {
      Ok(()) => {}
      Err(e) if e.is_not_found() => warn!(classroom_id = %id, "Namespace already gone."),
      Err(e) => {
        error!(classroom_id = %id, error = %e, "Failed to delete classroom namespace.");
        return Err(CoreError::resource(
          &e,
          message::classroom_delete_namespace(&classroom.name),
        ));
      }
    }

    let selector = format!("{VOLUME_CLASSROOM_LABEL}={id}");
    let volumes = self.cluster.list_volumes(&selector).await.map_err(|e| {
      error!(classroom_id = %id, error = %e, "Failed to list classroom volumes.");
      CoreError::resource(&e, message::classroom_delete_dataset(&classroom.name))
    })?;
    for volume in volumes {
      if let Err(e) = self
        .cluster
        .delete_volume(&volume, DeletePropagation::Foreground)
        .await
      {
        warn!(classroom_id = %id, %volume, error = %e, "Skipping volume that failed to delete.");
      }
    }

    info!(classroom_id = %id, stopped_jobs = jobs.len(), "Classroom deleted.");
    Ok(())
  }

  // --- Reads ---

  pub async fn classroom_detail(&self, id: &str) -> Result<ClassroomDetail, CoreError> {
    let read = |e: StoreError| CoreError::from_store(&e, message::storage_failure());
    let info = self.store.classroom(id).await.map_err(read)?;
    let cron_format = self.store.classroom_schedules(id).await.map_err(read)?;
    let selected_option = self.store.classroom_selected_options(id).await.map_err(read)?;
    let courses = self.store.classroom_courses(id).await.map_err(read)?;
    let teachers = self
      .store
      .classroom_members(id, MemberRole::Teacher)
      .await
      .map_err(read)?;
    let students = self
      .store
      .classroom_members(id, MemberRole::Student)
      .await
      .map_err(read)?;
    let calendar = self.store.classroom_calendar(id).await.map_err(read)?;

    Ok(ClassroomDetail {
      schedule: ScheduleWindow {
        cron_format,
        description: info.schedule_description.clone(),
        start_date: info.start_at.clone(),
        end_date: info.end_at.clone(),
        selected_type: info.selected_type,
        selected_option,
      },
      info,
      courses,
      teachers,
      students,
      calendar,
    })
  }

  /// Every classroom except the reserved teacher classroom.
  pub async fn list_classrooms(&self) -> Result<Vec<Classroom>, CoreError> {
    let classrooms = self
      .store
      .list_classrooms()
      .await
      .map_err(|e| CoreError::storage(&e, message::storage_failure()))?;
    Ok(
      classrooms
        .into_iter()
        .filter(|c| c.id != self.reserved.teacher)
        .collect(),
    )
  }

  /// Public classrooms the user belongs to, plus the public classroom.
  pub async fn user_classrooms(&self, user: &OauthUser) -> Result<Vec<Classroom>, CoreError> {
    let mut ids: BTreeSet<String> = self
      .store
      .member_classrooms(user)
      .await
      .map_err(|e| CoreError::storage(&e, message::storage_failure()))?
      .into_iter()
      .collect();
    ids.insert(self.reserved.public.clone());

    let mut classrooms = Vec::with_capacity(ids.len());
    for id in ids {
      match self.store.classroom(&id).await {
        Ok(classroom) if classroom.public => classrooms.push(classroom),
        Ok(_) => {}
        Err(e) if e.is_not_found() => debug!(classroom_id = %id, "Member classroom is gone."),
        Err(e) => return Err(CoreError::storage(&e, message::storage_failure())),
      }
    }
    Ok(classrooms)
  }
}

// --- Helpers ---

fn classroom_row(id: &str, request: &ClassroomRequest) -> Classroom {
  Classroom {
    id: id.to_string(),
    name: request.name.clone(),
    description: request.description.clone(),
    public: request.public,
    schedule_description: request.schedule.description.clone(),
    selected_type: request.schedule.selected_type,
    start_at: request.schedule.start_date.clone(),
    end_at: request.schedule.end_date.clone(),
    created_at: Utc::now(),
  }
}

fn validate_schedules(
  schedule: &ScheduleWindow,
  invalid: fn(&str) -> String,
) -> Result<(), CoreError> {
  for raw in &schedule.cron_format {
    CronExpr::parse(raw).map_err(|e| CoreError::validation(e.to_string(), invalid(raw)))?;
  }
  Ok(())
}

/// Boxes a cluster step, attaching the user-facing message to its error.
fn in_cluster<'a, F>(step: F, message: String) -> BoxFuture<'a, Result<(), CoreError>>
where
  F: Future<Output = Result<(), ResourceError>> + Send + 'a,
{
  async move { step.await.map_err(|e| CoreError::resource(&e, message)) }.boxed()
}

fn storage_error(classroom_id: &str, err: &StoreError, message: String) -> CoreError {
  error!(%classroom_id, error = %err, "Classroom storage operation failed.");
  CoreError::storage(err, message)
}

async fn rollback(tx: Box<dyn StoreTx>, classroom_id: &str) {
  match tx.rollback().await {
    Ok(()) => debug!(%classroom_id, "Transaction rolled back."),
    Err(e) => error!(%classroom_id, error = %e, "Rollback failed."),
  }
}
