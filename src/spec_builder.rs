//! Maps a (classroom, course, user) triple to a `Course` custom resource.

use crate::cluster::{CourseResource, CourseResourceSpec, WritableVolume};
use crate::error::{CoreError, StoreError};
use crate::message;
use crate::model::UserAccount;
use crate::store::Store;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

/// Annotation naming the user a custom resource was created for.
pub const USER_ANNOTATION: &str = "user";

/// A resource ready to be created, plus the course name for messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
  pub resource: CourseResource,
  pub course_name: String,
}

#[derive(Clone)]
pub struct ResourceSpecBuilder {
  store: Arc<dyn Store>,
  /// UID range starts at zero: writable volumes are always owned by root.
  privileged: bool,
  storage_class: String,
}

impl ResourceSpecBuilder {
  pub fn new(store: Arc<dyn Store>, privileged: bool, storage_class: impl Into<String>) -> Self {
    Self {
      store,
      privileged,
      storage_class: storage_class.into(),
    }
  }

  /// Builds the resource for `user` launching `course_id` in the namespace of `classroom_id`.
  ///
  /// The resource carries the classroom's current schedule. A course without ports fails
  /// with [`CoreError::NoPortsDefined`].
  pub async fn build(
    &self,
    classroom_id: &str,
    course_id: &str,
    user: &UserAccount,
  ) -> Result<Blueprint, CoreError> {
    let lookup = |e: StoreError| CoreError::from_store(&e, message::launch_build(course_id));

    self.store.classroom(classroom_id).await.map_err(lookup)?;
    let course = self.store.course(course_id).await.map_err(lookup)?;
    let schedule = self
      .store
      .classroom_schedules(classroom_id)
      .await
      .map_err(|e| CoreError::storage(&e, message::launch_build(&course.name)))?;

    if course.ports.is_empty() {
      return Err(CoreError::NoPortsDefined {
        detail: format!("ports are not defined in course `{course_id}`"),
        message: message::launch_port(&course.name, &course.owner.user),
      });
    }
    let port: BTreeMap<String, i32> = course
      .ports
      .iter()
      .map(|p| (p.name.clone(), p.port))
      .collect();

    let writable_volume = course
      .writable_path
      .as_deref()
      .filter(|path| !path.is_empty())
      .map(|path| WritableVolume {
        owner: user.identity.user.clone(),
        uid: if self.privileged { 0 } else { user.uid },
        storage_class: self.storage_class.clone(),
        mount_point: path.to_string(),
      });

    let dataset = (!course.datasets.is_empty()).then(|| course.datasets.clone());

    let name = Uuid::new_v4().to_string();
    debug!(
      %classroom_id,
      %course_id,
      resource = %name,
      ports = port.len(),
      writable = writable_volume.is_some(),
      "Built course resource."
    );

    Ok(Blueprint {
      resource: CourseResource {
        name,
        namespace: classroom_id.to_string(),
        annotations: BTreeMap::from([(
          USER_ANNOTATION.to_string(),
          user.identity.user.clone(),
        )]),
        spec: CourseResourceSpec {
          access_type: course.access_type,
          image: course.image,
          gpu: course.gpu,
          schedule,
          dataset,
          port,
          writable_volume,
        },
        status: None,
      },
      course_name: course.name,
    })
  }
}
