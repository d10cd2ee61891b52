//! Launch admission: the decision procedure run before any job is started.
//!
//! With a classroom the checks run in this order: classroom is public, a schedule matches
//! now, the classroom lists the course, the user is a member (waived for superusers and for
//! the reserved public classroom), quota. Without a classroom the user must own the course
//! unless they are a superuser, then quota. Quota is never waived.

use crate::config::ReservedClassrooms;
use crate::error::{CoreError, StoreError};
use crate::message;
use crate::model::{Classroom, LaunchRequest, MemberRole, OauthUser};
use crate::quota::QuotaTracker;
use crate::schedule::{CronExpr, ScheduleEvaluator};
use crate::store::Store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

/// Why a launch was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
  ClassroomNotPublic,
  OutsideSchedule,
  CourseNotInClassroom,
  NotMember,
  NotOwner,
  QuotaExceeded { active: u64 },
}

/// A refused launch: a normal outcome, carrying a log detail and a user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
  pub kind: DenialKind,
  pub detail: String,
  pub message: String,
}

impl From<Denial> for CoreError {
  fn from(denial: Denial) -> Self {
    CoreError::Denied {
      detail: denial.detail,
      message: denial.message,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
  Allow,
  Deny(Denial),
}

impl Admission {
  pub fn is_allowed(&self) -> bool {
    matches!(self, Admission::Allow)
  }
}

#[derive(Clone)]
pub struct AdmissionController {
  store: Arc<dyn Store>,
  quota: QuotaTracker,
  evaluator: ScheduleEvaluator,
  reserved: ReservedClassrooms,
}

fn storage(err: StoreError) -> CoreError {
  CoreError::from_store(&err, message::storage_failure())
}

impl AdmissionController {
  pub fn new(
    store: Arc<dyn Store>,
    evaluator: ScheduleEvaluator,
    reserved: ReservedClassrooms,
  ) -> Self {
    Self {
      quota: QuotaTracker::new(store.clone()),
      store,
      evaluator,
      reserved,
    }
  }

  pub fn quota(&self) -> &QuotaTracker {
    &self.quota
  }

  /// Decides whether `request` may launch now.
  ///
  /// Denials come back as `Ok(Admission::Deny(..))`; `Err` is reserved for invalid input,
  /// a missing classroom and storage failures.
  pub async fn check_launch(&self, request: &LaunchRequest) -> Result<Admission, CoreError> {
    self.check_launch_at(request, Utc::now()).await
  }

  /// [`check_launch`](Self::check_launch) with the schedule evaluated at `now`.
  pub async fn check_launch_at(
    &self,
    request: &LaunchRequest,
    now: DateTime<Utc>,
  ) -> Result<Admission, CoreError> {
    if request.user.user.trim().is_empty() {
      return Err(CoreError::validation(
        "user field in request cannot be empty",
        message::launch_empty_user(),
      ));
    }

    let admission = match request.classroom_id.as_deref() {
      Some(classroom_id) => self.check_with_classroom(request, classroom_id, now).await?,
      None => self.check_without_classroom(request).await?,
    };

    match &admission {
      Admission::Allow => {
        debug!(user = %request.user, course_id = %request.course_id, "Launch admitted.")
      }
      Admission::Deny(denial) => info!(
        user = %request.user,
        course_id = %request.course_id,
        kind = ?denial.kind,
        detail = %denial.detail,
        "Launch denied."
      ),
    }
    Ok(admission)
  }

  async fn check_with_classroom(
    &self,
    request: &LaunchRequest,
    classroom_id: &str,
    now: DateTime<Utc>,
  ) -> Result<Admission, CoreError> {
    let classroom = self.store.classroom(classroom_id).await.map_err(storage)?;

    if !classroom.public {
      return Ok(deny(
        DenialKind::ClassroomNotPublic,
        format!("classroom `{classroom_id}` is not public"),
        message::launch_not_public(&classroom.name),
      ));
    }

    let schedules = self.store.classroom_schedules(classroom_id).await.map_err(storage)?;
    if !self.schedule_open(&classroom, &schedules, now)? {
      return Ok(deny(
        DenialKind::OutsideSchedule,
        format!(
          "classroom `{classroom_id}` is allowed in `{}`",
          classroom.schedule_description
        ),
        message::launch_time(&classroom.name, &classroom.schedule_description),
      ));
    }

    let has_course = self
      .store
      .classroom_has_course(classroom_id, &request.course_id)
      .await
      .map_err(storage)?;
    if !has_course {
      return Ok(deny(
        DenialKind::CourseNotInClassroom,
        format!(
          "course `{}` is not in classroom `{classroom_id}`",
          request.course_id
        ),
        message::launch_not_in_classroom(&request.course_id, &classroom.name),
      ));
    }

    if !self.is_superuser(&request.user).await? && !self.reserved.is_public(classroom_id) {
      let user = &request.user;
      let student = self
        .store
        .is_member(classroom_id, user, MemberRole::Student)
        .await
        .map_err(storage)?;
      let teacher = self
        .store
        .is_member(classroom_id, user, MemberRole::Teacher)
        .await
        .map_err(storage)?;
      if !student && !teacher {
        return Ok(deny(
          DenialKind::NotMember,
          format!("{user} is neither student nor teacher of classroom `{classroom_id}`"),
          message::launch_member(&user.user, &classroom.name),
        ));
      }
    }

    self.check_quota(&request.user).await
  }

  async fn check_without_classroom(&self, request: &LaunchRequest) -> Result<Admission, CoreError> {
    let user = &request.user;
    if !self.is_superuser(user).await? {
      let owns_container = self
        .store
        .owns_course(&request.course_id, user)
        .await
        .map_err(storage)?;
      let owns_vm = owns_container
        || self
          .store
          .owns_external_course(&request.course_id, user)
          .await
          .map_err(storage)?;
      if !owns_vm {
        return Ok(deny(
          DenialKind::NotOwner,
          format!("course `{}` isn't owned by user {user}", request.course_id),
          message::launch_owner(&user.user),
        ));
      }
    }
    self.check_quota(user).await
  }

  async fn check_quota(&self, user: &OauthUser) -> Result<Admission, CoreError> {
    match self.quota.ensure_available(&user.user).await.map_err(storage)? {
      Some(denial) => Ok(Admission::Deny(denial)),
      None => Ok(Admission::Allow),
    }
  }

  async fn is_superuser(&self, user: &OauthUser) -> Result<bool, CoreError> {
    let superusers = self.store.superusers(&user.provider).await.map_err(storage)?;
    Ok(superusers.iter().any(|name| *name == user.user))
  }

  /// A stored expression that no longer parses fails the check instead of closing the
  /// schedule.
  fn schedule_open(
    &self,
    classroom: &Classroom,
    schedules: &[String],
    now: DateTime<Utc>,
  ) -> Result<bool, CoreError> {
    for raw in schedules {
      let expr = CronExpr::parse(raw).map_err(|e| {
        error!(classroom_id = %classroom.id, error = %e, "Stored schedule does not parse.");
        CoreError::Storage {
          detail: format!("classroom `{}` stores an invalid schedule: {e}", classroom.id),
          message: message::storage_failure(),
        }
      })?;
      if self.evaluator.matches_at(&expr, now) {
        return Ok(true);
      }
    }
    Ok(false)
  }
}

fn deny(kind: DenialKind, detail: String, message: String) -> Admission {
  Admission::Deny(Denial {
    kind,
    detail,
    message,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Role, UserAccount};
  use crate::store::{MemoryStore, RelationRows};

  use chrono::TimeZone;

  fn classroom(id: &str, public: bool) -> Classroom {
    Classroom {
      id: id.into(),
      name: "Intro".into(),
      description: String::new(),
      public,
      schedule_description: "weekdays".into(),
      selected_type: None,
      start_at: String::new(),
      end_at: String::new(),
      created_at: Utc::now(),
    }
  }

  fn controller(store: &MemoryStore) -> AdmissionController {
    AdmissionController::new(
      Arc::new(store.clone()),
      ScheduleEvaluator::new("Asia/Taipei").unwrap(),
      ReservedClassrooms::new("aitrain"),
    )
  }

  fn seed(store: &MemoryStore, id: &str, public: bool, schedule: &str) {
    store.put_classroom(
      classroom(id, public),
      &[
        RelationRows::Courses(vec!["k1".into()]),
        RelationRows::Schedules(vec![schedule.into()]),
      ],
    );
  }

  #[tokio::test]
  async fn empty_user_is_validation_error() {
    let store = MemoryStore::new();
    let req = LaunchRequest::new(OauthUser::new("", "github"), "k1", None);
    let err = controller(&store).check_launch(&req).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
  }

  #[tokio::test]
  async fn private_classroom_is_denied_first() {
    let store = MemoryStore::new();
    seed(&store, "aitrain-c", false, "* * * * * *");
    let req = LaunchRequest::new(OauthUser::new("u", "github"), "k1", Some("aitrain-c"));
    let admission = controller(&store).check_launch(&req).await.unwrap();
    assert!(matches!(
      admission,
      Admission::Deny(Denial { kind: DenialKind::ClassroomNotPublic, .. })
    ));
  }

  #[tokio::test]
  async fn closed_schedule_is_denied() {
    let store = MemoryStore::new();
    // Noon on the first of January only.
    seed(&store, "aitrain-c", true, "0 0 12 1 1 *");
    let req = LaunchRequest::new(OauthUser::new("u", "github"), "k1", Some("aitrain-c"));
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let admission = controller(&store).check_launch_at(&req, at).await.unwrap();
    assert!(matches!(
      admission,
      Admission::Deny(Denial { kind: DenialKind::OutsideSchedule, .. })
    ));
  }

  #[tokio::test]
  async fn unparseable_stored_schedule_fails_the_check() {
    let store = MemoryStore::new();
    seed(&store, "aitrain-c", true, "not a cron");
    let req = LaunchRequest::new(OauthUser::new("u", "github"), "k1", Some("aitrain-c"));
    let err = controller(&store).check_launch(&req).await.unwrap_err();
    assert!(matches!(err, CoreError::Storage { .. }));
  }

  #[tokio::test]
  async fn public_classroom_waives_membership() {
    let store = MemoryStore::new();
    seed(&store, "aitrain-public", true, "* * * * * *");
    let req = LaunchRequest::new(OauthUser::new("u", "github"), "k1", Some("aitrain-public"));
    assert!(controller(&store).check_launch(&req).await.unwrap().is_allowed());

    seed(&store, "aitrain-c", true, "* * * * * *");
    let req = LaunchRequest::new(OauthUser::new("u", "github"), "k1", Some("aitrain-c"));
    assert!(matches!(
      controller(&store).check_launch(&req).await.unwrap(),
      Admission::Deny(Denial { kind: DenialKind::NotMember, .. })
    ));
  }

  #[tokio::test]
  async fn superuser_skips_ownership_but_not_quota() {
    let store = MemoryStore::new();
    let root = OauthUser::new("root", "github");
    store.put_user(UserAccount {
      identity: root.clone(),
      uid: 1000,
      role: Role::Superuser,
    });
    let req = LaunchRequest::new(root.clone(), "someone-elses", None);
    assert!(controller(&store).check_launch(&req).await.unwrap().is_allowed());

    store.put_external_job("vm-1", root);
    assert!(matches!(
      controller(&store).check_launch(&req).await.unwrap(),
      Admission::Deny(Denial { kind: DenialKind::QuotaExceeded { active: 1 }, .. })
    ));
  }

  #[tokio::test]
  async fn external_course_owner_is_admitted() {
    let store = MemoryStore::new();
    let owner = OauthUser::new("alice", "github");
    store.put_external_course("vm-course", owner.clone());
    let req = LaunchRequest::new(owner, "vm-course", None);
    assert!(controller(&store).check_launch(&req).await.unwrap().is_allowed());

    let req = LaunchRequest::new(OauthUser::new("bob", "github"), "vm-course", None);
    assert!(matches!(
      controller(&store).check_launch(&req).await.unwrap(),
      Admission::Deny(Denial { kind: DenialKind::NotOwner, .. })
    ));
  }
}
