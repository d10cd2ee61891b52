//! Relational persistence port.
//!
//! The store is the single source of truth for classroom and job state. Reads go through
//! [`Store`]; multi-row classroom mutations go through a [`StoreTx`] opened with
//! [`Store::begin`] and finished with `commit` or `rollback`.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::StoreError;
use crate::model::{
  AuditRecord, CalendarWindow, Classroom, ClassroomId, Course, CourseId, CourseKind, Job, JobId,
  JobStatus, LabelValue, MemberRole, OauthUser, UserAccount,
};

use async_trait::async_trait;

/// A relation table hanging off a classroom row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
  Course,
  Schedule,
  Teacher,
  Student,
  Calendar,
  SelectedOption,
}

impl Relation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Relation::Course => "course",
      Relation::Schedule => "schedule",
      Relation::Teacher => "teacher",
      Relation::Student => "student",
      Relation::Calendar => "calendar",
      Relation::SelectedOption => "selected_option",
    }
  }
}

/// Rows to bulk-insert into one relation of a classroom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationRows {
  Courses(Vec<CourseId>),
  Schedules(Vec<String>),
  /// Members carry the provider of the acting administrator; `label` is the display name,
  /// `value` the user id.
  Teachers {
    provider: String,
    members: Vec<LabelValue>,
  },
  Students {
    provider: String,
    members: Vec<LabelValue>,
  },
  Calendar(Vec<CalendarWindow>),
  SelectedOptions(Vec<LabelValue>),
}

impl RelationRows {
  pub fn relation(&self) -> Relation {
    match self {
      RelationRows::Courses(_) => Relation::Course,
      RelationRows::Schedules(_) => Relation::Schedule,
      RelationRows::Teachers { .. } => Relation::Teacher,
      RelationRows::Students { .. } => Relation::Student,
      RelationRows::Calendar(_) => Relation::Calendar,
      RelationRows::SelectedOptions(_) => Relation::SelectedOption,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      RelationRows::Courses(rows) | RelationRows::Schedules(rows) => rows.len(),
      RelationRows::Teachers { members, .. } | RelationRows::Students { members, .. } => {
        members.len()
      }
      RelationRows::Calendar(rows) => rows.len(),
      RelationRows::SelectedOptions(rows) => rows.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Read/write access to classrooms, courses, jobs, audit rows and users.
#[async_trait]
pub trait Store: Send + Sync {
  // --- Classrooms ---

  async fn classroom(&self, id: &str) -> Result<Classroom, StoreError>;
  async fn list_classrooms(&self) -> Result<Vec<Classroom>, StoreError>;
  async fn classroom_schedules(&self, id: &str) -> Result<Vec<String>, StoreError>;
  async fn classroom_courses(&self, id: &str) -> Result<Vec<CourseId>, StoreError>;
  async fn classroom_members(
    &self,
    id: &str,
    role: MemberRole,
  ) -> Result<Vec<LabelValue>, StoreError>;
  async fn classroom_calendar(&self, id: &str) -> Result<Vec<CalendarWindow>, StoreError>;
  async fn classroom_selected_options(&self, id: &str) -> Result<Vec<LabelValue>, StoreError>;
  async fn classroom_has_course(&self, id: &str, course_id: &str) -> Result<bool, StoreError>;
  async fn is_member(
    &self,
    id: &str,
    user: &OauthUser,
    role: MemberRole,
  ) -> Result<bool, StoreError>;
  /// Ids of the classrooms where the user is a teacher or a student.
  async fn member_classrooms(&self, user: &OauthUser) -> Result<Vec<ClassroomId>, StoreError>;
  /// Hard delete; relation rows go with it.
  async fn delete_classroom(&self, id: &str) -> Result<(), StoreError>;

  /// Opens a transaction for multi-row classroom mutations.
  async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

  // --- Courses ---

  /// Container course with its datasets and ports.
  async fn course(&self, id: &str) -> Result<Course, StoreError>;
  async fn owns_course(&self, course_id: &str, user: &OauthUser) -> Result<bool, StoreError>;
  /// Ownership recorded by the external job stack for VM courses.
  async fn owns_external_course(
    &self,
    course_id: &str,
    user: &OauthUser,
  ) -> Result<bool, StoreError>;
  /// Deletes the course row; datasets and ports cascade.
  async fn delete_course(&self, id: &str) -> Result<(), StoreError>;

  /// Which system backs `course_id`: present in the container course table means
  /// resource-backed, anything else belongs to the external job stack.
  async fn course_kind(&self, course_id: &str) -> Result<CourseKind, StoreError> {
    match self.course(course_id).await {
      Ok(_) => Ok(CourseKind::ResourceBacked),
      Err(e) if e.is_not_found() => Ok(CourseKind::ExternallyBacked),
      Err(e) => Err(e),
    }
  }

  // --- Jobs ---

  async fn job(&self, id: &str) -> Result<Job, StoreError>;
  async fn jobs_owned_by(&self, user: &OauthUser) -> Result<Vec<Job>, StoreError>;
  async fn jobs_for_course(&self, course_id: &str) -> Result<Vec<Job>, StoreError>;
  async fn jobs_in_classroom(&self, classroom_id: &str) -> Result<Vec<Job>, StoreError>;
  /// Every job whose status is not `Ready`.
  async fn unready_jobs(&self) -> Result<Vec<Job>, StoreError>;
  /// Resource-backed jobs of a user name (any provider).
  async fn count_jobs(&self, user: &str) -> Result<u64, StoreError>;
  /// Jobs the external stack runs for a user name.
  async fn count_external_jobs(&self, user: &str) -> Result<u64, StoreError>;
  async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
  async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError>;
  async fn delete_job(&self, id: &str) -> Result<(), StoreError>;

  // --- Audit ---

  async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
  async fn mark_audit_deleted(&self, id: &JobId, actor: &str) -> Result<(), StoreError>;
  async fn audit(&self, id: &str) -> Result<AuditRecord, StoreError>;

  // --- Users ---

  async fn user(&self, user: &OauthUser) -> Result<UserAccount, StoreError>;
  /// User names holding the superuser role for `provider`.
  async fn superusers(&self, provider: &str) -> Result<Vec<String>, StoreError>;
}

/// An open storage transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTx: Send {
  async fn insert_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError>;
  /// Rewrites name, description and schedule metadata; the public flag is separate.
  async fn update_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError>;
  /// Public flag as persisted (`1`/`0`).
  async fn set_public_flag(&mut self, id: &str, flag: i16) -> Result<(), StoreError>;
  async fn clear_relation(&mut self, id: &str, relation: Relation) -> Result<(), StoreError>;
  async fn insert_relation(&mut self, id: &str, rows: &RelationRows) -> Result<(), StoreError>;

  /// Delete-all-then-reinsert.
  async fn replace_relation(&mut self, id: &str, rows: &RelationRows) -> Result<(), StoreError> {
    self.clear_relation(id, rows.relation()).await?;
    self.insert_relation(id, rows).await
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError>;
  async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
