//! Domain entities shared by every component: classrooms, courses, jobs, audit rows and users.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider recorded when the authentication layer did not supply one.
pub const DEFAULT_PROVIDER: &str = "default-provider";

/// Job identifier. Equal to the name of the custom resource backing the job.
pub type JobId = String;
pub type ClassroomId = String;
pub type CourseId = String;

/// A user as seen through an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OauthUser {
  pub user: String,
  pub provider: String,
}

impl OauthUser {
  pub fn new(user: impl Into<String>, provider: impl Into<String>) -> Self {
    Self {
      user: user.into(),
      provider: provider.into(),
    }
  }

  /// Key of this user's job-list cache entry: `provider:user`.
  pub fn cache_key(&self) -> String {
    format!("{}:{}", self.provider, self.user)
  }
}

impl fmt::Display for OauthUser {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.user, self.provider)
  }
}

/// Generic display/value pair used for members, courses, options and service endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelValue {
  pub label: String,
  pub value: String,
}

impl LabelValue {
  pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      value: value.into(),
    }
  }
}

// --- Classroom ---

/// One calendar window of a classroom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarWindow {
  pub start_month: i32,
  pub length: i32,
  pub start_date: String,
  pub end_date: String,
}

/// Launch schedule of a classroom: cron list plus the metadata the UI uses to render it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
  pub cron_format: Vec<String>,
  pub description: String,
  pub start_date: String,
  pub end_date: String,
  pub selected_type: Option<i32>,
  #[serde(default)]
  pub selected_option: Vec<LabelValue>,
}

/// The classroom row itself (without relations).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classroom {
  pub id: ClassroomId,
  pub name: String,
  pub description: String,
  pub public: bool,
  pub schedule_description: String,
  pub selected_type: Option<i32>,
  pub start_at: String,
  pub end_at: String,
  pub created_at: DateTime<Utc>,
}

impl Classroom {
  /// Integer form of the public flag, as persisted.
  pub fn public_flag(&self) -> i16 {
    i16::from(self.public)
  }
}

/// Input of classroom create/update.
///
/// `teachers`/`students` of `None` insert nothing on create and clear the set on update;
/// `calendar` of `None` leaves the calendar untouched on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomRequest {
  #[serde(default)]
  pub id: Option<ClassroomId>,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub public: bool,
  pub schedule: ScheduleWindow,
  #[serde(default)]
  pub courses: Vec<LabelValue>,
  pub teachers: Option<Vec<LabelValue>>,
  pub students: Option<Vec<LabelValue>>,
  pub calendar: Option<Vec<CalendarWindow>>,
}

/// A classroom with every relation loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomDetail {
  #[serde(flatten)]
  pub info: Classroom,
  pub schedule: ScheduleWindow,
  pub courses: Vec<CourseId>,
  pub teachers: Vec<LabelValue>,
  pub students: Vec<LabelValue>,
  pub calendar: Vec<CalendarWindow>,
}

/// Membership role inside a classroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
  Teacher,
  Student,
}

// --- Course ---

/// How a launched course is exposed to its user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "kube-provider", derive(schemars::JsonSchema))]
pub enum AccessType {
  #[default]
  Ingress,
  NodePort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePort {
  pub name: String,
  pub port: i32,
}

/// A container-backed course definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
  pub id: CourseId,
  pub owner: OauthUser,
  pub name: String,
  pub level: String,
  pub introduction: Option<String>,
  pub image: String,
  pub gpu: i32,
  pub writable_path: Option<String>,
  pub access_type: AccessType,
  /// Dataset claim names (`dataset-*`).
  pub datasets: Vec<String>,
  pub ports: Vec<CoursePort>,
  pub created_at: DateTime<Utc>,
}

/// Which system backs a course or job.
///
/// Determined once (by presence in the resource-backed tables) and threaded through the
/// operation instead of being re-derived at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CourseKind {
  /// Container course launched as a custom resource in the cluster.
  ResourceBacked,
  /// VM course owned by the external job stack.
  ExternallyBacked,
}

// --- Job ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
  Created,
  Pending,
  Ready,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Created => "Created",
      JobStatus::Pending => "Pending",
      JobStatus::Ready => "Ready",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "Created" => Ok(JobStatus::Created),
      "Pending" => Ok(JobStatus::Pending),
      "Ready" => Ok(JobStatus::Ready),
      other => Err(format!("unknown job status `{other}`")),
    }
  }
}

/// A resource-backed job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
  pub id: JobId,
  pub owner: OauthUser,
  pub course_id: CourseId,
  /// `None` when launched outside any classroom.
  pub classroom_id: Option<ClassroomId>,
  pub status: JobStatus,
  pub created_at: DateTime<Utc>,
}

/// Shadow of a job creation, kept after the job row is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
  pub id: JobId,
  pub owner: OauthUser,
  pub course_id: CourseId,
  pub classroom_id: Option<ClassroomId>,
  pub deleted_by: Option<String>,
  pub created_at: DateTime<Utc>,
}

// --- User ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Student,
  Teacher,
  Superuser,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Student => "student",
      Role::Teacher => "teacher",
      Role::Superuser => "superuser",
    }
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "student" => Ok(Role::Student),
      "teacher" => Ok(Role::Teacher),
      "superuser" => Ok(Role::Superuser),
      other => Err(format!("unknown role `{other}`")),
    }
  }
}

/// A registered platform account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
  pub identity: OauthUser,
  /// UID allocated from the configured range.
  pub uid: i64,
  pub role: Role,
}

// --- Launch / listing payloads ---

/// A launch request as handed over by the (excluded) HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
  pub user: OauthUser,
  pub course_id: CourseId,
  #[serde(default)]
  pub classroom_id: Option<ClassroomId>,
  /// Bearer token forwarded to the external job stack.
  #[serde(default, skip_serializing)]
  pub auth_token: Option<String>,
}

impl LaunchRequest {
  pub fn new(user: OauthUser, course_id: impl Into<String>, classroom_id: Option<&str>) -> Self {
    Self {
      user,
      course_id: course_id.into(),
      classroom_id: classroom_id.filter(|id| !id.is_empty()).map(str::to_string),
      auth_token: None,
    }
  }

  pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
    self.auth_token = Some(token.into());
    self
  }
}

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTicket {
  pub job_id: JobId,
  pub ready: bool,
  pub status: String,
}

/// One row of a user's job list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
  pub id: JobId,
  pub course_id: CourseId,
  pub start_at: DateTime<Utc>,
  pub status: JobStatus,
  pub name: String,
  pub introduction: String,
  pub image: String,
  pub level: String,
  pub gpu: i32,
  pub can_snapshot: bool,
  pub service: Vec<LabelValue>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cache_key_is_provider_then_user() {
    let user = OauthUser::new("alice", "github");
    assert_eq!(user.cache_key(), "github:alice");
  }

  #[test]
  fn empty_classroom_id_means_no_classroom() {
    let req = LaunchRequest::new(OauthUser::new("a", DEFAULT_PROVIDER), "k1", Some(""));
    assert!(req.classroom_id.is_none());
  }

  #[test]
  fn job_status_parses_its_own_names() {
    for status in [JobStatus::Created, JobStatus::Pending, JobStatus::Ready] {
      assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
    }
  }
}
