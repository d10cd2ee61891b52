use super::{Relation, RelationRows, Store, StoreTx};
use crate::error::StoreError;
use crate::model::{
  AuditRecord, CalendarWindow, Classroom, ClassroomId, Course, CourseId, Job, JobId, JobStatus,
  LabelValue, MemberRole, OauthUser, Role, UserAccount,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
  user: String,
  provider: String,
  name: String,
}

#[derive(Debug, Clone, Default)]
struct Relations {
  courses: Vec<CourseId>,
  schedules: Vec<String>,
  teachers: Vec<Member>,
  students: Vec<Member>,
  calendar: Vec<CalendarWindow>,
  options: Vec<LabelValue>,
}

impl Relations {
  fn clear(&mut self, relation: Relation) {
    match relation {
      Relation::Course => self.courses.clear(),
      Relation::Schedule => self.schedules.clear(),
      Relation::Teacher => self.teachers.clear(),
      Relation::Student => self.students.clear(),
      Relation::Calendar => self.calendar.clear(),
      Relation::SelectedOption => self.options.clear(),
    }
  }

  fn insert(&mut self, rows: &RelationRows) {
    let to_members = |provider: &str, members: &[LabelValue]| -> Vec<Member> {
      members
        .iter()
        .map(|m| Member {
          user: m.value.clone(),
          provider: provider.to_string(),
          name: m.label.clone(),
        })
        .collect()
    };
    match rows {
      RelationRows::Courses(ids) => self.courses.extend(ids.iter().cloned()),
      RelationRows::Schedules(exprs) => self.schedules.extend(exprs.iter().cloned()),
      RelationRows::Teachers { provider, members } => {
        self.teachers.extend(to_members(provider, members))
      }
      RelationRows::Students { provider, members } => {
        self.students.extend(to_members(provider, members))
      }
      RelationRows::Calendar(windows) => self.calendar.extend(windows.iter().cloned()),
      RelationRows::SelectedOptions(options) => self.options.extend(options.iter().cloned()),
    }
  }

  fn members(&self, role: MemberRole) -> &[Member] {
    match role {
      MemberRole::Teacher => &self.teachers,
      MemberRole::Student => &self.students,
    }
  }

  fn len(&self, relation: Relation) -> usize {
    match relation {
      Relation::Course => self.courses.len(),
      Relation::Schedule => self.schedules.len(),
      Relation::Teacher => self.teachers.len(),
      Relation::Student => self.students.len(),
      Relation::Calendar => self.calendar.len(),
      Relation::SelectedOption => self.options.len(),
    }
  }
}

#[derive(Debug, Default)]
struct Tables {
  classrooms: BTreeMap<ClassroomId, Classroom>,
  relations: HashMap<ClassroomId, Relations>,
  courses: BTreeMap<CourseId, Course>,
  external_courses: HashMap<CourseId, OauthUser>,
  external_jobs: HashMap<String, OauthUser>,
  jobs: BTreeMap<JobId, Job>,
  audits: HashMap<JobId, AuditRecord>,
  users: HashMap<OauthUser, UserAccount>,
}

#[derive(Debug, Default)]
struct Inner {
  tables: RwLock<Tables>,
  failpoints: Mutex<HashSet<String>>,
}

impl Inner {
  fn check(&self, point: &str) -> Result<(), StoreError> {
    if self.failpoints.lock().contains(point) {
      debug!(failpoint = point, "Injected storage failure.");
      return Err(StoreError::Injected(point.to_string()));
    }
    Ok(())
  }
}

/// In-process [`Store`] with transactional staging and named failpoints.
///
/// Writes inside a [`StoreTx`] are journaled and applied atomically on commit. A failpoint
/// armed with [`MemoryStore::fail_on`] makes the matching operation fail until cleared;
/// names are the operation names (`insert_job`, `commit`, ...) and, for relation inserts,
/// `insert_relation:<relation>` (e.g. `insert_relation:teacher`).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  inner: Arc<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  // --- Fault injection ---

  pub fn fail_on(&self, point: &str) {
    self.inner.failpoints.lock().insert(point.to_string());
  }

  pub fn clear_failure(&self, point: &str) {
    self.inner.failpoints.lock().remove(point);
  }

  // --- Seeding ---

  /// Inserts a classroom row directly, outside any transaction.
  pub fn put_classroom(&self, classroom: Classroom, relations: &[RelationRows]) {
    let mut tables = self.inner.tables.write();
    let entry = tables.relations.entry(classroom.id.clone()).or_default();
    for rows in relations {
      entry.insert(rows);
    }
    tables.classrooms.insert(classroom.id.clone(), classroom);
  }

  pub fn put_course(&self, course: Course) {
    self.inner.tables.write().courses.insert(course.id.clone(), course);
  }

  pub fn put_external_course(&self, course_id: &str, owner: OauthUser) {
    let mut tables = self.inner.tables.write();
    tables.external_courses.insert(course_id.to_string(), owner);
  }

  /// Records a job run by the external stack.
  pub fn put_external_job(&self, job_id: &str, owner: OauthUser) {
    let mut tables = self.inner.tables.write();
    tables.external_jobs.insert(job_id.to_string(), owner);
  }

  pub fn put_user(&self, account: UserAccount) {
    let mut tables = self.inner.tables.write();
    tables.users.insert(account.identity.clone(), account);
  }

  // --- Inspection ---

  pub fn classroom_count(&self) -> usize {
    self.inner.tables.read().classrooms.len()
  }

  /// Row count of one relation of a classroom (0 if the classroom is gone).
  pub fn relation_len(&self, classroom_id: &str, relation: Relation) -> usize {
    self
      .inner
      .tables
      .read()
      .relations
      .get(classroom_id)
      .map_or(0, |r| r.len(relation))
  }

  pub fn job_count(&self) -> usize {
    self.inner.tables.read().jobs.len()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn classroom(&self, id: &str) -> Result<Classroom, StoreError> {
    self.inner.check("classroom")?;
    let tables = self.inner.tables.read();
    tables
      .classrooms
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("classroom", id))
  }

  async fn list_classrooms(&self) -> Result<Vec<Classroom>, StoreError> {
    self.inner.check("list_classrooms")?;
    Ok(self.inner.tables.read().classrooms.values().cloned().collect())
  }

  async fn classroom_schedules(&self, id: &str) -> Result<Vec<String>, StoreError> {
    self.inner.check("classroom_schedules")?;
    let tables = self.inner.tables.read();
    Ok(tables.relations.get(id).map(|r| r.schedules.clone()).unwrap_or_default())
  }

  async fn classroom_courses(&self, id: &str) -> Result<Vec<CourseId>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(tables.relations.get(id).map(|r| r.courses.clone()).unwrap_or_default())
  }

  async fn classroom_members(
    &self,
    id: &str,
    role: MemberRole,
  ) -> Result<Vec<LabelValue>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(
      tables
        .relations
        .get(id)
        .map(|r| {
          r.members(role)
            .iter()
            .map(|m| LabelValue::new(m.name.clone(), m.user.clone()))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn classroom_calendar(&self, id: &str) -> Result<Vec<CalendarWindow>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(tables.relations.get(id).map(|r| r.calendar.clone()).unwrap_or_default())
  }

  async fn classroom_selected_options(&self, id: &str) -> Result<Vec<LabelValue>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(tables.relations.get(id).map(|r| r.options.clone()).unwrap_or_default())
  }

  async fn classroom_has_course(&self, id: &str, course_id: &str) -> Result<bool, StoreError> {
    let tables = self.inner.tables.read();
    Ok(
      tables
        .relations
        .get(id)
        .map_or(false, |r| r.courses.iter().any(|c| c == course_id)),
    )
  }

  async fn is_member(
    &self,
    id: &str,
    user: &OauthUser,
    role: MemberRole,
  ) -> Result<bool, StoreError> {
    self.inner.check("is_member")?;
    let tables = self.inner.tables.read();
    Ok(tables.relations.get(id).map_or(false, |r| {
      r.members(role)
        .iter()
        .any(|m| m.user == user.user && m.provider == user.provider)
    }))
  }

  async fn member_classrooms(&self, user: &OauthUser) -> Result<Vec<ClassroomId>, StoreError> {
    let tables = self.inner.tables.read();
    let matches = |members: &[Member]| {
      members
        .iter()
        .any(|m| m.user == user.user && m.provider == user.provider)
    };
    Ok(
      tables
        .relations
        .iter()
        .filter(|(_, r)| matches(&r.teachers) || matches(&r.students))
        .map(|(id, _)| id.clone())
        .collect(),
    )
  }

  async fn delete_classroom(&self, id: &str) -> Result<(), StoreError> {
    self.inner.check("delete_classroom")?;
    let mut tables = self.inner.tables.write();
    if tables.classrooms.remove(id).is_none() {
      return Err(StoreError::not_found("classroom", id));
    }
    tables.relations.remove(id);
    tables
      .jobs
      .retain(|_, job| job.classroom_id.as_deref() != Some(id));
    Ok(())
  }

  async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
    self.inner.check("begin")?;
    Ok(Box::new(MemoryTx {
      inner: self.inner.clone(),
      journal: Vec::new(),
    }))
  }

  async fn course(&self, id: &str) -> Result<Course, StoreError> {
    self.inner.check("course")?;
    let tables = self.inner.tables.read();
    tables
      .courses
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("course", id))
  }

  async fn owns_course(&self, course_id: &str, user: &OauthUser) -> Result<bool, StoreError> {
    let tables = self.inner.tables.read();
    Ok(tables.courses.get(course_id).map_or(false, |c| &c.owner == user))
  }

  async fn owns_external_course(
    &self,
    course_id: &str,
    user: &OauthUser,
  ) -> Result<bool, StoreError> {
    let tables = self.inner.tables.read();
    Ok(tables.external_courses.get(course_id) == Some(user))
  }

  async fn delete_course(&self, id: &str) -> Result<(), StoreError> {
    self.inner.check("delete_course")?;
    let mut tables = self.inner.tables.write();
    if tables.courses.remove(id).is_none() {
      return Err(StoreError::not_found("course", id));
    }
    tables.jobs.retain(|_, job| job.course_id != id);
    for relations in tables.relations.values_mut() {
      relations.courses.retain(|c| c != id);
    }
    Ok(())
  }

  async fn job(&self, id: &str) -> Result<Job, StoreError> {
    self.inner.check("job")?;
    let tables = self.inner.tables.read();
    tables
      .jobs
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("job", id))
  }

  async fn jobs_owned_by(&self, user: &OauthUser) -> Result<Vec<Job>, StoreError> {
    self.inner.check("jobs_owned_by")?;
    let tables = self.inner.tables.read();
    Ok(tables.jobs.values().filter(|j| &j.owner == user).cloned().collect())
  }

  async fn jobs_for_course(&self, course_id: &str) -> Result<Vec<Job>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(
      tables
        .jobs
        .values()
        .filter(|j| j.course_id == course_id)
        .cloned()
        .collect(),
    )
  }

  async fn jobs_in_classroom(&self, classroom_id: &str) -> Result<Vec<Job>, StoreError> {
    let tables = self.inner.tables.read();
    Ok(
      tables
        .jobs
        .values()
        .filter(|j| j.classroom_id.as_deref() == Some(classroom_id))
        .cloned()
        .collect(),
    )
  }

  async fn unready_jobs(&self) -> Result<Vec<Job>, StoreError> {
    self.inner.check("unready_jobs")?;
    let tables = self.inner.tables.read();
    Ok(
      tables
        .jobs
        .values()
        .filter(|j| j.status != JobStatus::Ready)
        .cloned()
        .collect(),
    )
  }

  async fn count_jobs(&self, user: &str) -> Result<u64, StoreError> {
    self.inner.check("count_jobs")?;
    let tables = self.inner.tables.read();
    Ok(tables.jobs.values().filter(|j| j.owner.user == user).count() as u64)
  }

  async fn count_external_jobs(&self, user: &str) -> Result<u64, StoreError> {
    self.inner.check("count_external_jobs")?;
    let tables = self.inner.tables.read();
    Ok(tables.external_jobs.values().filter(|o| o.user == user).count() as u64)
  }

  async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
    self.inner.check("insert_job")?;
    let mut tables = self.inner.tables.write();
    if tables.jobs.contains_key(&job.id) {
      return Err(StoreError::Conflict(format!("job `{}` already exists", job.id)));
    }
    tables.jobs.insert(job.id.clone(), job.clone());
    Ok(())
  }

  async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError> {
    self.inner.check("update_job_status")?;
    let mut tables = self.inner.tables.write();
    match tables.jobs.get_mut(id) {
      Some(job) => {
        trace!(job_id = id, %status, "Updating job status.");
        job.status = status;
        Ok(())
      }
      None => Err(StoreError::not_found("job", id)),
    }
  }

  async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
    self.inner.check("delete_job")?;
    let mut tables = self.inner.tables.write();
    tables
      .jobs
      .remove(id)
      .map(|_| ())
      .ok_or_else(|| StoreError::not_found("job", id))
  }

  async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
    self.inner.check("insert_audit")?;
    let mut tables = self.inner.tables.write();
    tables.audits.insert(record.id.clone(), record.clone());
    Ok(())
  }

  async fn mark_audit_deleted(&self, id: &JobId, actor: &str) -> Result<(), StoreError> {
    self.inner.check("mark_audit_deleted")?;
    let mut tables = self.inner.tables.write();
    match tables.audits.get_mut(id) {
      Some(record) => {
        record.deleted_by = Some(actor.to_string());
        Ok(())
      }
      None => Err(StoreError::not_found("audit", id.as_str())),
    }
  }

  async fn audit(&self, id: &str) -> Result<AuditRecord, StoreError> {
    let tables = self.inner.tables.read();
    tables
      .audits
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("audit", id))
  }

  async fn user(&self, user: &OauthUser) -> Result<UserAccount, StoreError> {
    self.inner.check("user")?;
    let tables = self.inner.tables.read();
    tables
      .users
      .get(user)
      .cloned()
      .ok_or_else(|| StoreError::not_found("user", user.to_string()))
  }

  async fn superusers(&self, provider: &str) -> Result<Vec<String>, StoreError> {
    self.inner.check("superusers")?;
    let tables = self.inner.tables.read();
    Ok(
      tables
        .users
        .values()
        .filter(|a| a.role == Role::Superuser && a.identity.provider == provider)
        .map(|a| a.identity.user.clone())
        .collect(),
    )
  }
}

// --- Transactions ---

#[derive(Debug)]
enum TxOp {
  InsertClassroom(Classroom),
  UpdateClassroom(Classroom),
  SetPublic(ClassroomId, i16),
  Clear(ClassroomId, Relation),
  Insert(ClassroomId, RelationRows),
}

struct MemoryTx {
  inner: Arc<Inner>,
  journal: Vec<TxOp>,
}

impl MemoryTx {
  /// Foreign-key check against committed rows and rows staged in this transaction.
  fn classroom_visible(&self, id: &str) -> bool {
    let staged = self
      .journal
      .iter()
      .any(|op| matches!(op, TxOp::InsertClassroom(c) if c.id == id));
    staged || self.inner.tables.read().classrooms.contains_key(id)
  }
}

#[async_trait]
impl StoreTx for MemoryTx {
  async fn insert_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError> {
    self.inner.check("insert_classroom")?;
    if self.classroom_visible(&classroom.id) {
      return Err(StoreError::Conflict(format!(
        "classroom `{}` already exists",
        classroom.id
      )));
    }
    self.journal.push(TxOp::InsertClassroom(classroom.clone()));
    Ok(())
  }

  async fn update_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError> {
    self.inner.check("update_classroom")?;
    if !self.classroom_visible(&classroom.id) {
      return Err(StoreError::not_found("classroom", classroom.id.as_str()));
    }
    self.journal.push(TxOp::UpdateClassroom(classroom.clone()));
    Ok(())
  }

  async fn set_public_flag(&mut self, id: &str, flag: i16) -> Result<(), StoreError> {
    self.inner.check("set_public_flag")?;
    self.journal.push(TxOp::SetPublic(id.to_string(), flag));
    Ok(())
  }

  async fn clear_relation(&mut self, id: &str, relation: Relation) -> Result<(), StoreError> {
    self.inner.check(&format!("clear_relation:{}", relation.as_str()))?;
    self.journal.push(TxOp::Clear(id.to_string(), relation));
    Ok(())
  }

  async fn insert_relation(&mut self, id: &str, rows: &RelationRows) -> Result<(), StoreError> {
    self
      .inner
      .check(&format!("insert_relation:{}", rows.relation().as_str()))?;
    if !self.classroom_visible(id) {
      return Err(StoreError::Conflict(format!(
        "foreign key: classroom `{id}` does not exist"
      )));
    }
    self.journal.push(TxOp::Insert(id.to_string(), rows.clone()));
    Ok(())
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let MemoryTx { inner, journal } = *self;
    inner.check("commit")?;
    let mut tables = inner.tables.write();
    for op in journal {
      match op {
        TxOp::InsertClassroom(classroom) => {
          tables.relations.entry(classroom.id.clone()).or_default();
          tables.classrooms.insert(classroom.id.clone(), classroom);
        }
        TxOp::UpdateClassroom(update) => {
          if let Some(row) = tables.classrooms.get_mut(&update.id) {
            row.name = update.name;
            row.description = update.description;
            row.schedule_description = update.schedule_description;
            row.selected_type = update.selected_type;
            row.start_at = update.start_at;
            row.end_at = update.end_at;
          }
        }
        TxOp::SetPublic(id, flag) => {
          if let Some(row) = tables.classrooms.get_mut(&id) {
            row.public = flag != 0;
          }
        }
        TxOp::Clear(id, relation) => {
          if let Some(relations) = tables.relations.get_mut(&id) {
            relations.clear(relation);
          }
        }
        TxOp::Insert(id, rows) => tables.relations.entry(id).or_default().insert(&rows),
      }
    }
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
    self.inner.check("rollback")?;
    debug!(discarded = self.journal.len(), "Rolled back memory transaction.");
    Ok(())
  }
}
