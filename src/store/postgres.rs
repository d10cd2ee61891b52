//! PostgreSQL implementation of the store port.

use super::{Relation, RelationRows, Store, StoreTx};
use crate::error::StoreError;
use crate::model::{
  AccessType, AuditRecord, CalendarWindow, Classroom, ClassroomId, Course, CourseId, CoursePort,
  Job, JobId, JobStatus, LabelValue, MemberRole, OauthUser, Role, UserAccount,
};

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("schema.sql");

/// Connection settings for [`PgStore::connect`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
  pub url: String,
  pub max_connections: u32,
  pub idle_timeout: Option<Duration>,
}

impl Default for PgStoreConfig {
  fn default() -> Self {
    Self {
      url: "postgresql://coursekeeper@localhost:5432/coursekeeper".to_string(),
      max_connections: 10,
      idle_timeout: Some(Duration::from_secs(600)),
    }
  }
}

fn backend(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
  move |e| StoreError::Backend(format!("{context}: {e}"))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
  T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
  row
    .try_get::<T, _>(name)
    .map_err(|e| StoreError::Backend(format!("column `{name}`: {e}")))
}

fn relation_table(relation: Relation) -> &'static str {
  match relation {
    Relation::Course => "classroom_course",
    Relation::Schedule => "classroom_schedule",
    Relation::Teacher => "classroom_teacher",
    Relation::Student => "classroom_student",
    Relation::Calendar => "classroom_calendar",
    Relation::SelectedOption => "classroom_selected_option",
  }
}

fn member_table(role: MemberRole) -> &'static str {
  match role {
    MemberRole::Teacher => "classroom_teacher",
    MemberRole::Student => "classroom_student",
  }
}

fn classroom_from_row(row: &PgRow) -> Result<Classroom, StoreError> {
  Ok(Classroom {
    id: column(row, "id")?,
    name: column(row, "name")?,
    description: column(row, "description")?,
    public: column::<i16>(row, "is_public")? != 0,
    schedule_description: column(row, "schedule_description")?,
    selected_type: column(row, "selected_type")?,
    start_at: column(row, "start_at")?,
    end_at: column(row, "end_at")?,
    created_at: column(row, "created_at")?,
  })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
  let status: String = column(row, "status")?;
  Ok(Job {
    id: column(row, "id")?,
    owner: OauthUser::new(column::<String>(row, "user_name")?, column::<String>(row, "provider")?),
    course_id: column(row, "course_id")?,
    classroom_id: column(row, "classroom_id")?,
    status: status.parse().map_err(StoreError::Backend)?,
    created_at: column(row, "created_at")?,
  })
}

const JOB_COLUMNS: &str = "id, user_name, provider, course_id, classroom_id, status, created_at";
const CLASSROOM_COLUMNS: &str = "id, name, description, schedule_description, is_public, \
                                 selected_type, start_at, end_at, created_at";

/// [`Store`] backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
    info!(max_connections = config.max_connections, "Connecting to PostgreSQL.");
    let pool = PgPoolOptions::new()
      .max_connections(config.max_connections)
      .idle_timeout(config.idle_timeout)
      .connect(&config.url)
      .await
      .map_err(backend("connect"))?;
    Ok(Self { pool })
  }

  pub fn from_pool(pool: PgPool) -> Self {
    Self { pool }
  }

  /// Creates missing tables. Statements are idempotent.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
      sqlx::query(statement)
        .execute(&self.pool)
        .await
        .map_err(backend("migrate"))?;
    }
    debug!("Schema is up to date.");
    Ok(())
  }

  async fn jobs_where(&self, predicate: &str, value: &str) -> Result<Vec<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM container_jobs WHERE {predicate} = $1");
    let rows = sqlx::query(&sql)
      .bind(value)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select jobs"))?;
    rows.iter().map(job_from_row).collect()
  }

  async fn single_column(&self, sql: &str, id: &str) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query(sql)
      .bind(id)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select relation"))?;
    rows.iter().map(|row| column::<String>(row, "v")).collect()
  }
}

#[async_trait]
impl Store for PgStore {
  async fn classroom(&self, id: &str) -> Result<Classroom, StoreError> {
    let sql = format!("SELECT {CLASSROOM_COLUMNS} FROM classroom_info WHERE id = $1");
    let row = sqlx::query(&sql)
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .map_err(backend("select classroom"))?;
    match row {
      Some(row) => classroom_from_row(&row),
      None => Err(StoreError::not_found("classroom", id)),
    }
  }

  async fn list_classrooms(&self) -> Result<Vec<Classroom>, StoreError> {
    let sql = format!("SELECT {CLASSROOM_COLUMNS} FROM classroom_info ORDER BY created_at");
    let rows = sqlx::query(&sql)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("list classrooms"))?;
    rows.iter().map(classroom_from_row).collect()
  }

  async fn classroom_schedules(&self, id: &str) -> Result<Vec<String>, StoreError> {
    self
      .single_column(
        "SELECT cron_format AS v FROM classroom_schedule WHERE classroom_id = $1",
        id,
      )
      .await
  }

  async fn classroom_courses(&self, id: &str) -> Result<Vec<CourseId>, StoreError> {
    self
      .single_column(
        "SELECT course_id AS v FROM classroom_course WHERE classroom_id = $1",
        id,
      )
      .await
  }

  async fn classroom_members(
    &self,
    id: &str,
    role: MemberRole,
  ) -> Result<Vec<LabelValue>, StoreError> {
    let sql = format!(
      "SELECT name, user_name FROM {} WHERE classroom_id = $1",
      member_table(role)
    );
    let rows = sqlx::query(&sql)
      .bind(id)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select members"))?;
    rows
      .iter()
      .map(|row| {
        Ok(LabelValue::new(
          column::<String>(row, "name")?,
          column::<String>(row, "user_name")?,
        ))
      })
      .collect()
  }

  async fn classroom_calendar(&self, id: &str) -> Result<Vec<CalendarWindow>, StoreError> {
    let rows = sqlx::query(
      "SELECT start_month, length, start_date, end_date FROM classroom_calendar \
       WHERE classroom_id = $1 ORDER BY seq",
    )
    .bind(id)
    .fetch_all(&self.pool)
    .await
    .map_err(backend("select calendar"))?;
    rows
      .iter()
      .map(|row| {
        Ok(CalendarWindow {
          start_month: column(row, "start_month")?,
          length: column(row, "length")?,
          start_date: column(row, "start_date")?,
          end_date: column(row, "end_date")?,
        })
      })
      .collect()
  }

  async fn classroom_selected_options(&self, id: &str) -> Result<Vec<LabelValue>, StoreError> {
    let rows = sqlx::query(
      "SELECT label, value FROM classroom_selected_option WHERE classroom_id = $1",
    )
    .bind(id)
    .fetch_all(&self.pool)
    .await
    .map_err(backend("select options"))?;
    rows
      .iter()
      .map(|row| Ok(LabelValue::new(column::<String>(row, "label")?, column::<String>(row, "value")?)))
      .collect()
  }

  async fn classroom_has_course(&self, id: &str, course_id: &str) -> Result<bool, StoreError> {
    let row = sqlx::query(
      "SELECT 1 AS hit FROM classroom_course WHERE classroom_id = $1 AND course_id = $2",
    )
    .bind(id)
    .bind(course_id)
    .fetch_optional(&self.pool)
    .await
    .map_err(backend("select classroom course"))?;
    Ok(row.is_some())
  }

  async fn is_member(
    &self,
    id: &str,
    user: &OauthUser,
    role: MemberRole,
  ) -> Result<bool, StoreError> {
    let sql = format!(
      "SELECT 1 AS hit FROM {} WHERE classroom_id = $1 AND user_name = $2 AND provider = $3",
      member_table(role)
    );
    let row = sqlx::query(&sql)
      .bind(id)
      .bind(&user.user)
      .bind(&user.provider)
      .fetch_optional(&self.pool)
      .await
      .map_err(backend("select member"))?;
    Ok(row.is_some())
  }

  async fn member_classrooms(&self, user: &OauthUser) -> Result<Vec<ClassroomId>, StoreError> {
    let rows = sqlx::query(
      "SELECT classroom_id FROM classroom_teacher WHERE user_name = $1 AND provider = $2 \
       UNION SELECT classroom_id FROM classroom_student WHERE user_name = $1 AND provider = $2",
    )
    .bind(&user.user)
    .bind(&user.provider)
    .fetch_all(&self.pool)
    .await
    .map_err(backend("select member classrooms"))?;
    rows.iter().map(|row| column::<String>(row, "classroom_id")).collect()
  }

  async fn delete_classroom(&self, id: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM classroom_info WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await
      .map_err(backend("delete classroom"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("classroom", id));
    }
    Ok(())
  }

  async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
    let tx = self.pool.begin().await.map_err(backend("begin"))?;
    Ok(Box::new(PgTx { tx }))
  }

  async fn course(&self, id: &str) -> Result<Course, StoreError> {
    let row = sqlx::query(
      "SELECT id, user_name, provider, name, level, introduction, image, gpu, writable_path, \
       access_type, created_at FROM courses WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .map_err(backend("select course"))?;
    let Some(row) = row else {
      return Err(StoreError::not_found("course", id));
    };

    let datasets = self
      .single_column(
        "SELECT dataset_name AS v FROM course_datasets WHERE course_id = $1",
        id,
      )
      .await?;
    let port_rows = sqlx::query("SELECT name, port FROM course_ports WHERE course_id = $1")
      .bind(id)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select ports"))?;
    let ports = port_rows
      .iter()
      .map(|row| {
        Ok(CoursePort {
          name: column(row, "name")?,
          port: column(row, "port")?,
        })
      })
      .collect::<Result<Vec<_>, StoreError>>()?;

    let access_type = match column::<String>(&row, "access_type")?.as_str() {
      "NodePort" => AccessType::NodePort,
      _ => AccessType::Ingress,
    };
    Ok(Course {
      id: column(&row, "id")?,
      owner: OauthUser::new(column::<String>(&row, "user_name")?, column::<String>(&row, "provider")?),
      name: column(&row, "name")?,
      level: column(&row, "level")?,
      introduction: column(&row, "introduction")?,
      image: column(&row, "image")?,
      gpu: column(&row, "gpu")?,
      writable_path: column(&row, "writable_path")?,
      access_type,
      datasets,
      ports,
      created_at: column(&row, "created_at")?,
    })
  }

  async fn owns_course(&self, course_id: &str, user: &OauthUser) -> Result<bool, StoreError> {
    let row = sqlx::query(
      "SELECT 1 AS hit FROM courses WHERE id = $1 AND user_name = $2 AND provider = $3",
    )
    .bind(course_id)
    .bind(&user.user)
    .bind(&user.provider)
    .fetch_optional(&self.pool)
    .await
    .map_err(backend("select course owner"))?;
    Ok(row.is_some())
  }

  async fn owns_external_course(
    &self,
    course_id: &str,
    user: &OauthUser,
  ) -> Result<bool, StoreError> {
    let row = sqlx::query(
      "SELECT 1 AS hit FROM stack_courses WHERE id = $1 AND user_name = $2 AND provider = $3",
    )
    .bind(course_id)
    .bind(&user.user)
    .bind(&user.provider)
    .fetch_optional(&self.pool)
    .await
    .map_err(backend("select stack course owner"))?;
    Ok(row.is_some())
  }

  async fn delete_course(&self, id: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM courses WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await
      .map_err(backend("delete course"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("course", id));
    }
    Ok(())
  }

  async fn job(&self, id: &str) -> Result<Job, StoreError> {
    self
      .jobs_where("id", id)
      .await?
      .pop()
      .ok_or_else(|| StoreError::not_found("job", id))
  }

  async fn jobs_owned_by(&self, user: &OauthUser) -> Result<Vec<Job>, StoreError> {
    let sql = format!(
      "SELECT {JOB_COLUMNS} FROM container_jobs WHERE user_name = $1 AND provider = $2 \
       ORDER BY created_at"
    );
    let rows = sqlx::query(&sql)
      .bind(&user.user)
      .bind(&user.provider)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select user jobs"))?;
    rows.iter().map(job_from_row).collect()
  }

  async fn jobs_for_course(&self, course_id: &str) -> Result<Vec<Job>, StoreError> {
    self.jobs_where("course_id", course_id).await
  }

  async fn jobs_in_classroom(&self, classroom_id: &str) -> Result<Vec<Job>, StoreError> {
    self.jobs_where("classroom_id", classroom_id).await
  }

  async fn unready_jobs(&self) -> Result<Vec<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM container_jobs WHERE status <> $1");
    let rows = sqlx::query(&sql)
      .bind(JobStatus::Ready.as_str())
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select unready jobs"))?;
    rows.iter().map(job_from_row).collect()
  }

  async fn count_jobs(&self, user: &str) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM container_jobs WHERE user_name = $1")
      .bind(user)
      .fetch_one(&self.pool)
      .await
      .map_err(backend("count jobs"))?;
    Ok(column::<i64>(&row, "n")?.max(0) as u64)
  }

  async fn count_external_jobs(&self, user: &str) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM stack_jobs WHERE user_name = $1")
      .bind(user)
      .fetch_one(&self.pool)
      .await
      .map_err(backend("count stack jobs"))?;
    Ok(column::<i64>(&row, "n")?.max(0) as u64)
  }

  async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO container_jobs (id, user_name, provider, course_id, classroom_id, status, \
       created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&job.id)
    .bind(&job.owner.user)
    .bind(&job.owner.provider)
    .bind(&job.course_id)
    .bind(&job.classroom_id)
    .bind(job.status.as_str())
    .bind(job.created_at)
    .execute(&self.pool)
    .await
    .map_err(backend("insert job"))?;
    Ok(())
  }

  async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE container_jobs SET status = $1 WHERE id = $2")
      .bind(status.as_str())
      .bind(id)
      .execute(&self.pool)
      .await
      .map_err(backend("update job status"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("job", id));
    }
    Ok(())
  }

  async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM container_jobs WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await
      .map_err(backend("delete job"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("job", id));
    }
    Ok(())
  }

  async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO job_audit (id, user_name, provider, course_id, classroom_id, deleted_by, \
       created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&record.id)
    .bind(&record.owner.user)
    .bind(&record.owner.provider)
    .bind(&record.course_id)
    .bind(&record.classroom_id)
    .bind(&record.deleted_by)
    .bind(record.created_at)
    .execute(&self.pool)
    .await
    .map_err(backend("insert audit"))?;
    Ok(())
  }

  async fn mark_audit_deleted(&self, id: &JobId, actor: &str) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE job_audit SET deleted_by = $1 WHERE id = $2")
      .bind(actor)
      .bind(id)
      .execute(&self.pool)
      .await
      .map_err(backend("update audit"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("audit", id.as_str()));
    }
    Ok(())
  }

  async fn audit(&self, id: &str) -> Result<AuditRecord, StoreError> {
    let row = sqlx::query(
      "SELECT id, user_name, provider, course_id, classroom_id, deleted_by, created_at \
       FROM job_audit WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .map_err(backend("select audit"))?;
    let Some(row) = row else {
      return Err(StoreError::not_found("audit", id));
    };
    Ok(AuditRecord {
      id: column(&row, "id")?,
      owner: OauthUser::new(column::<String>(&row, "user_name")?, column::<String>(&row, "provider")?),
      course_id: column(&row, "course_id")?,
      classroom_id: column(&row, "classroom_id")?,
      deleted_by: column(&row, "deleted_by")?,
      created_at: column(&row, "created_at")?,
    })
  }

  async fn user(&self, user: &OauthUser) -> Result<UserAccount, StoreError> {
    let row = sqlx::query("SELECT uid, role FROM users WHERE user_name = $1 AND provider = $2")
      .bind(&user.user)
      .bind(&user.provider)
      .fetch_optional(&self.pool)
      .await
      .map_err(backend("select user"))?;
    let Some(row) = row else {
      return Err(StoreError::not_found("user", user.to_string()));
    };
    let role: String = column(&row, "role")?;
    Ok(UserAccount {
      identity: user.clone(),
      uid: column(&row, "uid")?,
      role: role.parse::<Role>().map_err(StoreError::Backend)?,
    })
  }

  async fn superusers(&self, provider: &str) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query("SELECT user_name FROM users WHERE role = $1 AND provider = $2")
      .bind(Role::Superuser.as_str())
      .bind(provider)
      .fetch_all(&self.pool)
      .await
      .map_err(backend("select superusers"))?;
    rows.iter().map(|row| column::<String>(row, "user_name")).collect()
  }
}

// --- Transactions ---

struct PgTx {
  tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
  async fn insert_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO classroom_info (id, name, description, schedule_description, is_public, \
       selected_type, start_at, end_at, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&classroom.id)
    .bind(&classroom.name)
    .bind(&classroom.description)
    .bind(&classroom.schedule_description)
    .bind(classroom.public_flag())
    .bind(classroom.selected_type)
    .bind(&classroom.start_at)
    .bind(&classroom.end_at)
    .bind(classroom.created_at)
    .execute(&mut *self.tx)
    .await
    .map_err(backend("insert classroom"))?;
    Ok(())
  }

  async fn update_classroom(&mut self, classroom: &Classroom) -> Result<(), StoreError> {
    let result = sqlx::query(
      "UPDATE classroom_info SET name = $1, description = $2, schedule_description = $3, \
       selected_type = $4, start_at = $5, end_at = $6 WHERE id = $7",
    )
    .bind(&classroom.name)
    .bind(&classroom.description)
    .bind(&classroom.schedule_description)
    .bind(classroom.selected_type)
    .bind(&classroom.start_at)
    .bind(&classroom.end_at)
    .bind(&classroom.id)
    .execute(&mut *self.tx)
    .await
    .map_err(backend("update classroom"))?;
    if result.rows_affected() == 0 {
      return Err(StoreError::not_found("classroom", classroom.id.as_str()));
    }
    Ok(())
  }

  async fn set_public_flag(&mut self, id: &str, flag: i16) -> Result<(), StoreError> {
    sqlx::query("UPDATE classroom_info SET is_public = $1 WHERE id = $2")
      .bind(flag)
      .bind(id)
      .execute(&mut *self.tx)
      .await
      .map_err(backend("update public flag"))?;
    Ok(())
  }

  async fn clear_relation(&mut self, id: &str, relation: Relation) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM {} WHERE classroom_id = $1", relation_table(relation));
    sqlx::query(&sql)
      .bind(id)
      .execute(&mut *self.tx)
      .await
      .map_err(backend("clear relation"))?;
    Ok(())
  }

  async fn insert_relation(&mut self, id: &str, rows: &RelationRows) -> Result<(), StoreError> {
    if rows.is_empty() {
      return Ok(());
    }
    let classroom_id = id.to_string();
    let mut builder: QueryBuilder<Postgres> = match rows {
      RelationRows::Courses(ids) => {
        let mut b = QueryBuilder::new("INSERT INTO classroom_course (classroom_id, course_id) ");
        b.push_values(ids, |mut row, course| {
          row.push_bind(classroom_id.clone()).push_bind(course.clone());
        });
        b
      }
      RelationRows::Schedules(exprs) => {
        let mut b =
          QueryBuilder::new("INSERT INTO classroom_schedule (classroom_id, cron_format) ");
        b.push_values(exprs, |mut row, expr| {
          row.push_bind(classroom_id.clone()).push_bind(expr.clone());
        });
        b
      }
      RelationRows::Teachers { provider, members } | RelationRows::Students { provider, members } => {
        let table = relation_table(rows.relation());
        let mut b = QueryBuilder::new(format!(
          "INSERT INTO {table} (classroom_id, user_name, provider, name) "
        ));
        b.push_values(members, |mut row, member| {
          row
            .push_bind(classroom_id.clone())
            .push_bind(member.value.clone())
            .push_bind(provider.clone())
            .push_bind(member.label.clone());
        });
        b
      }
      RelationRows::Calendar(windows) => {
        let mut b = QueryBuilder::new(
          "INSERT INTO classroom_calendar (classroom_id, seq, start_month, length, start_date, \
           end_date) ",
        );
        b.push_values(windows.iter().enumerate(), |mut row, (idx, window)| {
          row
            .push_bind(classroom_id.clone())
            .push_bind(idx as i32 + 1)
            .push_bind(window.start_month)
            .push_bind(window.length)
            .push_bind(window.start_date.clone())
            .push_bind(window.end_date.clone());
        });
        b
      }
      RelationRows::SelectedOptions(options) => {
        let mut b = QueryBuilder::new(
          "INSERT INTO classroom_selected_option (classroom_id, label, value) ",
        );
        b.push_values(options, |mut row, option| {
          row
            .push_bind(classroom_id.clone())
            .push_bind(option.label.clone())
            .push_bind(option.value.clone());
        });
        b
      }
    };
    builder
      .build()
      .execute(&mut *self.tx)
      .await
      .map_err(backend("insert relation"))?;
    Ok(())
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError> {
    self.tx.commit().await.map_err(backend("commit"))
  }

  async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
    self.tx.rollback().await.map_err(backend("rollback"))
  }
}
