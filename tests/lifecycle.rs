mod common;

use common::*;

use coursekeeper::cluster::CourseResourceStatus;
use coursekeeper::model::{LaunchTicket, Role};
use coursekeeper::stack::{JobStack, StackLaunchRequest};
use coursekeeper::{
  CoreError, CourseKeeper, Job, JobStatus, LaunchRequest, StackError, Store,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

/// Records every call and answers with canned results.
#[derive(Clone, Default)]
struct RecordingStack {
  calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobStack for RecordingStack {
  async fn launch(
    &self,
    auth_token: Option<String>,
    request: StackLaunchRequest,
  ) -> Result<LaunchTicket, StackError> {
    self.calls.lock().push(format!(
      "launch {} {} {}",
      request.user,
      request.course_id,
      auth_token.unwrap_or_default()
    ));
    Ok(LaunchTicket {
      job_id: "vm-job-1".into(),
      ready: false,
      status: "Pending".into(),
    })
  }

  async fn delete(&self, auth_token: Option<String>, job_id: String) -> Result<(), StackError> {
    self
      .calls
      .lock()
      .push(format!("delete {job_id} {}", auth_token.unwrap_or_default()));
    Ok(())
  }
}

fn keeper_with_stack(h: &Harness, stack: RecordingStack) -> CourseKeeper {
  CourseKeeper::builder()
    .store(h.store.clone())
    .cluster_backend(h.cluster.clone())
    .cache(h.cache.clone())
    .job_stack(stack)
    .config(fast_config())
    .build()
    .expect("keeper builds")
}

/// A student enrolled in `aitrain-c1`, which lists course `k1`.
fn enrolled(h: &Harness) -> coursekeeper::OauthUser {
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());
  student
}

fn job(id: &str, status: JobStatus) -> Job {
  Job {
    id: id.into(),
    owner: user("u1"),
    course_id: "k1".into(),
    classroom_id: Some("aitrain-c1".into()),
    status,
    created_at: Utc::now(),
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_stops_watcher_and_audits_actor() -> anyhow::Result<()> {
  let h = harness();
  let student = enrolled(&h);
  let ticket = h
    .keeper
    .launch(LaunchRequest::new(student, "k1", Some("aitrain-c1")))
    .await?;

  let cluster = h.cluster.clone();
  assert!(
    wait_until(Duration::from_secs(2), || {
      let polled = cluster.course_gets() > 0;
      async move { polled }
    })
    .await
  );

  h.keeper.delete_job(&ticket.job_id, "admin", None).await?;
  assert!(!h.keeper.registry().contains(&ticket.job_id));
  assert!(h.cluster.course("aitrain-c1", &ticket.job_id).is_none());
  assert!(h.store.job(&ticket.job_id).await.is_err());
  assert_eq!(
    h.store.audit(&ticket.job_id).await?.deleted_by.as_deref(),
    Some("admin")
  );

  // At most one cycle may still be in flight; after that polling stops for good.
  tokio::time::sleep(Duration::from_millis(50)).await;
  let settled = h.cluster.course_gets();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(h.cluster.course_gets(), settled);
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_over_a_live_watcher_leaves_one_to_stop() -> anyhow::Result<()> {
  let h = harness();
  let student = enrolled(&h);
  let ticket = h
    .keeper
    .launch(LaunchRequest::new(student, "k1", Some("aitrain-c1")))
    .await?;

  let cluster = h.cluster.clone();
  assert!(
    wait_until(Duration::from_secs(2), || {
      let polled = cluster.course_gets() > 0;
      async move { polled }
    })
    .await
  );

  assert_eq!(h.keeper.resume().await?, 1);
  assert_eq!(h.keeper.registry().len(), 1);

  h.keeper.delete_job(&ticket.job_id, "admin", None).await?;
  assert!(h.keeper.registry().is_empty());

  tokio::time::sleep(Duration::from_millis(50)).await;
  let settled = h.cluster.course_gets();
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(h.cluster.course_gets(), settled);

  h.keeper.shutdown(Some(Duration::from_secs(2))).await?;
  Ok(())
}

#[tokio::test]
async fn missing_channel_does_not_fail_delete() -> anyhow::Result<()> {
  let h = harness();
  enrolled(&h);
  h.store.insert_job(&job("job-9", JobStatus::Ready)).await?;

  h.keeper.delete_job("job-9", "admin", None).await?;
  assert_eq!(h.store.job_count(), 0);
  Ok(())
}

#[tokio::test]
async fn unknown_job_ids_go_to_the_vm_stack() -> anyhow::Result<()> {
  let h = harness();
  let stack = RecordingStack::default();
  let keeper = keeper_with_stack(&h, stack.clone());

  keeper
    .delete_job("vm-42", "admin", Some("Bearer tok".into()))
    .await?;
  assert_eq!(*stack.calls.lock(), vec!["delete vm-42 Bearer tok".to_string()]);
  Ok(())
}

#[tokio::test]
async fn vm_courses_launch_through_the_stack() -> anyhow::Result<()> {
  let h = harness();
  let owner = user("alice");
  h.store.put_external_course("vm-course", owner.clone());
  let stack = RecordingStack::default();
  let keeper = keeper_with_stack(&h, stack.clone());

  let ticket = keeper
    .launch(LaunchRequest::new(owner, "vm-course", None).with_auth_token("Bearer tok"))
    .await?;
  assert_eq!(ticket.job_id, "vm-job-1");
  assert_eq!(ticket.status, "Pending");
  assert_eq!(
    *stack.calls.lock(),
    vec!["launch alice vm-course Bearer tok".to_string()]
  );
  assert_eq!(h.store.job_count(), 0);
  Ok(())
}

#[tokio::test]
async fn vm_stack_is_disabled_by_default() {
  let h = harness();
  let err = h.keeper.delete_job("vm-42", "admin", None).await.unwrap_err();
  assert!(matches!(err, CoreError::Stack { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_rearms_unready_jobs_only() -> anyhow::Result<()> {
  let h = harness();
  enrolled(&h);
  h.store.insert_job(&job("job-created", JobStatus::Created)).await?;
  h.store.insert_job(&job("job-pending", JobStatus::Pending)).await?;
  h.store.insert_job(&job("job-ready", JobStatus::Ready)).await?;

  assert_eq!(h.keeper.resume().await?, 2);
  assert!(h.keeper.registry().contains("job-created"));
  assert!(h.keeper.registry().contains("job-pending"));
  assert!(!h.keeper.registry().contains("job-ready"));

  h.keeper.shutdown(Some(Duration::from_secs(2))).await?;
  assert!(h.keeper.registry().is_empty());
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_watcher_leaves_job_pending() -> anyhow::Result<()> {
  let mut config = fast_config();
  config.watch = coursekeeper::BackoffConfig::Fixed {
    delay_ms: 5,
    max_elapsed_ms: Some(40),
  };
  let h = harness_with(config);
  enrolled(&h);
  h.store.insert_job(&job("job-1", JobStatus::Created)).await?;
  h.keeper.resume().await?;

  let registry_empty = {
    let keeper = h.keeper.clone();
    wait_until(Duration::from_secs(2), move || {
      let empty = !keeper.registry().contains("job-1");
      async move { empty }
    })
    .await
  };
  assert!(registry_empty);
  assert_eq!(h.store.job("job-1").await?.status, JobStatus::Pending);
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_list_is_cached_and_invalidated() -> anyhow::Result<()> {
  let h = harness();
  let student = enrolled(&h);
  let ticket = h
    .keeper
    .launch(LaunchRequest::new(student.clone(), "k1", Some("aitrain-c1")))
    .await?;
  h.cluster.set_status(
    "aitrain-c1",
    &ticket.job_id,
    CourseResourceStatus {
      accessible: true,
      sub_path: BTreeMap::from([("jupyter".to_string(), "lab.example/u1".to_string())]),
      node_port: BTreeMap::new(),
    },
  );
  let store = h.store.clone();
  let job_id = ticket.job_id.clone();
  assert!(
    wait_until(Duration::from_secs(3), || {
      let store = store.clone();
      let job_id = job_id.clone();
      async move { matches!(store.job(&job_id).await, Ok(j) if j.status == JobStatus::Ready) }
    })
    .await
  );

  let views = h.keeper.list_jobs(&student).await?;
  assert_eq!(views.len(), 1);
  assert_eq!(views[0].status, JobStatus::Ready);
  assert_eq!(views[0].name, "Course k1");
  assert!(!views[0].can_snapshot);
  assert_eq!(views[0].service.len(), 1);
  assert_eq!(views[0].service[0].value, "http://lab.example/u1");
  assert!(h.cache.contains(&student.cache_key()));

  // Served from the cache even while the store is unavailable.
  h.store.fail_on("jobs_owned_by");
  assert_eq!(h.keeper.list_jobs(&student).await?, views);
  h.store.clear_failure("jobs_owned_by");

  h.keeper.delete_job(&ticket.job_id, "u1", None).await?;
  assert!(!h.cache.contains(&student.cache_key()));
  assert!(h.keeper.list_jobs(&student).await?.is_empty());
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_course_cascades_to_its_jobs() -> anyhow::Result<()> {
  let h = harness();
  let student = enrolled(&h);
  let ticket = h
    .keeper
    .launch(LaunchRequest::new(student, "k1", Some("aitrain-c1")))
    .await?;

  h.keeper.delete_course("k1").await?;
  assert_eq!(h.store.job_count(), 0);
  assert!(h.cluster.course("aitrain-c1", &ticket.job_id).is_none());
  assert!(!h.keeper.registry().contains(&ticket.job_id));
  assert!(h.store.course("k1").await.is_err());

  let err = h.keeper.delete_course("k1").await.unwrap_err();
  assert!(matches!(err, CoreError::NotFound { .. }));
  Ok(())
}
