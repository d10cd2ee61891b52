mod common;

use common::*;

use coursekeeper::cluster::{CourseResourceStatus, DeletePropagation};
use coursekeeper::model::Role;
use coursekeeper::{
  Admission, CoreError, CourseResourceClient, DenialKind, JobStatus, LaunchRequest, Store,
};

use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn member_launch_creates_resource_and_becomes_ready() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());

  let ticket = h
    .keeper
    .launch(LaunchRequest::new(student.clone(), "k1", Some("aitrain-c1")))
    .await?;
  assert!(!ticket.ready);
  assert_eq!(ticket.status, "Created");
  assert!(h.keeper.registry().contains(&ticket.job_id));

  let resource = h
    .cluster
    .course("aitrain-c1", &ticket.job_id)
    .expect("course resource created");
  assert_eq!(resource.spec.port, BTreeMap::from([("jupyter".to_string(), 8888)]));
  assert_eq!(resource.spec.schedule, vec![ALWAYS.to_string()]);
  // UID range starts at zero: writable volumes run as root.
  assert_eq!(resource.spec.writable_volume.map(|v| v.uid), Some(0));

  let job = h.store.job(&ticket.job_id).await?;
  assert_eq!(job.classroom_id.as_deref(), Some("aitrain-c1"));
  assert!(h.store.audit(&ticket.job_id).await.is_ok());

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
  assert!(
    wait_until(Duration::from_secs(1), || {
      let ready = !h.keeper.registry().contains(&ticket.job_id);
      async move { ready }
    })
    .await
  );

  h.keeper.shutdown(Some(Duration::from_secs(2))).await?;
  Ok(())
}

#[tokio::test]
async fn quota_denies_second_job_without_side_effects() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());
  h.store.put_external_job("vm-1", student.clone());

  let request = LaunchRequest::new(student, "k1", Some("aitrain-c1"));
  match h.keeper.check_launch(&request).await? {
    Admission::Deny(denial) => assert_eq!(denial.kind, DenialKind::QuotaExceeded { active: 1 }),
    Admission::Allow => panic!("quota should deny"),
  }

  let err = h.keeper.launch(request).await.unwrap_err();
  assert!(matches!(err, CoreError::Denied { .. }));
  assert!(h.cluster.course_names("aitrain-c1").is_empty());
  assert_eq!(h.store.job_count(), 0);
  Ok(())
}

#[tokio::test]
async fn superuser_is_still_bound_by_quota() -> anyhow::Result<()> {
  let h = harness();
  let root = seed_user(&h.store, "root", 0, Role::Superuser);
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[]);

  let request = LaunchRequest::new(root.clone(), "k1", Some("aitrain-c1"));
  assert!(h.keeper.check_launch(&request).await?.is_allowed());

  h.store.put_external_job("vm-1", root);
  assert!(!h.keeper.check_launch(&request).await?.is_allowed());
  Ok(())
}

#[tokio::test]
async fn course_without_ports_cannot_launch() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k2", &teacher, &[]);
  seed_classroom(&h.store, "aitrain-c1", &["k2"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());

  let err = h
    .keeper
    .launch(LaunchRequest::new(student, "k2", Some("aitrain-c1")))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::NoPortsDefined { .. }));
  assert!(h.cluster.course_names("aitrain-c1").is_empty());
  assert_eq!(h.store.job_count(), 0);
  assert!(h.keeper.registry().is_empty());
  Ok(())
}

#[tokio::test]
async fn failed_job_insert_removes_the_resource() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());
  h.store.fail_on("insert_job");

  let err = h
    .keeper
    .launch(LaunchRequest::new(student, "k1", Some("aitrain-c1")))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Storage { .. }));
  assert_eq!(h.cluster.calls("create"), 1);
  assert_eq!(h.cluster.calls("delete"), 1);
  assert!(h.cluster.course_names("aitrain-c1").is_empty());
  assert!(h.keeper.registry().is_empty());
  Ok(())
}

#[tokio::test]
async fn compensation_failure_keeps_insert_error() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  let student = seed_user(&h.store, "u1", 1042, Role::Student);
  seed_course(&h.store, "k1", &teacher, &[("jupyter", 8888)]);
  seed_classroom(&h.store, "aitrain-c1", &["k1"], &[&student]);
  h.cluster.put_namespace("aitrain-c1", BTreeMap::new());
  h.store.fail_on("insert_job");
  h.cluster.fail_on("delete");

  let err = h
    .keeper
    .launch(LaunchRequest::new(student, "k1", Some("aitrain-c1")))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Storage { .. }));
  assert_eq!(h.cluster.course_names("aitrain-c1").len(), 1);
  Ok(())
}

#[tokio::test]
async fn owner_launch_without_classroom_uses_teacher_namespace() -> anyhow::Result<()> {
  let h = harness();
  let teacher = seed_user(&h.store, "t1", 2000, Role::Teacher);
  seed_course(&h.store, "k1", &teacher, &[("ssh", 22)]);

  let ticket = h
    .keeper
    .launch(LaunchRequest::new(teacher.clone(), "k1", None))
    .await?;
  assert!(h.cluster.course(TEACHER, &ticket.job_id).is_some());
  assert_eq!(h.store.job(&ticket.job_id).await?.classroom_id, None);

  let stranger = seed_user(&h.store, "s9", 3000, Role::Student);
  let err = h
    .keeper
    .launch(LaunchRequest::new(stranger, "k1", None))
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Denied { .. }));

  // Tidy up so the watcher does not outlive the test.
  CourseResourceClient::delete(&h.cluster, TEACHER, &ticket.job_id, DeletePropagation::Foreground)
    .await?;
  h.keeper.shutdown(Some(Duration::from_secs(2))).await?;
  Ok(())
}
