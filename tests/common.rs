//! tests/common.rs
//! Shared fixtures for integration tests.

#![allow(dead_code)]

use coursekeeper::cluster::{SecretData, VolumeClaim};
use coursekeeper::model::{AccessType, CoursePort, Role};
use coursekeeper::store::RelationRows;
use coursekeeper::{
  BackoffConfig, Classroom, ClassroomRequest, Course, CourseKeeper, KeeperConfig, LabelValue,
  MemoryCache, MemoryCluster, MemoryStore, OauthUser, ScheduleWindow, UserAccount,
};

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;

pub const PROVIDER: &str = "github";
/// Fires every second, so the classroom is always open.
pub const ALWAYS: &str = "* * * * * *";
pub const PUBLIC: &str = "aitrain-public";
pub const TEACHER: &str = "aitrain-teacher";
pub const SYSTEM: &str = "aitrain-system";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_test_writer()
    .try_init();
}

/// Collaborators plus the keeper built on top of them.
pub struct Harness {
  pub keeper: CourseKeeper,
  pub store: MemoryStore,
  pub cluster: MemoryCluster,
  pub cache: MemoryCache,
}

/// Polls fast and gives up after a few seconds.
pub fn fast_config() -> KeeperConfig {
  KeeperConfig {
    storage_class: "nfs".into(),
    node_port_dns: "nodes.example".into(),
    watch: BackoffConfig::Fixed {
      delay_ms: 10,
      max_elapsed_ms: Some(5_000),
    },
    ..KeeperConfig::default()
  }
}

pub fn harness() -> Harness {
  harness_with(fast_config())
}

/// Seeds the two reserved classrooms with their namespaces, the system TLS secret and one
/// source dataset claim.
pub fn harness_with(config: KeeperConfig) -> Harness {
  setup_tracing();
  let store = MemoryStore::new();
  let cluster = MemoryCluster::new();
  let cache = MemoryCache::new();

  store.put_classroom(
    classroom(PUBLIC, "Public", true),
    &[RelationRows::Schedules(vec![ALWAYS.into()])],
  );
  store.put_classroom(
    classroom(TEACHER, "Teacher", true),
    &[RelationRows::Schedules(vec![ALWAYS.into()])],
  );

  for ns in [PUBLIC, TEACHER, SYSTEM, "default"] {
    cluster.put_namespace(ns, BTreeMap::new());
  }
  cluster.put_secret(
    SYSTEM,
    SecretData {
      name: config.tls_secret_name.clone(),
      type_: "kubernetes.io/tls".into(),
      data: BTreeMap::from([("tls.crt".to_string(), b"cert".to_vec())]),
    },
  );
  cluster.put_claim(VolumeClaim {
    name: "dataset-mnist".into(),
    namespace: "default".into(),
    labels: BTreeMap::from([("instance".to_string(), config.namespace_prefix.clone())]),
    annotations: BTreeMap::new(),
    access_modes: vec!["ReadWriteMany".into()],
    storage_request: "10Gi".into(),
    storage_class: None,
  });

  let keeper = CourseKeeper::builder()
    .store(store.clone())
    .cluster_backend(cluster.clone())
    .cache(cache.clone())
    .config(config)
    .build()
    .expect("keeper builds");

  Harness {
    keeper,
    store,
    cluster,
    cache,
  }
}

pub fn user(name: &str) -> OauthUser {
  OauthUser::new(name, PROVIDER)
}

pub fn classroom(id: &str, name: &str, public: bool) -> Classroom {
  Classroom {
    id: id.into(),
    name: name.into(),
    description: String::new(),
    public,
    schedule_description: "always".into(),
    selected_type: None,
    start_at: String::new(),
    end_at: String::new(),
    created_at: Utc::now(),
  }
}

pub fn seed_user(store: &MemoryStore, name: &str, uid: i64, role: Role) -> OauthUser {
  let identity = user(name);
  store.put_user(UserAccount {
    identity: identity.clone(),
    uid,
    role,
  });
  identity
}

pub fn seed_course(store: &MemoryStore, id: &str, owner: &OauthUser, ports: &[(&str, i32)]) {
  store.put_course(Course {
    id: id.into(),
    owner: owner.clone(),
    name: format!("Course {id}"),
    level: "basic".into(),
    introduction: Some("intro".into()),
    image: "jupyter:latest".into(),
    gpu: 0,
    writable_path: Some("/home/jovyan".into()),
    access_type: AccessType::Ingress,
    datasets: vec!["dataset-mnist".into()],
    ports: ports
      .iter()
      .map(|(name, port)| CoursePort {
        name: name.to_string(),
        port: *port,
      })
      .collect(),
    created_at: Utc::now(),
  });
}

/// A public, always-open classroom listing `courses`, with `students` enrolled.
pub fn seed_classroom(store: &MemoryStore, id: &str, courses: &[&str], students: &[&OauthUser]) {
  store.put_classroom(
    classroom(id, &format!("Classroom {id}"), true),
    &[
      RelationRows::Courses(courses.iter().map(|c| c.to_string()).collect()),
      RelationRows::Schedules(vec![ALWAYS.into()]),
      RelationRows::Students {
        provider: PROVIDER.into(),
        members: students
          .iter()
          .map(|u| LabelValue::new(u.user.clone(), u.user.clone()))
          .collect(),
      },
    ],
  );
}

pub fn classroom_request(name: &str, cron: &[&str]) -> ClassroomRequest {
  ClassroomRequest {
    id: None,
    name: name.into(),
    description: "desc".into(),
    public: true,
    schedule: ScheduleWindow {
      cron_format: cron.iter().map(|c| c.to_string()).collect(),
      description: "weekdays".into(),
      start_date: "2024-01-01".into(),
      end_date: "2024-12-31".into(),
      selected_type: Some(1),
      selected_option: vec![LabelValue::new("Mon", "1")],
    },
    courses: vec![LabelValue::new("Course k1", "k1")],
    teachers: Some(vec![LabelValue::new("Teacher", "t1")]),
    students: Some(vec![
      LabelValue::new("Student 1", "s1"),
      LabelValue::new("Student 2", "s2"),
    ]),
    calendar: None,
  }
}

/// Polls `check` until it returns true or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + limit;
  while tokio::time::Instant::now() < deadline {
    if check().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  false
}
