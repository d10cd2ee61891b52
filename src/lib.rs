//! CourseKeeper: classroom tenancy, launch admission and job lifecycle for a
//! Kubernetes-backed training platform.
//!
//! A classroom is a tenant: a set of storage rows (courses, schedule, members, calendar) and
//! a namespace holding linked dataset claims, a TLS secret and an access role. Users launch
//! courses inside classrooms; each launch is either a `Course` custom resource watched until
//! the course controller reports it accessible, or a VM job handed to an external job stack.
//!
//! # Features
//!
//! - Launch admission: public classroom, cron schedule window (evaluated in a configured
//!   timezone), course membership, classroom membership, ownership outside classrooms, and
//!   a one-job-per-user quota that superusers do not bypass.
//! - Classroom create/update/delete with one storage transaction per operation and
//!   compensating cleanup of the cluster side when a step fails.
//! - Per-job reconciliation watchers with exponential backoff, a cancellation registry and
//!   resume of unfinished jobs after a restart.
//! - Cached per-user job lists with reachable endpoints.
//! - Pluggable collaborators: in-memory implementations are always available; PostgreSQL
//!   (`postgres`), Kubernetes (`kube-provider`) and the HTTP job stack (`http-stack`) are
//!   feature-gated.
//!
//! # Usage
//!
//! ```no_run
//! use coursekeeper::{CourseKeeper, KeeperConfig, LaunchRequest, MemoryCache, MemoryCluster,
//!     MemoryStore, OauthUser};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,coursekeeper=info").init();
//!
//!     let keeper = CourseKeeper::builder()
//!         .store(MemoryStore::new())
//!         .cluster_backend(MemoryCluster::new())
//!         .cache(MemoryCache::new())
//!         .config(KeeperConfig::default())
//!         .build()?;
//!
//!     // Pick up jobs that were still reconciling when the process last stopped.
//!     let resumed = keeper.resume().await?;
//!     println!("Resumed {resumed} watchers");
//!
//!     let request = LaunchRequest::new(
//!         OauthUser::new("alice", "github"),
//!         "course-1",
//!         Some("aitrain-public"),
//!     );
//!     match keeper.launch(request).await {
//!         Ok(ticket) => println!("Launched {} ({})", ticket.job_id, ticket.status),
//!         Err(e) => eprintln!("{}", e.message()),
//!     }
//!
//!     keeper.shutdown(Some(Duration::from_secs(5))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! [`KeeperConfig`] carries the namespace prefix (which also names the reserved
//! `<prefix>-public` and `<prefix>-teacher` classrooms and the `<prefix>-system`
//! namespace), the UID range, storage class, node-port host, schedule timezone, TLS secret
//! name, dataset source namespace and the watcher [`BackoffConfig`].
//!
//! # Errors
//!
//! Every operation returns [`CoreError`], which pairs a log `detail` with a localized,
//! user-facing `message`. Admission denials are values of [`Admission`], not errors, until
//! `launch` turns them into [`CoreError::Denied`].

pub mod admission;
pub mod backoff;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod keeper;
pub mod message;
pub mod model;
pub mod orchestrator;
pub mod provision;
pub mod quota;
pub mod registry;
pub mod saga;
pub mod schedule;
pub mod spec_builder;
pub mod stack;
pub mod store;
pub mod watcher;

// --- Public Re-exports ---

// Entry point
pub use keeper::{CourseKeeper, CourseKeeperBuilder};
pub use config::{KeeperConfig, ReservedClassrooms};

// Components
pub use admission::{Admission, AdmissionController, Denial, DenialKind};
pub use backoff::{BackoffConfig, BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use orchestrator::JobLifecycle;
pub use provision::ClassroomProvisioner;
pub use quota::QuotaTracker;
pub use registry::{CancellationRegistry, Signal};
pub use schedule::{CronExpr, ScheduleEvaluator};
pub use spec_builder::ResourceSpecBuilder;
pub use watcher::{ReconciliationWatcher, WatchOutcome, WatchState};

// Collaborators
pub use cache::{ListCache, MemoryCache};
pub use cluster::{ClusterProvider, CourseResourceClient, MemoryCluster};
#[cfg(feature = "kube-provider")]
pub use cluster::KubeCluster;
pub use stack::{DisabledJobStack, JobStack};
#[cfg(feature = "http-stack")]
pub use stack::HttpJobStack;
pub use store::{MemoryStore, Store, StoreTx};
#[cfg(feature = "postgres")]
pub use store::PgStore;

// Errors
pub use error::{
  BuildError, CacheError, CoreError, ResourceError, ScheduleError, ShutdownError, StackError,
  StoreError,
};

// Domain types
pub use model::{
  Classroom, ClassroomDetail, ClassroomRequest, Course, CourseKind, Job, JobStatus, JobView,
  LabelValue, LaunchRequest, LaunchTicket, OauthUser, ScheduleWindow, UserAccount,
};
