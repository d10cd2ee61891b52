//! Per-job reconciliation loop.
//!
//! A watcher polls the job's `Course` resource until the controller reports it accessible,
//! writing `Pending` after each miss and `Ready` once, and invalidating the owner's list
//! cache after each write. It stops when its channel delivers [`Signal::Stop`] or when the
//! backoff policy gives up.

use crate::backoff::BackoffPolicy;
use crate::cache::ListCache;
use crate::cluster::CourseResourceClient;
use crate::model::{Job, JobId, JobStatus};
use crate::registry::{Signal, WatchChannel};
use crate::store::Store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn, Instrument};

/// Where a watcher is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
  Armed,
  Polling,
  Ready,
  Stopped,
  /// Backoff gave up; the job stays `Pending`.
  Exhausted,
}

impl fmt::Display for WatchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WatchState::Armed => "armed",
      WatchState::Polling => "polling",
      WatchState::Ready => "ready",
      WatchState::Stopped => "stopped",
      WatchState::Exhausted => "exhausted",
    };
    f.write_str(name)
  }
}

/// Terminal state of a watcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
  Ready,
  Stopped,
  Exhausted,
}

impl From<WatchOutcome> for WatchState {
  fn from(outcome: WatchOutcome) -> Self {
    match outcome {
      WatchOutcome::Ready => WatchState::Ready,
      WatchOutcome::Stopped => WatchState::Stopped,
      WatchOutcome::Exhausted => WatchState::Exhausted,
    }
  }
}

pub struct ReconciliationWatcher {
  job_id: JobId,
  namespace: String,
  cache_key: String,
  store: Arc<dyn Store>,
  resources: Arc<dyn CourseResourceClient>,
  cache: Arc<dyn ListCache>,
  channel: WatchChannel,
  backoff: Box<dyn BackoffPolicy>,
  state: WatchState,
  polls: usize,
}

impl ReconciliationWatcher {
  /// `namespace` is where the job's resource lives; for jobs without a classroom that is
  /// the reserved teacher classroom.
  pub fn new(
    job: &Job,
    namespace: impl Into<String>,
    store: Arc<dyn Store>,
    resources: Arc<dyn CourseResourceClient>,
    cache: Arc<dyn ListCache>,
    channel: WatchChannel,
    backoff: Box<dyn BackoffPolicy>,
  ) -> Self {
    Self {
      job_id: job.id.clone(),
      namespace: namespace.into(),
      cache_key: job.owner.cache_key(),
      store,
      resources,
      cache,
      channel,
      backoff,
      state: WatchState::Armed,
      polls: 0,
    }
  }

  pub fn job_id(&self) -> &str {
    &self.job_id
  }

  /// Drives the watcher to a terminal state. Never fails; every problem is logged.
  pub async fn run(mut self) -> WatchOutcome {
    let span = tracing::span!(
      tracing::Level::INFO,
      "course_watch",
      job_id = %self.job_id,
      namespace = %self.namespace
    );
    async move {
      info!("Watcher armed.");
      let outcome = self.poll_until_settled().await;
      self.transition(outcome.into());
      info!(?outcome, polls = self.polls, "Watcher finished.");
      outcome
    }
    .instrument(span)
    .await
  }

  async fn poll_until_settled(&mut self) -> WatchOutcome {
    loop {
      match self.channel.receiver.recv().await {
        Some(Signal::Proceed) => {}
        Some(Signal::Stop) | None => return WatchOutcome::Stopped,
      }

      self.transition(WatchState::Polling);
      self.polls += 1;
      match self.resources.get(&self.namespace, &self.job_id).await {
        Ok(resource) if resource.is_accessible() => {
          self.record(JobStatus::Ready).await;
          return WatchOutcome::Ready;
        }
        Ok(_) => debug!(poll = self.polls, "Course resource is not accessible yet."),
        Err(e) => warn!(poll = self.polls, error = %e, "Failed to read course resource."),
      }
      self.record(JobStatus::Pending).await;

      let Some(delay) = self.backoff.next_delay() else {
        warn!(polls = self.polls, "Backoff exhausted; job stays Pending.");
        return WatchOutcome::Exhausted;
      };
      if !self.wait(delay).await {
        return WatchOutcome::Stopped;
      }
    }
  }

  /// Sleeps for `delay`, returning `false` if a stop arrives meanwhile. Re-arms the channel
  /// before the next cycle.
  async fn wait(&mut self, delay: Duration) -> bool {
    trace!(delay_ms = delay.as_millis() as u64, "Waiting before next poll.");
    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      signal = self.channel.receiver.recv() => match signal {
        Some(Signal::Proceed) => {}
        Some(Signal::Stop) | None => return false,
      },
    }
    if let Err(e) = self.channel.rearm.try_send(Signal::Proceed) {
      trace!(error = %e, "Channel already holds a token.");
    }
    true
  }

  /// Store write first, cache invalidation second.
  async fn record(&self, status: JobStatus) {
    if let Err(e) = self.store.update_job_status(&self.job_id, status).await {
      warn!(%status, error = %e, "Failed to update job status.");
    }
    if let Err(e) = self.cache.delete(&self.cache_key).await {
      warn!(cache_key = %self.cache_key, error = %e, "Failed to invalidate job list cache.");
    }
  }

  fn transition(&mut self, next: WatchState) {
    if self.state != next {
      trace!(from = %self.state, to = %next, "Watcher state change.");
      self.state = next;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backoff::{ExponentialBackoff, FixedBackoff};
  use crate::cache::MemoryCache;
  use crate::cluster::{CourseResource, CourseResourceSpec, MemoryCluster};
  use crate::model::{AccessType, OauthUser};
  use crate::registry::CancellationRegistry;
  use crate::store::MemoryStore;

  use std::collections::BTreeMap;

  use chrono::Utc;

  fn job() -> Job {
    Job {
      id: "job-1".into(),
      owner: OauthUser::new("alice", "github"),
      course_id: "k".into(),
      classroom_id: Some("aitrain-c".into()),
      status: JobStatus::Created,
      created_at: Utc::now(),
    }
  }

  async fn fixture() -> (MemoryStore, MemoryCluster, MemoryCache) {
    let store = MemoryStore::new();
    store.insert_job(&job()).await.unwrap();
    let cluster = MemoryCluster::new();
    cluster.put_namespace("aitrain-c", BTreeMap::new());
    let resource = CourseResource {
      name: "job-1".into(),
      namespace: "aitrain-c".into(),
      annotations: BTreeMap::new(),
      spec: CourseResourceSpec {
        access_type: AccessType::Ingress,
        image: "img".into(),
        gpu: 0,
        schedule: vec![],
        dataset: None,
        port: BTreeMap::from([("jupyter".to_string(), 8888)]),
        writable_volume: None,
      },
      status: None,
    };
    CourseResourceClient::create(&cluster, &resource).await.unwrap();
    (store, cluster, MemoryCache::new())
  }

  fn watcher(
    store: &MemoryStore,
    cluster: &MemoryCluster,
    cache: &MemoryCache,
    channel: WatchChannel,
    backoff: Box<dyn BackoffPolicy>,
  ) -> ReconciliationWatcher {
    ReconciliationWatcher::new(
      &job(),
      "aitrain-c",
      Arc::new(store.clone()),
      Arc::new(cluster.clone()),
      Arc::new(cache.clone()),
      channel,
      backoff,
    )
  }

  #[tokio::test]
  async fn accessible_resource_marks_ready_and_invalidates_cache() {
    let (store, cluster, cache) = fixture().await;
    cluster.set_accessible("aitrain-c", "job-1", true);
    cache.set("github:alice", serde_json::json!([])).await.unwrap();

    let registry = CancellationRegistry::new();
    let backoff = Box::new(FixedBackoff::new(Duration::from_millis(5), None));
    let outcome = watcher(&store, &cluster, &cache, registry.arm("job-1"), backoff)
      .run()
      .await;

    assert_eq!(outcome, WatchOutcome::Ready);
    assert_eq!(store.job("job-1").await.unwrap().status, JobStatus::Ready);
    assert!(!cache.contains("github:alice"));
  }

  #[tokio::test]
  async fn exhausted_backoff_leaves_job_pending() {
    let (store, cluster, cache) = fixture().await;
    let registry = CancellationRegistry::new();
    let backoff = Box::new(FixedBackoff::new(
      Duration::from_millis(5),
      Some(Duration::from_millis(30)),
    ));
    let outcome = watcher(&store, &cluster, &cache, registry.arm("job-1"), backoff)
      .run()
      .await;

    assert_eq!(outcome, WatchOutcome::Exhausted);
    assert_eq!(store.job("job-1").await.unwrap().status, JobStatus::Pending);
  }

  #[tokio::test]
  async fn stop_during_backoff_ends_without_another_poll() {
    let (store, cluster, cache) = fixture().await;
    let registry = Arc::new(CancellationRegistry::new());
    let backoff = Box::new(FixedBackoff::new(Duration::from_secs(30), None));
    let handle = tokio::spawn(
      watcher(&store, &cluster, &cache, registry.arm("job-1"), backoff).run(),
    );

    // Let the first poll happen, then stop while the watcher sleeps.
    while cluster.course_gets() == 0 {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(registry.signal_stop("job-1"));
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
      .await
      .unwrap()
      .unwrap();

    assert_eq!(outcome, WatchOutcome::Stopped);
    assert_eq!(cluster.course_gets(), 1);
  }

  fn assert_send<T: Send + 'static>(_: &T) {}

  #[tokio::test]
  async fn run_future_is_spawnable() {
    let (store, cluster, cache) = fixture().await;
    let registry = CancellationRegistry::new();
    let backoff = Box::new(ExponentialBackoff::default());
    let run = watcher(&store, &cluster, &cache, registry.arm("job-1"), backoff).run();
    assert_send(&run);
  }
}
