//! Process-wide map from job id to the channel its watcher listens on.

use crate::model::JobId;

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of every watcher channel.
pub const SIGNAL_BUFFER: usize = 5;

/// Token carried on a watcher channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  /// Run the next poll cycle. The watcher puts one back after every receive.
  Proceed,
  /// Stop at the top of the next cycle.
  Stop,
}

/// Both ends of a freshly armed channel, handed to the watcher.
#[derive(Debug)]
pub struct WatchChannel {
  pub receiver: mpsc::Receiver<Signal>,
  /// Used by the watcher to re-arm itself.
  pub rearm: mpsc::Sender<Signal>,
}

/// Registry of watcher channels, safe under concurrent arm/stop/resume.
///
/// Only `arm`, `signal_stop` and `remove` mutate it; the map itself never leaves this type.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
  channels: Mutex<HashMap<JobId, mpsc::Sender<Signal>>>,
}

impl CancellationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new channel for `job_id`, primed with [`Signal::Proceed`] so the first
  /// poll runs immediately. A previous channel for the job is replaced and its watcher is
  /// sent [`Signal::Stop`], so at most one watcher per job stays live.
  pub fn arm(&self, job_id: &str) -> WatchChannel {
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
    // Fresh channel with spare capacity: this cannot fail.
    let _ = tx.try_send(Signal::Proceed);
    let previous = self.channels.lock().insert(job_id.to_string(), tx.clone());
    if let Some(old) = previous {
      match old.try_send(Signal::Stop) {
        Ok(()) => debug!(%job_id, "Replaced a live watcher channel; old watcher stopped."),
        Err(e) => debug!(%job_id, error = %e, "Replaced a stale watcher channel."),
      }
    }
    WatchChannel {
      receiver: rx,
      rearm: tx,
    }
  }

  /// Sends [`Signal::Stop`] to the job's watcher and forgets the channel.
  ///
  /// Returns `false` when no channel is registered or the watcher already exited; neither
  /// is an error for the caller.
  pub fn signal_stop(&self, job_id: &str) -> bool {
    let sender = self.channels.lock().remove(job_id);
    match sender {
      Some(tx) => match tx.try_send(Signal::Stop) {
        Ok(()) => {
          debug!(%job_id, "Stop token sent to watcher.");
          true
        }
        Err(e) => {
          warn!(%job_id, error = %e, "Watcher channel did not accept stop token.");
          false
        }
      },
      None => {
        warn!(%job_id, "No watcher channel registered; nothing to stop.");
        false
      }
    }
  }

  /// Drops the channel for `job_id` without signalling. Returns whether one existed.
  pub fn remove(&self, job_id: &str) -> bool {
    self.channels.lock().remove(job_id).is_some()
  }

  /// Drops the entry for `job_id` only while it still points at `channel`.
  ///
  /// A watcher that finishes after being replaced must not evict its successor.
  pub fn release(&self, job_id: &str, channel: &mpsc::Sender<Signal>) -> bool {
    let mut channels = self.channels.lock();
    match channels.get(job_id) {
      Some(current) if current.same_channel(channel) => {
        channels.remove(job_id);
        true
      }
      _ => false,
    }
  }

  /// Sends a stop token to every registered watcher and clears the registry.
  pub fn signal_stop_all(&self) -> usize {
    let drained: Vec<(JobId, mpsc::Sender<Signal>)> = self.channels.lock().drain().collect();
    let mut stopped = 0;
    for (job_id, tx) in drained {
      if tx.try_send(Signal::Stop).is_ok() {
        stopped += 1;
      } else {
        debug!(%job_id, "Watcher already gone during stop-all.");
      }
    }
    stopped
  }

  pub fn contains(&self, job_id: &str) -> bool {
    self.channels.lock().contains_key(job_id)
  }

  pub fn len(&self) -> usize {
    self.channels.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn arm_primes_channel_with_proceed() {
    let registry = CancellationRegistry::new();
    let mut channel = registry.arm("job-1");
    assert_eq!(channel.receiver.try_recv(), Ok(Signal::Proceed));
    assert!(registry.contains("job-1"));
  }

  #[tokio::test]
  async fn stop_is_delivered_after_pending_proceed() {
    let registry = CancellationRegistry::new();
    let mut channel = registry.arm("job-1");
    assert!(registry.signal_stop("job-1"));
    assert_eq!(channel.receiver.recv().await, Some(Signal::Proceed));
    assert_eq!(channel.receiver.recv().await, Some(Signal::Stop));
    assert!(!registry.contains("job-1"));
  }

  #[test]
  fn missing_entry_is_not_an_error() {
    let registry = CancellationRegistry::new();
    assert!(!registry.signal_stop("ghost"));
    assert!(!registry.remove("ghost"));
  }

  #[tokio::test]
  async fn rearming_stops_and_replaces_previous_channel() {
    let registry = CancellationRegistry::new();
    let mut old = registry.arm("job-1");
    let mut new = registry.arm("job-1");
    assert_eq!(registry.len(), 1);
    assert_eq!(old.receiver.recv().await, Some(Signal::Proceed));
    assert_eq!(old.receiver.recv().await, Some(Signal::Stop));

    registry.signal_stop("job-1");
    assert_eq!(new.receiver.recv().await, Some(Signal::Proceed));
    assert_eq!(new.receiver.recv().await, Some(Signal::Stop));
  }

  #[test]
  fn release_ignores_a_replaced_channel() {
    let registry = CancellationRegistry::new();
    let old = registry.arm("job-1");
    let new = registry.arm("job-1");
    assert!(!registry.release("job-1", &old.rearm));
    assert!(registry.contains("job-1"));
    assert!(registry.release("job-1", &new.rearm));
    assert!(registry.is_empty());
  }
}
