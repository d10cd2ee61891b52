//! One-job-per-user concurrency quota.

use crate::admission::{Denial, DenialKind};
use crate::error::StoreError;
use crate::message;
use crate::store::Store;

use std::sync::Arc;

use tracing::debug;

/// Jobs a user may hold at once, across both job populations.
pub const MAX_ACTIVE_JOBS: u64 = 1;

/// Counts a user's running jobs in the resource-backed table and in the external stack.
#[derive(Clone)]
pub struct QuotaTracker {
  store: Arc<dyn Store>,
}

impl QuotaTracker {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Counting is by user name; the provider is not part of the key.
  pub async fn active_count(&self, user: &str) -> Result<u64, StoreError> {
    let containers = self.store.count_jobs(user).await?;
    let vms = self.store.count_external_jobs(user).await?;
    debug!(%user, containers, vms, "Counted active jobs.");
    Ok(containers + vms)
  }

  /// `None` when the user may start another job, otherwise the quota denial.
  pub async fn ensure_available(&self, user: &str) -> Result<Option<Denial>, StoreError> {
    let active = self.active_count(user).await?;
    if active < MAX_ACTIVE_JOBS {
      return Ok(None);
    }
    Ok(Some(Denial {
      kind: DenialKind::QuotaExceeded { active },
      detail: format!("user `{user}` already runs {active} job(s)"),
      message: message::launch_quota(user, active),
    }))
  }
}
