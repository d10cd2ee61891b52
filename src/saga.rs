//! Ordered steps with compensating actions, for sequences that touch the cluster and have
//! no transaction to lean on.
//!
//! Steps run in order. When one fails, the compensations recorded by the steps that already
//! succeeded run in reverse order. A failing compensation is logged and collected; it never
//! replaces the error of the step that failed.

use crate::cluster::{ClusterProvider, CourseResourceClient, DeletePropagation};
use crate::error::{CoreError, ResourceError};

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

/// An undo action against the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
  /// Deletes a namespace and, by cascade, everything created inside it.
  DeleteNamespace { name: String },
  DeleteCourseResource { namespace: String, name: String },
}

/// Executes [`Compensation`]s.
#[derive(Clone)]
pub struct Compensator {
  cluster: Arc<dyn ClusterProvider>,
  resources: Arc<dyn CourseResourceClient>,
}

impl Compensator {
  pub fn new(cluster: Arc<dyn ClusterProvider>, resources: Arc<dyn CourseResourceClient>) -> Self {
    Self { cluster, resources }
  }

  pub async fn apply(&self, compensation: &Compensation) -> Result<(), ResourceError> {
    match compensation {
      Compensation::DeleteNamespace { name } => {
        self
          .cluster
          .delete_namespace(name, DeletePropagation::Foreground)
          .await
      }
      Compensation::DeleteCourseResource { namespace, name } => {
        self
          .resources
          .delete(namespace, name, DeletePropagation::Foreground)
          .await
      }
    }
  }

  /// Runs `compensations` last-to-first, collecting failures.
  async fn unwind(&self, label: &str, compensations: Vec<Compensation>) -> Vec<ResourceError> {
    let mut failures = Vec::new();
    for compensation in compensations.into_iter().rev() {
      match self.apply(&compensation).await {
        Ok(()) => info!(saga = %label, ?compensation, "Compensation applied."),
        Err(e) => {
          error!(saga = %label, ?compensation, error = %e, "Compensation failed.");
          failures.push(e);
        }
      }
    }
    failures
  }
}

type StepAction<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), CoreError>> + Send + 'a>;

struct Step<'a> {
  name: &'static str,
  compensation: Option<Compensation>,
  action: StepAction<'a>,
}

/// A step failed; the saga has already been unwound.
#[derive(Debug)]
pub struct SagaFailure {
  pub step: &'static str,
  pub error: CoreError,
  pub compensation_errors: Vec<ResourceError>,
}

/// Every step succeeded. Holds the compensations in case a later, non-saga step fails.
#[derive(Debug)]
#[must_use = "an applied saga must be finished or unwound"]
pub struct AppliedSaga {
  label: String,
  compensations: Vec<Compensation>,
}

impl AppliedSaga {
  pub fn compensations(&self) -> &[Compensation] {
    &self.compensations
  }

  /// Undoes the whole saga.
  pub async fn unwind(self, compensator: &Compensator) -> Vec<ResourceError> {
    compensator.unwind(&self.label, self.compensations).await
  }

  /// Keeps the applied effects.
  pub fn finish(self) {
    debug!(saga = %self.label, "Saga finished.");
  }
}

pub struct Saga<'a> {
  label: String,
  steps: Vec<Step<'a>>,
}

impl<'a> Saga<'a> {
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      steps: Vec::new(),
    }
  }

  /// Appends a step. `compensation` is recorded only once `action` succeeds.
  pub fn step<F>(mut self, name: &'static str, compensation: Option<Compensation>, action: F) -> Self
  where
    F: FnOnce() -> BoxFuture<'a, Result<(), CoreError>> + Send + 'a,
  {
    self.steps.push(Step {
      name,
      compensation,
      action: Box::new(action),
    });
    self
  }

  pub async fn execute(self, compensator: &Compensator) -> Result<AppliedSaga, SagaFailure> {
    let Saga { label, steps } = self;
    let mut applied: Vec<Compensation> = Vec::new();
    for step in steps {
      debug!(saga = %label, step = step.name, "Running saga step.");
      match (step.action)().await {
        Ok(()) => applied.extend(step.compensation),
        Err(error) => {
          error!(saga = %label, step = step.name, error = %error, "Saga step failed; unwinding.");
          let compensation_errors = compensator.unwind(&label, applied).await;
          return Err(SagaFailure {
            step: step.name,
            error,
            compensation_errors,
          });
        }
      }
    }
    Ok(AppliedSaga {
      label,
      compensations: applied,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cluster::MemoryCluster;

  use std::collections::BTreeMap;

  use futures::FutureExt;

  fn compensator(cluster: &MemoryCluster) -> Compensator {
    Compensator::new(Arc::new(cluster.clone()), Arc::new(cluster.clone()))
  }

  #[tokio::test]
  async fn failure_unwinds_completed_steps_only() {
    let cluster = MemoryCluster::new();
    let c = cluster.clone();
    let failure = Saga::new("test")
      .step(
        "namespace",
        Some(Compensation::DeleteNamespace { name: "ns".into() }),
        move || {
          async move {
            c.create_namespace("ns", &BTreeMap::new())
              .await
              .map_err(|e| CoreError::resource(&e, "ns"))
          }
          .boxed()
        },
      )
      .step("boom", None, || {
        async { Err(CoreError::validation("boom", "boom")) }.boxed()
      })
      .step(
        "never",
        Some(Compensation::DeleteNamespace { name: "other".into() }),
        || async { Ok(()) }.boxed(),
      )
      .execute(&compensator(&cluster))
      .await
      .unwrap_err();

    assert_eq!(failure.step, "boom");
    assert!(failure.compensation_errors.is_empty());
    assert!(!cluster.has_namespace("ns"));
    assert_eq!(cluster.calls("delete_namespace"), 1);
  }

  #[tokio::test]
  async fn compensation_failure_keeps_original_error() {
    let cluster = MemoryCluster::new();
    cluster.put_namespace("ns", BTreeMap::new());
    cluster.fail_on("delete_namespace");
    let failure = Saga::new("test")
      .step(
        "noop",
        Some(Compensation::DeleteNamespace { name: "ns".into() }),
        || async { Ok(()) }.boxed(),
      )
      .step("boom", None, || {
        async { Err(CoreError::validation("original", "original")) }.boxed()
      })
      .execute(&compensator(&cluster))
      .await
      .unwrap_err();

    assert_eq!(failure.error.detail(), "original");
    assert_eq!(failure.compensation_errors.len(), 1);
  }

  #[tokio::test]
  async fn applied_saga_can_unwind_later() {
    let cluster = MemoryCluster::new();
    cluster.put_namespace("ns", BTreeMap::new());
    let comp = compensator(&cluster);
    let applied = Saga::new("test")
      .step(
        "noop",
        Some(Compensation::DeleteNamespace { name: "ns".into() }),
        || async { Ok(()) }.boxed(),
      )
      .execute(&comp)
      .await
      .unwrap();
    assert_eq!(applied.compensations().len(), 1);
    assert!(applied.unwind(&comp).await.is_empty());
    assert!(!cluster.has_namespace("ns"));
  }
}
