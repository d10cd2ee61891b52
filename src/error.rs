use crate::message;

use thiserror::Error;

/// Errors that can occur while assembling a `CourseKeeper` with `CourseKeeperBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Required collaborator `{0}` was not supplied to the builder")]
  MissingCollaborator(&'static str),
  #[error("Namespace prefix must not be empty")]
  EmptyNamespacePrefix,
  #[error("Unknown timezone identifier `{0}`")]
  UnknownTimezone(String),
  #[error("UID range `{0}` is not of the form `<start>/<size>`")]
  InvalidUidRange(String),
  #[error("Invalid watcher backoff: {0}")]
  InvalidBackoff(String),
}

/// Errors that can occur during `CourseKeeper::shutdown`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out waiting for watcher tasks to finish.")]
  Timeout,
  #[error("A watcher task panicked during shutdown.")]
  TaskPanic,
}

// --- Collaborator Errors ---

/// Errors reported by a relational [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// The "first matching row" lookup found nothing. Kept distinct from backend failures
  /// because several decisions (course type, delete routing) hinge on absence.
  #[error("{entity} `{id}` not found")]
  NotFound { entity: &'static str, id: String },
  #[error("Conflicting row: {0}")]
  Conflict(String),
  #[error("Storage backend error: {0}")]
  Backend(String),
  #[error("Injected storage failure at `{0}`")]
  Injected(String),
}

impl StoreError {
  pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
    StoreError::NotFound {
      entity,
      id: id.into(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, StoreError::NotFound { .. })
  }
}

/// Errors reported by the custom-resource client or the namespace/volume/secret/role provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
  #[error("{kind} `{name}` not found")]
  NotFound { kind: &'static str, name: String },
  #[error("{kind} `{name}` already exists")]
  AlreadyExists { kind: &'static str, name: String },
  #[error("Cluster API error: {0}")]
  Api(String),
  #[error("Injected cluster failure at `{0}`")]
  Injected(String),
}

impl ResourceError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, ResourceError::NotFound { .. })
  }
}

/// Errors reported by the job-list cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  #[error("Cache backend error: {0}")]
  Backend(String),
  #[error("Cached value for `{key}` could not be decoded: {reason}")]
  Decode { key: String, reason: String },
}

/// Errors reported by the external VM job stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
  #[error("Job stack transport error: {0}")]
  Transport(String),
  /// The stack answered with its `{error: true, message}` envelope.
  #[error("Job stack rejected the request: {message}")]
  Rejected { message: String },
  #[error("Job stack response could not be decoded: {0}")]
  Decode(String),
  #[error("Job stack integration is disabled")]
  Disabled,
}

/// Errors raised while parsing cron expressions or resolving timezones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("Invalid cron expression `{expr}`: {reason}")]
  InvalidExpression { expr: String, reason: String },
  #[error("Unknown timezone identifier `{0}`")]
  UnknownTimezone(String),
}

// --- Caller-facing Errors ---

/// Error returned by every produced operation (`launch`, `delete_job`, classroom
/// create/update/delete, ...).
///
/// Each variant pairs a `detail` meant for logs with a sanitized, localized `message`
/// meant for the end user. Admission denials are not errors of `check_launch`; they only
/// become [`CoreError::Denied`] when `launch` is called for a request that fails admission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
  /// Missing or malformed input, rejected before any storage access.
  #[error("validation failed: {detail}")]
  Validation { detail: String, message: String },
  /// The launch request failed admission control.
  #[error("admission denied: {detail}")]
  Denied { detail: String, message: String },
  #[error("not found: {detail}")]
  NotFound { detail: String, message: String },
  /// The course declares no exposed port and cannot be launched.
  #[error("no ports defined: {detail}")]
  NoPortsDefined { detail: String, message: String },
  #[error("storage failure: {detail}")]
  Storage { detail: String, message: String },
  #[error("external resource failure: {detail}")]
  Resource { detail: String, message: String },
  #[error("job stack failure: {detail}")]
  Stack { detail: String, message: String },
  /// The operation is not allowed on a system-reserved classroom.
  #[error("reserved classroom: {detail}")]
  Reserved { detail: String, message: String },
}

impl CoreError {
  pub fn validation(detail: impl Into<String>, message: impl Into<String>) -> Self {
    CoreError::Validation {
      detail: detail.into(),
      message: message.into(),
    }
  }

  pub fn storage(err: &StoreError, message: impl Into<String>) -> Self {
    CoreError::Storage {
      detail: err.to_string(),
      message: message.into(),
    }
  }

  pub fn resource(err: &ResourceError, message: impl Into<String>) -> Self {
    CoreError::Resource {
      detail: err.to_string(),
      message: message.into(),
    }
  }

  /// Maps a store error, turning the not-found signal into [`CoreError::NotFound`].
  pub fn from_store(err: &StoreError, message: impl Into<String>) -> Self {
    match err {
      StoreError::NotFound { entity, id } => CoreError::NotFound {
        detail: err.to_string(),
        message: message::not_found(entity, id),
      },
      _ => CoreError::storage(err, message),
    }
  }

  /// Full detail, suitable for logs.
  pub fn detail(&self) -> &str {
    match self {
      CoreError::Validation { detail, .. }
      | CoreError::Denied { detail, .. }
      | CoreError::NotFound { detail, .. }
      | CoreError::NoPortsDefined { detail, .. }
      | CoreError::Storage { detail, .. }
      | CoreError::Resource { detail, .. }
      | CoreError::Stack { detail, .. }
      | CoreError::Reserved { detail, .. } => detail,
    }
  }

  /// Sanitized, localized text for the end user.
  pub fn message(&self) -> &str {
    match self {
      CoreError::Validation { message, .. }
      | CoreError::Denied { message, .. }
      | CoreError::NotFound { message, .. }
      | CoreError::NoPortsDefined { message, .. }
      | CoreError::Storage { message, .. }
      | CoreError::Resource { message, .. }
      | CoreError::Stack { message, .. }
      | CoreError::Reserved { message, .. } => message,
    }
  }
}

impl From<StackError> for CoreError {
  fn from(err: StackError) -> Self {
    let message = match &err {
      StackError::Rejected { message } => message.clone(),
      other => message::stack_failure(&other.to_string()),
    };
    CoreError::Stack {
      detail: err.to_string(),
      message,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_not_found_maps_to_not_found() {
    let err = StoreError::not_found("classroom", "aitrain-x");
    let core = CoreError::from_store(&err, "unused");
    assert!(matches!(core, CoreError::NotFound { .. }));
    assert_eq!(core.detail(), "classroom `aitrain-x` not found");
  }

  #[test]
  fn stack_rejection_passes_message_through() {
    let core: CoreError = StackError::Rejected {
      message: "quota exceeded".into(),
    }
    .into();
    assert_eq!(core.message(), "quota exceeded");
  }
}
