//! Runtime configuration and the names derived from it.

use crate::backoff::BackoffConfig;
use crate::error::BuildError;

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const DEFAULT_NAMESPACE_PREFIX: &str = "aitrain";
const DEFAULT_UID_RANGE: &str = "0/65536";
const DEFAULT_TIMEZONE: &str = "Asia/Taipei";
const DEFAULT_TLS_SECRET: &str = "nchc-tls-secret";
const DEFAULT_DATASET_SOURCE_NAMESPACE: &str = "default";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Settings consumed by the core.
///
/// Loading the document (files, flags, env) is the caller's concern; this type only
/// describes its shape and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeeperConfig {
  /// Prefix of every classroom id and of the reserved classroom/system namespaces.
  pub namespace_prefix: String,
  /// `<start>/<size>`. A start of `0` means jobs always run as root.
  pub uid_range: String,
  /// Storage class used for writable volumes and replicated dataset claims.
  pub storage_class: String,
  /// Host name advertised for node-port services.
  pub node_port_dns: String,
  /// IANA timezone in which classroom schedules are evaluated.
  pub timezone: String,
  /// Name of the TLS secret copied from the system namespace into each classroom.
  pub tls_secret_name: String,
  /// Namespace holding the source dataset claims.
  pub dataset_source_namespace: String,
  /// Poll policy of reconciliation watchers.
  pub watch: BackoffConfig,
  pub shutdown_timeout_secs: u64,
}

impl Default for KeeperConfig {
  fn default() -> Self {
    Self {
      namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
      uid_range: DEFAULT_UID_RANGE.to_string(),
      storage_class: String::new(),
      node_port_dns: String::new(),
      timezone: DEFAULT_TIMEZONE.to_string(),
      tls_secret_name: DEFAULT_TLS_SECRET.to_string(),
      dataset_source_namespace: DEFAULT_DATASET_SOURCE_NAMESPACE.to_string(),
      watch: BackoffConfig::default(),
      shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
    }
  }
}

impl KeeperConfig {
  /// Parses a JSON configuration document; absent keys keep their defaults.
  pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(raw)
  }

  /// Checks the values the core cannot run without.
  pub fn validate(&self) -> Result<(), BuildError> {
    if self.namespace_prefix.trim().is_empty() {
      return Err(BuildError::EmptyNamespacePrefix);
    }
    self
      .timezone
      .parse::<Tz>()
      .map_err(|_| BuildError::UnknownTimezone(self.timezone.clone()))?;
    self.uid_start()?;
    self.watch.validate()?;
    Ok(())
  }

  /// First UID of the configured range.
  pub fn uid_start(&self) -> Result<i64, BuildError> {
    let start = self.uid_range.split('/').next().unwrap_or_default();
    start
      .trim()
      .parse::<i64>()
      .map_err(|_| BuildError::InvalidUidRange(self.uid_range.clone()))
  }

  /// True when jobs run with UID 0 regardless of the user.
  pub fn runs_privileged(&self) -> bool {
    matches!(self.uid_start(), Ok(0))
  }

  pub fn reserved(&self) -> ReservedClassrooms {
    ReservedClassrooms::new(&self.namespace_prefix)
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout_secs)
  }

  /// A fresh classroom id, `<prefix>-<uuid>`.
  pub fn new_classroom_id(&self) -> String {
    format!("{}-{}", self.namespace_prefix, uuid::Uuid::new_v4())
  }
}

/// Identifiers of the two system-reserved classrooms and the system namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedClassrooms {
  pub public: String,
  pub teacher: String,
  pub system_namespace: String,
  pub prefix: String,
}

impl ReservedClassrooms {
  pub fn new(prefix: &str) -> Self {
    Self {
      public: format!("{prefix}-public"),
      teacher: format!("{prefix}-teacher"),
      system_namespace: format!("{prefix}-system"),
      prefix: prefix.to_string(),
    }
  }

  pub fn is_public(&self, classroom_id: &str) -> bool {
    self.public == classroom_id
  }

  pub fn is_reserved(&self, classroom_id: &str) -> bool {
    self.public == classroom_id || self.teacher == classroom_id
  }

  /// Namespace a job runs in. Jobs launched outside a classroom live in the teacher classroom.
  pub fn namespace_for<'a>(&'a self, classroom_id: Option<&'a str>) -> &'a str {
    classroom_id.unwrap_or(&self.teacher)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reserved_names_follow_prefix() {
    let reserved = KeeperConfig::default().reserved();
    assert_eq!(reserved.public, "aitrain-public");
    assert_eq!(reserved.teacher, "aitrain-teacher");
    assert_eq!(reserved.system_namespace, "aitrain-system");
    assert_eq!(reserved.namespace_for(None), "aitrain-teacher");
    assert_eq!(reserved.namespace_for(Some("aitrain-x")), "aitrain-x");
  }

  #[test]
  fn partial_document_keeps_defaults() {
    let config =
      KeeperConfig::from_json_str(r#"{"namespacePrefix":"lab","uidRange":"1000/5000"}"#).unwrap();
    assert_eq!(config.namespace_prefix, "lab");
    assert_eq!(config.timezone, "Asia/Taipei");
    assert!(!config.runs_privileged());
    assert!(config.new_classroom_id().starts_with("lab-"));
  }

  #[test]
  fn validate_rejects_bad_values() {
    let config = KeeperConfig {
      timezone: "Mars/Olympus".into(),
      ..KeeperConfig::default()
    };
    assert_eq!(
      config.validate(),
      Err(BuildError::UnknownTimezone("Mars/Olympus".into()))
    );

    let config = KeeperConfig {
      uid_range: "abc".into(),
      ..KeeperConfig::default()
    };
    assert!(matches!(config.validate(), Err(BuildError::InvalidUidRange(_))));

    let config = KeeperConfig::from_json_str(
      r#"{"watch":{"kind":"exponential","initialIntervalMs":500,"multiplier":1e300,
      "randomization":2.0,"maxIntervalMs":60000,"maxElapsedMs":null}}"#,
    )
    .unwrap();
    assert!(matches!(config.validate(), Err(BuildError::InvalidBackoff(_))));
  }
}
