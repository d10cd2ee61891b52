//! Client side of the external job stack that runs VM-backed courses.
//!
//! The stack answers every call with either its typed payload or a generic
//! `{"error": true, "message": ".."}` envelope; the latter becomes
//! [`StackError::Rejected`] and its message is shown to the user unchanged.

use crate::error::StackError;
use crate::model::LaunchTicket;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// Body of a VM launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLaunchRequest {
  pub user: String,
  pub course_id: String,
}

/// The generic response envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
  #[serde(default)]
  pub error: bool,
  #[serde(default)]
  pub message: String,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
  #[serde(default)]
  error: bool,
  #[serde(default)]
  message: String,
  job: Option<LaunchTicket>,
}

/// VM job launch and deletion. The bearer token is forwarded as received.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobStack: Send + Sync {
  async fn launch(
    &self,
    auth_token: Option<String>,
    request: StackLaunchRequest,
  ) -> Result<LaunchTicket, StackError>;

  async fn delete(&self, auth_token: Option<String>, job_id: String) -> Result<(), StackError>;
}

/// Stand-in for deployments without a VM stack; every call fails with
/// [`StackError::Disabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledJobStack;

#[async_trait]
impl JobStack for DisabledJobStack {
  async fn launch(
    &self,
    _auth_token: Option<String>,
    _request: StackLaunchRequest,
  ) -> Result<LaunchTicket, StackError> {
    Err(StackError::Disabled)
  }

  async fn delete(&self, _auth_token: Option<String>, _job_id: String) -> Result<(), StackError> {
    Err(StackError::Disabled)
  }
}

#[cfg(feature = "http-stack")]
pub use http::HttpJobStack;

#[cfg(feature = "http-stack")]
mod http {
  use super::{Envelope, JobStack, LaunchResponse, StackLaunchRequest};
  use crate::error::StackError;
  use crate::model::LaunchTicket;

  use std::time::Duration;

  use async_trait::async_trait;
  use reqwest::header::AUTHORIZATION;
  use tracing::{debug, error};

  /// [`JobStack`] over HTTP: `POST {base}/v1/job/launch`, `DELETE {base}/v1/job/delete/{id}`.
  #[derive(Debug, Clone)]
  pub struct HttpJobStack {
    base_url: String,
    client: reqwest::Client,
  }

  impl HttpJobStack {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StackError> {
      let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StackError::Transport(format!("client construction failed: {e}")))?;
      Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
      let base_url = base_url.into().trim_end_matches('/').to_string();
      Self { base_url, client }
    }

    fn authorize(
      builder: reqwest::RequestBuilder,
      auth_token: Option<String>,
    ) -> reqwest::RequestBuilder {
      match auth_token {
        Some(token) => builder.header(AUTHORIZATION, token),
        None => builder,
      }
    }
  }

  #[async_trait]
  impl JobStack for HttpJobStack {
    async fn launch(
      &self,
      auth_token: Option<String>,
      request: StackLaunchRequest,
    ) -> Result<LaunchTicket, StackError> {
      let url = format!("{}/v1/job/launch", self.base_url);
      debug!(%url, user = %request.user, course_id = %request.course_id, "Launching VM job.");
      let response = Self::authorize(self.client.post(&url), auth_token)
        .json(&request)
        .send()
        .await
        .map_err(|e| StackError::Transport(e.to_string()))?;
      let body: LaunchResponse = response
        .json()
        .await
        .map_err(|e| StackError::Decode(e.to_string()))?;
      if body.error {
        error!(message = %body.message, "Job stack refused VM launch.");
        return Err(StackError::Rejected {
          message: body.message,
        });
      }
      body
        .job
        .ok_or_else(|| StackError::Decode("launch response carries no job".to_string()))
    }

    async fn delete(&self, auth_token: Option<String>, job_id: String) -> Result<(), StackError> {
      let url = format!("{}/v1/job/delete/{}", self.base_url, job_id);
      debug!(%url, %job_id, "Deleting VM job.");
      let response = Self::authorize(self.client.delete(&url), auth_token)
        .send()
        .await
        .map_err(|e| StackError::Transport(e.to_string()))?;
      let body: Envelope = response
        .json()
        .await
        .map_err(|e| StackError::Decode(e.to_string()))?;
      if body.error {
        error!(%job_id, message = %body.message, "Job stack refused VM deletion.");
        return Err(StackError::Rejected {
          message: body.message,
        });
      }
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn launch_response_decodes_both_shapes() {
    let ok: LaunchResponse = serde_json::from_str(
      r#"{"error":false,"job":{"job_id":"vm-1","ready":false,"status":"Created"}}"#,
    )
    .unwrap();
    assert_eq!(ok.job.unwrap().job_id, "vm-1");

    let rejected: LaunchResponse =
      serde_json::from_str(r#"{"error":true,"message":"no flavor"}"#).unwrap();
    assert!(rejected.error);
    assert_eq!(rejected.message, "no flavor");
    assert!(rejected.job.is_none());
  }

  #[tokio::test]
  async fn disabled_stack_refuses_everything() {
    let stack = DisabledJobStack;
    assert_eq!(
      stack.delete(None, "x".into()).await,
      Err(StackError::Disabled)
    );
  }
}
