//! JSON over HTTP transport for the control plane.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::model::{AgentInfo, AssociationPage, AssociationStatus, UpdateStatusOutput};
use super::service::{ControlPlane, ServiceError};

#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct DocumentBody {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    status: AssociationStatus,
    message: &'a str,
    agent_info: &'a AgentInfo,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(format!("reqwest client: {e}")))?;
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| ServiceError::Transport(format!("invalid control plane url `{base_url}`: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::Transport(format!("control plane url `{base_url}` cannot take a path")));
        }
        Ok(Self { client, base_url })
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn associations_url(&self, instance_id: &str) -> Url {
        self.url(&["instances", instance_id, "associations"])
    }

    fn document_url(&self, name: &str) -> Url {
        self.url(&["documents", name])
    }

    fn status_url(&self, instance_id: &str, association_name: &str) -> Url {
        self.url(&["instances", instance_id, "associations", association_name, "status"])
    }
}

/// Maps a non-success HTTP status onto the error taxonomy.
fn status_error(status: StatusCode, body: String) -> ServiceError {
    if status.is_client_error() {
        ServiceError::Rejected { code: status.as_u16(), message: body }
    } else {
        ServiceError::Transport(format!("server returned {status}: {body}"))
    }
}

async fn check(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_else(|_| "<no body>".into());
    Err(status_error(status, body))
}

fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::Transport(e.to_string())
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_page(&self, instance_id: &str, next_token: Option<&str>) -> Result<AssociationPage, ServiceError> {
        let mut req = self.client.get(self.associations_url(instance_id));
        if let Some(token) = next_token {
            req = req.query(&[("nextToken", token)]);
        }
        let resp = check(req.send().await.map_err(transport)?).await?;
        resp.json().await.map_err(transport)
    }

    async fn get_document(&self, name: &str, version: Option<&str>) -> Result<String, ServiceError> {
        let mut req = self.client.get(self.document_url(name));
        if let Some(version) = version {
            req = req.query(&[("version", version)]);
        }
        let resp = check(req.send().await.map_err(transport)?).await?;
        let body: DocumentBody = resp.json().await.map_err(transport)?;
        Ok(body.content)
    }

    async fn update_status(
        &self,
        instance_id: &str,
        association_name: &str,
        status: AssociationStatus,
        message: &str,
        agent_info: &AgentInfo,
    ) -> Result<UpdateStatusOutput, ServiceError> {
        let body = StatusBody { status, message, agent_info };
        let resp = self
            .client
            .put(self.status_url(instance_id, association_name))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let resp = check(resp).await?;
        // An empty 2xx body still means the update was taken.
        let text = resp.text().await.map_err(transport)?;
        if text.trim().is_empty() {
            return Ok(UpdateStatusOutput { accepted: true, message: None });
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Transport(format!("invalid status response: {e}")))
    }

    fn name(&self) -> &'static str {
        "HttpControlPlane"
    }
}
