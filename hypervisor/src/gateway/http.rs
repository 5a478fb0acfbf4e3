use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared_types::{SandboxStatus, WorkspaceStatus};
use tracing::{debug, error};

use super::{
    AgentInitPayload, AgentResponse, ChatMessagePayload, CreateSandboxResult, InterruptPayload,
    SandboxGateway, SandboxStatusEntry, SUCCESS_CODE,
};
use crate::error::{HypervisorError, Result};

/// `{code, message, data}` wrapper used by every gateway endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    project_id: &'a str,
    sandbox_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSandboxData {
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct BatchStatusRequest<'a> {
    sandbox_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WorkspaceStatusData {
    status: WorkspaceStatus,
}

/// Sandbox gateway client over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpSandboxGateway {
    base_url: String,
    ws_base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpSandboxGateway {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut parsed = url::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid sandbox gateway URL '{base_url}': {e}"))?;
        let base_url = parsed.as_str().trim_end_matches('/').to_string();

        let ws_scheme = match parsed.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(anyhow::anyhow!(
                    "Unsupported sandbox gateway scheme '{other}'. Expected http or https"
                ))
            }
        };
        parsed
            .set_scheme(ws_scheme)
            .map_err(|_| anyhow::anyhow!("Cannot derive websocket URL from '{base_url}'"))?;
        let ws_base_url = parsed.as_str().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            ws_base_url,
            token,
            client,
        })
    }

    fn sandbox_url(&self, sandbox_id: &str) -> String {
        format!("{}/api/v1/sandboxes/{sandbox_id}", self.base_url)
    }

    fn agent_url(&self, sandbox_id: &str, path: &str) -> String {
        format!("{}/proxy/api/v1/{path}", self.sandbox_url(sandbox_id))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn envelope<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Envelope<T>> {
        let response = self.authorize(request).send().await.map_err(|e| {
            error!(url, error = %e, "sandbox gateway request failed");
            HypervisorError::from(e)
        })?;
        let status = response.status();
        let body = response.bytes().await?;
        serde_json::from_slice::<Envelope<T>>(&body).map_err(|e| {
            error!(url, %status, error = %e, "sandbox gateway returned an unreadable body");
            HypervisorError::Transport(format!("invalid gateway response ({status}): {e}"))
        })
    }

    /// Unwrap `data` from a successful envelope.
    async fn data<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T> {
        let envelope = self.envelope::<T>(request, url).await?;
        if envelope.code != SUCCESS_CODE {
            return Err(HypervisorError::sandbox(operation, envelope.message, envelope.code));
        }
        envelope.data.ok_or_else(|| {
            HypervisorError::sandbox(operation, "gateway response carried no data", envelope.code)
        })
    }

    async fn agent_call<P: Serialize + Sync>(
        &self,
        sandbox_id: &str,
        path: &str,
        payload: &P,
    ) -> Result<AgentResponse> {
        let url = self.agent_url(sandbox_id, path);
        debug!(sandbox_id, url = %url, "forwarding request to agent");
        let envelope = self
            .envelope::<serde_json::Value>(self.client.post(&url).json(payload), &url)
            .await?;
        Ok(AgentResponse {
            code: envelope.code,
            message: envelope.message,
            data: envelope.data.unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl SandboxGateway for HttpSandboxGateway {
    async fn create_sandbox(
        &self,
        project_id: &str,
        sandbox_id: &str,
    ) -> Result<CreateSandboxResult> {
        let url = format!("{}/api/v1/sandboxes", self.base_url);
        let request = self.client.post(&url).json(&CreateSandboxRequest {
            project_id,
            sandbox_id,
        });
        let envelope = self.envelope::<CreateSandboxData>(request, &url).await?;
        let success = envelope.code == SUCCESS_CODE;
        Ok(CreateSandboxResult {
            success,
            sandbox_id: envelope.data.map(|d| d.sandbox_id).unwrap_or_default(),
            code: envelope.code,
            message: envelope.message,
        })
    }

    async fn get_sandbox_status(&self, sandbox_id: &str) -> Result<SandboxStatus> {
        let url = self.sandbox_url(sandbox_id);
        let entry: SandboxStatusEntry = self
            .data("Get sandbox status", self.client.get(&url), &url)
            .await?;
        Ok(entry.status)
    }

    async fn get_batch_sandbox_status(
        &self,
        sandbox_ids: &[String],
    ) -> Result<Vec<SandboxStatusEntry>> {
        if sandbox_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/v1/sandboxes/queries", self.base_url);
        let request = self
            .client
            .post(&url)
            .json(&BatchStatusRequest { sandbox_ids });
        self.data("Get batch sandbox status", request, &url).await
    }

    async fn get_workspace_status(&self, sandbox_id: &str) -> Result<WorkspaceStatus> {
        let url = self.agent_url(sandbox_id, "workspace/status");
        let data: WorkspaceStatusData = self
            .data("Get workspace status", self.client.get(&url), &url)
            .await?;
        Ok(data.status)
    }

    async fn initialize_agent(
        &self,
        sandbox_id: &str,
        payload: &AgentInitPayload,
    ) -> Result<AgentResponse> {
        self.agent_call(sandbox_id, "agent/init", payload).await
    }

    async fn send_chat_message(
        &self,
        sandbox_id: &str,
        payload: &ChatMessagePayload,
    ) -> Result<AgentResponse> {
        self.agent_call(sandbox_id, "messages/chat", payload).await
    }

    async fn send_interrupt_message(
        &self,
        sandbox_id: &str,
        payload: &InterruptPayload,
    ) -> Result<AgentResponse> {
        self.agent_call(sandbox_id, "messages/interrupt", payload)
            .await
    }

    fn websocket_url(&self, sandbox_id: &str) -> String {
        format!("{}/api/v1/sandboxes/{sandbox_id}/proxy/ws", self.ws_base_url)
    }
}
