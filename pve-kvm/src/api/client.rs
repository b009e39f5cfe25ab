use super::types::{
    AuthTicket, ClusterResource, CreateVmRequest, MigrateVmRequest, NextId, NodeInfo,
    ProxmoxResponse, TaskHandle, TaskLogPage, TaskResponse, TaskStatus, VmRef,
};
use super::ProxmoxApi;
use crate::config::{ConnectionSettings, Credentials};
use crate::error::KvmError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 30;

enum Auth {
    Token(String),
    Ticket { ticket: String, csrf_token: String },
}

/// HTTP implementation of [`ProxmoxApi`].
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    auth: Auth,
}

impl ProxmoxClient {
    /// Build the HTTP client and authenticate. Password credentials are
    /// exchanged for a ticket up front; tokens are sent on every request.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!settings.validate_certs)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        let base_url = settings.base_url.trim_end_matches('/').to_string();

        let auth = match &settings.credentials {
            Credentials::Token {
                user,
                token_id,
                secret,
            } => Auth::Token(format!("PVEAPIToken={}!{}={}", user, token_id, secret)),
            Credentials::Password { user, password } => {
                let ticket = Self::login(&client, &base_url, user, password).await?;
                tracing::debug!("Authenticated to {} as {}", base_url, user);
                Auth::Ticket {
                    ticket: ticket.ticket,
                    csrf_token: ticket.csrf_token,
                }
            }
        };

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    async fn login(
        client: &Client,
        base_url: &str,
        user: &str,
        password: &str,
    ) -> Result<AuthTicket> {
        let path = "/api2/json/access/ticket";
        let response = client
            .post(format!("{}{}", base_url, path))
            .form(&[("username", user), ("password", password)])
            .send()
            .await
            .with_context(|| format!("Failed POST {}", path))?;

        let response = check_status("POST", path, response).await?;
        let result: ProxmoxResponse<AuthTicket> = response
            .json()
            .await
            .context("Failed to parse authentication ticket")?;
        Ok(result.data)
    }

    fn authorize(&self, builder: RequestBuilder, write: bool) -> RequestBuilder {
        match &self.auth {
            Auth::Token(header) => builder.header("Authorization", header),
            Auth::Ticket { ticket, csrf_token } => {
                let builder = builder.header("Cookie", format!("PVEAuthCookie={}", ticket));
                if write {
                    builder.header("CSRFPreventionToken", csrf_token)
                } else {
                    builder
                }
            }
        }
    }

    /// Execute a GET request to the Proxmox API.
    async fn api_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let result: ProxmoxResponse<T> = self.get_json(path, query).await?;
        Ok(result.data)
    }

    /// GET returning the whole response document, for endpoints that put
    /// more than `data` into it.
    async fn get_json<R: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorize(self.client.get(&url), false)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed GET {}", path))?;

        let response = check_status("GET", path, response).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse GET {} response", path))
    }

    async fn task_log_page(&self, path: &str, start: usize, limit: usize) -> Result<TaskLogPage> {
        let start = start.to_string();
        let limit = limit.to_string();
        self.get_json(path, &[("start", start.as_str()), ("limit", limit.as_str())])
            .await
    }

    /// Execute a form-encoded POST request to the Proxmox API.
    async fn api_post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorize(self.client.post(&url), true)
            .form(body)
            .send()
            .await
            .with_context(|| format!("Failed POST {}", path))?;

        let response = check_status("POST", path, response).await?;
        let result: ProxmoxResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse POST {} response", path))?;

        Ok(result.data)
    }

    fn task_path(task: &TaskHandle, leaf: &str) -> Result<String> {
        Ok(format!(
            "/api2/json/nodes/{}/tasks/{}/{}",
            task.node()?,
            urlencoding::encode(task.upid()),
            leaf
        ))
    }
}

async fn check_status(method: &str, path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(KvmError::Api {
        method: method.to_string(),
        path: path.to_string(),
        status: status.as_u16(),
        body,
    }
    .into())
}

#[async_trait]
impl ProxmoxApi for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.api_get("/api2/json/nodes", &[]).await
    }

    async fn list_vms(&self) -> Result<Vec<VmRef>> {
        let resources: Vec<ClusterResource> = self
            .api_get("/api2/json/cluster/resources", &[("type", "vm")])
            .await?;
        Ok(resources
            .into_iter()
            .filter_map(ClusterResource::into_vm_ref)
            .collect())
    }

    async fn next_vmid(&self) -> Result<u32> {
        let next: NextId = self.api_get("/api2/json/cluster/nextid", &[]).await?;
        next.vmid()
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<TaskHandle> {
        let path = format!("/api2/json/nodes/{}/qemu", request.node);
        let task: TaskResponse = self.api_post(&path, request).await?;
        Ok(task.into_handle())
    }

    async fn migrate_vm(&self, request: &MigrateVmRequest) -> Result<TaskHandle> {
        let path = format!(
            "/api2/json/nodes/{}/qemu/{}/migrate",
            request.node, request.vmid
        );
        let task: TaskResponse = self.api_post(&path, request).await?;
        Ok(task.into_handle())
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let path = Self::task_path(task, "status")?;
        self.api_get(&path, &[]).await
    }

    async fn task_log(&self, task: &TaskHandle, lines: usize) -> Result<Vec<String>> {
        if lines == 0 {
            return Ok(Vec::new());
        }
        let path = Self::task_path(task, "log")?;

        // The log is paged; `total` of the first page locates the end.
        let mut page = self.task_log_page(&path, 0, lines).await?;
        if let Some(total) = page.total.filter(|total| *total > lines) {
            page = self.task_log_page(&path, total - lines, lines).await?;
        }
        Ok(page.data.into_iter().map(|line| line.t).collect())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<Map<String, Value>> {
        let path = format!("/api2/json/nodes/{}/qemu/{}/config", node, vmid);
        self.api_get(&path, &[]).await
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;
