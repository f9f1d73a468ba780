use std::collections::HashMap;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::types::{DriverError, Result};

pub const DEFAULT_MACHINES_URL: &str = "https://api.machines.dev/v1";
pub const DEFAULT_API_URL: &str = "https://api.fly.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlyConfig {
    pub access_token: String,
    pub app_name: String,
    pub machines_url: String,
    pub api_url: String,
    pub region: Option<String>,
}

impl FlyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `FLY_ACCESS_TOKEN` and `FLY_APP_NAME` are required; the endpoints
    /// and region are optional overrides.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| DriverError::Config(format!("{key} must be set")))
        };

        Ok(FlyConfig {
            access_token: required("FLY_ACCESS_TOKEN")?,
            app_name: required("FLY_APP_NAME")?,
            machines_url: lookup("FLY_MACHINES_URL").unwrap_or_else(|| DEFAULT_MACHINES_URL.to_string()),
            api_url: lookup("FLY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            region: lookup("FLY_REGION").filter(|region| !region.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub events: Vec<MachineEvent>,
    #[serde(default)]
    pub config: ReportedConfig,
}

/// The part of a machine's config read back from the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportedConfig {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Machine {
    pub fn is_active(&self) -> bool {
        !matches!(self.state.as_str(), "destroyed" | "destroying")
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.config.metadata.get(key).map(String::as_str)
    }

    /// Exit code from the newest event that carries one.
    pub fn exit_code(&self) -> Option<i64> {
        self.events
            .iter()
            .filter_map(|event| event.exit_code().map(|code| (event.timestamp, code)))
            .max_by_key(|(timestamp, _)| *timestamp)
            .map(|(_, code)| code)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub request: Option<Value>,
}

impl MachineEvent {
    pub fn exit_code(&self) -> Option<i64> {
        self.request
            .as_ref()?
            .get("exit_event")?
            .get("exit_code")?
            .as_i64()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchMachine {
    pub name: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<MachineProcess>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MachineMount>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineProcess {
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineMount {
    pub volume: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartPolicy {
    pub policy: String,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            policy: "no".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlyVolume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolume {
    pub name: String,
    pub size_gb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogPage {
    #[serde(default)]
    pub data: Vec<LogEntry>,
    #[serde(default)]
    pub meta: LogMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogMeta {
    #[serde(default)]
    pub next_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub id: String,
    pub attributes: LogAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogAttributes {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Thin client over the machines and logs endpoints for one app.
#[derive(Debug, Clone)]
pub struct FlyApi {
    config: FlyConfig,
    client: Client,
}

impl FlyApi {
    pub fn new(config: FlyConfig) -> Self {
        FlyApi {
            config,
            client: Client::new(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    fn machines_url(&self, suffix: &str) -> String {
        format!(
            "{}/apps/{}/{}",
            self.config.machines_url, self.config.app_name, suffix
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.config.access_token)
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        let response = self
            .authorized(self.client.get(self.machines_url("machines")))
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn get_machine(&self, id: &str) -> Result<Machine> {
        let response = self
            .authorized(self.client.get(self.machines_url(&format!("machines/{id}"))))
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn launch_machine(&self, input: &LaunchMachine) -> Result<Machine> {
        let response = self
            .authorized(self.client.post(self.machines_url("machines")))
            .json(input)
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn destroy_machine(&self, id: &str) -> Result<()> {
        let response = self
            .authorized(self.client.delete(self.machines_url(&format!("machines/{id}"))))
            .query(&[("force", "true")])
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<FlyVolume>> {
        let response = self
            .authorized(self.client.get(self.machines_url("volumes")))
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn create_volume(&self, input: &CreateVolume) -> Result<FlyVolume> {
        let response = self
            .authorized(self.client.post(self.machines_url("volumes")))
            .json(input)
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn destroy_volume(&self, id: &str) -> Result<()> {
        let response = self
            .authorized(self.client.delete(self.machines_url(&format!("volumes/{id}"))))
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn logs(&self, instance: &str, next_token: &str) -> Result<LogPage> {
        let url = format!(
            "{}/api/v1/apps/{}/logs",
            self.config.api_url, self.config.app_name
        );
        let response = self
            .authorized(self.client.get(url))
            .query(&[("instance", instance), ("next_token", next_token)])
            .send()
            .await?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(api_error(status, response).await);
    }
    Ok(response.json().await?)
}

async fn handle_empty(response: Response) -> Result<()> {
    let status = response.status();
    if !status.is_success() && status != StatusCode::NOT_FOUND {
        return Err(api_error(status, response).await);
    }
    Ok(())
}

async fn api_error(status: StatusCode, response: Response) -> DriverError {
    DriverError::Api {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}
