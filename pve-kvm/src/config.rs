use crate::api::HardwareConfig;
use crate::error::KvmError;
use crate::task::TaskWait;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;

const REDACTED: &str = "<redacted>";

/// Flat parameter set of one invocation.
#[derive(Debug, Default, Deserialize)]
pub struct ModuleParams {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default, deserialize_with = "de_opt_vmid")]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    /// Target node for creation, destination node for migration.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub migrate: bool,
    #[serde(default)]
    pub with_local_disks: bool,
    /// MiB/s
    #[serde(default)]
    pub migrate_speed: Option<u64>,
    #[serde(default)]
    pub choose_first_if_multiple: bool,
    #[serde(flatten)]
    pub tasks: TaskConfig,
    #[serde(flatten)]
    pub hardware: HardwareConfig,
    /// Keys no other field claimed, typically misspellings. Must stay the
    /// last flattened field.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub api_user: Option<String>,
    #[serde(default)]
    pub api_password: Option<String>,
    #[serde(default)]
    pub api_token_id: Option<String>,
    #[serde(default)]
    pub api_token_secret: Option<String>,
    #[serde(default)]
    pub validate_certs: bool,
}

#[derive(Debug, Deserialize)]
pub struct TaskConfig {
    /// Seconds to wait for a cluster task.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token {
        user: String,
        token_id: String,
        secret: String,
    },
    Password {
        user: String,
        password: String,
    },
}

/// Validated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub base_url: String,
    pub credentials: Credentials,
    pub validate_certs: bool,
}

impl ModuleParams {
    /// Load parameters from `path` (stdin when `None` or `-`). Files ending
    /// in `.toml` are parsed as TOML, everything else as JSON.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path != Path::new("-") => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read parameters file: {}", path.display()))?;
                let is_toml = path.extension().is_some_and(|ext| ext == "toml");
                if is_toml {
                    toml::from_str(&content).with_context(|| {
                        format!("Failed to parse parameters file: {}", path.display())
                    })
                } else {
                    Self::from_json(&content).with_context(|| {
                        format!("Failed to parse parameters file: {}", path.display())
                    })
                }
            }
            _ => {
                let mut content = String::new();
                std::io::stdin()
                    .read_to_string(&mut content)
                    .context("Failed to read parameters from stdin")?;
                Self::from_json(&content).context("Failed to parse parameters from stdin")
            }
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

impl ConnectionConfig {
    /// Fill connection parameters missing from the document from the
    /// `PROXMOX_*` variables returned by `lookup`.
    pub fn apply_env_fallback(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields = [
            (&mut self.api_host, "PROXMOX_HOST"),
            (&mut self.api_user, "PROXMOX_USER"),
            (&mut self.api_password, "PROXMOX_PASSWORD"),
            (&mut self.api_token_id, "PROXMOX_TOKEN_ID"),
            (&mut self.api_token_secret, "PROXMOX_TOKEN_SECRET"),
        ];
        for (field, var) in fields {
            if field.is_none() {
                *field = lookup(var).filter(|v| !v.is_empty());
            }
        }
    }

    /// Pre-flight check, performed before any API call.
    pub fn settings(&self) -> Result<ConnectionSettings> {
        let host = non_empty(&self.api_host)
            .ok_or_else(|| KvmError::config("missing required arguments: api_host"))?;
        let user = non_empty(&self.api_user)
            .ok_or_else(|| KvmError::config("missing required arguments: api_user"))?;

        let credentials = match (
            non_empty(&self.api_token_id),
            non_empty(&self.api_token_secret),
            non_empty(&self.api_password),
        ) {
            (Some(token_id), Some(secret), _) => Credentials::Token {
                user: user.to_string(),
                token_id: token_id.to_string(),
                secret: secret.to_string(),
            },
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(KvmError::config(
                    "api_token_id and api_token_secret must be given together",
                )
                .into())
            }
            (None, None, Some(password)) => Credentials::Password {
                user: user.to_string(),
                password: password.to_string(),
            },
            (None, None, None) => {
                return Err(KvmError::config(
                    "one of api_password or api_token_id/api_token_secret is required",
                )
                .into())
            }
        };

        let base_url = base_url(host, self.api_port);

        Ok(ConnectionSettings {
            base_url,
            credentials,
            validate_certs: self.validate_certs,
        })
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("api_host", &self.api_host)
            .field("api_port", &self.api_port)
            .field("api_user", &self.api_user)
            .field("api_password", &self.api_password.as_ref().map(|_| REDACTED))
            .field("api_token_id", &self.api_token_id)
            .field(
                "api_token_secret",
                &self.api_token_secret.as_ref().map(|_| REDACTED),
            )
            .field("validate_certs", &self.validate_certs)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token { user, token_id, .. } => f
                .debug_struct("Token")
                .field("user", user)
                .field("token_id", token_id)
                .field("secret", &REDACTED)
                .finish(),
            Credentials::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &REDACTED)
                .finish(),
        }
    }
}

/// `api_host` may be a full URL, `host`, `host:port`, or an IPv6 literal
/// with or without brackets. `api_port` is used only when no port is given.
fn base_url(host: &str, port: u16) -> String {
    if host.contains("://") {
        return host.trim_end_matches('/').to_string();
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return format!("https://[{}]:{}", host, port);
    }
    let has_port = match host.strip_prefix('[') {
        Some(bracketed) => bracketed.contains("]:"),
        None => host
            .rsplit_once(':')
            .is_some_and(|(_, p)| p.parse::<u16>().is_ok()),
    };
    if has_port {
        format!("https://{}", host)
    } else {
        format!("https://{}:{}", host, port)
    }
}

impl TaskConfig {
    pub fn task_wait(&self) -> TaskWait {
        TaskWait {
            poll_interval: Duration::from_secs(self.poll_interval),
            timeout: Duration::from_secs(self.timeout),
            ..TaskWait::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            api_host: None,
            api_port: default_api_port(),
            api_user: None,
            api_password: None,
            api_token_id: None,
            api_token_secret: None,
            validate_certs: false,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Accept `100` as well as `"100"`.
fn de_opt_vmid<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(id)) => Ok(Some(id)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid vmid: {}", text))),
    }
}

// Default functions
fn default_api_port() -> u16 {
    8006
}

fn default_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1
}
