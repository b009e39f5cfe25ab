//! Invocation entry: validate parameters, connect, dispatch, report.

use crate::api::ProxmoxClient;
use crate::config::{ConnectionSettings, ModuleParams};
use crate::error::KvmError;
use crate::kvm::{KvmManager, MigrationRequest, ProvisionRequest};
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Successful result document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleOutcome {
    pub changed: bool,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Network device key to MAC address.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mac: BTreeMap<String, String>,
    /// Disk device key to `storage:volume`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, String>,
}

impl ModuleOutcome {
    pub fn changed(msg: impl Into<String>) -> Self {
        Self {
            changed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn unchanged(msg: impl Into<String>) -> Self {
        Self {
            changed: false,
            msg: msg.into(),
            ..Default::default()
        }
    }
}

/// Failure result document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleFailure {
    pub failed: bool,
    pub msg: String,
}

impl ModuleFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            failed: true,
            msg: format!("{:#}", err),
        }
    }
}

/// Checks that need no cluster access.
pub fn preflight(params: &ModuleParams) -> Result<ConnectionSettings> {
    let settings = params.connection.settings()?;

    for key in params.unknown.keys() {
        tracing::warn!("Ignoring unknown parameter '{}'", key);
    }
    if params.tasks.poll_interval == 0 {
        return Err(KvmError::config("poll_interval must be at least 1 second").into());
    }

    if params.vmid.is_none() && params.name.is_none() {
        return Err(KvmError::config("vmid or name is required").into());
    }
    if params.migrate {
        if params.node.is_none() {
            return Err(KvmError::config("node is required for migration").into());
        }
    } else {
        params.hardware.devices()?;
    }

    Ok(settings)
}

/// Run one invocation against the cluster described by `params`.
pub async fn execute(params: ModuleParams) -> Result<ModuleOutcome> {
    let settings = preflight(&params)?;
    let client = ProxmoxClient::connect(&settings).await?;
    let manager = KvmManager::new(Arc::new(client), params.tasks.task_wait())
        .choose_first_if_multiple(params.choose_first_if_multiple);
    dispatch(&manager, params).await
}

/// Route to migration when `migrate` is set, provisioning otherwise.
pub async fn dispatch(manager: &KvmManager, params: ModuleParams) -> Result<ModuleOutcome> {
    if params.migrate {
        let target_node = params
            .node
            .ok_or_else(|| KvmError::config("node is required for migration"))?;
        manager
            .migrate(&MigrationRequest {
                vmid: params.vmid,
                name: params.name,
                target_node,
                with_local_disks: params.with_local_disks,
                migrate_speed: params.migrate_speed,
            })
            .await
    } else {
        manager
            .provision(&ProvisionRequest {
                vmid: params.vmid,
                name: params.name,
                node: params.node,
                hardware: params.hardware,
            })
            .await
    }
}
