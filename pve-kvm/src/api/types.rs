use crate::error::KvmError;
use crate::parse::{is_disk_key, is_net_key};
use anyhow::Result;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// Proxmox API response wrapper.
#[derive(Deserialize, Debug)]
pub(crate) struct ProxmoxResponse<T> {
    pub data: T,
}

/// Task UPID response (for async operations like create, migrate).
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum TaskResponse {
    Upid(String),
    Object { upid: String },
}

impl TaskResponse {
    pub fn into_handle(self) -> TaskHandle {
        match self {
            TaskResponse::Upid(upid) => TaskHandle::new(upid),
            TaskResponse::Object { upid } => TaskHandle::new(upid),
        }
    }
}

/// `/cluster/nextid` answers with a string, older releases with a number.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum NextId {
    Text(String),
    Number(u32),
}

impl NextId {
    pub fn vmid(self) -> Result<u32> {
        match self {
            NextId::Number(id) => Ok(id),
            NextId::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid next vmid returned by cluster: {}", text)),
        }
    }
}

/// One entry of `/cluster/resources?type=vm`.
#[derive(Deserialize, Debug)]
pub(crate) struct ClusterResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub vmid: Option<u32>,
    pub node: Option<String>,
    pub name: Option<String>,
}

impl ClusterResource {
    /// QEMU guests only; containers share the listing.
    pub fn into_vm_ref(self) -> Option<VmRef> {
        if self.resource_type != "qemu" {
            return None;
        }
        Some(VmRef {
            vmid: self.vmid?,
            node: self.node?,
            name: self.name,
        })
    }
}

/// Ticket returned by `/access/ticket`.
#[derive(Deserialize, Debug)]
pub(crate) struct AuthTicket {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
}

/// One page of `/nodes/{node}/tasks/{upid}/log`. `total` counts all lines
/// of the log, not just this page.
#[derive(Deserialize, Debug)]
pub(crate) struct TaskLogPage {
    pub data: Vec<TaskLogLine>,
    #[serde(default)]
    pub total: Option<usize>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct TaskLogLine {
    #[allow(dead_code)]
    pub n: u64,
    pub t: String,
}

/// A VM as seen by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmRef {
    /// Name when the VM has one, otherwise its id.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.vmid.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Opaque id of an asynchronous cluster job, e.g.
/// `UPID:pve1:00001234:12345678:12345678:qmigrate:100:root@pam:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(upid: impl Into<String>) -> Self {
        Self(upid.into())
    }

    pub fn upid(&self) -> &str {
        &self.0
    }

    /// Node that runs the task (second UPID field).
    pub fn node(&self) -> Result<&str> {
        match self.0.split(':').nth(1) {
            Some(node) if self.0.starts_with("UPID:") && !node.is_empty() => Ok(node),
            _ => anyhow::bail!("Invalid UPID format: {}", self.0),
        }
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status == "stopped"
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.exitstatus.as_deref() == Some("OK")
    }
}

fn int_flag<S: Serializer>(value: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

fn opt_int_flag<S: Serializer>(
    value: &Option<bool>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) => int_flag(v, serializer),
        None => serializer.serialize_none(),
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Hardware options of a new VM.
///
/// Scalars go onto the wire under their own names. The device maps are keyed
/// by PVE device key (`net0`, `scsi0`, ...) and are flattened by
/// [`CreateVmRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    /// MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ostype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "opt_int_flag"
    )]
    pub onboot: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "opt_int_flag"
    )]
    pub agent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsihw: Option<String>,
    #[serde(default, skip_serializing)]
    pub net: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub scsi: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub virtio: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub sata: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub ide: BTreeMap<String, String>,
}

impl HardwareConfig {
    /// Merge all device maps into one wire map, checking every key against
    /// the bus it was declared under.
    pub fn devices(&self) -> Result<BTreeMap<String, String>> {
        let buses: [(&str, &BTreeMap<String, String>); 5] = [
            ("net", &self.net),
            ("scsi", &self.scsi),
            ("virtio", &self.virtio),
            ("sata", &self.sata),
            ("ide", &self.ide),
        ];

        let mut devices = BTreeMap::new();
        for (bus, entries) in buses {
            for (key, value) in entries {
                let index_ok = key
                    .strip_prefix(bus)
                    .is_some_and(|index| !index.is_empty());
                let key_ok = if bus == "net" {
                    is_net_key(key)
                } else {
                    is_disk_key(key)
                };
                if !index_ok || !key_ok {
                    return Err(KvmError::config(format!(
                        "Invalid {} device key '{}', expected {}<N>",
                        bus, key, bus
                    ))
                    .into());
                }
                devices.insert(key.clone(), value.clone());
            }
        }
        Ok(devices)
    }
}

/// Body of `POST /nodes/{node}/qemu`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateVmRequest {
    #[serde(skip)]
    pub node: String,
    pub vmid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub hardware: HardwareConfig,
    #[serde(flatten)]
    pub devices: BTreeMap<String, String>,
}

impl CreateVmRequest {
    pub fn new(
        node: &str,
        vmid: u32,
        name: Option<&str>,
        hardware: &HardwareConfig,
    ) -> Result<Self> {
        Ok(Self {
            node: node.to_string(),
            vmid,
            name: name.map(str::to_string),
            hardware: hardware.clone(),
            devices: hardware.devices()?,
        })
    }
}

/// Body of `POST /nodes/{node}/qemu/{vmid}/migrate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateVmRequest {
    pub vmid: u32,
    /// Source node.
    pub node: String,
    pub target: String,
    #[serde(serialize_with = "int_flag")]
    pub online: bool,
    #[serde(
        rename = "with-local-disks",
        skip_serializing_if = "is_false",
        serialize_with = "int_flag"
    )]
    pub with_local_disks: bool,
    /// KiB/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bwlimit: Option<u64>,
}

impl MigrateVmRequest {
    /// Live migration of `vm` to `target`. `migrate_speed` is in MiB/s.
    pub fn new(
        vm: &VmRef,
        target: &str,
        with_local_disks: bool,
        migrate_speed: Option<u64>,
    ) -> Result<Self> {
        let bwlimit = match migrate_speed {
            Some(speed) => Some(speed.checked_mul(1024).ok_or_else(|| {
                KvmError::config(format!("migrate_speed {} is out of range", speed))
            })?),
            None => None,
        };

        Ok(Self {
            vmid: vm.vmid,
            node: vm.node.clone(),
            target: target.to_string(),
            online: true,
            with_local_disks,
            bwlimit,
        })
    }
}
