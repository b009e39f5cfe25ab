use crate::api::{CreateVmRequest, HardwareConfig, MigrateVmRequest, ProxmoxApi, VmRef};
use crate::error::KvmError;
use crate::module::ModuleOutcome;
use crate::parse::{is_disk_key, is_net_key, parse_dev, parse_mac};
use crate::resolver::{Resolution, Resolver};
use crate::task::{wait_for_task, TaskWait};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Desired VM for provisioning.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub vmid: Option<u32>,
    pub name: Option<String>,
    pub node: Option<String>,
    pub hardware: HardwareConfig,
}

/// VM to move and where to.
#[derive(Debug, Clone, Default)]
pub struct MigrationRequest {
    pub vmid: Option<u32>,
    pub name: Option<String>,
    pub target_node: String,
    pub with_local_disks: bool,
    /// MiB/s
    pub migrate_speed: Option<u64>,
}

/// Provisioning and migration decisions over an injected cluster API.
pub struct KvmManager {
    api: Arc<dyn ProxmoxApi>,
    wait: TaskWait,
    choose_first_if_multiple: bool,
}

impl KvmManager {
    pub fn new(api: Arc<dyn ProxmoxApi>, wait: TaskWait) -> Self {
        Self {
            api,
            wait,
            choose_first_if_multiple: false,
        }
    }

    /// Resolve duplicate names to the lowest vmid instead of failing.
    pub fn choose_first_if_multiple(mut self, choose_first: bool) -> Self {
        self.choose_first_if_multiple = choose_first;
        self
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.api.as_ref(), self.choose_first_if_multiple)
    }

    /// Create the VM unless it already exists.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ModuleOutcome> {
        let vmid = match self
            .resolver()
            .resolve(request.vmid, request.name.as_deref())
            .await?
        {
            Resolution::Existing(vm) => {
                tracing::info!("VM {} already exists on node {}", vm.vmid, vm.node);
                return Ok(ModuleOutcome {
                    vmid: Some(vm.vmid),
                    node: Some(vm.node),
                    ..ModuleOutcome::unchanged(format!(
                        "VM with vmid <{}> already exists",
                        vm.vmid
                    ))
                });
            }
            Resolution::Create { vmid } => vmid,
        };

        let name = request
            .name
            .as_deref()
            .ok_or_else(|| KvmError::config("name is required for creating a VM"))?;
        let node = request
            .node
            .as_deref()
            .ok_or_else(|| KvmError::config("node is required for creating a VM"))?;

        if self.api.get_node(node).await?.is_none() {
            return Err(
                KvmError::lookup(format!("Node {} does not exist in PVE cluster", node)).into(),
            );
        }

        let create = CreateVmRequest::new(node, vmid, Some(name), &request.hardware)?;

        tracing::info!("Creating VM {} (VMID: {}) on node {}", name, vmid, node);
        let task = self
            .api
            .create_vm(&create)
            .await
            .with_context(|| format!("Failed to create VM {}", name))?;

        tracing::debug!("Waiting for create task: {}", task);
        wait_for_task(self.api.as_ref(), &task, &self.wait)
            .await
            .with_context(|| format!("Creation of VM {} did not complete", name))?;

        let (mac, devices) = match self.api.vm_config(node, vmid).await {
            Ok(config) => device_report(&config),
            Err(e) => {
                tracing::warn!("VM {} created but its config could not be read: {:#}", vmid, e);
                (BTreeMap::new(), BTreeMap::new())
            }
        };

        tracing::info!("Successfully deployed VM {} (VMID: {})", name, vmid);

        Ok(ModuleOutcome {
            vmid: Some(vmid),
            node: Some(node.to_string()),
            mac,
            devices,
            ..ModuleOutcome::changed(format!("VM {} with vmid {} deployed", name, vmid))
        })
    }

    /// Move an existing VM to `request.target_node`.
    pub async fn migrate(&self, request: &MigrationRequest) -> Result<ModuleOutcome> {
        let vm = match (request.vmid, request.name.as_deref()) {
            (Some(vmid), _) => self.api.get_vm(vmid).await?.ok_or_else(|| {
                KvmError::lookup(format!("VM with vmid {} does not exist", vmid))
            })?,
            (None, Some(name)) => self.resolver().lookup_by_name(name).await?.ok_or_else(|| {
                KvmError::lookup(format!("VM with name {} does not exist", name))
            })?,
            (None, None) => return Err(KvmError::config("vmid or name is required").into()),
        };

        if vm.node == request.target_node {
            return Ok(ModuleOutcome {
                vmid: Some(vm.vmid),
                node: Some(vm.node.clone()),
                ..ModuleOutcome::unchanged(format!(
                    "VM {} is already on node {}",
                    vm.vmid, vm.node
                ))
            });
        }

        self.migrate_vm(
            &vm,
            &request.target_node,
            request.with_local_disks,
            request.migrate_speed,
        )
        .await?;

        Ok(ModuleOutcome {
            vmid: Some(vm.vmid),
            node: Some(request.target_node.clone()),
            ..ModuleOutcome::changed(format!(
                "VM {} migrated from {} to {}",
                vm.display_name(),
                vm.node,
                request.target_node
            ))
        })
    }

    /// Live-migrate `vm` and block until the migration task has finished.
    /// `migrate_speed` is in MiB/s and goes out as `bwlimit` in KiB/s.
    pub async fn migrate_vm(
        &self,
        vm: &VmRef,
        target_node: &str,
        with_local_disks: bool,
        migrate_speed: Option<u64>,
    ) -> Result<()> {
        let request = MigrateVmRequest::new(vm, target_node, with_local_disks, migrate_speed)?;

        tracing::info!(
            "Migrating VM {} from {} to {} (local disks: {}, bwlimit: {:?} KiB/s)",
            vm.vmid,
            vm.node,
            target_node,
            with_local_disks,
            request.bwlimit
        );
        let task = self
            .api
            .migrate_vm(&request)
            .await
            .with_context(|| format!("Failed to start migration of VM {}", vm.vmid))?;

        tracing::debug!("Waiting for migration task: {}", task);
        wait_for_task(self.api.as_ref(), &task, &self.wait)
            .await
            .with_context(|| format!("Migration of VM {} to {} failed", vm.vmid, target_node))
    }
}

/// MAC per network device and volume per disk, from a VM config.
fn device_report(
    config: &Map<String, Value>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut mac = BTreeMap::new();
    let mut devices = BTreeMap::new();
    for (key, value) in config {
        let Some(value) = value.as_str() else {
            continue;
        };
        if is_net_key(key) {
            if let Some(addr) = parse_mac(value) {
                mac.insert(key.clone(), addr.to_string());
            }
        } else if is_disk_key(key) {
            devices.insert(key.clone(), parse_dev(value).to_string());
        }
    }
    (mac, devices)
}

#[cfg(test)]
#[path = "kvm_tests.rs"]
mod kvm_tests;
