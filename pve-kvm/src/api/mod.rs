//! Seam between the orchestrators and the cluster's REST API.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub mod client;
pub mod types;

pub use client::ProxmoxClient;
pub use types::{
    CreateVmRequest, HardwareConfig, MigrateVmRequest, NodeInfo, TaskHandle, TaskStatus, VmRef,
};

/// Cluster operations used by the orchestrators.
///
/// Implemented over HTTP by [`ProxmoxClient`]; tests substitute an in-memory
/// fake. Lookups are never cached, every call reads the cluster.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    /// All nodes of the cluster.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// All QEMU guests of the cluster.
    async fn list_vms(&self) -> Result<Vec<VmRef>>;

    /// Next free vmid as allocated by the cluster.
    async fn next_vmid(&self) -> Result<u32>;

    /// Submit VM creation, returning the creation task.
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<TaskHandle>;

    /// Submit a migration, returning the migration task.
    async fn migrate_vm(&self, request: &MigrateVmRequest) -> Result<TaskHandle>;

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus>;

    /// Last `lines` lines of a task's log.
    async fn task_log(&self, task: &TaskHandle, lines: usize) -> Result<Vec<String>>;

    /// Current configuration of a VM (`net0`, `scsi0`, `cores`, ...).
    async fn vm_config(&self, node: &str, vmid: u32) -> Result<Map<String, Value>>;

    async fn get_node(&self, node: &str) -> Result<Option<NodeInfo>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.node == node))
    }

    async fn get_vm(&self, vmid: u32) -> Result<Option<VmRef>> {
        Ok(self.list_vms().await?.into_iter().find(|vm| vm.vmid == vmid))
    }

    /// VMs carrying `name`, ordered by vmid.
    async fn find_vms_by_name(&self, name: &str) -> Result<Vec<VmRef>> {
        let mut vms: Vec<VmRef> = self
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.name.as_deref() == Some(name))
            .collect();
        vms.sort_by_key(|vm| vm.vmid);
        Ok(vms)
    }
}
