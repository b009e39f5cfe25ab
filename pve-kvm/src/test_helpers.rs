//! In-memory [`ProxmoxApi`] that records every call.

use crate::api::{
    CreateVmRequest, MigrateVmRequest, NodeInfo, ProxmoxApi, TaskHandle, TaskStatus, VmRef,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListNodes,
    ListVms,
    NextVmid,
    CreateVm(CreateVmRequest),
    MigrateVm(MigrateVmRequest),
    TaskStatus(String),
    TaskLog(String),
    VmConfig(String, u32),
}

/// Cluster state served by the fake. Task polls pop `task_statuses` in
/// order and report a finished `OK` task once it is empty.
#[derive(Default)]
pub struct FakeApi {
    pub nodes: Vec<String>,
    pub vms: Vec<VmRef>,
    pub next_id: u32,
    pub task_log: Vec<String>,
    pub vm_config: Map<String, Value>,
    pub create_error: Option<String>,
    task_statuses: Mutex<VecDeque<TaskStatus>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeApi {
    pub fn with_nodes(mut self, nodes: &[&str]) -> Self {
        self.nodes = nodes.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_vm(mut self, vmid: u32, node: &str, name: Option<&str>) -> Self {
        self.vms.push(VmRef {
            vmid,
            node: node.to_string(),
            name: name.map(str::to_string),
        });
        self
    }

    pub fn with_next_id(mut self, next_id: u32) -> Self {
        self.next_id = next_id;
        self
    }

    pub fn with_task_statuses(self, statuses: Vec<TaskStatus>) -> Self {
        *self.task_statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProxmoxApi for FakeApi {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.record(Call::ListNodes);
        Ok(self
            .nodes
            .iter()
            .map(|node| NodeInfo {
                node: node.clone(),
                status: Some("online".to_string()),
            })
            .collect())
    }

    async fn list_vms(&self) -> Result<Vec<VmRef>> {
        self.record(Call::ListVms);
        Ok(self.vms.clone())
    }

    async fn next_vmid(&self) -> Result<u32> {
        self.record(Call::NextVmid);
        Ok(self.next_id)
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<TaskHandle> {
        self.record(Call::CreateVm(request.clone()));
        if let Some(err) = &self.create_error {
            anyhow::bail!("{}", err);
        }
        Ok(TaskHandle::new(format!(
            "UPID:{}:00001234:00000000:00000000:qmcreate:{}:root@pam:",
            request.node, request.vmid
        )))
    }

    async fn migrate_vm(&self, request: &MigrateVmRequest) -> Result<TaskHandle> {
        self.record(Call::MigrateVm(request.clone()));
        Ok(TaskHandle::new(format!(
            "UPID:{}:00001235:00000000:00000000:qmigrate:{}:root@pam:",
            request.node, request.vmid
        )))
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        self.record(Call::TaskStatus(task.upid().to_string()));
        let next = self.task_statuses.lock().unwrap().pop_front();
        Ok(next.unwrap_or(TaskStatus {
            status: "stopped".to_string(),
            exitstatus: Some("OK".to_string()),
        }))
    }

    async fn task_log(&self, task: &TaskHandle, lines: usize) -> Result<Vec<String>> {
        self.record(Call::TaskLog(task.upid().to_string()));
        let skip = self.task_log.len().saturating_sub(lines);
        Ok(self.task_log[skip..].to_vec())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<Map<String, Value>> {
        self.record(Call::VmConfig(node.to_string(), vmid));
        Ok(self.vm_config.clone())
    }
}
