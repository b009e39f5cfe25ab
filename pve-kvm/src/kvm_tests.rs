use super::*;
use crate::api::TaskStatus;
use crate::test_helpers::{Call, FakeApi};
use serde_json::json;
use std::time::Duration;

fn fast_wait() -> TaskWait {
    TaskWait {
        poll_interval: Duration::ZERO,
        timeout: Duration::from_secs(5),
        log_tail_lines: 5,
    }
}

fn manager(api: &Arc<FakeApi>) -> KvmManager {
    KvmManager::new(api.clone(), fast_wait())
}

fn provision_request(vmid: Option<u32>, name: Option<&str>) -> ProvisionRequest {
    ProvisionRequest {
        vmid,
        name: name.map(str::to_string),
        node: Some("pve".to_string()),
        hardware: HardwareConfig::default(),
    }
}

fn creates(api: &FakeApi) -> Vec<CreateVmRequest> {
    api.calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CreateVm(req) => Some(req),
            _ => None,
        })
        .collect()
}

fn migrations(api: &FakeApi) -> Vec<MigrateVmRequest> {
    api.calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::MigrateVm(req) => Some(req),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_unchanged_when_provided_vmid_exists() {
    let api = Arc::new(FakeApi::default().with_nodes(&["pve"]).with_vm(100, "pve", None));

    let outcome = manager(&api)
        .provision(&provision_request(Some(100), None))
        .await
        .unwrap();

    assert!(!outcome.changed);
    assert_eq!(outcome.msg, "VM with vmid <100> already exists");
    assert_eq!(outcome.vmid, Some(100));
    assert_eq!(api.count(|c| *c == Call::ListVms), 1);
    assert!(creates(&api).is_empty());
}

#[tokio::test]
async fn test_created_when_vmid_free_but_name_exists() {
    let api = Arc::new(
        FakeApi::default()
            .with_nodes(&["pve"])
            .with_vm(200, "pve", Some("existing.vm.local")),
    );

    let outcome = manager(&api)
        .provision(&provision_request(Some(100), Some("existing.vm.local")))
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.msg, "VM existing.vm.local with vmid 100 deployed");
    assert_eq!(api.count(|c| *c == Call::ListNodes), 1);

    let created = creates(&api);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].vmid, 100);
    assert_eq!(created[0].node, "pve");
    assert_eq!(created[0].name.as_deref(), Some("existing.vm.local"));
}

#[tokio::test]
async fn test_not_created_when_name_exists_and_vmid_not_set() {
    let api = Arc::new(
        FakeApi::default()
            .with_nodes(&["pve"])
            .with_vm(100, "pve", Some("existing.vm.local")),
    );

    let outcome = manager(&api)
        .provision(&provision_request(None, Some("existing.vm.local")))
        .await
        .unwrap();

    assert!(!outcome.changed);
    assert_eq!(outcome.msg, "VM with vmid <100> already exists");
    assert!(creates(&api).is_empty());
    assert_eq!(api.count(|c| *c == Call::NextVmid), 0);
}

#[tokio::test]
async fn test_created_with_next_vmid_when_name_unknown() {
    let api = Arc::new(FakeApi::default().with_nodes(&["pve"]).with_next_id(101));

    let outcome = manager(&api)
        .provision(&provision_request(None, Some("existing.vm.local")))
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.msg, "VM existing.vm.local with vmid 101 deployed");
    assert_eq!(api.count(|c| *c == Call::NextVmid), 1);
    assert_eq!(creates(&api)[0].vmid, 101);
}

#[tokio::test]
async fn test_created_vm_reports_macs_and_devices() {
    let mut fake = FakeApi::default().with_nodes(&["pve"]).with_next_id(101);
    fake.vm_config = json!({
        "name": "web01",
        "cores": 2,
        "net0": "virtio=00:11:22:AA:BB:CC,bridge=vmbr0,firewall=1",
        "scsi0": "local-lvm:vm-101-disk-0,size=8G",
        "ide2": "none,media=cdrom",
        "scsihw": "virtio-scsi-pci",
    })
    .as_object()
    .unwrap()
    .clone();
    let api = Arc::new(fake);

    let outcome = manager(&api)
        .provision(&provision_request(None, Some("web01")))
        .await
        .unwrap();

    assert_eq!(
        outcome.mac.get("net0").map(String::as_str),
        Some("00:11:22:AA:BB:CC")
    );
    assert_eq!(
        outcome.devices.get("scsi0").map(String::as_str),
        Some("local-lvm:vm-101-disk-0")
    );
    assert_eq!(outcome.devices.get("ide2").map(String::as_str), Some("none"));
    assert!(!outcome.devices.contains_key("scsihw"));
    assert!(api.calls().contains(&Call::VmConfig("pve".to_string(), 101)));
}

#[tokio::test]
async fn test_create_fails_on_unknown_node() {
    let api = Arc::new(FakeApi::default().with_nodes(&["pve1"]).with_next_id(101));

    let err = manager(&api)
        .provision(&provision_request(None, Some("web01")))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Node pve does not exist in PVE cluster");
    assert!(creates(&api).is_empty());
}

#[tokio::test]
async fn test_create_requires_name() {
    let api = Arc::new(FakeApi::default().with_nodes(&["pve"]));

    let err = manager(&api)
        .provision(&provision_request(Some(100), None))
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<KvmError>(),
        Some(&KvmError::config("name is required for creating a VM"))
    );
}

#[tokio::test]
async fn test_create_api_error_text_propagates() {
    let mut fake = FakeApi::default().with_nodes(&["pve"]).with_next_id(101);
    fake.create_error = Some("unable to create VM 101 - storage 'fast' does not exist".to_string());
    let api = Arc::new(fake);

    let err = manager(&api)
        .provision(&provision_request(None, Some("web01")))
        .await
        .unwrap_err();

    let msg = format!("{:#}", err);
    assert!(msg.starts_with("Failed to create VM web01"), "{}", msg);
    assert!(msg.contains("storage 'fast' does not exist"), "{}", msg);
}

#[tokio::test]
async fn test_migration_with_local_disks() {
    let api = Arc::new(
        FakeApi::default()
            .with_nodes(&["source-node", "target-node"])
            .with_vm(100, "source-node", None),
    );

    let outcome = manager(&api)
        .migrate(&MigrationRequest {
            vmid: Some(100),
            target_node: "target-node".to_string(),
            with_local_disks: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        migrations(&api),
        vec![MigrateVmRequest {
            vmid: 100,
            node: "source-node".to_string(),
            target: "target-node".to_string(),
            online: true,
            with_local_disks: true,
            bwlimit: None,
        }]
    );
    assert!(outcome.changed);
    assert!(outcome.msg.contains("migrated from source-node to target-node"));
}

#[tokio::test]
async fn test_migrate_vm_converts_speed_to_bwlimit() {
    let api = Arc::new(FakeApi::default());
    let vm = VmRef {
        vmid: 100,
        node: "source-node".to_string(),
        name: None,
    };

    manager(&api)
        .migrate_vm(&vm, "target-node", true, Some(100))
        .await
        .unwrap();

    let sent = migrations(&api);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bwlimit, Some(102400));
    assert!(sent[0].online);
    assert!(sent[0].with_local_disks);
    assert_eq!(
        api.count(|c| matches!(c, Call::TaskStatus(_))),
        1,
        "migration task must be awaited"
    );
}

#[tokio::test]
async fn test_migration_by_name() {
    let api = Arc::new(FakeApi::default().with_vm(104, "pve1", Some("db01")));

    let outcome = manager(&api)
        .migrate(&MigrationRequest {
            name: Some("db01".to_string()),
            target_node: "pve2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.msg, "VM db01 migrated from pve1 to pve2");
    assert_eq!(migrations(&api)[0].vmid, 104);
}

#[tokio::test]
async fn test_migration_to_current_node_is_noop() {
    let api = Arc::new(FakeApi::default().with_vm(100, "pve1", None));

    let outcome = manager(&api)
        .migrate(&MigrationRequest {
            vmid: Some(100),
            target_node: "pve1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!outcome.changed);
    assert_eq!(outcome.msg, "VM 100 is already on node pve1");
    assert!(migrations(&api).is_empty());
}

#[tokio::test]
async fn test_migration_of_missing_vm() {
    let api = Arc::new(FakeApi::default());

    let err = manager(&api)
        .migrate(&MigrationRequest {
            vmid: Some(100),
            target_node: "pve2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "VM with vmid 100 does not exist");
}

#[tokio::test]
async fn test_failed_migration_task_reports_log_tail() {
    let mut fake = FakeApi::default()
        .with_vm(100, "source-node", None)
        .with_task_statuses(vec![
            TaskStatus {
                status: "running".to_string(),
                exitstatus: None,
            },
            TaskStatus {
                status: "stopped".to_string(),
                exitstatus: Some("migration problems".to_string()),
            },
        ]);
    fake.task_log = vec![
        "2024-01-01 starting migration of VM 100 to node 'target-node'".to_string(),
        "2024-01-01 ERROR: migration aborted".to_string(),
    ];
    let api = Arc::new(fake);

    let err = manager(&api)
        .migrate(&MigrationRequest {
            vmid: Some(100),
            target_node: "target-node".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    let msg = format!("{:#}", err);
    assert!(msg.starts_with("Migration of VM 100 to target-node failed"), "{}", msg);
    assert!(msg.contains("failed with status: migration problems"), "{}", msg);
    assert!(msg.contains("ERROR: migration aborted"), "{}", msg);
}

#[tokio::test]
async fn test_migration_of_unknown_name() {
    let api = Arc::new(FakeApi::default().with_vm(100, "pve1", Some("db01")));

    let err = manager(&api)
        .migrate(&MigrationRequest {
            name: Some("ghost".to_string()),
            target_node: "pve2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<KvmError>(),
        Some(&KvmError::lookup("VM with name ghost does not exist"))
    );
    assert!(migrations(&api).is_empty());
}

#[tokio::test]
async fn test_failed_creation_task_is_reported() {
    let mut fake = FakeApi::default()
        .with_nodes(&["pve"])
        .with_next_id(101)
        .with_task_statuses(vec![TaskStatus {
            status: "stopped".to_string(),
            exitstatus: Some("unable to create VM 101 - no space left".to_string()),
        }]);
    fake.task_log = vec!["TASK ERROR: unable to create VM 101 - no space left".to_string()];
    let api = Arc::new(fake);

    let err = manager(&api)
        .provision(&provision_request(None, Some("web01")))
        .await
        .unwrap_err();

    let msg = format!("{:#}", err);
    assert!(msg.starts_with("Creation of VM web01 did not complete"), "{}", msg);
    assert!(msg.contains("failed with status: unable to create VM 101"), "{}", msg);
    assert!(msg.contains("TASK ERROR"), "{}", msg);
    assert_eq!(creates(&api).len(), 1);
    assert_eq!(api.count(|c| matches!(c, Call::VmConfig(..))), 0);
}
