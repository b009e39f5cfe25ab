use crate::api::{ProxmoxApi, VmRef};
use crate::error::KvmError;
use anyhow::Result;

/// Outcome of identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The VM is already there; nothing to create.
    Existing(VmRef),
    /// No such VM; create it under this vmid.
    Create { vmid: u32 },
}

/// Decides whether a VM identified by vmid and/or name exists, and which
/// vmid a new VM gets.
pub struct Resolver<'a> {
    api: &'a dyn ProxmoxApi,
    choose_first_if_multiple: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(api: &'a dyn ProxmoxApi, choose_first_if_multiple: bool) -> Self {
        Self {
            api,
            choose_first_if_multiple,
        }
    }

    pub async fn resolve(&self, vmid: Option<u32>, name: Option<&str>) -> Result<Resolution> {
        match (vmid, name) {
            (Some(vmid), name) => {
                if let Some(vm) = self.api.get_vm(vmid).await? {
                    return Ok(Resolution::Existing(vm));
                }
                if let Some(name) = name {
                    self.warn_on_name_collision(vmid, name).await?;
                }
                Ok(Resolution::Create { vmid })
            }
            (None, Some(name)) => match self.lookup_by_name(name).await? {
                Some(vm) => Ok(Resolution::Existing(vm)),
                None => {
                    let vmid = self.api.next_vmid().await?;
                    tracing::debug!("Allocated vmid {} for {}", vmid, name);
                    Ok(Resolution::Create { vmid })
                }
            },
            (None, None) => Err(KvmError::config("vmid or name is required").into()),
        }
    }

    /// Name to VM lookup. Several matches are an error unless the resolver
    /// was told to take the lowest vmid.
    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<VmRef>> {
        let mut matches = self.api.find_vms_by_name(name).await?;
        if matches.len() > 1 && !self.choose_first_if_multiple {
            return Err(KvmError::lookup(format!(
                "Multiple VMs with name {} found, provide vmid instead",
                name
            ))
            .into());
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    // PVE does not enforce unique names, so a taken name never blocks a
    // creation under an explicit vmid.
    async fn warn_on_name_collision(&self, vmid: u32, name: &str) -> Result<()> {
        let holders = self.api.find_vms_by_name(name).await?;
        for vm in holders.iter().filter(|vm| vm.vmid != vmid) {
            tracing::warn!(
                "Name {} is already used by vmid {} on node {}; creating vmid {} anyway",
                name,
                vm.vmid,
                vm.node,
                vmid
            );
        }
        Ok(())
    }
}
