use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudstack_api::{
    AsyncJob, AsyncJobResult, CloudStackClient, DeployVirtualMachine, JobStatus, NicPlacement,
    VirtualMachine,
};

use crate::config::CloudStackParams;
use crate::ipam::IpAllocator;
use crate::poll::{self, PollPolicy, Progress};
use crate::profile::VmProfile;
use crate::secrets::Credential;
use crate::types::{InstanceHandle, InstanceSummary, IpLease, PowerState, SnapshotInfo};
use crate::vm::{self, VmDriver};
use crate::{BackendKind, Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

pub struct CloudStackDriver {
    host: String,
    client: CloudStackClient,
    zone: String,
    ipam: Arc<dyn IpAllocator>,
    poll: PollPolicy,
}

fn power(state: &str) -> PowerState {
    match state {
        "Running" => PowerState::On,
        "Stopped" => PowerState::Off,
        "Starting" => PowerState::Starting,
        "Error" => PowerState::Error,
        _ => PowerState::Unknown,
    }
}

/// Name of the data volume backing `disk` on `vm`.
fn volume_name(vm: &str, disk: &str) -> String {
    format!("{vm}-{disk}")
}

impl CloudStackDriver {
    pub fn new(
        host: &str,
        params: &CloudStackParams,
        cred: &Credential,
        ipam: Arc<dyn IpAllocator>,
        poll: PollPolicy,
    ) -> Result<Self> {
        let client = CloudStackClient::new(
            &params.url,
            cred.require("api_key")?,
            cred.require("secret_key")?,
        );
        Ok(Self {
            host: host.to_string(),
            client,
            zone: params.zone.clone(),
            ipam,
            poll,
        })
    }

    /// Poll `queryAsyncJobResult` until the job leaves the pending state.
    async fn wait_job(&self, job: &AsyncJob, what: &str) -> Result<AsyncJobResult> {
        poll::wait_for(&self.poll, what, || async {
            let result = self.client.query_async_job(&job.jobid).await?;
            Ok(match result.status() {
                JobStatus::Pending => Progress::Pending,
                JobStatus::Succeeded => Progress::Done(result),
                JobStatus::Failed => Progress::Failed(result.error_text()),
            })
        })
        .await
    }

    /// Wait for `job` and return the id of the resource it acted on.
    async fn wait_for_id(&self, job: AsyncJob, what: &str) -> Result<String> {
        let result = self.wait_job(&job, what).await?;
        job.id
            .or(result.jobinstanceid)
            .ok_or_else(|| Error::ProvisioningFailed(format!("{what}: job returned no resource id")))
    }

    async fn resolve(&self, name_or_id: &str) -> Result<VirtualMachine> {
        let vms = self.client.list_virtual_machines().await?;
        vm::find_by_name_or_id(&vms, name_or_id, |v| (&v.name, &v.id))
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(name_or_id.to_string()))
    }

    async fn zone_id(&self) -> Result<String> {
        self.client
            .list_zones(&self.zone)
            .await?
            .into_iter()
            .next()
            .map(|z| z.id)
            .ok_or_else(|| Error::ProvisioningFailed(format!("zone {} not found", self.zone)))
    }

    fn offering_name<'a>(profile: &'a VmProfile, field: &'static str, value: &'a Option<String>) -> Result<&'a str> {
        value.as_deref().ok_or_else(|| Error::ProfileInvalid {
            profile: profile.name.clone(),
            reason: format!("cloudstack profiles need {field}"),
        })
    }

    async fn service_offering_id(&self, profile: &VmProfile) -> Result<String> {
        let name = Self::offering_name(profile, "service_offering", &profile.service_offering)?;
        self.client
            .list_service_offerings(name)
            .await?
            .into_iter()
            .next()
            .map(|o| o.id)
            .ok_or_else(|| Error::ProvisioningFailed(format!("service offering {name} not found")))
    }

    async fn disk_offering_id(&self, profile: &VmProfile) -> Result<String> {
        let name = Self::offering_name(profile, "disk_offering", &profile.disk_offering)?;
        self.client
            .list_disk_offerings(name)
            .await?
            .into_iter()
            .next()
            .map(|o| o.id)
            .ok_or_else(|| Error::ProvisioningFailed(format!("disk offering {name} not found")))
    }

    /// Network name to id within the zone.
    async fn network_ids(&self, zone_id: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .client
            .list_networks(zone_id)
            .await?
            .into_iter()
            .map(|n| (n.name, n.id))
            .collect())
    }

    fn network_id<'a>(ids: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
        ids.get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::ProvisioningFailed(format!("network {name} not found")))
    }

    async fn add_volume(&self, vm_id: &str, name: &str, zone_id: &str, offering: &str, size_gb: u32) -> Result<()> {
        let job = self
            .client
            .create_volume(name, zone_id, offering, size_gb)
            .await?;
        let volume = self.wait_for_id(job, &format!("create volume {name}")).await?;
        let job = self.client.attach_volume(&volume, vm_id).await?;
        self.wait_job(&job, &format!("attach volume {name}")).await?;
        tracing::debug!(volume = name, size_gb, "cloudstack: volume attached");
        Ok(())
    }

    /// Deploy and attach data disks. `created` is set to the VM id as soon
    /// as CloudStack has accepted the deploy.
    async fn provision(
        &self,
        name: &str,
        profile: &VmProfile,
        leases: &[IpLease],
        created: &mut Option<String>,
    ) -> Result<InstanceHandle> {
        let zone_id = self.zone_id().await?;
        let template_id = self
            .client
            .list_templates(&profile.template)
            .await?
            .into_iter()
            .next()
            .map(|t| t.id)
            .ok_or_else(|| Error::ProvisioningFailed(format!("template {} not found", profile.template)))?;
        let offering_id = self.service_offering_id(profile).await?;
        let disk_offering = match profile.disks.len() {
            0 | 1 => None,
            _ => Some(self.disk_offering_id(profile).await?),
        };

        let networks = self.network_ids(&zone_id).await?;
        let mut nics = Vec::with_capacity(profile.networks.len());
        for (net, lease) in profile.networks.iter().zip(leases) {
            nics.push(NicPlacement {
                network_id: Self::network_id(&networks, &net.name)?.to_string(),
                ip: Some(lease.address.to_string()),
            });
        }

        let job = self
            .client
            .deploy_virtual_machine(&DeployVirtualMachine {
                service_offering_id: offering_id,
                template_id,
                zone_id: zone_id.clone(),
                name: name.to_string(),
                display_name: name.to_string(),
                cpu: profile.cpu,
                memory_mib: profile.memory_mib,
                root_disk_size_gb: profile.disks.first().map(|d| d.size_gb),
                nics,
                start: true,
            })
            .await?;
        tracing::info!(vm = name, job = %job.jobid, "cloudstack: deploy submitted");
        *created = job.id.clone();
        let vm_id = self.wait_for_id(job, &format!("deploy {name}")).await?;
        *created = Some(vm_id.clone());

        if let Some(offering) = disk_offering {
            for disk in profile.disks.iter().skip(1) {
                self.add_volume(&vm_id, &volume_name(name, &disk.name), &zone_id, &offering, disk.size_gb)
                    .await?;
            }
        }

        tracing::info!(vm = name, id = %vm_id, "cloudstack: instance created");
        Ok(InstanceHandle {
            id: vm_id,
            name: name.to_string(),
            host: None,
            addresses: leases.iter().map(|l| l.address.to_string()).collect(),
        })
    }

    async fn destroy(&self, vm_id: &str) -> Result<()> {
        let job = self.client.destroy_virtual_machine(vm_id, true).await?;
        self.wait_job(&job, &format!("destroy {vm_id}")).await?;
        Ok(())
    }

    /// Graceful stop; a stop that fails or never completes blocks the change.
    async fn stop(&self, vm: &VirtualMachine) -> Result<()> {
        let job = self.client.stop_virtual_machine(&vm.id, false).await?;
        match self.wait_job(&job, &format!("stop {}", vm.name)).await {
            Ok(_) => Ok(()),
            Err(e @ (Error::ProvisioningTimeout { .. } | Error::ProvisioningFailed(_))) => {
                tracing::warn!(vm = %vm.name, error = %e, "cloudstack: instance did not stop");
                Err(Error::ReconfigureBlocked(vm.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn reconfigure(&self, vm: &VirtualMachine, profile: &VmProfile, fresh: &mut Vec<IpLease>) -> Result<()> {
        if vm.cpunumber != Some(profile.cpu) || vm.memory != Some(profile.memory_mib) {
            let offering = match &profile.service_offering {
                Some(_) => self.service_offering_id(profile).await?,
                None => vm.serviceofferingid.clone().ok_or_else(|| {
                    Error::ProvisioningFailed(format!("{} has no service offering", vm.name))
                })?,
            };
            self.client
                .change_service(&vm.id, &offering, profile.cpu, profile.memory_mib)
                .await?;
        }

        let zone_id = match &vm.zoneid {
            Some(z) => z.clone(),
            None => self.zone_id().await?,
        };

        let volumes = self.client.list_volumes(Some(&vm.id)).await?;
        let mut disk_offering = None;
        for (i, disk) in profile.disks.iter().enumerate() {
            let wanted = u64::from(disk.size_gb) * GIB;
            let label = volume_name(&vm.name, &disk.name);
            let existing = volumes.iter().find(|v| {
                if i == 0 {
                    v.kind.as_deref() == Some("ROOT")
                } else {
                    v.name == label || v.name == disk.name
                }
            });
            match existing {
                Some(v) if v.size < wanted => {
                    let job = self.client.resize_volume(&v.id, disk.size_gb).await?;
                    self.wait_job(&job, &format!("resize volume {}", v.name)).await?;
                }
                Some(_) => {}
                None => {
                    if disk_offering.is_none() {
                        disk_offering = Some(self.disk_offering_id(profile).await?);
                    }
                    let offering = disk_offering.as_deref().unwrap_or_default();
                    self.add_volume(&vm.id, &label, &zone_id, offering, disk.size_gb)
                        .await?;
                }
            }
        }

        let attached: Vec<&str> = vm
            .nic
            .iter()
            .filter_map(|n| n.networkname.as_deref())
            .collect();
        let missing: Vec<_> = profile
            .networks
            .iter()
            .filter(|n| !attached.contains(&n.name.as_str()))
            .collect();
        if !missing.is_empty() {
            let networks = self.network_ids(&zone_id).await?;
            for net in missing {
                let network_id = Self::network_id(&networks, &net.name)?;
                let lease = self.ipam.allocate(&net.vlan, &vm.name).await?;
                fresh.push(lease.clone());
                let job = self
                    .client
                    .add_nic(&vm.id, network_id, Some(&lease.address.to_string()))
                    .await?;
                self.wait_job(&job, &format!("add nic {}", net.name)).await?;
                tracing::info!(vm = %vm.name, address = %lease.address, network = %net.name, "cloudstack: nic added");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VmDriver for CloudStackDriver {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cloudstack
    }

    async fn create_instance(&self, profile: &VmProfile) -> Result<InstanceHandle> {
        let pattern = profile.pattern()?;
        let existing = self.client.list_virtual_machines().await?;
        let (_, name) = pattern.first_unused(existing.iter().map(|v| v.name.as_str()));

        let leases = vm::allocate_leases(self.ipam.as_ref(), profile, &name).await?;
        let mut created = None;
        match self.provision(&name, profile, &leases, &mut created).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let destroy = created.as_deref().map(|id| self.destroy(id));
                vm::compensate(BackendKind::Cloudstack, self.ipam.as_ref(), &name, &leases, &e, destroy).await;
                Err(e)
            }
        }
    }

    async fn delete_instance(&self, name_or_id: &str) -> Result<()> {
        let vm = self.resolve(name_or_id).await?;
        let job = self.client.destroy_virtual_machine(&vm.id, true).await?;
        self.wait_job(&job, &format!("destroy {}", vm.name)).await?;
        tracing::info!(vm = %vm.name, id = %vm.id, "cloudstack: instance deleted");
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>> {
        let vms = self.client.list_virtual_machines().await?;
        let mut disk_bytes: HashMap<String, u64> = HashMap::new();
        for volume in self.client.list_volumes(None).await? {
            if let Some(vm) = volume.virtualmachineid {
                *disk_bytes.entry(vm).or_default() += volume.size;
            }
        }

        let mut out = Vec::with_capacity(vms.len());
        for vm in vms {
            let snapshots = self.client.list_vm_snapshots(&vm.id).await?;
            let mut summary = InstanceSummary::new(&vm.id, &vm.name, power(&vm.state));
            summary.cpu = vm.cpunumber;
            summary.memory_mib = vm.memory;
            summary.disk_gb = disk_bytes.get(&vm.id).map(|b| b / GIB);
            summary.networks = vm.nic.iter().filter_map(|n| n.networkname.clone()).collect();
            summary.addresses = vm.nic.iter().filter_map(|n| n.ipaddress.clone()).collect();
            summary.snapshots = snapshots.into_iter().map(|s| s.name).collect();
            summary.host = vm.hostname;
            out.push(summary);
        }
        Ok(out)
    }

    async fn modify_instance(&self, name_or_id: &str, profile: &VmProfile) -> Result<()> {
        let vm = self.resolve(name_or_id).await?;
        if vm.state != "Stopped" {
            self.stop(&vm).await?;
        }

        let mut fresh = Vec::new();
        if let Err(e) = self.reconfigure(&vm, profile, &mut fresh).await {
            vm::release_leases(self.ipam.as_ref(), &fresh).await;
            return Err(e);
        }
        tracing::info!(vm = %vm.name, "cloudstack: instance reconfigured");
        Ok(())
    }

    async fn snapshot_instance(&self, name_or_id: &str, name: Option<&str>) -> Result<SnapshotInfo> {
        let vm = self.resolve(name_or_id).await?;
        let snapshot = name
            .map(str::to_string)
            .unwrap_or_else(|| vm::default_snapshot_name(&vm.name));

        let job = self.client.create_vm_snapshot(&vm.id, &snapshot).await?;
        let result = self.wait_job(&job, &format!("snapshot {}", vm.name)).await?;
        let id = job.id.or(result.jobinstanceid);
        tracing::info!(vm = %vm.name, snapshot = %snapshot, "cloudstack: snapshot taken");

        Ok(SnapshotInfo {
            instance: vm.name,
            name: snapshot,
            id,
        })
    }
}
