use std::sync::Arc;

use async_trait::async_trait;
use vsphere_api::{
    AdapterSpec, CloneRequest, ClonePlacement, ConfigurationSpec, ConnectionState, CpuUpdate,
    CustomizationRequest, CustomizationSpec, DatastoreSummary, DiskCreate, DiskResize,
    GlobalDnsSettings, HostnameSpec, InterfaceSpec, Ipv4Spec, LinuxConfig, MemoryUpdate,
    NewVmdk, NicBacking, NicCreate, NicUpdate, PowerState as VmPower, SnapshotRequest,
    TaskStatus, VmInfo, VmSummary, VsphereClient,
};

use crate::config::VsphereParams;
use crate::ipam::IpAllocator;
use crate::poll::{self, PollPolicy, Progress};
use crate::profile::{DiskSpec, NetworkSpec, VmProfile};
use crate::secrets::Credential;
use crate::types::{InstanceHandle, InstanceSummary, IpLease, PowerState, SnapshotInfo};
use crate::vm::{self, VmDriver};
use crate::{BackendKind, Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Usage figures for one connected host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCandidate {
    pub id: String,
    pub name: String,
    pub cpu_usage: u64,
    pub memory_usage: u64,
}

/// Keep a running minimum of CPU and memory usage; a host replaces the
/// current pick only when it is strictly below both. With no host below
/// both minima, the earlier pick stands, so the last host satisfying the
/// condition wins.
pub fn select_host(hosts: &[HostCandidate]) -> Option<&HostCandidate> {
    let mut pick = None;
    let mut min_cpu = u64::MAX;
    let mut min_memory = u64::MAX;
    for host in hosts {
        if host.cpu_usage < min_cpu && host.memory_usage < min_memory {
            min_cpu = host.cpu_usage;
            min_memory = host.memory_usage;
            pick = Some(host);
        }
    }
    pick
}

/// Bytes left on a datastore after keeping 20 % of capacity free and
/// placing `requested` bytes. Negative when the request does not fit.
pub fn remaining_after(ds: &DatastoreSummary, requested: u64) -> i128 {
    i128::from(ds.free_space) - i128::from(ds.capacity / 5) - i128::from(requested)
}

/// Datastore with the most room left; `None` when nothing fits.
pub fn select_datastore(datastores: &[DatastoreSummary], requested_gb: u64) -> Option<&DatastoreSummary> {
    let requested = requested_gb * GIB;
    datastores
        .iter()
        .map(|ds| (ds, remaining_after(ds, requested)))
        .filter(|(_, left)| *left >= 0)
        .max_by_key(|(_, left)| *left)
        .map(|(ds, _)| ds)
}

/// One disk change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskAction {
    Resize { key: String, capacity: u64 },
    Add { name: String, capacity: u64 },
}

/// Match profile disks to existing disks by label, then pair the rest by
/// device key order. Disks only grow; extra profile disks are added.
pub fn plan_disks(existing: &[(String, String, u64)], wanted: &[DiskSpec]) -> Vec<DiskAction> {
    let mut free: Vec<&(String, String, u64)> = existing.iter().collect();
    free.sort_by(|a, b| a.0.cmp(&b.0));

    let mut by_label = Vec::with_capacity(wanted.len());
    for disk in wanted {
        let hit = free.iter().position(|(_, label, _)| *label == disk.name);
        by_label.push(hit.map(|i| free.remove(i)));
    }

    let mut rest = free.into_iter();
    let mut actions = Vec::new();
    for (disk, matched) in wanted.iter().zip(by_label) {
        let capacity = u64::from(disk.size_gb) * GIB;
        match matched.or_else(|| rest.next()) {
            Some((key, _, current)) if *current < capacity => actions.push(DiskAction::Resize {
                key: key.clone(),
                capacity,
            }),
            Some(_) => {}
            None => actions.push(DiskAction::Add {
                name: disk.name.clone(),
                capacity,
            }),
        }
    }
    actions
}

/// One network adapter change; `index` points into the profile networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicAction {
    Repoint { key: String, index: usize },
    Add { index: usize },
}

/// Pair profile networks with existing adapters by device key order.
pub fn plan_nics(existing: &[(String, Option<String>)], wanted: &[NetworkSpec]) -> Vec<NicAction> {
    let mut nics: Vec<&(String, Option<String>)> = existing.iter().collect();
    nics.sort_by(|a, b| a.0.cmp(&b.0));

    wanted
        .iter()
        .enumerate()
        .filter_map(|(index, net)| match nics.get(index) {
            Some((_, Some(current))) if *current == net.name => None,
            Some((key, _)) => Some(NicAction::Repoint {
                key: key.clone(),
                index,
            }),
            None => Some(NicAction::Add { index }),
        })
        .collect()
}

pub struct VsphereDriver {
    host: String,
    client: VsphereClient,
    params: VsphereParams,
    ipam: Arc<dyn IpAllocator>,
    poll: PollPolicy,
}

impl VsphereDriver {
    pub async fn connect(
        host: &str,
        params: &VsphereParams,
        cred: &Credential,
        ipam: Arc<dyn IpAllocator>,
        poll: PollPolicy,
    ) -> Result<Self> {
        let client = VsphereClient::login(
            &params.url,
            cred.require("username")?,
            cred.require("password")?,
            params.insecure,
        )
        .await?;
        tracing::info!(host, "vsphere: session opened");

        Ok(Self {
            host: host.to_string(),
            client,
            params: params.clone(),
            ipam,
            poll,
        })
    }

    async fn wait_task(&self, task: &str, what: &str) -> Result<Option<serde_json::Value>> {
        poll::wait_for(&self.poll, what, || async {
            let info = self.client.get_task(task).await?;
            Ok(match info.status {
                TaskStatus::Succeeded => Progress::Done(info.result),
                TaskStatus::Failed => Progress::Failed(
                    info.error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("task {task} failed")),
                ),
                _ => Progress::Pending,
            })
        })
        .await
    }

    async fn resolve(&self, name_or_id: &str) -> Result<VmSummary> {
        let vms = self.client.list_vms().await?;
        vm::find_by_name_or_id(&vms, name_or_id, |v| (&v.name, &v.vm))
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(name_or_id.to_string()))
    }

    async fn place(&self, profile: &VmProfile) -> Result<(HostCandidate, DatastoreSummary)> {
        let mut candidates = Vec::new();
        for host in self.client.list_hosts().await? {
            if host.connection_state != ConnectionState::Connected {
                continue;
            }
            let stats = self.client.host_quick_stats(&host.host).await?;
            candidates.push(HostCandidate {
                id: host.host,
                name: host.name,
                cpu_usage: stats.overall_cpu_usage,
                memory_usage: stats.overall_memory_usage,
            });
        }
        let host = select_host(&candidates)
            .cloned()
            .ok_or_else(|| Error::ProvisioningFailed("no connected host to place on".into()))?;

        let datastores = self.client.list_datastores(&host.id).await?;
        let datastore = select_datastore(&datastores, profile.total_disk_gb())
            .cloned()
            .ok_or_else(|| {
                Error::ProvisioningFailed(format!(
                    "no datastore on {} has {} GB to spare",
                    host.name,
                    profile.total_disk_gb()
                ))
            })?;

        tracing::debug!(host = %host.name, datastore = %datastore.name, "vsphere: placement chosen");
        Ok((host, datastore))
    }

    async fn network_id(&self, name: &str) -> Result<String> {
        self.client
            .find_networks(name)
            .await?
            .into_iter()
            .next()
            .map(|n| n.network)
            .ok_or_else(|| Error::ProvisioningFailed(format!("network {name} not found")))
    }

    /// Apply CPU, memory, disk and adapter changes. The VM must be off.
    async fn apply_hardware(&self, vm: &str, info: &VmInfo, profile: &VmProfile) -> Result<()> {
        if info.cpu.count != profile.cpu {
            self.client
                .update_cpu(vm, &CpuUpdate { count: profile.cpu })
                .await?;
        }
        if info.memory.size_mib != profile.memory_mib {
            self.client
                .update_memory(
                    vm,
                    &MemoryUpdate {
                        size_mib: profile.memory_mib,
                    },
                )
                .await?;
        }

        let disks: Vec<(String, String, u64)> = info
            .disks
            .iter()
            .map(|(key, d)| (key.clone(), d.label.clone(), d.capacity.unwrap_or(0)))
            .collect();
        for action in plan_disks(&disks, &profile.disks) {
            match action {
                DiskAction::Resize { key, capacity } => {
                    self.client
                        .resize_disk(vm, &key, &DiskResize { capacity })
                        .await?;
                }
                DiskAction::Add { name, capacity } => {
                    self.client
                        .add_disk(
                            vm,
                            &DiskCreate {
                                new_vmdk: NewVmdk {
                                    name: format!("{}_{name}", info.name),
                                    capacity,
                                },
                            },
                        )
                        .await?;
                }
            }
        }

        let nics: Vec<(String, Option<String>)> = info
            .nics
            .iter()
            .map(|(key, n)| (key.clone(), n.backing.network_name.clone()))
            .collect();
        for action in plan_nics(&nics, &profile.networks) {
            match action {
                NicAction::Repoint { key, index } => {
                    let network = self.network_id(&profile.networks[index].name).await?;
                    self.client
                        .update_nic(
                            vm,
                            &key,
                            &NicUpdate {
                                backing: NicBacking::standard_portgroup(network),
                            },
                        )
                        .await?;
                }
                NicAction::Add { index } => {
                    let network = self.network_id(&profile.networks[index].name).await?;
                    self.client
                        .add_nic(
                            vm,
                            &NicCreate {
                                kind: "VMXNET3".into(),
                                backing: NicBacking::standard_portgroup(network),
                                start_connected: true,
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Guest customization for `name`. The first `kept` adapters keep their
    /// settings; the leases configure the adapters after them, in order.
    fn customization(&self, name: &str, kept: usize, leases: &[IpLease]) -> CustomizationRequest {
        let unchanged = (0..kept).map(|_| Ipv4Spec::unchanged());
        let fixed = leases.iter().enumerate().map(|(i, l)| {
            let gateways = match (kept + i, l.gateway) {
                (0, Some(gw)) => vec![gw.to_string()],
                _ => Vec::new(),
            };
            Ipv4Spec::fixed(l.address.to_string(), l.prefix_len, gateways)
        });

        CustomizationRequest {
            spec: CustomizationSpec {
                configuration_spec: ConfigurationSpec {
                    linux_config: LinuxConfig {
                        hostname: HostnameSpec {
                            kind: "FIXED".into(),
                            fixed_name: name.to_string(),
                        },
                        domain: self.params.domain.clone(),
                    },
                },
                global_dns_settings: GlobalDnsSettings {
                    dns_servers: leases
                        .first()
                        .map(|l| l.dns_servers.clone())
                        .unwrap_or_default(),
                },
                interfaces: unchanged
                    .chain(fixed)
                    .map(|ipv4| InterfaceSpec {
                        adapter: AdapterSpec { ipv4 },
                    })
                    .collect(),
            },
        }
    }

    /// Clone, configure and power on. `created` is set to the new VM id once
    /// the clone has finished.
    async fn provision(
        &self,
        name: &str,
        profile: &VmProfile,
        leases: &[IpLease],
        created: &mut Option<String>,
    ) -> Result<InstanceHandle> {
        let (host, datastore) = self.place(profile).await?;

        let template = self
            .client
            .find_vms(&profile.template)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProvisioningFailed(format!("template {} not found", profile.template)))?;

        let folder = match &self.params.folder {
            Some(f) => self.client.find_folders(f).await?.into_iter().next().map(|f| f.folder),
            None => None,
        };

        let task = self
            .client
            .clone_vm(&CloneRequest {
                name: name.to_string(),
                source: template.vm,
                placement: ClonePlacement {
                    folder,
                    host: host.id.clone(),
                    datastore: datastore.datastore.clone(),
                },
                power_on: false,
            })
            .await?;
        tracing::info!(vm = name, host = %host.name, datastore = %datastore.name, "vsphere: clone started");

        let result = self.wait_task(&task, &format!("clone {name}")).await?;
        let vm = match result.as_ref().and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => self.resolve(name).await?.vm,
        };
        *created = Some(vm.clone());

        let info = self.client.get_vm(&vm).await?;
        self.apply_hardware(&vm, &info, profile).await?;
        if !leases.is_empty() {
            self.client
                .set_customization(&vm, &self.customization(name, 0, leases))
                .await?;
        }
        self.client.power_on(&vm).await?;
        tracing::info!(vm = name, id = %vm, "vsphere: instance created");

        Ok(InstanceHandle {
            id: vm,
            name: name.to_string(),
            host: Some(host.name),
            addresses: leases.iter().map(|l| l.address.to_string()).collect(),
        })
    }

    async fn destroy(&self, vm: &str) -> Result<()> {
        if self.client.power_state(vm).await?.state == VmPower::PoweredOn {
            self.client.power_off(vm).await?;
        }
        self.client.delete_vm(vm).await?;
        Ok(())
    }

    /// Request a guest shutdown and wait for power-off.
    async fn shut_down(&self, vm: &VmSummary) -> Result<()> {
        if let Err(e) = self.client.shutdown_guest(&vm.vm).await {
            tracing::warn!(vm = %vm.name, error = %e, "vsphere: guest shutdown refused");
            return Err(Error::ReconfigureBlocked(vm.name.clone()));
        }

        let waited = poll::wait_for(&self.poll, &format!("shutdown {}", vm.name), || async {
            let power = self.client.power_state(&vm.vm).await?;
            Ok(match power.state {
                VmPower::PoweredOff => Progress::Done(()),
                _ => Progress::Pending,
            })
        })
        .await;

        match waited {
            Err(Error::ProvisioningTimeout { .. }) => Err(Error::ReconfigureBlocked(vm.name.clone())),
            other => other,
        }
    }
}

fn power(state: VmPower) -> PowerState {
    match state {
        VmPower::PoweredOn => PowerState::On,
        VmPower::PoweredOff => PowerState::Off,
        VmPower::Suspended => PowerState::Suspended,
    }
}

#[async_trait]
impl VmDriver for VsphereDriver {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Vsphere
    }

    async fn create_instance(&self, profile: &VmProfile) -> Result<InstanceHandle> {
        let pattern = profile.pattern()?;
        let existing = self.client.list_vms().await?;
        let (_, name) = pattern.first_unused(existing.iter().map(|v| v.name.as_str()));

        let leases = vm::allocate_leases(self.ipam.as_ref(), profile, &name).await?;
        let mut created = None;
        match self.provision(&name, profile, &leases, &mut created).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let destroy = created.as_deref().map(|vm| self.destroy(vm));
                vm::compensate(BackendKind::Vsphere, self.ipam.as_ref(), &name, &leases, &e, destroy).await;
                Err(e)
            }
        }
    }

    async fn delete_instance(&self, name_or_id: &str) -> Result<()> {
        let vm = self.resolve(name_or_id).await?;
        if vm.power_state == VmPower::PoweredOn {
            self.client.power_off(&vm.vm).await?;
        }
        self.client.delete_vm(&vm.vm).await?;
        tracing::info!(vm = %vm.name, id = %vm.vm, "vsphere: instance deleted");
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>> {
        let mut out = Vec::new();
        for vm in self.client.list_vms().await? {
            let info = self.client.get_vm(&vm.vm).await?;
            let snapshots = self.client.list_snapshots(&vm.vm).await?;

            let mut summary = InstanceSummary::new(&vm.vm, &vm.name, power(vm.power_state));
            summary.cpu = Some(info.cpu.count);
            summary.memory_mib = Some(info.memory.size_mib);
            summary.disk_gb = Some(info.disks.values().filter_map(|d| d.capacity).sum::<u64>() / GIB);
            summary.networks = info
                .nics
                .values()
                .filter_map(|n| n.backing.network_name.clone())
                .collect();
            summary.snapshots = snapshots.into_iter().map(|s| s.name).collect();
            summary.host = info.host;
            out.push(summary);
        }
        Ok(out)
    }

    async fn modify_instance(&self, name_or_id: &str, profile: &VmProfile) -> Result<()> {
        let vm = self.resolve(name_or_id).await?;
        if vm.power_state != VmPower::PoweredOff {
            self.shut_down(&vm).await?;
        }

        let info = self.client.get_vm(&vm.vm).await?;
        let mut fresh = Vec::new();
        for action in plan_nics(
            &info
                .nics
                .iter()
                .map(|(k, n)| (k.clone(), n.backing.network_name.clone()))
                .collect::<Vec<_>>(),
            &profile.networks,
        ) {
            if let NicAction::Add { index } = action {
                let vlan = &profile.networks[index].vlan;
                match self.ipam.allocate(vlan, &vm.name).await {
                    Ok(lease) => fresh.push(lease),
                    Err(e) => {
                        vm::release_leases(self.ipam.as_ref(), &fresh).await;
                        return Err(e);
                    }
                }
            }
        }

        let mut applied = self.apply_hardware(&vm.vm, &info, profile).await;
        if applied.is_ok() && !fresh.is_empty() {
            let spec = self.customization(&vm.name, info.nics.len(), &fresh);
            applied = self.client.set_customization(&vm.vm, &spec).await.map_err(Error::from);
        }
        if let Err(e) = applied {
            vm::release_leases(self.ipam.as_ref(), &fresh).await;
            return Err(e);
        }
        for lease in &fresh {
            tracing::info!(vm = %vm.name, address = %lease.address, vlan = %lease.vlan, "vsphere: adapter added");
        }
        tracing::info!(vm = %vm.name, "vsphere: instance reconfigured");
        Ok(())
    }

    async fn snapshot_instance(&self, name_or_id: &str, name: Option<&str>) -> Result<SnapshotInfo> {
        let vm = self.resolve(name_or_id).await?;
        let snapshot = name
            .map(str::to_string)
            .unwrap_or_else(|| vm::default_snapshot_name(&vm.name));

        let task = self
            .client
            .create_snapshot(
                &vm.vm,
                &SnapshotRequest {
                    name: snapshot.clone(),
                    description: "created by sitectl".into(),
                    memory: false,
                    quiesce: false,
                },
            )
            .await?;
        let result = self.wait_task(&task, &format!("snapshot {}", vm.name)).await?;
        tracing::info!(vm = %vm.name, snapshot = %snapshot, "vsphere: snapshot taken");

        Ok(SnapshotInfo {
            instance: vm.name,
            name: snapshot,
            id: result.and_then(|v| v.as_str().map(str::to_string)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeIpam, FakeServer};
    use axum::Json;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::{get, patch, post};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn host(id: &str, cpu: u64, memory: u64) -> HostCandidate {
        HostCandidate {
            id: id.into(),
            name: id.into(),
            cpu_usage: cpu,
            memory_usage: memory,
        }
    }

    fn ds(name: &str, free_gb: u64, capacity_gb: u64) -> DatastoreSummary {
        DatastoreSummary {
            datastore: name.into(),
            name: name.into(),
            kind: None,
            free_space: free_gb * GIB,
            capacity: capacity_gb * GIB,
        }
    }

    #[test]
    fn host_pick_requires_both_minima() {
        // h2 beats h1 on both; h3 is lower on cpu only and never replaces h2.
        let hosts = [host("h1", 500, 800), host("h2", 400, 700), host("h3", 100, 900)];
        assert_eq!(select_host(&hosts).unwrap().id, "h2");
    }

    #[test]
    fn host_pick_last_strict_improvement_wins() {
        let hosts = [
            host("h1", 900, 900),
            host("h2", 300, 950),
            host("h3", 800, 800),
            host("h4", 700, 100),
        ];
        // h2 fails memory, h3 improves both, h4 improves both again.
        assert_eq!(select_host(&hosts).unwrap().id, "h4");

        // The first host is picked against infinite minima even if it is the
        // worst by one axis; nothing later is strictly lower on both.
        let hosts = [host("a", 100, 900), host("b", 50, 950), host("c", 200, 100)];
        assert_eq!(select_host(&hosts).unwrap().id, "a");
        assert!(select_host(&[]).is_none());
    }

    #[test]
    fn datastore_pick_keeps_twenty_percent_headroom() {
        // remaining: a = 300-100-70 = 130, b = 250-20-70 = 160, c = 80-20-70 < 0
        let stores = [ds("a", 300, 500), ds("b", 250, 100), ds("c", 80, 100)];
        assert_eq!(select_datastore(&stores, 70).unwrap().name, "b");
        assert_eq!(remaining_after(&stores[2], 70 * GIB), -10 * GIB as i128);

        assert!(select_datastore(&[ds("tiny", 90, 100)], 71).is_none());
        assert_eq!(select_datastore(&[ds("exact", 90, 100)], 70).unwrap().name, "exact");
    }

    #[test]
    fn disk_plan_matches_labels_then_position() {
        let existing = vec![
            ("2001".to_string(), "data".to_string(), 10 * GIB),
            ("2000".to_string(), "Hard disk 1".to_string(), 40 * GIB),
        ];
        let wanted = vec![
            DiskSpec { name: "root".into(), size_gb: 50 },
            DiskSpec { name: "data".into(), size_gb: 20 },
            DiskSpec { name: "logs".into(), size_gb: 5 },
        ];
        assert_eq!(
            plan_disks(&existing, &wanted),
            vec![
                DiskAction::Resize { key: "2000".into(), capacity: 50 * GIB },
                DiskAction::Resize { key: "2001".into(), capacity: 20 * GIB },
                DiskAction::Add { name: "logs".into(), capacity: 5 * GIB },
            ]
        );

        // Never shrinks.
        let smaller = vec![DiskSpec { name: "root".into(), size_gb: 30 }];
        assert!(plan_disks(&existing[1..], &smaller).is_empty());
    }

    #[test]
    fn nic_plan_repoints_then_adds() {
        let existing = vec![
            ("4000".to_string(), Some("tmpl-pg".to_string())),
            ("4001".to_string(), Some("backup-pg".to_string())),
        ];
        let wanted = vec![
            NetworkSpec { name: "prod-pg".into(), vlan: "prod".into() },
            NetworkSpec { name: "backup-pg".into(), vlan: "backup".into() },
            NetworkSpec { name: "mgmt-pg".into(), vlan: "mgmt".into() },
        ];
        assert_eq!(
            plan_nics(&existing, &wanted),
            vec![
                NicAction::Repoint { key: "4000".into(), index: 0 },
                NicAction::Add { index: 2 },
            ]
        );
    }

    fn quick() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(5), Duration::from_millis(60))
    }

    fn cred() -> Credential {
        Credential::new([
            ("username".to_string(), "svc".to_string()),
            ("password".to_string(), "pw".to_string()),
        ])
    }

    fn params(url: String) -> VsphereParams {
        VsphereParams {
            url,
            folder: None,
            domain: Some("corp.example".into()),
            insecure: false,
        }
    }

    fn profile() -> VmProfile {
        VmProfile::from_yaml(
            "web",
            r#"
hostname: "web{index:02d}"
cpu: 4
memory_mib: 8192
template: ubuntu-tpl
disks:
  - { name: root, size_gb: 50 }
  - { name: data, size_gb: 20 }
networks:
  - { name: prod-pg, vlan: prod }
"#,
        )
        .unwrap()
    }

    fn vm_list() -> Value {
        json!([
            {"vm": "vm-1", "name": "web01", "power_state": "POWERED_ON", "cpu_count": 2, "memory_size_MiB": 4096},
            {"vm": "vm-9", "name": "ubuntu-tpl", "power_state": "POWERED_OFF"}
        ])
    }

    fn base_router() -> axum::Router {
        axum::Router::new()
            .route("/api/session", post(|| async { Json(json!("sess-1")) }))
            .route(
                "/api/vcenter/vm",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let all = vm_list();
                    match q.get("names") {
                        Some(name) => Json(Value::Array(
                            all.as_array()
                                .unwrap()
                                .iter()
                                .filter(|v| v["name"] == name.as_str())
                                .cloned()
                                .collect(),
                        )),
                        None => Json(all),
                    }
                }),
            )
            .route(
                "/api/vcenter/vm/{vm}/power",
                get(|| async { Json(json!({"state": "POWERED_ON"})) })
                    .post(|| async { StatusCode::NO_CONTENT }),
            )
            .route(
                "/api/vcenter/vm/{vm}/guest/power",
                post(|| async { StatusCode::NO_CONTENT }),
            )
    }

    #[tokio::test]
    async fn test_running_vm_that_never_stops_is_not_reconfigured() {
        let server = FakeServer::start(base_router()).await;
        let ipam = Arc::new(FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24));
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam.clone(), quick())
            .await
            .unwrap();

        let err = driver.modify_instance("web01", &profile()).await.unwrap_err();

        assert!(matches!(err, Error::ReconfigureBlocked(ref n) if n == "web01"));
        let shutdowns = server.requests_to("POST", "/api/vcenter/vm/vm-1/guest/power");
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(shutdowns[0].query_param("action").as_deref(), Some("shutdown"));
        assert!(server.hits("GET", "/api/vcenter/vm/vm-1/power") >= 1);
        assert_eq!(server.hits_containing("/hardware"), 0);
        assert!(ipam.allocated().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_vm_sends_no_delete() {
        let server = FakeServer::start(base_router()).await;
        let ipam = Arc::new(FakeIpam::default());
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam, quick())
            .await
            .unwrap();

        let err = driver.delete_instance("web77").await.unwrap_err();

        assert!(matches!(err, Error::InstanceNotFound(ref n) if n == "web77"));
        assert!(server.requests().iter().all(|r| r.method != "DELETE"));
    }

    fn create_router(task: Value) -> axum::Router {
        create_router_with(task, StatusCode::NO_CONTENT)
    }

    fn create_router_with(task: Value, customization: StatusCode) -> axum::Router {
        base_router()
            .route("/api/vcenter/vm", post(|| async { Json(json!("task-1")) }))
            .route(
                "/api/vcenter/host",
                get(|| async {
                    Json(json!([
                        {"host": "host-1", "name": "esx01", "connection_state": "CONNECTED"},
                        {"host": "host-2", "name": "esx02", "connection_state": "CONNECTED"},
                        {"host": "host-3", "name": "esx03", "connection_state": "NOT_RESPONDING"}
                    ]))
                }),
            )
            .route(
                "/api/vcenter/host/{host}/quick-stats",
                get(|axum::extract::Path(host): axum::extract::Path<String>| async move {
                    let (cpu, mem) = if host == "host-2" { (100, 100) } else { (900, 900) };
                    Json(json!({"overall_cpu_usage": cpu, "overall_memory_usage": mem}))
                }),
            )
            .route(
                "/api/vcenter/datastore",
                get(|| async {
                    Json(json!([
                        {"datastore": "ds-1", "name": "small", "free_space": 60u64 * GIB, "capacity": 100u64 * GIB},
                        {"datastore": "ds-2", "name": "big", "free_space": 900u64 * GIB, "capacity": 1000u64 * GIB}
                    ]))
                }),
            )
            .route("/api/vcenter/vm/{vm}/hardware/cpu", patch(|| async { StatusCode::NO_CONTENT }))
            .route("/api/vcenter/vm/{vm}/hardware/memory", patch(|| async { StatusCode::NO_CONTENT }))
            .route(
                "/api/vcenter/vm/{vm}/hardware/disk/{disk}",
                patch(|| async { StatusCode::NO_CONTENT }),
            )
            .route("/api/vcenter/vm/{vm}/hardware/disk", post(|| async { Json(json!("2001")) }))
            .route(
                "/api/vcenter/vm/{vm}/hardware/ethernet/{nic}",
                patch(|| async { StatusCode::NO_CONTENT }),
            )
            .route("/api/vcenter/vm/{vm}/hardware/ethernet", post(|| async { Json(json!("4001")) }))
            .route(
                "/api/vcenter/network",
                get(|| async { Json(json!([{"network": "net-7", "name": "prod-pg", "type": "STANDARD_PORTGROUP"}])) }),
            )
            .route(
                "/api/vcenter/vm/{vm}/guest/customization",
                axum::routing::put(move || async move { customization }),
            )
            .route(
                "/api/cis/tasks/{task}",
                get(move || {
                    let body = task.clone();
                    async move { Json(body) }
                }),
            )
            .route(
                "/api/vcenter/vm/{vm}",
                get(|| async {
                    Json(json!({
                        "name": "web02",
                        "power_state": "POWERED_OFF",
                        "cpu": {"count": 2},
                        "memory": {"size_MiB": 4096},
                        "disks": {"2000": {"label": "Hard disk 1", "capacity": 16u64 * GIB}},
                        "nics": {"4000": {"label": "Network adapter 1",
                                          "backing": {"type": "STANDARD_PORTGROUP", "network_name": "tmpl-pg"}}}
                    }))
                })
                .delete(|| async { StatusCode::NO_CONTENT }),
            )
    }

    #[tokio::test]
    async fn test_create_places_clones_and_reconfigures() {
        let router = create_router(json!({"status": "SUCCEEDED", "result": "vm-2"}));
        let server = FakeServer::start(router).await;
        let ipam = Arc::new(FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24));
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam.clone(), quick())
            .await
            .unwrap();

        let handle = driver.create_instance(&profile()).await.unwrap();

        assert_eq!(handle.name, "web02");
        assert_eq!(handle.id, "vm-2");
        assert_eq!(handle.host.as_deref(), Some("esx02"));
        assert_eq!(handle.addresses, vec!["10.20.0.11"]);

        let clone = &server.requests_to("POST", "/api/vcenter/vm")[0];
        assert_eq!(clone.query_param("action").as_deref(), Some("clone"));
        let body = clone.json();
        assert_eq!(body["name"], "web02");
        assert_eq!(body["source"], "vm-9");
        assert_eq!(body["placement"]["host"], "host-2");
        assert_eq!(body["placement"]["datastore"], "ds-2");
        assert_eq!(body["power_on"], false);
        assert_eq!(server.hits("GET", "/api/vcenter/host/host-3/quick-stats"), 0);

        // 2 disks: the template disk grown to 50 GB plus one new 20 GB disk.
        let resize = server.requests_to("PATCH", "/api/vcenter/vm/vm-2/hardware/disk/2000");
        assert_eq!(resize.len(), 1);
        assert_eq!(resize[0].json()["capacity"], 50 * GIB);
        let added = server.requests_to("POST", "/api/vcenter/vm/vm-2/hardware/disk");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].json()["new_vmdk"]["capacity"], 20 * GIB);

        // 1 network: the template adapter re-pointed at prod-pg.
        let nic = server.requests_to("PATCH", "/api/vcenter/vm/vm-2/hardware/ethernet/4000");
        assert_eq!(nic[0].json()["backing"]["network"], "net-7");
        assert_eq!(server.hits("POST", "/api/vcenter/vm/vm-2/hardware/ethernet"), 0);

        let custom = &server.requests_to("PUT", "/api/vcenter/vm/vm-2/guest/customization")[0];
        let spec = &custom.json()["spec"];
        assert_eq!(spec["interfaces"][0]["adapter"]["ipv4"]["ip_address"], "10.20.0.11");
        assert_eq!(spec["interfaces"][0]["adapter"]["ipv4"]["prefix"], 24);
        assert_eq!(spec["configuration_spec"]["linux_config"]["hostname"]["fixed_name"], "web02");

        let power_on = server.requests_to("POST", "/api/vcenter/vm/vm-2/power");
        assert_eq!(power_on[0].query_param("action").as_deref(), Some("start"));
        assert!(ipam.released().is_empty());
    }

    #[tokio::test]
    async fn test_failed_clone_is_cleaned_up() {
        let router = create_router(json!({"status": "FAILED", "error": {"messages": ["datastore busy"]}}));
        let server = FakeServer::start(router).await;
        let ipam = Arc::new(FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24));
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam.clone(), quick())
            .await
            .unwrap();

        let err = driver.create_instance(&profile()).await.unwrap_err();

        assert!(matches!(err, Error::ProvisioningFailed(ref m) if m.contains("datastore busy")));
        assert_eq!(ipam.released(), ipam.allocated());
        assert_eq!(ipam.released().len(), 1);
        // web01 (vm-1) is someone else's; nothing was cloned, so nothing is removed.
        assert!(server.requests().iter().all(|r| r.method != "DELETE"));
        assert_eq!(server.hits("POST", "/api/vcenter/vm/vm-1/power"), 0);
    }

    #[tokio::test]
    async fn test_failure_after_clone_destroys_only_the_clone() {
        let router = create_router_with(
            json!({"status": "SUCCEEDED", "result": "vm-2"}),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        let server = FakeServer::start(router).await;
        let ipam = Arc::new(FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24));
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam.clone(), quick())
            .await
            .unwrap();

        let err = driver.create_instance(&profile()).await.unwrap_err();

        assert!(matches!(err, Error::Vsphere(_)), "{err:?}");
        let deletes: Vec<String> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == "DELETE")
            .map(|r| r.path)
            .collect();
        assert_eq!(deletes, vec!["/api/vcenter/vm/vm-2"]);
        assert_eq!(ipam.released(), ipam.allocated());
    }

    #[tokio::test]
    async fn test_modify_customizes_added_adapter() {
        let server = FakeServer::start(create_router(json!({"status": "SUCCEEDED"}))).await;
        let ipam = Arc::new(
            FakeIpam::default()
                .with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24)
                .with_vlan("backup", "9", Ipv4Addr::new(10, 40, 0, 5), 24),
        );
        let driver = VsphereDriver::connect("vc01", &params(server.url()), &cred(), ipam.clone(), quick())
            .await
            .unwrap();
        let mut profile = profile();
        profile.networks.push(NetworkSpec {
            name: "backup-pg".into(),
            vlan: "backup".into(),
        });

        driver.modify_instance("vm-9", &profile).await.unwrap();

        assert_eq!(server.hits("POST", "/api/vcenter/vm/vm-9/hardware/ethernet"), 1);
        assert_eq!(ipam.allocated().len(), 1);
        assert_eq!(ipam.allocated()[0].vlan, "backup");

        let custom = &server.requests_to("PUT", "/api/vcenter/vm/vm-9/guest/customization")[0];
        let interfaces = custom.json()["spec"]["interfaces"].clone();
        assert_eq!(interfaces.as_array().unwrap().len(), 2);
        assert_eq!(interfaces[0]["adapter"]["ipv4"]["type"], "UNCHANGED");
        assert_eq!(interfaces[1]["adapter"]["ipv4"]["type"], "STATIC");
        assert_eq!(interfaces[1]["adapter"]["ipv4"]["ip_address"], "10.40.0.5");
        assert!(interfaces[1]["adapter"]["ipv4"].get("gateways").is_none());
        assert!(ipam.released().is_empty());
    }
}
