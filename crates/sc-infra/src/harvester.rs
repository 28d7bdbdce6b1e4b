use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use harvester_api::{
    ClaimRef, CloudInitNoCloud, Cpu, DataVolumeSpec, DataVolumeTemplate, Devices, Disk, DiskTarget,
    Domain, GuestMemory, HarvesterClient, InstanceSpec, InstanceTemplate, Interface, Multus, Network,
    ObjectMeta, PvcSpec, ResourceRequirements, VirtualMachine, VirtualMachineBackup,
    VirtualMachineSpec, Volume,
};
use serde_json::json;

use crate::config::HarvesterParams;
use crate::ipam::IpAllocator;
use crate::poll::{self, PollPolicy, Progress};
use crate::profile::{DiskSpec, NetworkSpec, VmProfile};
use crate::secrets::Credential;
use crate::types::{InstanceHandle, InstanceSummary, IpLease, PowerState, SnapshotInfo};
use crate::vm::{self, VmDriver};
use crate::{BackendKind, Error, Result};

const IMAGE_ANNOTATION: &str = "harvesterhci.io/imageId";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const CLOUD_INIT_DISK: &str = "cloudinitdisk";

fn claim_name(vm: &str, disk: &str) -> String {
    format!("{vm}-{disk}")
}

fn interface_name(index: usize) -> String {
    format!("nic-{index}")
}

/// Outcome of one status poll.
pub fn classify(vm: &VirtualMachine) -> Progress<()> {
    let ready = vm.status.as_ref().and_then(|s| s.ready).unwrap_or(false);
    match vm.printable_status() {
        Some("Running") => Progress::Done(()),
        Some(s) if s.starts_with("Error") || s == "CrashLoopBackOff" => {
            Progress::Failed(format!("{} entered {s}", vm.metadata.name))
        }
        _ if ready => Progress::Done(()),
        _ => Progress::Pending,
    }
}

fn power(vm: &VirtualMachine) -> PowerState {
    match vm.printable_status() {
        Some("Running") => PowerState::On,
        Some("Stopped") => PowerState::Off,
        Some("Paused") => PowerState::Suspended,
        Some("Starting" | "Provisioning" | "WaitingForVolumeBinding") => PowerState::Starting,
        Some(s) if s.starts_with("Error") || s == "CrashLoopBackOff" => PowerState::Error,
        _ => PowerState::Unknown,
    }
}

fn instance_id(vm: &VirtualMachine) -> &str {
    vm.metadata
        .extra
        .get("uid")
        .and_then(|v| v.as_str())
        .unwrap_or(&vm.metadata.name)
}

fn ethernet(lease: &IpLease, with_gateway: bool) -> serde_json::Value {
    let mut eth = json!({
        "addresses": [lease.cidr()],
        "nameservers": {"addresses": lease.dns_servers},
    });
    if let (true, Some(gw)) = (with_gateway, lease.gateway) {
        eth["gateway4"] = json!(gw.to_string());
    }
    eth
}

fn render(doc: &serde_json::Value) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::ProvisioningFailed(format!("render network data: {e}")))
}

/// Cloud-init network config (version 2) for the leases, one ethernet per
/// lease in adapter order.
pub fn network_data(leases: &[IpLease]) -> Result<String> {
    let mut ethernets = serde_json::Map::new();
    for (i, lease) in leases.iter().enumerate() {
        ethernets.insert(format!("eth{i}"), ethernet(lease, i == 0));
    }
    render(&json!({"version": 2, "ethernets": ethernets}))
}

/// `existing` network config with `fresh` appended as `eth{offset}` onward.
/// Only the first interface of an empty config gets a gateway.
pub fn extend_network_data(existing: Option<&str>, offset: usize, fresh: &[IpLease]) -> Result<String> {
    let mut doc: serde_json::Value = match existing {
        Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)
            .map_err(|e| Error::ProvisioningFailed(format!("parse network data: {e}")))?,
        _ => json!({"version": 2}),
    };
    if !doc.is_object() {
        return Err(Error::ProvisioningFailed("network data is not a mapping".into()));
    }
    if !doc["ethernets"].is_object() {
        doc["ethernets"] = json!({});
    }
    let Some(ethernets) = doc["ethernets"].as_object_mut() else {
        return Err(Error::ProvisioningFailed("network data is not a mapping".into()));
    };
    for (i, lease) in fresh.iter().enumerate() {
        let with_gateway = ethernets.is_empty();
        ethernets.insert(format!("eth{}", offset + i), ethernet(lease, with_gateway));
    }
    render(&doc)
}

fn user_data(hostname: &str) -> String {
    format!("#cloud-config\nhostname: {hostname}\npreserve_hostname: false\n")
}

/// Data volume template for one disk; `image` is set for the boot disk.
fn data_volume(vm: &str, disk: &DiskSpec, image: Option<&str>, storage_class: Option<&str>) -> DataVolumeTemplate {
    let mut annotations = BTreeMap::new();
    if let Some(image) = image {
        annotations.insert(IMAGE_ANNOTATION.to_string(), image.to_string());
    }
    DataVolumeTemplate {
        metadata: ObjectMeta {
            name: claim_name(vm, &disk.name),
            annotations,
            ..Default::default()
        },
        spec: DataVolumeSpec {
            pvc: PvcSpec {
                access_modes: vec!["ReadWriteMany".into()],
                volume_mode: Some("Block".into()),
                storage_class_name: storage_class.map(str::to_string),
                resources: ResourceRequirements {
                    requests: BTreeMap::from([("storage".to_string(), format!("{}Gi", disk.size_gb))]),
                    limits: BTreeMap::new(),
                },
            },
            extra: Default::default(),
        },
    }
}

fn disk_device(name: &str, boot_order: Option<u32>) -> Disk {
    Disk {
        name: name.to_string(),
        disk: Some(DiskTarget { bus: "virtio".into() }),
        boot_order,
    }
}

fn claim_volume(name: &str, claim: String) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(ClaimRef { claim_name: claim }),
        ..Default::default()
    }
}

fn multus_pair(index: usize, net: &NetworkSpec) -> (Network, Interface) {
    let name = interface_name(index);
    (
        Network {
            name: name.clone(),
            multus: Some(Multus {
                network_name: net.name.clone(),
            }),
            pod: None,
        },
        Interface {
            name,
            model: Some("virtio".into()),
            bridge: Some(json!({})),
            mac_address: None,
        },
    )
}

/// KubeVirt manifest for a new instance: one data volume and disk per disk
/// spec, one multus network and interface per network spec.
pub fn build_vm(
    name: &str,
    namespace: &str,
    profile: &VmProfile,
    leases: &[IpLease],
    storage_class: Option<&str>,
) -> Result<VirtualMachine> {
    let mut devices = Devices::default();
    let mut volumes = Vec::new();
    let mut templates = Vec::new();

    for (i, disk) in profile.disks.iter().enumerate() {
        let image = (i == 0).then_some(profile.template.as_str());
        templates.push(data_volume(name, disk, image, storage_class));
        devices
            .disks
            .push(disk_device(&disk.name, (i == 0).then_some(1)));
        volumes.push(claim_volume(&disk.name, claim_name(name, &disk.name)));
    }
    devices.disks.push(disk_device(CLOUD_INIT_DISK, None));
    volumes.push(Volume {
        name: CLOUD_INIT_DISK.into(),
        cloud_init_no_cloud: Some(CloudInitNoCloud {
            user_data: Some(user_data(name)),
            network_data: Some(network_data(leases)?),
        }),
        ..Default::default()
    });

    let mut networks = Vec::new();
    for (i, net) in profile.networks.iter().enumerate() {
        let (network, interface) = multus_pair(i, net);
        networks.push(network);
        devices.interfaces.push(interface);
    }

    let memory = format!("{}Mi", profile.memory_mib);
    let metadata = ObjectMeta {
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        labels: BTreeMap::from([(MANAGED_BY.to_string(), "sitectl".to_string())]),
        ..Default::default()
    };
    let spec = VirtualMachineSpec {
        run_strategy: Some("RerunOnFailure".into()),
        data_volume_templates: templates,
        template: InstanceTemplate {
            metadata: None,
            spec: InstanceSpec {
                domain: Domain {
                    cpu: Cpu {
                        cores: profile.cpu,
                        sockets: Some(1),
                        threads: Some(1),
                    },
                    memory: Some(GuestMemory {
                        guest: memory.clone(),
                    }),
                    resources: ResourceRequirements {
                        requests: BTreeMap::from([("memory".to_string(), memory)]),
                        limits: BTreeMap::new(),
                    },
                    devices,
                    extra: Default::default(),
                },
                networks,
                volumes,
                extra: Default::default(),
            },
        },
        extra: Default::default(),
    };
    Ok(VirtualMachine::new(metadata, spec))
}

/// Set CPU and memory, grow or add disks and append `missing` networks on
/// an existing manifest.
fn apply_profile(
    vm: &mut VirtualMachine,
    profile: &VmProfile,
    missing: &[&NetworkSpec],
    fresh: &[IpLease],
    storage_class: Option<&str>,
) -> Result<()> {
    let name = vm.metadata.name.clone();
    let memory = format!("{}Mi", profile.memory_mib);
    let domain = &mut vm.spec.template.spec.domain;
    domain.cpu.cores = profile.cpu;
    domain.memory = Some(GuestMemory {
        guest: memory.clone(),
    });
    domain.resources.requests.insert("memory".into(), memory);

    for (i, disk) in profile.disks.iter().enumerate() {
        let claim = claim_name(&name, &disk.name);
        let wanted = u64::from(disk.size_gb);
        match vm
            .spec
            .data_volume_templates
            .iter_mut()
            .find(|t| t.metadata.name == claim)
        {
            Some(t) => {
                let current = t
                    .spec
                    .pvc
                    .resources
                    .requests
                    .get("storage")
                    .and_then(|q| harvester_api::quantity_gib(q))
                    .unwrap_or(0);
                if current < wanted {
                    t.spec
                        .pvc
                        .resources
                        .requests
                        .insert("storage".into(), format!("{wanted}Gi"));
                }
            }
            None => {
                let image = (i == 0 && vm.spec.data_volume_templates.is_empty())
                    .then_some(profile.template.as_str());
                vm.spec
                    .data_volume_templates
                    .push(data_volume(&name, disk, image, storage_class));
                let spec = &mut vm.spec.template.spec;
                spec.domain.devices.disks.push(disk_device(&disk.name, None));
                spec.volumes.push(claim_volume(&disk.name, claim));
            }
        }
    }

    let spec = &mut vm.spec.template.spec;
    let offset = spec.networks.len();
    for (i, net) in missing.iter().enumerate() {
        let (network, interface) = multus_pair(offset + i, net);
        spec.networks.push(network);
        spec.domain.devices.interfaces.push(interface);
    }
    if fresh.is_empty() {
        return Ok(());
    }

    match spec
        .volumes
        .iter_mut()
        .find_map(|v| v.cloud_init_no_cloud.as_mut())
    {
        Some(cloud_init) => {
            cloud_init.network_data = Some(extend_network_data(
                cloud_init.network_data.as_deref(),
                offset,
                fresh,
            )?);
        }
        None => {
            spec.domain.devices.disks.push(disk_device(CLOUD_INIT_DISK, None));
            spec.volumes.push(Volume {
                name: CLOUD_INIT_DISK.into(),
                cloud_init_no_cloud: Some(CloudInitNoCloud {
                    user_data: Some(user_data(&name)),
                    network_data: Some(extend_network_data(None, offset, fresh)?),
                }),
                ..Default::default()
            });
        }
    }
    Ok(())
}

fn attached_networks(vm: &VirtualMachine) -> Vec<&str> {
    vm.spec
        .template
        .spec
        .networks
        .iter()
        .filter_map(|n| n.multus.as_ref().map(|m| m.network_name.as_str()))
        .collect()
}

pub struct HarvesterDriver {
    host: String,
    client: HarvesterClient,
    storage_class: Option<String>,
    ipam: Arc<dyn IpAllocator>,
    poll: PollPolicy,
}

impl HarvesterDriver {
    pub fn new(
        host: &str,
        params: &HarvesterParams,
        cred: &Credential,
        ipam: Arc<dyn IpAllocator>,
        poll: PollPolicy,
    ) -> Result<Self> {
        let client = HarvesterClient::new(
            &params.url,
            cred.require("token")?,
            &params.namespace,
            params.insecure,
        )?;
        Ok(Self {
            host: host.to_string(),
            client,
            storage_class: params.storage_class.clone(),
            ipam,
            poll,
        })
    }

    async fn resolve(&self, name_or_id: &str) -> Result<VirtualMachine> {
        let vms = self.client.list_vms().await?;
        vm::find_by_name_or_id(&vms, name_or_id, |v| (&v.metadata.name, instance_id(v)))
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(name_or_id.to_string()))
    }

    /// Submit and wait for the instance. `created` is set once the API has
    /// accepted the manifest.
    async fn provision(
        &self,
        name: &str,
        profile: &VmProfile,
        leases: &[IpLease],
        created: &mut Option<String>,
    ) -> Result<InstanceHandle> {
        let manifest = build_vm(
            name,
            self.client.namespace(),
            profile,
            leases,
            self.storage_class.as_deref(),
        )?;
        let submitted = self.client.create_vm(&manifest).await?;
        *created = Some(submitted.metadata.name.clone());
        tracing::info!(vm = name, namespace = self.client.namespace(), "harvester: vm submitted");

        poll::wait_for(&self.poll, &format!("start {name}"), || async {
            let vm = self.client.get_vm(name).await?;
            Ok(classify(&vm))
        })
        .await?;

        tracing::info!(vm = name, "harvester: instance running");
        Ok(InstanceHandle {
            id: instance_id(&submitted).to_string(),
            name: name.to_string(),
            host: None,
            addresses: leases.iter().map(|l| l.address.to_string()).collect(),
        })
    }
}

#[async_trait]
impl VmDriver for HarvesterDriver {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Harvester
    }

    async fn create_instance(&self, profile: &VmProfile) -> Result<InstanceHandle> {
        let pattern = profile.pattern()?;
        let existing = self.client.list_vms().await?;
        let (_, name) = pattern.first_unused(existing.iter().map(|v| v.metadata.name.as_str()));

        let leases = vm::allocate_leases(self.ipam.as_ref(), profile, &name).await?;
        let mut created = None;
        match self.provision(&name, profile, &leases, &mut created).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let destroy = created
                    .as_deref()
                    .map(|vm| async move { self.client.delete_vm(vm).await.map_err(Error::from) });
                vm::compensate(BackendKind::Harvester, self.ipam.as_ref(), &name, &leases, &e, destroy).await;
                Err(e)
            }
        }
    }

    async fn delete_instance(&self, name_or_id: &str) -> Result<()> {
        let vm = self.resolve(name_or_id).await?;
        self.client.delete_vm(&vm.metadata.name).await?;
        tracing::info!(vm = %vm.metadata.name, "harvester: instance deleted");
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>> {
        let mut snapshots: HashMap<String, Vec<String>> = HashMap::new();
        for backup in self.client.list_backups().await? {
            snapshots
                .entry(backup.spec.source.name)
                .or_default()
                .push(backup.metadata.name);
        }

        let vms = self.client.list_vms().await?;
        Ok(vms
            .iter()
            .map(|vm| {
                let domain = &vm.spec.template.spec.domain;
                let mut summary = InstanceSummary::new(instance_id(vm), &vm.metadata.name, power(vm));
                summary.cpu = Some(domain.cpu.cores);
                summary.memory_mib = domain
                    .memory
                    .as_ref()
                    .map(|m| m.guest.as_str())
                    .or_else(|| domain.resources.requests.get("memory").map(String::as_str))
                    .and_then(harvester_api::quantity_mib);
                summary.disk_gb = Some(
                    vm.spec
                        .data_volume_templates
                        .iter()
                        .filter_map(|t| t.spec.pvc.resources.requests.get("storage"))
                        .filter_map(|q| harvester_api::quantity_gib(q))
                        .sum(),
                );
                summary.networks = attached_networks(vm).into_iter().map(str::to_string).collect();
                summary.snapshots = snapshots.remove(&vm.metadata.name).unwrap_or_default();
                summary
            })
            .collect())
    }

    async fn modify_instance(&self, name_or_id: &str, profile: &VmProfile) -> Result<()> {
        let found = self.resolve(name_or_id).await?;
        let mut vm = self.client.get_vm(&found.metadata.name).await?;
        let name = vm.metadata.name.clone();

        let attached = attached_networks(&vm);
        let missing: Vec<&NetworkSpec> = profile
            .networks
            .iter()
            .filter(|n| !attached.contains(&n.name.as_str()))
            .collect();

        let mut fresh = Vec::with_capacity(missing.len());
        for net in &missing {
            match self.ipam.allocate(&net.vlan, &name).await {
                Ok(lease) => fresh.push(lease),
                Err(e) => {
                    vm::release_leases(self.ipam.as_ref(), &fresh).await;
                    return Err(e);
                }
            }
        }

        let replaced = match apply_profile(&mut vm, profile, &missing, &fresh, self.storage_class.as_deref()) {
            Ok(()) => self.client.replace_vm(&vm).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = replaced {
            vm::release_leases(self.ipam.as_ref(), &fresh).await;
            return Err(e);
        }

        for lease in &fresh {
            tracing::info!(vm = %name, address = %lease.address, vlan = %lease.vlan, "harvester: network added");
        }
        tracing::info!(vm = %name, "harvester: spec updated, applies on next restart");
        Ok(())
    }

    async fn snapshot_instance(&self, name_or_id: &str, name: Option<&str>) -> Result<SnapshotInfo> {
        let vm = self.resolve(name_or_id).await?;
        let snapshot = name
            .map(str::to_string)
            .unwrap_or_else(|| vm::default_snapshot_name(&vm.metadata.name));

        let created = self
            .client
            .create_backup(&VirtualMachineBackup::snapshot(&snapshot, &vm.metadata.name))
            .await?;
        tracing::info!(vm = %vm.metadata.name, snapshot = %snapshot, "harvester: snapshot requested");

        Ok(SnapshotInfo {
            instance: vm.metadata.name,
            name: snapshot,
            id: created
                .metadata
                .extra
                .get("uid")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}
