use serde::Deserialize;

use crate::Params;

// ── Virtual machines ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub displayname: Option<String>,
    pub state: String,
    #[serde(default)]
    pub cpunumber: Option<u32>,
    /// MiB.
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub templatename: Option<String>,
    #[serde(default)]
    pub serviceofferingid: Option<String>,
    #[serde(default)]
    pub zoneid: Option<String>,
    #[serde(default)]
    pub nic: Vec<Nic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nic {
    pub id: String,
    pub networkid: String,
    #[serde(default)]
    pub networkname: Option<String>,
    #[serde(default)]
    pub ipaddress: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVirtualMachines {
    #[serde(default)]
    pub virtualmachine: Vec<VirtualMachine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachineEnvelope {
    pub virtualmachine: VirtualMachine,
}

/// One `iptonetworklist[n]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicPlacement {
    pub network_id: String,
    pub ip: Option<String>,
}

/// Parameters for `deployVirtualMachine` with a custom-sized offering.
#[derive(Debug, Clone)]
pub struct DeployVirtualMachine {
    pub service_offering_id: String,
    pub template_id: String,
    pub zone_id: String,
    pub name: String,
    pub display_name: String,
    pub cpu: u32,
    pub memory_mib: u64,
    pub root_disk_size_gb: Option<u32>,
    pub nics: Vec<NicPlacement>,
    pub start: bool,
}

impl DeployVirtualMachine {
    pub fn to_params(&self) -> Params {
        let mut params = Params::new()
            .set("serviceofferingid", &self.service_offering_id)
            .set("templateid", &self.template_id)
            .set("zoneid", &self.zone_id)
            .set("name", &self.name)
            .set("displayname", &self.display_name)
            .set("startvm", self.start)
            .set("details[0].cpuNumber", self.cpu)
            .set("details[0].memory", self.memory_mib)
            .set_opt("rootdisksize", self.root_disk_size_gb);

        for (i, nic) in self.nics.iter().enumerate() {
            params = params
                .set(format!("iptonetworklist[{i}].networkid"), &nic.network_id)
                .set_opt(format!("iptonetworklist[{i}].ip"), nic.ip.as_deref());
        }
        params
    }
}

// ── Async jobs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AsyncJob {
    pub jobid: String,
    /// Id of the created/affected resource, when the command has one.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AsyncJobResult {
    pub jobstatus: i32,
    #[serde(default)]
    pub jobresultcode: Option<i32>,
    #[serde(default)]
    pub jobresult: Option<serde_json::Value>,
    #[serde(default)]
    pub jobinstanceid: Option<String>,
}

impl AsyncJobResult {
    pub fn status(&self) -> JobStatus {
        match self.jobstatus {
            0 => JobStatus::Pending,
            1 => JobStatus::Succeeded,
            _ => JobStatus::Failed,
        }
    }

    /// `jobresult.errortext`, falling back to the raw result.
    pub fn error_text(&self) -> String {
        match &self.jobresult {
            Some(result) => result
                .get("errortext")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| result.to_string()),
            None => format!("job failed with status {}", self.jobstatus),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTemplates {
    #[serde(default)]
    pub template: Vec<Template>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Offering {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListServiceOfferings {
    #[serde(default)]
    pub serviceoffering: Vec<Offering>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListDiskOfferings {
    #[serde(default)]
    pub diskoffering: Vec<Offering>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListZones {
    #[serde(default)]
    pub zone: Vec<Zone>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vlan: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListNetworks {
    #[serde(default)]
    pub network: Vec<Network>,
}

// ── Volumes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub virtualmachineid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVolumes {
    #[serde(default)]
    pub volume: Vec<Volume>,
}

// ── VM snapshots ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VmSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVmSnapshots {
    #[serde(default)]
    pub vmsnapshot: Vec<VmSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_params_index_every_nic() {
        let req = DeployVirtualMachine {
            service_offering_id: "so-1".into(),
            template_id: "tpl-1".into(),
            zone_id: "zone-1".into(),
            name: "web01".into(),
            display_name: "web01".into(),
            cpu: 2,
            memory_mib: 4096,
            root_disk_size_gb: Some(50),
            nics: vec![
                NicPlacement {
                    network_id: "net-a".into(),
                    ip: Some("10.0.0.5".into()),
                },
                NicPlacement {
                    network_id: "net-b".into(),
                    ip: None,
                },
            ],
            start: true,
        };

        let params = req.to_params();
        assert_eq!(params.get("iptonetworklist[0].networkid"), Some("net-a"));
        assert_eq!(params.get("iptonetworklist[0].ip"), Some("10.0.0.5"));
        assert_eq!(params.get("iptonetworklist[1].networkid"), Some("net-b"));
        assert_eq!(params.get("iptonetworklist[1].ip"), None);
        assert_eq!(params.get("rootdisksize"), Some("50"));
        assert_eq!(params.get("details[0].memory"), Some("4096"));
    }

    #[test]
    fn job_error_text_prefers_errortext() {
        let job = AsyncJobResult {
            jobstatus: 2,
            jobresultcode: Some(530),
            jobresult: Some(serde_json::json!({"errorcode": 530, "errortext": "no capacity"})),
            jobinstanceid: None,
        };
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error_text(), "no capacity");
    }
}
