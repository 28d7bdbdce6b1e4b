use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── VM inventory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    pub vm: String,
    pub name: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(rename = "memory_size_MiB", default)]
    pub memory_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub power_state: PowerState,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub disks: HashMap<String, DiskInfo>,
    #[serde(default)]
    pub nics: HashMap<String, NicInfo>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuInfo {
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryInfo {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskInfo {
    pub label: String,
    /// Capacity in bytes.
    #[serde(default)]
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicInfo {
    pub label: String,
    pub backing: NicBackingInfo,
    #[serde(default)]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicBackingInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerInfo {
    pub state: PowerState,
}

// ── Clone ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CloneRequest {
    pub name: String,
    pub source: String,
    pub placement: ClonePlacement,
    pub power_on: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClonePlacement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub host: String,
    pub datastore: String,
}

// ── Hardware ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CpuUpdate {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUpdate {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskResize {
    /// New capacity in bytes.
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskCreate {
    pub new_vmdk: NewVmdk,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewVmdk {
    pub name: String,
    /// Capacity in bytes.
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NicBacking {
    #[serde(rename = "type")]
    pub kind: String,
    pub network: String,
}

impl NicBacking {
    pub fn standard_portgroup(network: impl Into<String>) -> Self {
        Self {
            kind: "STANDARD_PORTGROUP".into(),
            network: network.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NicUpdate {
    pub backing: NicBacking,
}

#[derive(Debug, Clone, Serialize)]
pub struct NicCreate {
    #[serde(rename = "type")]
    pub kind: String,
    pub backing: NicBacking,
    pub start_connected: bool,
}

// ── Guest customization ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CustomizationRequest {
    pub spec: CustomizationSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomizationSpec {
    pub configuration_spec: ConfigurationSpec,
    #[serde(rename = "global_DNS_settings")]
    pub global_dns_settings: GlobalDnsSettings,
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSpec {
    pub linux_config: LinuxConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinuxConfig {
    pub hostname: HostnameSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostnameSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub fixed_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalDnsSettings {
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSpec {
    pub adapter: AdapterSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterSpec {
    pub ipv4: Ipv4Spec,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ipv4Spec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
}

impl Ipv4Spec {
    pub fn fixed(ip_address: String, prefix: u8, gateways: Vec<String>) -> Self {
        Self {
            kind: "STATIC".into(),
            ip_address: Some(ip_address),
            prefix: Some(prefix),
            gateways,
        }
    }

    /// Leave the adapter's current guest settings alone.
    pub fn unchanged() -> Self {
        Self {
            kind: "UNCHANGED".into(),
            ip_address: None,
            prefix: None,
            gateways: Vec::new(),
        }
    }
}

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub description: String,
    pub memory: bool,
    pub quiesce: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot: String,
    pub name: String,
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Blocked,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

// ── Placement inventory ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    NotResponding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSummary {
    pub host: String,
    pub name: String,
    pub connection_state: ConnectionState,
}

/// Live usage figures for a host (CPU in MHz, memory in MiB).
#[derive(Debug, Clone, Deserialize)]
pub struct HostQuickStats {
    pub overall_cpu_usage: u64,
    pub overall_memory_usage: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreSummary {
    pub datastore: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Bytes.
    pub free_space: u64,
    /// Bytes.
    pub capacity: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSummary {
    pub network: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderSummary {
    pub folder: String,
    pub name: String,
}
