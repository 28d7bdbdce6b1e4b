pub mod cloudstack;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod harvester;
pub mod ipam;
pub mod msdns;
pub mod poll;
pub mod profile;
pub mod purestorage;
pub mod secrets;
pub mod storage;
pub mod types;
pub mod vm;
pub mod vsphere;

#[cfg(test)]
mod testing;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use dispatch::{Connector, Dispatcher, Driver, RemoteConnector};
pub use dns::DnsDriver;
pub use storage::StorageDriver;
pub use vm::VmDriver;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("site not found: {0}")]
    SiteNotFound(String),

    #[error("no {service} service named {host} in site {site}")]
    ServiceNotFound {
        site: String,
        service: ServiceType,
        host: String,
    },

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("invalid profile {profile}: {reason}")]
    ProfileInvalid { profile: String, reason: String },

    #[error("vlan not found in ipam: {0}")]
    VlanNotFound(String),

    #[error("no free address left in subnet {subnet_id} (vlan {vlan})")]
    AllocationExhausted { vlan: String, subnet_id: String },

    #[error("secret store refused the request: {0}")]
    AuthError(String),

    #[error("no reachable secret store (tried {0})")]
    NoReachableSecretStore(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("{rr_type} record {name} already exists")]
    RecordExists { rr_type: String, name: String },

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("{what} did not finish within {waited_secs}s")]
    ProvisioningTimeout { what: String, waited_secs: u64 },

    #[error("instance {0} is still powered on; refusing to reconfigure")]
    ReconfigureBlocked(String),

    #[error("unsupported record type: {0}")]
    UnsupportedRecordType(String),

    #[error("{backend} does not support {operation}")]
    UnsupportedOperation {
        backend: BackendKind,
        operation: &'static str,
    },

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("vault error: {0}")]
    Vault(#[from] vault_api::Error),

    #[error("phpipam error: {0}")]
    Ipam(#[from] phpipam_api::Error),

    #[error("vsphere error: {0}")]
    Vsphere(#[from] vsphere_api::Error),

    #[error("cloudstack error: {0}")]
    CloudStack(#[from] cloudstack_api::Error),

    #[error("harvester error: {0}")]
    Harvester(#[from] harvester_api::Error),

    #[error("purity error: {0}")]
    Purity(#[from] purity_api::Error),

    #[error("msdns error: {0}")]
    MsDns(#[from] msdns_api::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Service families a site can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Hypervisor,
    Storage,
    Dns,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hypervisor => "hypervisor",
            Self::Storage => "storage",
            Self::Dns => "dns",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hypervisor" | "vm" => Ok(Self::Hypervisor),
            "storage" => Ok(Self::Storage),
            "dns" => Ok(Self::Dns),
            other => Err(Error::ConfigInvalid(format!("unknown service type: {other}"))),
        }
    }
}

/// Known backend implementations, named by their `type` tag in the site file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vsphere,
    Cloudstack,
    Harvester,
    Purestorage,
    Msdns,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vsphere => "vsphere",
            Self::Cloudstack => "cloudstack",
            Self::Harvester => "harvester",
            Self::Purestorage => "purestorage",
            Self::Msdns => "msdns",
        }
    }

    /// The only service list an entry of this kind may appear in.
    pub fn service_type(&self) -> ServiceType {
        match self {
            Self::Vsphere | Self::Cloudstack | Self::Harvester => ServiceType::Hypervisor,
            Self::Purestorage => ServiceType::Storage,
            Self::Msdns => ServiceType::Dns,
        }
    }

    /// Whether CPU/memory/disk changes require the instance to be off.
    pub fn needs_power_off_to_reconfigure(&self) -> bool {
        matches!(self, Self::Vsphere | Self::Cloudstack)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vsphere" => Ok(Self::Vsphere),
            "cloudstack" => Ok(Self::Cloudstack),
            "harvester" => Ok(Self::Harvester),
            "purestorage" => Ok(Self::Purestorage),
            "msdns" => Ok(Self::Msdns),
            other => Err(Error::ConfigInvalid(format!("unknown backend type: {other}"))),
        }
    }
}
