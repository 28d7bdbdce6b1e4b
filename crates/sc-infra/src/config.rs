//! Site file loading.
//!
//! ```yaml
//! poll: { interval_secs: 5, timeout_secs: 600 }
//! sites:
//!   east:
//!     secrets:
//!       hosts: [https://vault1.east:8200, https://vault2.east:8200]
//!       role: provisioner
//!       mount: secret
//!       path: sites/east
//!     ipam: { url: https://ipam.east, app_id: sitectl }
//!     hypervisors:
//!       - { host: hv01, type: harvester, url: https://hv01, namespace: vms }
//!     storage:
//!       - { host: pure01, type: purestorage, url: https://pure01 }
//!     dns:
//!       - { host: dc01, type: msdns, ssh: admin@dc01, zone: corp.example }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::poll::PollPolicy;
use crate::{BackendKind, Error, Result, ServiceType};

/// Every site in the site file, keyed by name.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteTable {
    #[serde(default)]
    poll: Option<PollSettings>,
    sites: BTreeMap<String, Site>,
}

impl SiteTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ConfigNotFound(path.to_path_buf()),
            _ => Error::ConfigInvalid(format!("{}: {e}", path.display())),
        })?;
        Self::from_yaml(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    /// Parse and validate a site file body.
    pub fn from_yaml(raw: &str) -> std::result::Result<Self, String> {
        let mut table: SiteTable = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        for (name, site) in table.sites.iter_mut() {
            site.name = name.clone();
            site.validate()?;
        }
        Ok(table)
    }

    pub fn site(&self, name: &str) -> Result<&Site> {
        self.sites
            .get(name)
            .ok_or_else(|| Error::SiteNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    /// Poll policy for `site`: site override, then file-wide, then defaults.
    pub fn poll_policy(&self, site: &Site) -> PollPolicy {
        site.poll
            .or(self.poll)
            .map(PollSettings::policy)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    crate::poll::DEFAULT_INTERVAL.as_secs()
}

fn default_timeout_secs() -> u64 {
    crate::poll::DEFAULT_TIMEOUT.as_secs()
}

impl PollSettings {
    pub fn policy(self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.interval_secs.max(1)),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Site {
    #[serde(skip)]
    pub name: String,
    pub secrets: SecretStoreSettings,
    #[serde(default)]
    pub ipam: Option<IpamSettings>,
    #[serde(default)]
    pub poll: Option<PollSettings>,
    #[serde(default)]
    pub hypervisors: Vec<ServiceEntry>,
    #[serde(default)]
    pub storage: Vec<ServiceEntry>,
    #[serde(default)]
    pub dns: Vec<ServiceEntry>,
}

impl Site {
    pub fn entries(&self, service: ServiceType) -> &[ServiceEntry] {
        match service {
            ServiceType::Hypervisor => &self.hypervisors,
            ServiceType::Storage => &self.storage,
            ServiceType::Dns => &self.dns,
        }
    }

    pub fn find(&self, service: ServiceType, host: &str) -> Option<&ServiceEntry> {
        self.entries(service).iter().find(|e| e.host == host)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.secrets.hosts.is_empty() {
            return Err(format!("site {}: secrets.hosts is empty", self.name));
        }
        for service in [ServiceType::Hypervisor, ServiceType::Storage, ServiceType::Dns] {
            let mut seen = HashSet::new();
            for entry in self.entries(service) {
                if !seen.insert(entry.host.as_str()) {
                    return Err(format!(
                        "site {}: duplicate {service} host {}",
                        self.name, entry.host
                    ));
                }
                let kind = entry.kind();
                if kind.service_type() != service {
                    return Err(format!(
                        "site {}: {kind} entry {} is listed under {service}",
                        self.name, entry.host
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Where to fetch credentials for a site.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretStoreSettings {
    /// Tried in order until one issues a token.
    pub hosts: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Prefix for every secret read on behalf of this site.
    pub path: String,
}

fn default_mount() -> String {
    "secret".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpamSettings {
    pub url: String,
    pub app_id: String,
    /// Secret (under the site path) holding `username`/`password`.
    #[serde(default = "default_ipam_secret")]
    pub secret: String,
}

fn default_ipam_secret() -> String {
    "ipam".into()
}

/// One backend endpoint within a site's service list.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub host: String,
    /// Secret key under the site path; defaults to `host`.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

impl ServiceEntry {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn secret_key(&self) -> &str {
        self.secret.as_deref().unwrap_or(&self.host)
    }
}

/// Connection parameters, selected by the entry's `type` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Vsphere(VsphereParams),
    Cloudstack(CloudStackParams),
    Harvester(HarvesterParams),
    Purestorage(PureParams),
    Msdns(MsDnsParams),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Vsphere(_) => BackendKind::Vsphere,
            Self::Cloudstack(_) => BackendKind::Cloudstack,
            Self::Harvester(_) => BackendKind::Harvester,
            Self::Purestorage(_) => BackendKind::Purestorage,
            Self::Msdns(_) => BackendKind::Msdns,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VsphereParams {
    pub url: String,
    /// VM folder new instances are placed in.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudStackParams {
    /// Full API endpoint, e.g. `https://cs.example/client/api`.
    pub url: String,
    pub zone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarvesterParams {
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

fn default_namespace() -> String {
    "default".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PureParams {
    pub url: String,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MsDnsParams {
    /// `host` or `user@host` for ssh.
    pub ssh: String,
    pub zone: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_ttl() -> u32 {
    3600
}
