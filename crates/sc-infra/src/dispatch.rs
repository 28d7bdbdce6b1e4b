//! Site/service/host resolution into a connected backend driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use phpipam_api::PhpIpamClient;

use crate::cloudstack::CloudStackDriver;
use crate::config::{BackendConfig, ServiceEntry, Site, SiteTable};
use crate::dns::DnsDriver;
use crate::harvester::HarvesterDriver;
use crate::ipam::{IpAllocator, PhpIpamAllocator};
use crate::msdns::MsDnsDriver;
use crate::poll::PollPolicy;
use crate::purestorage::PureStorageDriver;
use crate::secrets::{self, Credential, ScopedSecrets, SecretProvider, VaultSecretProvider};
use crate::storage::StorageDriver;
use crate::vm::VmDriver;
use crate::vsphere::VsphereDriver;
use crate::{BackendKind, Error, Result, ServiceType};

/// Produces the secret store and IPAM connections a driver needs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Secret store for `site`, unscoped; the dispatcher adds the site path.
    async fn secrets(&self, site: &Site) -> Result<Arc<dyn SecretProvider>>;

    /// IP allocator for `site`. `secrets` is already scoped to the site.
    async fn ipam(&self, site: &Site, secrets: &dyn SecretProvider) -> Result<Arc<dyn IpAllocator>>;
}

/// Vault for secrets and phpIPAM for addresses, per the site file.
pub struct RemoteConnector {
    bootstrap_token: Option<String>,
}

impl RemoteConnector {
    pub fn new(bootstrap_token: impl Into<String>) -> Self {
        Self {
            bootstrap_token: Some(bootstrap_token.into()),
        }
    }

    /// Reads `VAULT_TOKEN` (after loading `.env`). A missing token only
    /// fails once a secret is actually needed.
    pub fn from_env() -> Self {
        Self {
            bootstrap_token: secrets::bootstrap_token_from_env().ok(),
        }
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn secrets(&self, site: &Site) -> Result<Arc<dyn SecretProvider>> {
        let token = self
            .bootstrap_token
            .as_deref()
            .ok_or_else(|| Error::MissingEnv("VAULT_TOKEN".into()))?;
        let vault = VaultSecretProvider::connect(&site.secrets, token).await?;
        Ok(Arc::new(vault))
    }

    async fn ipam(&self, site: &Site, secrets: &dyn SecretProvider) -> Result<Arc<dyn IpAllocator>> {
        let settings = site
            .ipam
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid(format!("site {} has no ipam section", site.name)))?;
        let cred = secrets.read_secret(&settings.secret).await?;
        let client = PhpIpamClient::login(
            &settings.url,
            &settings.app_id,
            cred.require("username")?,
            cred.require("password")?,
        )
        .await?;
        tracing::debug!(site = %site.name, url = %settings.url, "phpipam: session opened");
        Ok(Arc::new(PhpIpamAllocator::new(client)))
    }
}

/// A connected driver of one service family.
pub enum Driver {
    Hypervisor(Box<dyn VmDriver>),
    Storage(Box<dyn StorageDriver>),
    Dns(Box<dyn DnsDriver>),
}

impl Driver {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Hypervisor(d) => d.kind(),
            Self::Storage(d) => d.kind(),
            Self::Dns(d) => d.kind(),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Hypervisor(d) => d.host(),
            Self::Storage(d) => d.host(),
            Self::Dns(d) => d.host(),
        }
    }
}

/// Construct the driver for `entry`. Drivers that open a session do so here.
pub async fn build_driver(
    entry: &ServiceEntry,
    cred: &Credential,
    ipam: Option<Arc<dyn IpAllocator>>,
    poll: PollPolicy,
) -> Result<Driver> {
    let host = entry.host.as_str();
    let need_ipam = || {
        ipam.clone().ok_or_else(|| {
            Error::ConfigInvalid(format!("{} {host} needs an ip allocator", entry.kind()))
        })
    };

    Ok(match &entry.backend {
        BackendConfig::Vsphere(params) => Driver::Hypervisor(Box::new(
            VsphereDriver::connect(host, params, cred, need_ipam()?, poll).await?,
        )),
        BackendConfig::Cloudstack(params) => Driver::Hypervisor(Box::new(CloudStackDriver::new(
            host,
            params,
            cred,
            need_ipam()?,
            poll,
        )?)),
        BackendConfig::Harvester(params) => Driver::Hypervisor(Box::new(HarvesterDriver::new(
            host,
            params,
            cred,
            need_ipam()?,
            poll,
        )?)),
        BackendConfig::Purestorage(params) => {
            Driver::Storage(Box::new(PureStorageDriver::connect(host, params, cred).await?))
        }
        BackendConfig::Msdns(params) => Driver::Dns(Box::new(MsDnsDriver::connect(host, params))),
    })
}

/// Looks up service entries in the site table and connects their drivers.
/// Nothing is cached between calls.
pub struct Dispatcher {
    sites: SiteTable,
    connector: Arc<dyn Connector>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(sites: SiteTable, connector: Arc<dyn Connector>) -> Self {
        Self {
            sites,
            connector,
            timeout: None,
        }
    }

    /// Override every site's polling deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn sites(&self) -> &SiteTable {
        &self.sites
    }

    /// Find the entry for (`site`, `service`, `host`) without any network I/O.
    pub fn lookup(&self, site: &str, service: ServiceType, host: &str) -> Result<(&Site, &ServiceEntry)> {
        let site_cfg = self.sites.site(site)?;
        let entry = site_cfg
            .find(service, host)
            .ok_or_else(|| Error::ServiceNotFound {
                site: site.to_string(),
                service,
                host: host.to_string(),
            })?;
        Ok((site_cfg, entry))
    }

    pub async fn resolve(&self, site: &str, service: ServiceType, host: &str) -> Result<Driver> {
        let (site_cfg, entry) = self.lookup(site, service, host)?;

        let mut poll = self.sites.poll_policy(site_cfg);
        if let Some(timeout) = self.timeout {
            poll = poll.with_timeout(timeout);
        }

        // msdns authenticates with the operator's ssh key
        if entry.kind() == BackendKind::Msdns {
            tracing::debug!(site, host, "dispatch: connecting msdns");
            return build_driver(entry, &Credential::default(), None, poll).await;
        }

        let store = self.connector.secrets(site_cfg).await?;
        let scoped = ScopedSecrets::new(store, site_cfg.secrets.path.as_str());
        let cred = scoped.read_secret(entry.secret_key()).await?;

        let ipam = if service == ServiceType::Hypervisor {
            Some(self.connector.ipam(site_cfg, &scoped).await?)
        } else {
            None
        };

        tracing::debug!(site, host, backend = %entry.kind(), "dispatch: connecting");
        build_driver(entry, &cred, ipam, poll).await
    }

    pub async fn hypervisor(&self, site: &str, host: &str) -> Result<Box<dyn VmDriver>> {
        match self.resolve(site, ServiceType::Hypervisor, host).await? {
            Driver::Hypervisor(d) => Ok(d),
            other => Err(Error::UnsupportedOperation {
                backend: other.kind(),
                operation: "vm",
            }),
        }
    }

    pub async fn storage(&self, site: &str, host: &str) -> Result<Box<dyn StorageDriver>> {
        match self.resolve(site, ServiceType::Storage, host).await? {
            Driver::Storage(d) => Ok(d),
            other => Err(Error::UnsupportedOperation {
                backend: other.kind(),
                operation: "storage",
            }),
        }
    }

    pub async fn dns(&self, site: &str, host: &str) -> Result<Box<dyn DnsDriver>> {
        match self.resolve(site, ServiceType::Dns, host).await? {
            Driver::Dns(d) => Ok(d),
            other => Err(Error::UnsupportedOperation {
                backend: other.kind(),
                operation: "dns",
            }),
        }
    }
}
