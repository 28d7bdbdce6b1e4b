use std::collections::HashMap;

use async_trait::async_trait;
use purity_api::{HostPatch, PurityClient};

use crate::config::PureParams;
use crate::secrets::Credential;
use crate::storage::{LunInfo, LunMapping, StorageDriver, StorageHost};
use crate::{BackendKind, Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

fn bytes(size_gb: u64) -> Result<u64> {
    size_gb
        .checked_mul(GIB)
        .ok_or_else(|| Error::ConfigInvalid(format!("size {size_gb} GB is too large")))
}

/// Unknown-name errors become `InstanceNotFound(name)`.
fn not_found(name: &str) -> impl FnOnce(purity_api::Error) -> Error + '_ {
    move |e| {
        if e.is_not_found() {
            Error::InstanceNotFound(name.to_string())
        } else {
            Error::Purity(e)
        }
    }
}

pub struct PureStorageDriver {
    host: String,
    client: PurityClient,
}

impl PureStorageDriver {
    pub async fn connect(host: &str, params: &PureParams, cred: &Credential) -> Result<Self> {
        let client = PurityClient::login(&params.url, cred.require("api_token")?, params.insecure).await?;
        tracing::debug!(host, "purestorage: session opened");
        Ok(Self {
            host: host.to_string(),
            client,
        })
    }

    async fn require_host(&self, name: &str) -> Result<()> {
        let hosts = self.client.list_hosts().await?;
        if hosts.iter().any(|h| h.name == name) {
            Ok(())
        } else {
            Err(Error::InstanceNotFound(name.to_string()))
        }
    }
}

#[async_trait]
impl StorageDriver for PureStorageDriver {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Purestorage
    }

    async fn create_lun(&self, name: &str, size_gb: u64) -> Result<LunInfo> {
        let volume = self.client.create_volume(name, bytes(size_gb)?).await?;
        tracing::info!(volume = name, size_gb, "purestorage: volume created");
        Ok(LunInfo {
            name: volume.name,
            size_gb: volume.provisioned / GIB,
            serial: volume.serial,
            hosts: Vec::new(),
        })
    }

    async fn delete_lun(&self, name: &str) -> Result<()> {
        self.client.get_volume(name).await.map_err(not_found(name))?;
        self.client.delete_volume(name).await.map_err(not_found(name))?;
        tracing::info!(volume = name, "purestorage: volume eradicated");
        Ok(())
    }

    async fn list_luns(&self) -> Result<Vec<LunInfo>> {
        let mut mapped: HashMap<String, Vec<String>> = HashMap::new();
        for conn in self.client.list_connections().await? {
            mapped.entry(conn.volume.name).or_default().push(conn.host.name);
        }

        Ok(self
            .client
            .list_volumes()
            .await?
            .into_iter()
            .map(|v| LunInfo {
                hosts: mapped.remove(&v.name).unwrap_or_default(),
                size_gb: v.provisioned / GIB,
                serial: v.serial,
                name: v.name,
            })
            .collect())
    }

    async fn resize_lun(&self, name: &str, size_gb: u64) -> Result<()> {
        self.client
            .resize_volume(name, bytes(size_gb)?)
            .await
            .map_err(not_found(name))?;
        tracing::info!(volume = name, size_gb, "purestorage: volume resized");
        Ok(())
    }

    async fn create_host(&self, name: &str) -> Result<StorageHost> {
        let host = self.client.create_host(name).await?;
        tracing::info!(host = name, "purestorage: host created");
        Ok(StorageHost {
            name: host.name,
            initiators: host.iqns.into_iter().chain(host.wwns).collect(),
        })
    }

    async fn add_initiator(&self, host: &str, initiator: &str) -> Result<()> {
        self.client
            .add_initiators(host, &HostPatch::initiator(initiator))
            .await
            .map_err(not_found(host))?;
        tracing::info!(host, initiator, "purestorage: initiator added");
        Ok(())
    }

    async fn map_volume(&self, volume: &str, host: &str) -> Result<LunMapping> {
        self.client.get_volume(volume).await.map_err(not_found(volume))?;
        self.require_host(host).await?;

        let conn = self.client.connect(host, volume).await?;
        tracing::info!(volume, host, lun = ?conn.lun, "purestorage: volume connected");
        Ok(LunMapping {
            host: conn.host.name,
            volume: conn.volume.name,
            lun: conn.lun,
        })
    }

    async fn snapshot_lun(&self, volume: &str, suffix: Option<&str>) -> Result<String> {
        let snap = self
            .client
            .create_snapshot(volume, suffix)
            .await
            .map_err(not_found(volume))?;
        tracing::info!(volume, snapshot = %snap.name, "purestorage: snapshot taken");
        Ok(snap.name)
    }

    async fn list_hosts(&self) -> Result<Vec<StorageHost>> {
        Ok(self
            .client
            .list_hosts()
            .await?
            .into_iter()
            .map(|h| StorageHost {
                name: h.name,
                initiators: h.iqns.into_iter().chain(h.wwns).collect(),
            })
            .collect())
    }

    async fn list_host_lun_mappings(&self) -> Result<Vec<LunMapping>> {
        Ok(self
            .client
            .list_connections()
            .await?
            .into_iter()
            .map(|c| LunMapping {
                host: c.host.name,
                volume: c.volume.name,
                lun: c.lun,
            })
            .collect())
    }
}
