use async_trait::async_trait;

use crate::{BackendKind, Result};

/// A volume as reported by the array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunInfo {
    pub name: String,
    pub size_gb: u64,
    pub serial: Option<String>,
    /// Hosts the volume is connected to.
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHost {
    pub name: String,
    /// IQNs and WWNs registered for the host.
    pub initiators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunMapping {
    pub host: String,
    pub volume: String,
    pub lun: Option<u32>,
}

/// Block storage operations against one array.
///
/// Unknown volumes and hosts are reported as `InstanceNotFound`.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn host(&self) -> &str;

    fn kind(&self) -> BackendKind;

    async fn create_lun(&self, name: &str, size_gb: u64) -> Result<LunInfo>;

    async fn delete_lun(&self, name: &str) -> Result<()>;

    async fn list_luns(&self) -> Result<Vec<LunInfo>>;

    /// Grow a volume. Shrinking is refused by the array.
    async fn resize_lun(&self, name: &str, size_gb: u64) -> Result<()>;

    async fn create_host(&self, name: &str) -> Result<StorageHost>;

    /// Register an iSCSI IQN or a Fibre Channel WWN on `host`.
    async fn add_initiator(&self, host: &str, initiator: &str) -> Result<()>;

    async fn map_volume(&self, volume: &str, host: &str) -> Result<LunMapping>;

    /// Returns the snapshot name.
    async fn snapshot_lun(&self, volume: &str, suffix: Option<&str>) -> Result<String>;

    async fn list_hosts(&self) -> Result<Vec<StorageHost>>;

    async fn list_host_lun_mappings(&self) -> Result<Vec<LunMapping>>;
}
