//! Typed Rust client for Harvester's KubeVirt resources.
//!
//! Covers VirtualMachine CRUD in one namespace plus Harvester
//! VirtualMachineBackup snapshots. Unknown manifest fields are carried
//! through `extra` maps so a read-modify-write does not drop them.

mod types;

pub use types::*;

const KUBEVIRT: &str = "/apis/kubevirt.io/v1";
const HARVESTER: &str = "/apis/harvesterhci.io/v1beta1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("harvester api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("harvester api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the Kubernetes API of one Harvester cluster.
#[derive(Clone)]
pub struct HarvesterClient {
    base_url: String,
    token: String,
    namespace: String,
    http: reqwest::Client,
}

impl HarvesterClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        namespace: impl Into<String>,
        insecure: bool,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            namespace: namespace.into(),
            http: reqwest::Client::builder()
                .danger_accept_invalid_certs(insecure)
                .build()?,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn vms_url(&self) -> String {
        format!(
            "{}{KUBEVIRT}/namespaces/{}/virtualmachines",
            self.base_url, self.namespace
        )
    }

    fn vm_url(&self, name: &str) -> String {
        format!("{}/{name}", self.vms_url())
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn check_allow_404(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    // ── Virtual machines ────────────────────────────────────────────

    pub async fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let resp = self
            .http
            .get(self.vms_url())
            .header("Authorization", self.auth())
            .send()
            .await?;

        let list: VirtualMachineList = Self::check(resp, "list vms").await?.json().await?;
        Ok(list.items)
    }

    pub async fn get_vm(&self, name: &str) -> Result<VirtualMachine> {
        let resp = self
            .http
            .get(self.vm_url(name))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get vm")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let resp = self
            .http
            .post(self.vms_url())
            .header("Authorization", self.auth())
            .json(vm)
            .send()
            .await?;

        Self::check(resp, "create vm")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Replace the VM object. `vm.metadata.resource_version` must be current.
    pub async fn replace_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let resp = self
            .http
            .put(self.vm_url(&vm.metadata.name))
            .header("Authorization", self.auth())
            .json(vm)
            .send()
            .await?;

        Self::check(resp, "replace vm")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Delete the VM and, through foreground propagation, its data volumes.
    pub async fn delete_vm(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.vm_url(name))
            .header("Authorization", self.auth())
            .query(&[("propagationPolicy", "Foreground")])
            .send()
            .await?;

        Self::check_allow_404(resp, "delete vm").await?;
        Ok(())
    }

    // ── Backups ─────────────────────────────────────────────────────

    pub async fn create_backup(&self, backup: &VirtualMachineBackup) -> Result<VirtualMachineBackup> {
        let resp = self
            .http
            .post(format!(
                "{}{HARVESTER}/namespaces/{}/virtualmachinebackups",
                self.base_url, self.namespace
            ))
            .header("Authorization", self.auth())
            .json(backup)
            .send()
            .await?;

        Self::check(resp, "create backup")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn list_backups(&self) -> Result<Vec<VirtualMachineBackup>> {
        let resp = self
            .http
            .get(format!(
                "{}{HARVESTER}/namespaces/{}/virtualmachinebackups",
                self.base_url, self.namespace
            ))
            .header("Authorization", self.auth())
            .send()
            .await?;

        let list: BackupList = Self::check(resp, "list backups").await?.json().await?;
        Ok(list.items)
    }
}
