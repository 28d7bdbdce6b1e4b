//! Client for the Apache CloudStack query API.
//!
//! Every call is a signed `GET {endpoint}?command=...` request. Responses
//! arrive wrapped as `{ "<command>response": { ... } }`; long-running
//! commands return a `jobid` that is polled with `queryAsyncJobResult`.

mod sign;
mod types;

pub use sign::{canonical_query, encode, signature};
pub use types::*;

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cloudstack request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloudstack {command} returned {status}: {body}")]
    Api {
        command: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("cloudstack {command} response could not be decoded: {source}")]
    Decode {
        command: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Ordered request parameters, excluding `apikey`/`command`/`response`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.push((key.into(), value.to_string()));
        self
    }

    pub fn set_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Client for one CloudStack management server.
#[derive(Clone)]
pub struct CloudStackClient {
    endpoint: String,
    api_key: String,
    secret_key: String,
    http: reqwest::Client,
}

impl CloudStackClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sign and send `command`, returning the unwrapped `<command>response` body.
    pub async fn request<T: DeserializeOwned>(&self, command: &str, params: Params) -> Result<T> {
        let mut all = vec![
            ("apikey".to_string(), self.api_key.clone()),
            ("command".to_string(), command.to_string()),
            ("response".to_string(), "json".to_string()),
        ];
        all.extend(params.0);

        let query = canonical_query(&all);
        let sig = signature(&query, &self.secret_key);
        let url = format!("{}?{query}&signature={}", self.endpoint, encode(&sig));

        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Api {
                command: command.to_string(),
                status,
                body,
            });
        }

        let mut value: serde_json::Value =
            serde_json::from_str(&body).map_err(|source| Error::Decode {
                command: command.to_string(),
                source,
            })?;
        let key = format!("{}response", command.to_lowercase());
        let inner = value
            .get_mut(&key)
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);

        serde_json::from_value(inner).map_err(|source| Error::Decode {
            command: command.to_string(),
            source,
        })
    }

    // ── Virtual machines ────────────────────────────────────────────

    pub async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let resp: ListVirtualMachines = self
            .request("listVirtualMachines", Params::new().set("listall", true))
            .await?;
        Ok(resp.virtualmachine)
    }

    pub async fn deploy_virtual_machine(&self, req: &DeployVirtualMachine) -> Result<AsyncJob> {
        self.request("deployVirtualMachine", req.to_params()).await
    }

    pub async fn destroy_virtual_machine(&self, id: &str, expunge: bool) -> Result<AsyncJob> {
        self.request(
            "destroyVirtualMachine",
            Params::new().set("id", id).set("expunge", expunge),
        )
        .await
    }

    pub async fn stop_virtual_machine(&self, id: &str, forced: bool) -> Result<AsyncJob> {
        self.request(
            "stopVirtualMachine",
            Params::new().set("id", id).set("forced", forced),
        )
        .await
    }

    /// Change offering and/or custom CPU/memory details. The VM must be stopped.
    pub async fn change_service(
        &self,
        id: &str,
        service_offering_id: &str,
        cpu: u32,
        memory_mib: u64,
    ) -> Result<VirtualMachineEnvelope> {
        self.request(
            "changeServiceForVirtualMachine",
            Params::new()
                .set("id", id)
                .set("serviceofferingid", service_offering_id)
                .set("details[0].cpuNumber", cpu)
                .set("details[0].memory", memory_mib),
        )
        .await
    }

    pub async fn add_nic(&self, vm_id: &str, network_id: &str, ip: Option<&str>) -> Result<AsyncJob> {
        self.request(
            "addNicToVirtualMachine",
            Params::new()
                .set("virtualmachineid", vm_id)
                .set("networkid", network_id)
                .set_opt("ipaddress", ip),
        )
        .await
    }

    pub async fn create_vm_snapshot(&self, vm_id: &str, name: &str) -> Result<AsyncJob> {
        self.request(
            "createVMSnapshot",
            Params::new()
                .set("virtualmachineid", vm_id)
                .set("name", name)
                .set("snapshotmemory", false),
        )
        .await
    }

    pub async fn list_vm_snapshots(&self, vm_id: &str) -> Result<Vec<VmSnapshot>> {
        let resp: ListVmSnapshots = self
            .request(
                "listVMSnapshot",
                Params::new().set("virtualmachineid", vm_id),
            )
            .await?;
        Ok(resp.vmsnapshot)
    }

    // ── Async jobs ──────────────────────────────────────────────────

    pub async fn query_async_job(&self, job_id: &str) -> Result<AsyncJobResult> {
        self.request("queryAsyncJobResult", Params::new().set("jobid", job_id))
            .await
    }

    // ── Catalog lookups ─────────────────────────────────────────────

    pub async fn list_templates(&self, name: &str) -> Result<Vec<Template>> {
        let resp: ListTemplates = self
            .request(
                "listTemplates",
                Params::new()
                    .set("templatefilter", "executable")
                    .set("name", name),
            )
            .await?;
        Ok(resp.template)
    }

    pub async fn list_service_offerings(&self, name: &str) -> Result<Vec<Offering>> {
        let resp: ListServiceOfferings = self
            .request("listServiceOfferings", Params::new().set("name", name))
            .await?;
        Ok(resp.serviceoffering)
    }

    pub async fn list_disk_offerings(&self, name: &str) -> Result<Vec<Offering>> {
        let resp: ListDiskOfferings = self
            .request("listDiskOfferings", Params::new().set("name", name))
            .await?;
        Ok(resp.diskoffering)
    }

    pub async fn list_zones(&self, name: &str) -> Result<Vec<Zone>> {
        let resp: ListZones = self
            .request("listZones", Params::new().set("name", name))
            .await?;
        Ok(resp.zone)
    }

    pub async fn list_networks(&self, zone_id: &str) -> Result<Vec<Network>> {
        let resp: ListNetworks = self
            .request(
                "listNetworks",
                Params::new().set("zoneid", zone_id).set("listall", true),
            )
            .await?;
        Ok(resp.network)
    }

    // ── Volumes ─────────────────────────────────────────────────────

    pub async fn list_volumes(&self, vm_id: Option<&str>) -> Result<Vec<Volume>> {
        let resp: ListVolumes = self
            .request(
                "listVolumes",
                Params::new()
                    .set("listall", true)
                    .set_opt("virtualmachineid", vm_id),
            )
            .await?;
        Ok(resp.volume)
    }

    pub async fn create_volume(
        &self,
        name: &str,
        zone_id: &str,
        disk_offering_id: &str,
        size_gb: u32,
    ) -> Result<AsyncJob> {
        self.request(
            "createVolume",
            Params::new()
                .set("name", name)
                .set("zoneid", zone_id)
                .set("diskofferingid", disk_offering_id)
                .set("size", size_gb),
        )
        .await
    }

    pub async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<AsyncJob> {
        self.request(
            "attachVolume",
            Params::new()
                .set("id", volume_id)
                .set("virtualmachineid", vm_id),
        )
        .await
    }

    pub async fn resize_volume(&self, volume_id: &str, size_gb: u32) -> Result<AsyncJob> {
        self.request(
            "resizeVolume",
            Params::new().set("id", volume_id).set("size", size_gb),
        )
        .await
    }
}
