//! Typed Rust client for the vSphere Automation REST API (`/api`).
//!
//! Covers what the provisioning driver needs: sessions, VM inventory and
//! power, clone/snapshot tasks, hardware edits, guest customization, and
//! host/datastore/network lookups used for placement.

mod types;

pub use types::*;

use serde::Serialize;
use serde::de::DeserializeOwned;

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vsphere request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("vsphere {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Authenticated client bound to one vCenter.
#[derive(Clone)]
pub struct VsphereClient {
    base_url: String,
    session: String,
    http: reqwest::Client,
}

impl VsphereClient {
    /// Open a session with basic auth.
    ///
    /// `insecure` disables certificate verification for lab vCenters with
    /// self-signed certificates.
    pub async fn login(
        base_url: impl Into<String>,
        username: &str,
        password: &str,
        insecure: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let resp = http
            .post(format!("{base_url}/api/session"))
            .basic_auth(username, Some(password))
            .send()
            .await?;
        let session: String = Self::check(resp, "create session").await?.json().await?;

        Ok(Self {
            base_url,
            session,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
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

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        endpoint: &'static str,
    ) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header(SESSION_HEADER, &self.session)
            .query(query)
            .send()
            .await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    async fn send_json<B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .request(method, self.url(path))
            .header(SESSION_HEADER, &self.session)
            .query(query);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        Self::check(resp, endpoint).await
    }

    async fn action(&self, path: &str, action: &str, endpoint: &'static str) -> Result<()> {
        self.send_json::<()>(
            reqwest::Method::POST,
            path,
            &[("action", action)],
            None,
            endpoint,
        )
        .await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.send_json::<()>(reqwest::Method::DELETE, "/session", &[], None, "delete session")
            .await?;
        Ok(())
    }

    // ── VMs ─────────────────────────────────────────────────────────

    pub async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        self.get("/vcenter/vm", &[], "list vms").await
    }

    pub async fn find_vms(&self, name: &str) -> Result<Vec<VmSummary>> {
        self.get("/vcenter/vm", &[("names", name)], "find vms").await
    }

    pub async fn get_vm(&self, vm: &str) -> Result<VmInfo> {
        self.get(&format!("/vcenter/vm/{vm}"), &[], "get vm").await
    }

    pub async fn delete_vm(&self, vm: &str) -> Result<()> {
        self.send_json::<()>(
            reqwest::Method::DELETE,
            &format!("/vcenter/vm/{vm}"),
            &[],
            None,
            "delete vm",
        )
        .await?;
        Ok(())
    }

    /// Start a clone as a task and return the task id.
    pub async fn clone_vm(&self, req: &CloneRequest) -> Result<String> {
        self.send_json(
            reqwest::Method::POST,
            "/vcenter/vm",
            &[("action", "clone"), ("vmw-task", "true")],
            Some(req),
            "clone vm",
        )
        .await?
        .json()
        .await
        .map_err(Error::from)
    }

    // ── Power ───────────────────────────────────────────────────────

    pub async fn power_state(&self, vm: &str) -> Result<PowerInfo> {
        self.get(&format!("/vcenter/vm/{vm}/power"), &[], "get power").await
    }

    pub async fn power_on(&self, vm: &str) -> Result<()> {
        self.action(&format!("/vcenter/vm/{vm}/power"), "start", "power on")
            .await
    }

    pub async fn power_off(&self, vm: &str) -> Result<()> {
        self.action(&format!("/vcenter/vm/{vm}/power"), "stop", "power off")
            .await
    }

    /// Ask VMware Tools for a clean guest OS shutdown. Returns immediately.
    pub async fn shutdown_guest(&self, vm: &str) -> Result<()> {
        self.action(
            &format!("/vcenter/vm/{vm}/guest/power"),
            "shutdown",
            "shutdown guest",
        )
        .await
    }

    // ── Hardware ────────────────────────────────────────────────────

    pub async fn update_cpu(&self, vm: &str, req: &CpuUpdate) -> Result<()> {
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/vcenter/vm/{vm}/hardware/cpu"),
            &[],
            Some(req),
            "update cpu",
        )
        .await?;
        Ok(())
    }

    pub async fn update_memory(&self, vm: &str, req: &MemoryUpdate) -> Result<()> {
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/vcenter/vm/{vm}/hardware/memory"),
            &[],
            Some(req),
            "update memory",
        )
        .await?;
        Ok(())
    }

    pub async fn resize_disk(&self, vm: &str, disk: &str, req: &DiskResize) -> Result<()> {
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/vcenter/vm/{vm}/hardware/disk/{disk}"),
            &[],
            Some(req),
            "resize disk",
        )
        .await?;
        Ok(())
    }

    /// Add a new VMDK-backed disk and return its device key.
    pub async fn add_disk(&self, vm: &str, req: &DiskCreate) -> Result<String> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/vcenter/vm/{vm}/hardware/disk"),
            &[],
            Some(req),
            "add disk",
        )
        .await?
        .json()
        .await
        .map_err(Error::from)
    }

    pub async fn update_nic(&self, vm: &str, nic: &str, req: &NicUpdate) -> Result<()> {
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/vcenter/vm/{vm}/hardware/ethernet/{nic}"),
            &[],
            Some(req),
            "update nic",
        )
        .await?;
        Ok(())
    }

    /// Add a network adapter and return its device key.
    pub async fn add_nic(&self, vm: &str, req: &NicCreate) -> Result<String> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/vcenter/vm/{vm}/hardware/ethernet"),
            &[],
            Some(req),
            "add nic",
        )
        .await?
        .json()
        .await
        .map_err(Error::from)
    }

    // ── Guest customization ─────────────────────────────────────────

    pub async fn set_customization(&self, vm: &str, req: &CustomizationRequest) -> Result<()> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/vcenter/vm/{vm}/guest/customization"),
            &[],
            Some(req),
            "set customization",
        )
        .await?;
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotSummary>> {
        self.get(&format!("/vcenter/vm/{vm}/snapshots"), &[], "list snapshots")
            .await
    }

    /// Start a snapshot as a task and return the task id.
    pub async fn create_snapshot(&self, vm: &str, req: &SnapshotRequest) -> Result<String> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/vcenter/vm/{vm}/snapshots"),
            &[("vmw-task", "true")],
            Some(req),
            "create snapshot",
        )
        .await?
        .json()
        .await
        .map_err(Error::from)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn get_task(&self, task: &str) -> Result<TaskInfo> {
        self.get(&format!("/cis/tasks/{task}"), &[], "get task").await
    }

    // ── Inventory ───────────────────────────────────────────────────

    pub async fn list_hosts(&self) -> Result<Vec<HostSummary>> {
        self.get("/vcenter/host", &[], "list hosts").await
    }

    pub async fn host_quick_stats(&self, host: &str) -> Result<HostQuickStats> {
        self.get(&format!("/vcenter/host/{host}/quick-stats"), &[], "host stats")
            .await
    }

    pub async fn list_datastores(&self, host: &str) -> Result<Vec<DatastoreSummary>> {
        self.get("/vcenter/datastore", &[("hosts", host)], "list datastores")
            .await
    }

    pub async fn find_networks(&self, name: &str) -> Result<Vec<NetworkSummary>> {
        self.get("/vcenter/network", &[("names", name)], "find networks")
            .await
    }

    pub async fn find_folders(&self, name: &str) -> Result<Vec<FolderSummary>> {
        self.get(
            "/vcenter/folder",
            &[("names", name), ("type", "VIRTUAL_MACHINE")],
            "find folders",
        )
        .await
    }
}
