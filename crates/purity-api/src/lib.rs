//! Typed Rust client for the Pure Storage FlashArray REST 2.x API.
//!
//! A session starts with `POST /api/2.x/login` carrying the API token; the
//! array answers with an `x-auth-token` header used on every later call.

mod types;

pub use types::*;

const API: &str = "/api/2.4";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("purity request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("purity {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("purity login did not return an x-auth-token header")]
    MissingSessionToken,
}

impl Error {
    /// The array reports unknown names as 400 with a "does not exist" message.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Api { status, body, .. } => {
                status.as_u16() == 404 || body.contains("does not exist")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Authenticated session against one FlashArray.
#[derive(Clone)]
pub struct PurityClient {
    base_url: String,
    session: String,
    http: reqwest::Client,
}

impl PurityClient {
    pub async fn login(base_url: impl Into<String>, api_token: &str, insecure: bool) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        let resp = http
            .post(format!("{base_url}{API}/login"))
            .header("api-token", api_token)
            .send()
            .await?;
        let resp = check(resp, "login").await?;

        let session = resp
            .headers()
            .get("x-auth-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(Error::MissingSessionToken)?;

        Ok(Self {
            base_url,
            session,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API}{path}", self.base_url)
    }

    async fn items<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        endpoint: &'static str,
    ) -> Result<Vec<T>> {
        let resp = req.header("x-auth-token", &self.session).send().await?;
        let list: ItemList<T> = check(resp, endpoint).await?.json().await?;
        Ok(list.items)
    }

    async fn send(&self, req: reqwest::RequestBuilder, endpoint: &'static str) -> Result<()> {
        let resp = req.header("x-auth-token", &self.session).send().await?;
        check(resp, endpoint).await?;
        Ok(())
    }

    // ── Volumes ─────────────────────────────────────────────────────

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.items(
            self.http
                .get(self.url("/volumes"))
                .query(&[("destroyed", "false")]),
            "list volumes",
        )
        .await
    }

    pub async fn get_volume(&self, name: &str) -> Result<Volume> {
        let mut items: Vec<Volume> = self
            .items(
                self.http.get(self.url("/volumes")).query(&[("names", name)]),
                "get volume",
            )
            .await?;
        items.pop().ok_or_else(|| Error::Api {
            endpoint: "get volume",
            status: reqwest::StatusCode::NOT_FOUND,
            body: format!("volume {name} does not exist"),
        })
    }

    pub async fn create_volume(&self, name: &str, provisioned_bytes: u64) -> Result<Volume> {
        let items: Vec<Volume> = self
            .items(
                self.http
                    .post(self.url("/volumes"))
                    .query(&[("names", name)])
                    .json(&VolumePatch {
                        provisioned: Some(provisioned_bytes),
                        destroyed: None,
                    }),
                "create volume",
            )
            .await?;
        single(items, "create volume")
    }

    pub async fn resize_volume(&self, name: &str, provisioned_bytes: u64) -> Result<()> {
        self.send(
            self.http
                .patch(self.url("/volumes"))
                .query(&[("names", name)])
                .json(&VolumePatch {
                    provisioned: Some(provisioned_bytes),
                    destroyed: None,
                }),
            "resize volume",
        )
        .await
    }

    /// Destroy then eradicate a volume.
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.send(
            self.http
                .patch(self.url("/volumes"))
                .query(&[("names", name)])
                .json(&VolumePatch {
                    provisioned: None,
                    destroyed: Some(true),
                }),
            "destroy volume",
        )
        .await?;

        self.send(
            self.http
                .delete(self.url("/volumes"))
                .query(&[("names", name)]),
            "eradicate volume",
        )
        .await
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub async fn create_snapshot(&self, volume: &str, suffix: Option<&str>) -> Result<VolumeSnapshot> {
        let items: Vec<VolumeSnapshot> = self
            .items(
                self.http
                    .post(self.url("/volume-snapshots"))
                    .query(&[("source_names", volume)])
                    .json(&SnapshotRequest {
                        suffix: suffix.map(str::to_string),
                    }),
                "create snapshot",
            )
            .await?;
        single(items, "create snapshot")
    }

    // ── Hosts ───────────────────────────────────────────────────────

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.items(self.http.get(self.url("/hosts")), "list hosts")
            .await
    }

    pub async fn create_host(&self, name: &str) -> Result<Host> {
        let items: Vec<Host> = self
            .items(
                self.http
                    .post(self.url("/hosts"))
                    .query(&[("names", name)])
                    .json(&serde_json::json!({})),
                "create host",
            )
            .await?;
        single(items, "create host")
    }

    pub async fn add_initiators(&self, host: &str, patch: &HostPatch) -> Result<()> {
        self.send(
            self.http
                .patch(self.url("/hosts"))
                .query(&[("names", host)])
                .json(patch),
            "update host",
        )
        .await
    }

    // ── Connections ─────────────────────────────────────────────────

    pub async fn list_connections(&self) -> Result<Vec<Connection>> {
        self.items(self.http.get(self.url("/connections")), "list connections")
            .await
    }

    pub async fn connect(&self, host: &str, volume: &str) -> Result<Connection> {
        let items: Vec<Connection> = self
            .items(
                self.http
                    .post(self.url("/connections"))
                    .query(&[("host_names", host), ("volume_names", volume)]),
                "create connection",
            )
            .await?;
        single(items, "create connection")
    }
}

fn single<T>(mut items: Vec<T>, endpoint: &'static str) -> Result<T> {
    items.pop().ok_or(Error::Api {
        endpoint,
        status: reqwest::StatusCode::OK,
        body: "empty item list".into(),
    })
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
