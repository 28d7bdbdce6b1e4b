//! Typed Rust client for the phpIPAM REST API.
//!
//! Covers the subset needed for address allocation: user token, VLANs,
//! subnets and first-free address reservation/release.

mod types;

pub use types::*;

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("phpipam request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("phpipam {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("phpipam {endpoint} returned no data: {message}")]
    Empty {
        endpoint: &'static str,
        message: String,
    },
}

impl Error {
    /// True when phpIPAM answered 404, which it uses for "nothing found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status, .. } if status.as_u16() == 404)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for one phpIPAM application endpoint (`/api/{app_id}`).
#[derive(Clone)]
pub struct PhpIpamClient {
    base_url: String,
    app_id: String,
    token: String,
    http: reqwest::Client,
}

impl PhpIpamClient {
    /// Authenticate with username/password and return a token-bearing client.
    pub async fn login(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let mut client = Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            token: String::new(),
            http: reqwest::Client::new(),
        };

        let resp = client
            .http
            .post(client.url("/user/"))
            .basic_auth(username, Some(password))
            .send()
            .await?;

        let token: TokenData = Self::data(resp, "user token").await?;
        client.token = token.token;
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}{path}", self.base_url, self.app_id)
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

    /// Unwrap the `{ code, success, data, message }` envelope.
    async fn data<T: DeserializeOwned>(resp: reqwest::Response, endpoint: &'static str) -> Result<T> {
        let envelope: Envelope<T> = Self::check(resp, endpoint).await?.json().await?;
        envelope.data.ok_or_else(|| Error::Empty {
            endpoint,
            message: envelope.message.unwrap_or_default(),
        })
    }

    // ── VLANs ───────────────────────────────────────────────────────

    pub async fn list_vlans(&self) -> Result<Vec<Vlan>> {
        let resp = self
            .http
            .get(self.url("/vlan/"))
            .header("token", &self.token)
            .send()
            .await?;

        Self::data(resp, "list vlans").await
    }

    pub async fn vlan_subnets(&self, vlan_id: &str) -> Result<Vec<Subnet>> {
        let resp = self
            .http
            .get(self.url(&format!("/vlan/{vlan_id}/subnets/")))
            .header("token", &self.token)
            .send()
            .await?;

        Self::data(resp, "vlan subnets").await
    }

    // ── Subnets ─────────────────────────────────────────────────────

    pub async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet> {
        let resp = self
            .http
            .get(self.url(&format!("/subnets/{subnet_id}/")))
            .header("token", &self.token)
            .send()
            .await?;

        Self::data(resp, "get subnet").await
    }

    // ── Addresses ───────────────────────────────────────────────────

    /// Reserve the first free address in a subnet and return it.
    pub async fn reserve_first_free(&self, subnet_id: &str, req: &ReserveRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("/addresses/first_free/{subnet_id}/")))
            .header("token", &self.token)
            .json(req)
            .send()
            .await?;

        Self::data(resp, "first free address").await
    }

    /// Drop a reservation made by [`Self::reserve_first_free`].
    pub async fn release_address(&self, ip: &str, subnet_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/addresses/{ip}/{subnet_id}/")))
            .header("token", &self.token)
            .send()
            .await?;

        Self::check(resp, "release address").await?;
        Ok(())
    }
}
