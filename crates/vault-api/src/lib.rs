//! Typed Rust client for the HashiCorp Vault HTTP API.
//!
//! Covers the subset needed to fetch provisioning credentials:
//! child token creation (optionally against a token role) and KV v2 reads.

mod types;

pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vault request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("vault {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("vault client has no token")]
    MissingToken,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for a single Vault server.
#[derive(Clone)]
pub struct VaultClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl VaultClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Use `token` for every subsequent request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().ok_or(Error::MissingToken)
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

    // ── Tokens ──────────────────────────────────────────────────────

    /// Create a child token, authenticating with `parent_token`.
    ///
    /// When `role` is set the token is minted through
    /// `/auth/token/create/{role}` so the role's policies and TTL apply.
    pub async fn create_token(
        &self,
        parent_token: &str,
        role: Option<&str>,
        req: &CreateTokenRequest,
    ) -> Result<TokenAuth> {
        let path = match role {
            Some(role) => format!("/auth/token/create/{role}"),
            None => "/auth/token/create".to_string(),
        };

        let resp = self
            .http
            .post(self.url(&path))
            .header("X-Vault-Token", parent_token)
            .json(req)
            .send()
            .await?;

        let body: AuthResponse = Self::check(resp, "create token").await?.json().await?;
        Ok(body.auth)
    }

    // ── KV v2 ───────────────────────────────────────────────────────

    /// Read the latest version of a KV v2 secret at `mount/path`.
    pub async fn read_kv2(&self, mount: &str, path: &str) -> Result<KvSecret> {
        let path = path.trim_start_matches('/');
        let resp = self
            .http
            .get(self.url(&format!("/{mount}/data/{path}")))
            .header("X-Vault-Token", self.token()?)
            .send()
            .await?;

        let body: KvReadResponse = Self::check(resp, "read secret").await?.json().await?;
        Ok(body.data)
    }
}
