use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use vault_api::{CreateTokenRequest, VaultClient};

use crate::config::SecretStoreSettings;
use crate::{Error, Result};

/// Key/value credential bundle. Never persisted; `Debug` hides values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(BTreeMap<String, String>);

impl Credential {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Like [`Self::get`], but a missing key is an `AuthError`.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::AuthError(format!("credential has no {key:?} field")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn read_secret(&self, path: &str) -> Result<Credential>;
}

/// Bootstrap token used to mint the short-lived per-run token.
pub fn bootstrap_token_from_env() -> Result<String> {
    dotenvy::dotenv().ok();
    std::env::var("VAULT_TOKEN").map_err(|_| Error::MissingEnv("VAULT_TOKEN".into()))
}

/// KV v2 reads through a token minted on the first reachable Vault host.
pub struct VaultSecretProvider {
    client: VaultClient,
    mount: String,
}

impl VaultSecretProvider {
    pub async fn connect(settings: &SecretStoreSettings, bootstrap_token: &str) -> Result<Self> {
        let req = CreateTokenRequest {
            ttl: Some("15m".into()),
            renewable: Some(false),
            ..Default::default()
        };

        for host in &settings.hosts {
            let client = VaultClient::new(host.as_str());
            match client
                .create_token(bootstrap_token, settings.role.as_deref(), &req)
                .await
            {
                Ok(auth) => {
                    tracing::debug!(host = %host, "vault: token issued");
                    return Ok(Self {
                        client: client.with_token(auth.client_token),
                        mount: settings.mount.clone(),
                    });
                }
                Err(e) => tracing::warn!(host = %host, error = %e, "vault: host unusable, trying next"),
            }
        }

        Err(Error::NoReachableSecretStore(settings.hosts.join(", ")))
    }
}

#[async_trait]
impl SecretProvider for VaultSecretProvider {
    async fn read_secret(&self, path: &str) -> Result<Credential> {
        let secret = self
            .client
            .read_kv2(&self.mount, path)
            .await
            .map_err(|e| match e {
                vault_api::Error::Api { status, .. }
                    if matches!(status.as_u16(), 401 | 403 | 404) =>
                {
                    Error::AuthError(format!("{}/{path}: {status}", self.mount))
                }
                other => Error::Vault(other),
            })?;

        Ok(Credential::new(secret.data.into_iter().map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })))
    }
}

/// Prefixes every read with a site's base path.
pub struct ScopedSecrets {
    inner: Arc<dyn SecretProvider>,
    prefix: String,
}

impl ScopedSecrets {
    pub fn new(inner: Arc<dyn SecretProvider>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SecretProvider for ScopedSecrets {
    async fn read_secret(&self, path: &str) -> Result<Credential> {
        let path = path.trim_start_matches('/');
        let full = if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.prefix)
        };
        self.inner.read_secret(&full).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, StaticSecrets};
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::json;

    fn settings(hosts: Vec<String>) -> SecretStoreSettings {
        SecretStoreSettings {
            hosts,
            role: Some("provisioner".into()),
            mount: "secret".into(),
            path: "sites/east".into(),
        }
    }

    fn vault_router() -> axum::Router {
        axum::Router::new()
            .route(
                "/v1/auth/token/create/{role}",
                post(|| async { Json(json!({"auth": {"client_token": "child", "policies": []}})) }),
            )
            .route(
                "/v1/secret/data/sites/east/vc01",
                get(|| async {
                    Json(json!({"data": {"data": {"username": "svc", "password": "pw", "port": 443}}}))
                }),
            )
            .route(
                "/v1/secret/data/sites/east/locked",
                get(|| async { StatusCode::FORBIDDEN }),
            )
    }

    #[test]
    fn debug_redacts_values() {
        let cred = Credential::new([("password".to_string(), "hunter2".to_string())]);
        let shown = format!("{cred:?}");
        assert!(shown.contains("password"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_falls_over_to_next_host() {
        let down = FakeServer::start(
            axum::Router::new().route(
                "/v1/auth/token/create/{role}",
                post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
            ),
        )
        .await;
        let up = FakeServer::start(vault_router()).await;

        let provider = VaultSecretProvider::connect(&settings(vec![down.url(), up.url()]), "root")
            .await
            .unwrap();
        let scoped = ScopedSecrets::new(Arc::new(provider), "sites/east/");
        let cred = scoped.read_secret("vc01").await.unwrap();

        assert_eq!(cred.get("username"), Some("svc"));
        assert_eq!(cred.require("port").unwrap(), "443");
        assert!(matches!(cred.require("token"), Err(Error::AuthError(_))));

        assert_eq!(down.hits("POST", "/v1/auth/token/create/provisioner"), 1);
        let reads = up.requests_to("GET", "/v1/secret/data/sites/east/vc01");
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].header("x-vault-token"), Some("child"));
    }

    #[tokio::test]
    async fn test_no_reachable_host() {
        let down = FakeServer::start(axum::Router::new()).await;
        let err = VaultSecretProvider::connect(&settings(vec![down.url()]), "root")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoReachableSecretStore(_)));
    }

    #[tokio::test]
    async fn test_forbidden_read_is_auth_error() {
        let up = FakeServer::start(vault_router()).await;
        let provider = VaultSecretProvider::connect(&settings(vec![up.url()]), "root")
            .await
            .unwrap();
        let err = provider.read_secret("sites/east/locked").await.unwrap_err();
        assert!(matches!(err, Error::AuthError(_)));
    }

    #[tokio::test]
    async fn test_scoped_prefix_joins_paths() {
        let inner = Arc::new(StaticSecrets::default().with("sites/east/ipam", &[("username", "u")]));
        let scoped = ScopedSecrets::new(inner.clone(), "/sites/east/");
        assert!(scoped.read_secret("/ipam").await.is_ok());
        assert_eq!(inner.reads(), vec!["sites/east/ipam".to_string()]);
    }
}
