use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Token types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateTokenRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub auth: TokenAuth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuth {
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub policies: Vec<String>,
}

// ── KV v2 types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct KvReadResponse {
    pub data: KvSecret,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvSecret {
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<KvMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvMetadata {
    pub version: u64,
    #[serde(default)]
    pub created_time: Option<String>,
}
