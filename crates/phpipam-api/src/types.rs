use serde::{Deserialize, Deserializer, Serialize};

/// phpIPAM wraps every response in this envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenData {
    pub token: String,
}

// ── VLANs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Vlan {
    #[serde(rename = "vlanId", deserialize_with = "string_or_number")]
    pub vlan_id: String,
    pub name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub number: Option<String>,
    /// Present on installs that link a VLAN straight to its subnet.
    #[serde(rename = "subnetId", default, deserialize_with = "opt_string_or_number")]
    pub subnet_id: Option<String>,
}

// ── Subnets ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Subnet {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub subnet: String,
    #[serde(deserialize_with = "string_or_number")]
    pub mask: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub gateway: Option<Gateway>,
    #[serde(default)]
    pub nameservers: Option<Nameservers>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    pub ip_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nameservers {
    /// Semicolon-separated list, phpIPAM's storage format.
    pub namesrv1: String,
}

impl Nameservers {
    pub fn servers(&self) -> Vec<String> {
        self.namesrv1
            .split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

// ── Addresses ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReserveRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// phpIPAM returns ids as strings on some versions and numbers on others.

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.is_empty() || s == "0" => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) if n.as_u64() == Some(0) => Ok(None),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
