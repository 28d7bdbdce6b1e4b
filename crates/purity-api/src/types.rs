use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// `{ "name": ... }` reference to another object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Reference {
    pub name: String,
}

// ── Volumes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Bytes.
    #[serde(default)]
    pub provisioned: u64,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub connection_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroyed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeSnapshot {
    pub name: String,
    #[serde(default)]
    pub source: Option<Reference>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

// ── Hosts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub iqns: Vec<String>,
    #[serde(default)]
    pub wwns: Vec<String>,
    #[serde(default)]
    pub connection_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostPatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_iqns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_wwns: Vec<String>,
}

impl HostPatch {
    /// Route an initiator to the IQN or WWN list by its shape.
    pub fn initiator(id: &str) -> Self {
        if id.starts_with("iqn.") || id.starts_with("eui.") {
            Self {
                add_iqns: vec![id.to_string()],
                ..Default::default()
            }
        } else {
            Self {
                add_wwns: vec![id.replace(':', "").to_uppercase()],
                ..Default::default()
            }
        }
    }
}

// ── Connections ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    pub host: Reference,
    pub volume: Reference,
    #[serde(default)]
    pub lun: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_routes_by_shape() {
        let iqn = HostPatch::initiator("iqn.1998-01.com.vmware:esx01");
        assert_eq!(iqn.add_iqns, vec!["iqn.1998-01.com.vmware:esx01"]);
        assert!(iqn.add_wwns.is_empty());

        let wwn = HostPatch::initiator("21:00:00:24:ff:4c:aa:01");
        assert_eq!(wwn.add_wwns, vec!["21000024FF4CAA01"]);
        assert!(wwn.add_iqns.is_empty());
    }

    #[test]
    fn patch_omits_empty_lists() {
        let body = serde_json::to_value(HostPatch::initiator("iqn.x")).unwrap();
        assert!(body.get("add_wwns").is_none());
    }
}
