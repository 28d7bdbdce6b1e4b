use std::fmt;
use std::net::Ipv4Addr;

/// Returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    pub name: String,
    pub host: Option<String>,
    pub addresses: Vec<String>,
}

/// Backend-agnostic power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Starting,
    Error,
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Suspended => "suspended",
            Self::Starting => "starting",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `list_instances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub cpu: Option<u32>,
    pub memory_mib: Option<u64>,
    /// Only set when the backend reports disk sizes in the listing.
    pub disk_gb: Option<u64>,
    pub networks: Vec<String>,
    pub addresses: Vec<String>,
    pub power: PowerState,
    pub snapshots: Vec<String>,
    pub host: Option<String>,
}

impl InstanceSummary {
    pub fn new(id: impl Into<String>, name: impl Into<String>, power: PowerState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cpu: None,
            memory_mib: None,
            disk_gb: None,
            networks: Vec::new(),
            addresses: Vec::new(),
            power,
            snapshots: Vec::new(),
            host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub instance: String,
    pub name: String,
    pub id: Option<String>,
}

/// An address reserved in IPAM for one network of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLease {
    pub vlan: String,
    pub subnet_id: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<String>,
}

impl IpLease {
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        };
        Ipv4Addr::from(bits)
    }

    /// `address/prefix`.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(prefix_len: u8) -> IpLease {
        IpLease {
            vlan: "prod".into(),
            subnet_id: "7".into(),
            address: Ipv4Addr::new(10, 20, 0, 11),
            prefix_len,
            gateway: Some(Ipv4Addr::new(10, 20, 0, 1)),
            dns_servers: vec![],
        }
    }

    #[test]
    fn netmask_follows_prefix() {
        assert_eq!(lease(24).netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(lease(26).netmask(), Ipv4Addr::new(255, 255, 255, 192));
        assert_eq!(lease(32).netmask(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(lease(0).netmask(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(lease(24).cidr(), "10.20.0.11/24");
    }
}
