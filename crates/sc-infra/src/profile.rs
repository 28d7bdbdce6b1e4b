//! VM profiles: one YAML file per profile, named by file stem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub size_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkSpec {
    /// Backend network or port group label.
    pub name: String,
    /// IPAM VLAN the address is drawn from.
    pub vlan: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmProfile {
    #[serde(skip)]
    pub name: String,
    /// Hostname with one `{index}` or `{index:0Nd}` placeholder.
    pub hostname: String,
    pub cpu: u32,
    pub memory_mib: u64,
    /// Template (vSphere, CloudStack) or image (Harvester) reference.
    pub template: String,
    #[serde(default)]
    pub service_offering: Option<String>,
    #[serde(default)]
    pub disk_offering: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
}

impl VmProfile {
    pub fn from_yaml(name: &str, raw: &str) -> Result<Self> {
        let mut profile: VmProfile = serde_yaml::from_str(raw).map_err(|e| Error::ProfileInvalid {
            profile: name.to_string(),
            reason: e.to_string(),
        })?;
        profile.name = name.to_string();
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::ProfileInvalid {
            profile: self.name.clone(),
            reason,
        };

        HostnamePattern::parse(&self.hostname).map_err(invalid)?;
        if self.cpu == 0 {
            return Err(invalid("cpu must be positive".into()));
        }
        if self.memory_mib == 0 {
            return Err(invalid("memory_mib must be positive".into()));
        }

        let mut names = HashSet::new();
        for disk in &self.disks {
            if disk.name.is_empty() {
                return Err(invalid("disk without a name".into()));
            }
            if disk.size_gb == 0 {
                return Err(invalid(format!("disk {} has zero size", disk.name)));
            }
            if !names.insert(disk.name.as_str()) {
                return Err(invalid(format!("duplicate disk name {}", disk.name)));
            }
        }
        for net in &self.networks {
            if net.name.is_empty() || net.vlan.is_empty() {
                return Err(invalid("network entries need a name and a vlan".into()));
            }
        }
        Ok(())
    }

    pub fn pattern(&self) -> Result<HostnamePattern> {
        HostnamePattern::parse(&self.hostname).map_err(|reason| Error::ProfileInvalid {
            profile: self.name.clone(),
            reason,
        })
    }

    pub fn total_disk_gb(&self) -> u64 {
        self.disks.iter().map(|d| u64::from(d.size_gb)).sum()
    }
}

/// A hostname split around its index placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnamePattern {
    prefix: String,
    suffix: String,
    width: usize,
}

impl HostnamePattern {
    pub fn parse(pattern: &str) -> std::result::Result<Self, String> {
        let occurrences = pattern.matches("{index").count();
        if occurrences != 1 {
            return Err(format!(
                "hostname {pattern:?} must contain exactly one {{index}} placeholder"
            ));
        }
        let start = pattern.find("{index").unwrap_or_default();
        let rest = &pattern[start..];
        let end = rest
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in {pattern:?}"))?;
        let spec = &rest["{index".len()..end];

        let width = match spec {
            "" => 0,
            s => s
                .strip_prefix(":0")
                .and_then(|w| w.strip_suffix('d'))
                .and_then(|w| w.parse::<usize>().ok())
                .ok_or_else(|| format!("bad placeholder {{index{s}}} in {pattern:?}"))?,
        };

        Ok(Self {
            prefix: pattern[..start].to_string(),
            suffix: rest[end + 1..].to_string(),
            width,
        })
    }

    pub fn render(&self, index: u32) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        )
    }

    /// Lowest index from 1 whose name is not taken.
    ///
    /// Two concurrent invocations can pick the same name; the backend's
    /// create call is what rejects the loser.
    pub fn first_unused<'a>(&self, existing: impl IntoIterator<Item = &'a str>) -> (u32, String) {
        let taken: HashSet<&str> = existing.into_iter().collect();
        let mut index = 1;
        loop {
            let name = self.render(index);
            if !taken.contains(name.as_str()) {
                return (index, name);
            }
            index += 1;
        }
    }
}

/// Directory of `<name>.yaml` profiles.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::ConfigNotFound(dir));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, name: &str) -> Result<VmProfile> {
        if name.contains(['/', '\\']) {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        let path = ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()))?;

        let raw = std::fs::read_to_string(&path).map_err(|e| Error::ProfileInvalid {
            profile: name.to_string(),
            reason: e.to_string(),
        })?;
        VmProfile::from_yaml(name, &raw)
    }

    /// Profile names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", self.dir.display())))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
