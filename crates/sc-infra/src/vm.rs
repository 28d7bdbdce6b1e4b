use std::future::Future;

use async_trait::async_trait;

use crate::ipam::IpAllocator;
use crate::profile::VmProfile;
use crate::types::{InstanceHandle, InstanceSummary, IpLease, SnapshotInfo};
use crate::{BackendKind, Error, Result};

/// Backend-agnostic interface for hypervisor backends.
///
/// Each backend (vSphere, CloudStack, Harvester) implements this trait and is
/// bound to one service entry of one site.
#[async_trait]
pub trait VmDriver: Send + Sync {
    /// Service entry host this driver talks to.
    fn host(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Create one instance from `profile` at the first unused name index.
    async fn create_instance(&self, profile: &VmProfile) -> Result<InstanceHandle>;

    /// Destroy the instance whose name or id is `name_or_id`.
    async fn delete_instance(&self, name_or_id: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>>;

    /// Bring CPU, memory, disks and networks in line with `profile`.
    async fn modify_instance(&self, name_or_id: &str, profile: &VmProfile) -> Result<()>;

    /// Snapshot the instance; `name` defaults to `snapshot_<instance>`.
    async fn snapshot_instance(&self, name_or_id: &str, name: Option<&str>) -> Result<SnapshotInfo>;
}

pub fn default_snapshot_name(instance: &str) -> String {
    format!("snapshot_{instance}")
}

/// Linear scan for an item whose name or id equals `needle`.
pub fn find_by_name_or_id<'a, T>(
    items: &'a [T],
    needle: &str,
    keys: impl Fn(&T) -> (&str, &str),
) -> Option<&'a T> {
    items.iter().find(|item| {
        let (name, id) = keys(item);
        name == needle || id == needle
    })
}

/// One lease per network, in profile order. Already-taken leases are
/// released if a later allocation fails.
pub async fn allocate_leases(
    ipam: &dyn IpAllocator,
    profile: &VmProfile,
    hostname: &str,
) -> Result<Vec<IpLease>> {
    let mut leases = Vec::with_capacity(profile.networks.len());
    for net in &profile.networks {
        match ipam.allocate(&net.vlan, hostname).await {
            Ok(lease) => leases.push(lease),
            Err(e) => {
                release_leases(ipam, &leases).await;
                return Err(e);
            }
        }
    }
    Ok(leases)
}

/// Best-effort release; failures are logged and skipped.
pub async fn release_leases(ipam: &dyn IpAllocator, leases: &[IpLease]) {
    for lease in leases {
        if let Err(e) = ipam.release(lease).await {
            tracing::warn!(address = %lease.address, vlan = %lease.vlan, error = %e, "ipam: release failed");
        }
    }
}

/// Undo a failed create.
///
/// A timeout means the backend may still finish the work, so the instance
/// and its leases stay. Any other failure releases the leases and, when the
/// backend accepted the create, runs `destroy` against the instance this
/// call submitted. `destroy` is `None` when the submit itself failed: a
/// same-named instance may then belong to someone else.
pub async fn compensate<F>(
    backend: BackendKind,
    ipam: &dyn IpAllocator,
    name: &str,
    leases: &[IpLease],
    err: &Error,
    destroy: Option<F>,
) where
    F: Future<Output = Result<()>>,
{
    if let Error::ProvisioningTimeout { .. } = err {
        tracing::warn!(
            %backend,
            vm = name,
            leases = leases.len(),
            "create timed out; leaving instance and addresses in place"
        );
        return;
    }

    tracing::error!(%backend, vm = name, error = %err, "create failed, cleaning up");
    match destroy {
        Some(destroy) => {
            if let Err(e) = destroy.await {
                tracing::warn!(%backend, vm = name, error = %e, "cleanup destroy failed");
            }
        }
        None => tracing::debug!(%backend, vm = name, "create was not accepted, nothing to destroy"),
    }
    release_leases(ipam, leases).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::NetworkSpec;
    use crate::testing::FakeIpam;
    use std::net::Ipv4Addr;

    fn profile(vlans: &[&str]) -> VmProfile {
        VmProfile {
            name: "web01".into(),
            hostname: "web{index:02d}".into(),
            cpu: 2,
            memory_mib: 4096,
            template: "tpl".into(),
            service_offering: None,
            disk_offering: None,
            disks: vec![],
            networks: vlans
                .iter()
                .map(|v| NetworkSpec {
                    name: format!("{v}-pg"),
                    vlan: v.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_partial_allocation_is_rolled_back() {
        let ipam = FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24);

        let err = allocate_leases(&ipam, &profile(&["prod", "backup"]), "web01")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VlanNotFound(ref v) if v == "backup"));
        assert_eq!(ipam.allocated().len(), 1);
        assert_eq!(ipam.released(), ipam.allocated());
    }

    #[tokio::test]
    async fn test_compensate_keeps_everything_on_timeout() {
        let ipam = FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24);
        let leases = allocate_leases(&ipam, &profile(&["prod"]), "web01").await.unwrap();
        let timeout = Error::ProvisioningTimeout {
            what: "clone web01".into(),
            waited_secs: 600,
        };

        let mut destroyed = false;
        compensate(BackendKind::Vsphere, &ipam, "web01", &leases, &timeout, Some(async {
            destroyed = true;
            Ok(())
        }))
        .await;
        assert!(!destroyed);
        assert!(ipam.released().is_empty());

        let failed = Error::ProvisioningFailed("no datastore".into());
        compensate(BackendKind::Vsphere, &ipam, "web01", &leases, &failed, Some(async {
            destroyed = true;
            Ok(())
        }))
        .await;
        assert!(destroyed);
        assert_eq!(ipam.released(), leases);
    }

    #[tokio::test]
    async fn test_rejected_submit_only_releases_leases() {
        let ipam = FakeIpam::default().with_vlan("prod", "7", Ipv4Addr::new(10, 20, 0, 11), 24);
        let leases = allocate_leases(&ipam, &profile(&["prod"]), "web01").await.unwrap();
        let conflict = Error::ProvisioningFailed("web01 already exists".into());

        let destroy: Option<std::future::Ready<Result<()>>> = None;
        compensate(BackendKind::Harvester, &ipam, "web01", &leases, &conflict, destroy).await;

        assert_eq!(ipam.released(), leases);
    }

    #[test]
    fn finds_by_name_or_id() {
        fn by<'a>(t: &'a (&str, &str)) -> (&'a str, &'a str) {
            (t.0, t.1)
        }
        let items = vec![("web01", "vm-1"), ("web02", "vm-2")];
        assert_eq!(find_by_name_or_id(&items, "web02", by), Some(&items[1]));
        assert_eq!(find_by_name_or_id(&items, "vm-1", by), Some(&items[0]));
        assert_eq!(find_by_name_or_id(&items, "web03", by), None);
        assert_eq!(default_snapshot_name("web01"), "snapshot_web01");
    }
}
