use std::net::Ipv4Addr;

use async_trait::async_trait;
use phpipam_api::{PhpIpamClient, ReserveRequest};

use crate::types::IpLease;
use crate::{Error, Result};

#[async_trait]
pub trait IpAllocator: Send + Sync {
    /// Reserve a free address on `vlan`, tagged with `hostname`.
    async fn allocate(&self, vlan: &str, hostname: &str) -> Result<IpLease>;

    /// Give back an address from [`Self::allocate`].
    async fn release(&self, lease: &IpLease) -> Result<()>;
}

pub struct PhpIpamAllocator {
    client: PhpIpamClient,
}

impl PhpIpamAllocator {
    pub fn new(client: PhpIpamClient) -> Self {
        Self { client }
    }

    /// VLAN name to subnet id. Looked up on every call.
    async fn subnet_for(&self, vlan: &str) -> Result<String> {
        let vlans = match self.client.list_vlans().await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let found = vlans
            .into_iter()
            .find(|v| v.name == vlan)
            .ok_or_else(|| Error::VlanNotFound(vlan.to_string()))?;

        if let Some(subnet_id) = found.subnet_id {
            return Ok(subnet_id);
        }

        match self.client.vlan_subnets(&found.vlan_id).await {
            Ok(subnets) => subnets
                .into_iter()
                .next()
                .map(|s| s.id)
                .ok_or_else(|| Error::VlanNotFound(vlan.to_string())),
            Err(e) if e.is_not_found() => Err(Error::VlanNotFound(vlan.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Subnet details for an address that is already reserved.
    async fn lease(&self, vlan: &str, subnet_id: &str, address: &str) -> Result<IpLease> {
        let parsed: Ipv4Addr = address
            .parse()
            .map_err(|_| Error::ProvisioningFailed(format!("ipam returned bad address {address:?}")))?;

        let subnet = self.client.get_subnet(subnet_id).await?;
        let prefix_len = prefix_len(&subnet.mask).ok_or_else(|| {
            Error::ProvisioningFailed(format!("subnet {subnet_id} has unusable mask {:?}", subnet.mask))
        })?;

        Ok(IpLease {
            vlan: vlan.to_string(),
            subnet_id: subnet_id.to_string(),
            address: parsed,
            prefix_len,
            gateway: subnet.gateway.and_then(|g| g.ip_addr.parse().ok()),
            dns_servers: subnet.nameservers.map(|n| n.servers()).unwrap_or_default(),
        })
    }
}

/// Prefix length from a mask written as `24` or `255.255.255.0`.
fn prefix_len(mask: &str) -> Option<u8> {
    if let Ok(len) = mask.parse::<u8>() {
        return (len <= 32).then_some(len);
    }
    let bits = u32::from(mask.parse::<Ipv4Addr>().ok()?);
    let len = bits.leading_ones();
    (bits.count_ones() == len).then_some(len as u8)
}

#[async_trait]
impl IpAllocator for PhpIpamAllocator {
    async fn allocate(&self, vlan: &str, hostname: &str) -> Result<IpLease> {
        let subnet_id = self.subnet_for(vlan).await?;

        let req = ReserveRequest {
            hostname: Some(hostname.to_string()),
            description: Some("reserved by sitectl".into()),
        };
        let exhausted = || Error::AllocationExhausted {
            vlan: vlan.to_string(),
            subnet_id: subnet_id.clone(),
        };
        let address = match self.client.reserve_first_free(&subnet_id, &req).await {
            Ok(ip) => ip,
            Err(phpipam_api::Error::Empty { .. }) => return Err(exhausted()),
            Err(e) if e.is_not_found() => return Err(exhausted()),
            Err(e) => return Err(e.into()),
        };
        match self.lease(vlan, &subnet_id, &address).await {
            Ok(lease) => {
                tracing::info!(vlan, address = %lease.address, subnet = %subnet_id, "ipam: address reserved");
                Ok(lease)
            }
            Err(e) => {
                if let Err(release) = self.client.release_address(&address, &subnet_id).await {
                    tracing::warn!(vlan, %address, error = %release, "ipam: release failed");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, lease: &IpLease) -> Result<()> {
        self.client
            .release_address(&lease.address.to_string(), &lease.subnet_id)
            .await?;
        tracing::info!(vlan = %lease.vlan, address = %lease.address, "ipam: address released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post};
    use serde_json::json;

    fn ok(data: serde_json::Value) -> Json<serde_json::Value> {
        Json(json!({"code": 200, "success": true, "data": data}))
    }

    fn router(first_free: serde_json::Value) -> axum::Router {
        let subnet = json!({
            "id": 7, "subnet": "10.20.0.0", "mask": "24",
            "gateway": {"ip_addr": "10.20.0.1"},
            "nameservers": {"namesrv1": "10.0.0.53;10.0.0.54"}
        });
        router_with_subnet(first_free, StatusCode::OK, subnet)
    }

    fn router_with_subnet(first_free: serde_json::Value, status: StatusCode, subnet: serde_json::Value) -> axum::Router {
        axum::Router::new()
            .route("/api/sitectl/user/", post(|| async { ok(json!({"token": "tok"})) }))
            .route(
                "/api/sitectl/vlan/",
                get(|| async {
                    ok(json!([
                        {"vlanId": "3", "name": "mgmt", "number": 10},
                        {"vlanId": 4, "name": "prod", "number": "20"}
                    ]))
                }),
            )
            .route(
                "/api/sitectl/vlan/{id}/subnets/",
                get(|| async { ok(json!([{"id": "7", "subnet": "10.20.0.0", "mask": "24"}])) }),
            )
            .route(
                "/api/sitectl/addresses/first_free/{subnet}/",
                post(move || {
                    let body = first_free.clone();
                    async move { Json(body) }
                }),
            )
            .route(
                "/api/sitectl/subnets/{id}/",
                get(move || {
                    let body = subnet.clone();
                    async move { (status, ok(body)) }
                }),
            )
            .route("/api/sitectl/addresses/{ip}/{subnet}/", delete(|| async { ok(json!(null)) }))
    }

    async fn allocator(server: &FakeServer) -> PhpIpamAllocator {
        let client = PhpIpamClient::login(server.url(), "sitectl", "u", "p")
            .await
            .unwrap();
        PhpIpamAllocator::new(client)
    }

    #[tokio::test]
    async fn test_allocates_from_vlan_subnet() {
        let server = FakeServer::start(router(json!({"success": true, "data": "10.20.0.11"}))).await;
        let ipam = allocator(&server).await;

        let lease = ipam.allocate("prod", "web01").await.unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 20, 0, 11));
        assert_eq!(lease.subnet_id, "7");
        assert_eq!(lease.prefix_len, 24);
        assert_eq!(lease.gateway, Some(Ipv4Addr::new(10, 20, 0, 1)));
        assert_eq!(lease.dns_servers, vec!["10.0.0.53", "10.0.0.54"]);

        let reserve = server.requests_to("POST", "/api/sitectl/addresses/first_free/7/");
        assert_eq!(reserve.len(), 1);
        assert_eq!(reserve[0].header("token"), Some("tok"));
        assert_eq!(reserve[0].json()["hostname"], "web01");

        ipam.release(&lease).await.unwrap();
        assert_eq!(server.hits("DELETE", "/api/sitectl/addresses/10.20.0.11/7/"), 1);
    }

    #[tokio::test]
    async fn test_unknown_vlan_never_reserves() {
        let server = FakeServer::start(router(json!({"success": true, "data": "10.20.0.11"}))).await;
        let ipam = allocator(&server).await;

        let err = ipam.allocate("dmz", "web01").await.unwrap_err();
        assert!(matches!(err, Error::VlanNotFound(ref v) if v == "dmz"));
        assert_eq!(server.hits_containing("first_free"), 0);
    }

    #[tokio::test]
    async fn test_full_subnet_is_exhausted() {
        let server = FakeServer::start(router(json!({"success": false, "message": "No free addresses"}))).await;
        let ipam = allocator(&server).await;

        let err = ipam.allocate("prod", "web01").await.unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted { ref subnet_id, .. } if subnet_id == "7"));
    }

    #[tokio::test]
    async fn test_reservation_is_returned_when_subnet_lookup_fails() {
        let server = FakeServer::start(router_with_subnet(
            json!({"success": true, "data": "10.20.0.11"}),
            StatusCode::INTERNAL_SERVER_ERROR,
            json!(null),
        ))
        .await;
        let ipam = allocator(&server).await;

        let err = ipam.allocate("prod", "web01").await.unwrap_err();
        assert!(matches!(err, Error::Ipam(_)), "{err:?}");
        assert_eq!(server.hits("POST", "/api/sitectl/addresses/first_free/7/"), 1);
        assert_eq!(server.hits("DELETE", "/api/sitectl/addresses/10.20.0.11/7/"), 1);
    }

    #[tokio::test]
    async fn test_unusable_mask_is_an_error() {
        let server = FakeServer::start(router_with_subnet(
            json!({"success": true, "data": "10.20.0.11"}),
            StatusCode::OK,
            json!({"id": 7, "subnet": "10.20.0.0", "mask": "255.0.255.0"}),
        ))
        .await;
        let ipam = allocator(&server).await;

        let err = ipam.allocate("prod", "web01").await.unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed(ref m) if m.contains("mask")), "{err:?}");
        assert_eq!(server.hits("DELETE", "/api/sitectl/addresses/10.20.0.11/7/"), 1);
    }

    #[test]
    fn mask_forms() {
        assert_eq!(prefix_len("24"), Some(24));
        assert_eq!(prefix_len("255.255.252.0"), Some(22));
        assert_eq!(prefix_len("0.0.0.0"), Some(0));
        assert_eq!(prefix_len("33"), None);
        assert_eq!(prefix_len("255.0.255.0"), None);
        assert_eq!(prefix_len(""), None);
    }
}
