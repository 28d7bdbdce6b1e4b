//! In-process fakes for vendor APIs and the injected services.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;

use crate::ipam::IpAllocator;
use crate::secrets::{Credential, SecretProvider};
use crate::types::IpLease;
use crate::{Error, Result};

type Log = Arc<Mutex<Vec<Recorded>>>;

/// One request seen by a [`FakeServer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    }
}

/// An axum router on `127.0.0.1:0` that records every request, routed or not.
pub struct FakeServer {
    addr: SocketAddr,
    log: Log,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(router: Router) -> Self {
        let log: Log = Arc::default();
        let app = router.layer(middleware::from_fn_with_state(log.clone(), record));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, log, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    pub fn hits(&self, method: &str, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    /// Requests of any method whose path contains `fragment`.
    pub fn hits_containing(&self, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path.contains(fragment))
            .count()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record(State(log): State<Log>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    log.lock().unwrap().push(Recorded {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers.clone(),
        body: bytes.to_vec(),
    });

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Fixed secrets keyed by full path.
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, Credential>,
    reads: Mutex<Vec<String>>,
}

impl StaticSecrets {
    pub fn with(mut self, path: &str, pairs: &[(&str, &str)]) -> Self {
        let cred = Credential::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self.values.insert(path.to_string(), cred);
        self
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn read_secret(&self, path: &str) -> Result<Credential> {
        self.reads.lock().unwrap().push(path.to_string());
        self.values
            .get(path)
            .cloned()
            .ok_or_else(|| Error::AuthError(format!("no secret at {path}")))
    }
}

/// Hands out sequential addresses per VLAN and records releases.
#[derive(Default)]
pub struct FakeIpam {
    pools: HashMap<String, (String, Ipv4Addr, u8)>,
    state: Mutex<FakeIpamState>,
}

#[derive(Default)]
struct FakeIpamState {
    next: HashMap<String, u32>,
    allocated: Vec<IpLease>,
    released: Vec<IpLease>,
}

impl FakeIpam {
    /// `first` is the first address handed out for `vlan`.
    pub fn with_vlan(mut self, vlan: &str, subnet_id: &str, first: Ipv4Addr, prefix_len: u8) -> Self {
        self.pools
            .insert(vlan.to_string(), (subnet_id.to_string(), first, prefix_len));
        self
    }

    pub fn allocated(&self) -> Vec<IpLease> {
        self.state.lock().unwrap().allocated.clone()
    }

    pub fn released(&self) -> Vec<IpLease> {
        self.state.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl IpAllocator for FakeIpam {
    async fn allocate(&self, vlan: &str, _hostname: &str) -> Result<IpLease> {
        let (subnet_id, first, prefix_len) = self
            .pools
            .get(vlan)
            .cloned()
            .ok_or_else(|| Error::VlanNotFound(vlan.to_string()))?;

        let mut state = self.state.lock().unwrap();
        let offset = state.next.entry(vlan.to_string()).or_insert(0);
        let address = Ipv4Addr::from(u32::from(first) + *offset);
        *offset += 1;

        let lease = IpLease {
            vlan: vlan.to_string(),
            subnet_id,
            address,
            prefix_len,
            gateway: Some(Ipv4Addr::from((u32::from(first) & !0xff) | 1)),
            dns_servers: vec!["10.0.0.53".into()],
        };
        state.allocated.push(lease.clone());
        Ok(lease)
    }

    async fn release(&self, lease: &IpLease) -> Result<()> {
        self.state.lock().unwrap().released.push(lease.clone());
        Ok(())
    }
}
