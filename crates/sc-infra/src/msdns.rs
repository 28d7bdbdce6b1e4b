use std::sync::Arc;

use async_trait::async_trait;
use msdns_api::{DnsClient, RemoteShell, ResourceRecord, SshShell};

use crate::config::MsDnsParams;
use crate::dns::{DnsDriver, DnsRecord, RecordType};
use crate::{BackendKind, Error, Result};

/// Names compare case-insensitively and without the trailing root dot.
fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Convert a projected cmdlet row. Rows of other types (SOA, NS, SRV) are
/// skipped.
fn to_record(rr: ResourceRecord) -> Option<DnsRecord> {
    let rr_type = rr.kind()?;
    let (value, priority) = match rr_type {
        RecordType::Mx => match rr.data.split_once(' ') {
            Some((pref, exchange)) => (exchange.to_string(), pref.parse().ok()),
            None => (rr.data, None),
        },
        _ => (rr.data, None),
    };
    Some(DnsRecord {
        name: rr.host_name,
        rr_type,
        value,
        ttl: rr.ttl,
        priority,
    })
}

fn ptr_read_only() -> Error {
    Error::UnsupportedRecordType("PTR (created together with its A record)".into())
}

pub struct MsDnsDriver {
    host: String,
    client: DnsClient,
    default_ttl: u32,
}

impl MsDnsDriver {
    /// Driver over OpenSSH to the configured DNS server.
    pub fn connect(host: &str, params: &MsDnsParams) -> Self {
        let mut shell = SshShell::new(&params.ssh);
        if let Some(port) = params.port {
            shell = shell.port(port);
        }
        if let Some(identity) = &params.identity {
            shell = shell.identity(identity);
        }
        Self::with_shell(host, params, Arc::new(shell))
    }

    pub fn with_shell(host: &str, params: &MsDnsParams, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            host: host.to_string(),
            client: DnsClient::new(&params.zone, shell),
            default_ttl: params.ttl,
        }
    }

    async fn records(&self, rr_type: Option<RecordType>, name: Option<&str>) -> Result<Vec<DnsRecord>> {
        Ok(self
            .client
            .get_records(rr_type, name)
            .await?
            .into_iter()
            .filter_map(to_record)
            .collect())
    }
}

#[async_trait]
impl DnsDriver for MsDnsDriver {
    fn host(&self) -> &str {
        &self.host
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Msdns
    }

    fn zone(&self) -> &str {
        self.client.zone()
    }

    async fn get_record(&self, rr_type: RecordType, name: &str) -> Result<Vec<DnsRecord>> {
        self.records(Some(rr_type), Some(name)).await
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<()> {
        match (record.rr_type, record.priority) {
            (RecordType::Ptr, _) => return Err(ptr_read_only()),
            (RecordType::Mx, None) => {
                return Err(Error::UnsupportedRecordType("MX without a priority".into()));
            }
            _ => {}
        }

        let existing = self.get_record(record.rr_type, &record.name).await?;
        if !existing.is_empty() {
            return Err(Error::RecordExists {
                rr_type: record.rr_type.to_string(),
                name: record.name.clone(),
            });
        }

        let ttl = record.ttl.unwrap_or(self.default_ttl);
        let name = &record.name;
        let value = &record.value;
        match record.rr_type {
            RecordType::A => self.client.add_a(name, value, ttl, true).await?,
            RecordType::Cname => self.client.add_cname(name, value, ttl).await?,
            RecordType::Mx => {
                self.client
                    .add_mx(name, value, record.priority.unwrap_or_default(), ttl)
                    .await?
            }
            RecordType::Txt => self.client.add_txt(name, value, ttl).await?,
            RecordType::Ptr => return Err(ptr_read_only()),
        }
        tracing::info!(zone = self.zone(), record = %record, ttl, "msdns: record added");
        Ok(())
    }

    async fn delete_record(&self, rr_type: RecordType, name: &str, value: &str) -> Result<()> {
        let existing = self.get_record(rr_type, name).await?;
        let found = existing
            .iter()
            .find(|r| same_name(&r.value, value))
            .ok_or_else(|| Error::InstanceNotFound(format!("{name} {rr_type} {value}")))?;

        self.client.remove(rr_type, name, &found.value).await?;
        tracing::info!(zone = self.zone(), record = %found, "msdns: record removed");
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        self.records(None, None).await
    }
}
