use std::fmt;

use async_trait::async_trait;

pub use msdns_api::RecordType;

use crate::{BackendKind, Error, Result};

/// One resource record in a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rr_type: RecordType,
    /// Address, target name or text, depending on the type. For MX this is
    /// the exchange; the preference lives in `priority`.
    pub value: String,
    pub ttl: Option<u32>,
    pub priority: Option<u16>,
}

impl DnsRecord {
    pub fn new(rr_type: RecordType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rr_type,
            value: value.into(),
            ttl: None,
            priority: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.rr_type)?;
        if let Some(p) = self.priority {
            write!(f, " {p}")?;
        }
        write!(f, " {}", self.value)
    }
}

/// Parse a user-supplied record type; anything outside A, CNAME, MX, TXT
/// and PTR is `UnsupportedRecordType`.
pub fn parse_record_type(raw: &str) -> Result<RecordType> {
    raw.parse()
        .map_err(|_| Error::UnsupportedRecordType(raw.to_string()))
}

/// Record management for one zone on one DNS server.
#[async_trait]
pub trait DnsDriver: Send + Sync {
    fn host(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn zone(&self) -> &str;

    /// Records of `rr_type` owned by `name`; empty when there are none.
    async fn get_record(&self, rr_type: RecordType, name: &str) -> Result<Vec<DnsRecord>>;

    /// Add a record. A records also get their PTR.
    async fn add_record(&self, record: &DnsRecord) -> Result<()>;

    async fn delete_record(&self, rr_type: RecordType, name: &str, value: &str) -> Result<()>;

    async fn list_records(&self) -> Result<Vec<DnsRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_types_parse_case_insensitively() {
        assert_eq!(parse_record_type("cname").unwrap(), RecordType::Cname);
        assert!(matches!(
            parse_record_type("SRV"),
            Err(Error::UnsupportedRecordType(ref t)) if t == "SRV"
        ));
    }

    #[test]
    fn display_includes_mx_priority() {
        let mx = DnsRecord::new(RecordType::Mx, "@", "mail.corp.example").with_priority(10);
        assert_eq!(mx.to_string(), "@ MX 10 mail.corp.example");
    }
}
