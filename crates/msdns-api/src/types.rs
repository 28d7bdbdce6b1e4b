use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// Record types the cmdlets in this crate understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Cname,
    Mx,
    Txt,
    Ptr,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Ptr => "PTR",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRecordType(pub String);

impl fmt::Display for UnknownRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown record type: {}", self.0)
    }
}

impl std::error::Error for UnknownRecordType {}

impl FromStr for RecordType {
    type Err = UnknownRecordType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "CNAME" => Ok(RecordType::Cname),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "PTR" => Ok(RecordType::Ptr),
            _ => Err(UnknownRecordType(s.to_string())),
        }
    }
}

/// One row of `Get-DnsServerResourceRecord` after projection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "HostName")]
    pub host_name: String,
    /// Kept as text: zones also hold SOA, NS and SRV rows.
    #[serde(rename = "RecordType")]
    pub record_type: String,
    #[serde(rename = "Ttl", default)]
    pub ttl: Option<u32>,
    #[serde(rename = "Data", default, deserialize_with = "null_as_empty")]
    pub data: String,
}

impl ResourceRecord {
    pub fn kind(&self) -> Option<RecordType> {
        self.record_type.parse().ok()
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_parses_case_insensitively() {
        assert_eq!("cname".parse::<RecordType>().unwrap(), RecordType::Cname);
        assert_eq!(RecordType::Mx.to_string(), "MX");
        assert!("SRV".parse::<RecordType>().is_err());
    }

    #[test]
    fn null_data_decodes_as_empty() {
        let rec: ResourceRecord = serde_json::from_str(
            r#"{"HostName":"@","RecordType":"SOA","Ttl":3600,"Data":null}"#,
        )
        .unwrap();
        assert_eq!(rec.data, "");
        assert_eq!(rec.kind(), None);
    }
}
