//! Tables for humans, JSON for scripts.

use std::io::Write;

use sc_infra::config::SiteTable;
use sc_infra::dns::DnsRecord;
use sc_infra::storage::{LunInfo, LunMapping, StorageHost};
use sc_infra::types::InstanceSummary;
use sc_infra::ServiceType;
use serde_json::{Value, json};

pub trait Outputable {
    fn to_json(&self) -> Value;

    fn to_table(&self) -> Table;
}

pub fn print_output<T: Outputable>(out: &mut dyn Write, value: &T, as_json: bool) -> std::io::Result<()> {
    if as_json {
        let body = serde_json::to_string_pretty(&value.to_json())
            .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize: {e}\"}}"));
        writeln!(out, "{body}")
    } else {
        write!(out, "{}", value.to_table().render())
    }
}

/// Left-aligned columns, two spaces apart.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&'static str]) -> Self {
        Self {
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.len()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }

        let line = |cells: Vec<&str>| {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(c, &w)| format!("{c:<w$}"))
                .collect();
            format!("{}\n", padded.join("  ").trim_end())
        };

        let mut rendered = line(self.headers.clone());
        for row in &self.rows {
            rendered.push_str(&line(row.iter().map(String::as_str).collect()));
        }
        rendered
    }
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "-".into()
    } else {
        items.join(", ")
    }
}

pub struct Instances<'a>(pub &'a [InstanceSummary]);

impl Outputable for Instances<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|i| {
                    json!({
                        "id": i.id,
                        "name": i.name,
                        "cpu": i.cpu,
                        "memory_mib": i.memory_mib,
                        "disk_gb": i.disk_gb,
                        "networks": i.networks,
                        "addresses": i.addresses,
                        "power": i.power.as_str(),
                        "snapshots": i.snapshots,
                        "host": i.host,
                    })
                })
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&[
            "NAME", "ID", "VCPU", "MEMORY (GB)", "DISK (GB)", "NETWORKS", "ADDRESSES", "POWER", "SNAPSHOTS",
            "HOST",
        ]);
        for i in self.0 {
            table.push(vec![
                i.name.clone(),
                i.id.clone(),
                opt(i.cpu),
                opt(i.memory_mib.map(|m| format!("{:.1}", m as f64 / 1024.0))),
                opt(i.disk_gb),
                list(&i.networks),
                list(&i.addresses),
                i.power.to_string(),
                list(&i.snapshots),
                opt(i.host.as_deref()),
            ]);
        }
        table
    }
}

pub struct Luns<'a>(pub &'a [LunInfo]);

impl Outputable for Luns<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|l| json!({"name": l.name, "size_gb": l.size_gb, "serial": l.serial, "hosts": l.hosts}))
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&["VOLUME", "SIZE (GB)", "SERIAL", "HOSTS"]);
        for l in self.0 {
            table.push(vec![
                l.name.clone(),
                l.size_gb.to_string(),
                opt(l.serial.as_deref()),
                list(&l.hosts),
            ]);
        }
        table
    }
}

pub struct Hosts<'a>(pub &'a [StorageHost]);

impl Outputable for Hosts<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|h| json!({"name": h.name, "initiators": h.initiators}))
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&["HOST", "INITIATORS"]);
        for h in self.0 {
            table.push(vec![h.name.clone(), list(&h.initiators)]);
        }
        table
    }
}

pub struct Mappings<'a>(pub &'a [LunMapping]);

impl Outputable for Mappings<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|m| json!({"host": m.host, "volume": m.volume, "lun": m.lun}))
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&["HOST", "VOLUME", "LUN"]);
        for m in self.0 {
            table.push(vec![m.host.clone(), m.volume.clone(), opt(m.lun)]);
        }
        table
    }
}

pub struct Records<'a>(pub &'a [DnsRecord]);

impl Outputable for Records<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|r| {
                    json!({
                        "type": r.rr_type.to_string(),
                        "name": r.name,
                        "value": r.value,
                        "ttl": r.ttl,
                        "priority": r.priority,
                    })
                })
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&["TYPE", "NAME", "VALUE", "TTL"]);
        for r in self.0 {
            let value = match r.priority {
                Some(p) => format!("{p} {}", r.value),
                None => r.value.clone(),
            };
            table.push(vec![r.rr_type.to_string(), r.name.clone(), value, opt(r.ttl)]);
        }
        table
    }
}

/// Every service entry of every site.
pub struct Services<'a>(pub &'a SiteTable);

impl Services<'_> {
    fn rows(&self) -> Vec<(String, ServiceType, String, String)> {
        let mut rows = Vec::new();
        for name in self.0.names() {
            let Ok(site) = self.0.site(name) else { continue };
            for service in [ServiceType::Hypervisor, ServiceType::Storage, ServiceType::Dns] {
                for entry in site.entries(service) {
                    rows.push((name.to_string(), service, entry.host.clone(), entry.kind().to_string()));
                }
            }
        }
        rows
    }
}

impl Outputable for Services<'_> {
    fn to_json(&self) -> Value {
        Value::Array(
            self.rows()
                .into_iter()
                .map(|(site, service, host, kind)| {
                    json!({"site": site, "service": service.as_str(), "host": host, "type": kind})
                })
                .collect(),
        )
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&["SITE", "SERVICE", "HOST", "TYPE"]);
        for (site, service, host, kind) in self.rows() {
            table.push(vec![site, service.to_string(), host, kind]);
        }
        table
    }
}
