//! Microsoft DNS Server management through PowerShell cmdlets.
//!
//! Cmdlets run on the DNS server itself through a [`RemoteShell`]; the
//! production shell is OpenSSH into the Windows host. Query output is
//! requested as `ConvertTo-Json` and decoded into [`ResourceRecord`]s.

mod shell;
mod types;

pub use shell::{RemoteShell, ShellOutput, SshShell};
pub use types::*;

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote shell failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("msdns {command} exited with {status}: {stderr}")]
    Command {
        command: &'static str,
        status: i32,
        stderr: String,
    },

    #[error("msdns output could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Quote a value as a PowerShell single-quoted literal. PowerShell also
/// closes such literals on the typographic quotes U+2018 to U+201B, so
/// those are doubled along with `'`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn ttl_arg(ttl: u32) -> String {
    format!("([TimeSpan]::FromSeconds({ttl}))")
}

/// Projects each record to `{HostName, RecordType, Ttl, Data}`.
const SELECT: &str = "Select-Object HostName,RecordType,\
@{n='Ttl';e={[int]$_.TimeToLive.TotalSeconds}},\
@{n='Data';e={$r=$_; switch($r.RecordType){\
'A'{$r.RecordData.IPv4Address.IPAddressToString}\
'CNAME'{$r.RecordData.HostNameAlias}\
'MX'{\"$($r.RecordData.Preference) $($r.RecordData.MailExchange)\"}\
'TXT'{$r.RecordData.DescriptiveText}\
'PTR'{$r.RecordData.PtrDomainName}\
default{\"$($r.RecordData)\"}}}}";

/// Cmdlet client bound to one zone on one DNS server.
#[derive(Clone)]
pub struct DnsClient {
    zone: String,
    shell: Arc<dyn RemoteShell>,
}

impl DnsClient {
    pub fn new(zone: impl Into<String>, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            zone: zone.into(),
            shell,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    async fn run(&self, command: &'static str, script: String) -> Result<String> {
        tracing::debug!(zone = %self.zone, command, "msdns: running cmdlet");
        let out = self.shell.run(&script).await?;
        if out.status != 0 {
            return Err(Error::Command {
                command,
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Records in the zone, optionally narrowed by owner name and type.
    pub async fn get_records(
        &self,
        rr_type: Option<RecordType>,
        name: Option<&str>,
    ) -> Result<Vec<ResourceRecord>> {
        let mut query = format!("Get-DnsServerResourceRecord -ZoneName {}", quote(&self.zone));
        if let Some(name) = name {
            query.push_str(&format!(" -Name {}", quote(name)));
        }
        if let Some(rr_type) = rr_type {
            query.push_str(&format!(" -RRType {rr_type}"));
        }
        let script = format!(
            "$records = @({query} -ErrorAction SilentlyContinue | {SELECT}); \
             ConvertTo-Json -Compress -Depth 3 -InputObject $records"
        );

        let stdout = self.run("get records", script).await?;
        parse_records(&stdout)
    }

    // ── Mutations ───────────────────────────────────────────────────

    pub async fn add_a(&self, name: &str, address: &str, ttl: u32, create_ptr: bool) -> Result<()> {
        let mut script = format!(
            "Add-DnsServerResourceRecordA -ZoneName {} -Name {} -IPv4Address {} -TimeToLive {}",
            quote(&self.zone),
            quote(name),
            quote(address),
            ttl_arg(ttl)
        );
        if create_ptr {
            script.push_str(" -CreatePtr");
        }
        self.run("add A record", script).await.map(drop)
    }

    pub async fn add_cname(&self, name: &str, alias: &str, ttl: u32) -> Result<()> {
        let script = format!(
            "Add-DnsServerResourceRecordCName -ZoneName {} -Name {} -HostNameAlias {} -TimeToLive {}",
            quote(&self.zone),
            quote(name),
            quote(alias),
            ttl_arg(ttl)
        );
        self.run("add CNAME record", script).await.map(drop)
    }

    pub async fn add_mx(&self, name: &str, exchange: &str, preference: u16, ttl: u32) -> Result<()> {
        let script = format!(
            "Add-DnsServerResourceRecordMX -ZoneName {} -Name {} -MailExchange {} -Preference {preference} -TimeToLive {}",
            quote(&self.zone),
            quote(name),
            quote(exchange),
            ttl_arg(ttl)
        );
        self.run("add MX record", script).await.map(drop)
    }

    pub async fn add_txt(&self, name: &str, text: &str, ttl: u32) -> Result<()> {
        let script = format!(
            "Add-DnsServerResourceRecord -Txt -ZoneName {} -Name {} -DescriptiveText {} -TimeToLive {}",
            quote(&self.zone),
            quote(name),
            quote(text),
            ttl_arg(ttl)
        );
        self.run("add TXT record", script).await.map(drop)
    }

    pub async fn remove(&self, rr_type: RecordType, name: &str, data: &str) -> Result<()> {
        let script = format!(
            "Remove-DnsServerResourceRecord -ZoneName {} -Name {} -RRType {rr_type} -RecordData {} -Force",
            quote(&self.zone),
            quote(name),
            quote(data)
        );
        self.run("remove record", script).await.map(drop)
    }
}

/// Decode `ConvertTo-Json` output, which collapses one-element arrays into
/// a bare object on older PowerShell builds.
pub fn parse_records(stdout: &str) -> Result<Vec<ResourceRecord>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<serde_json::Value>(trimmed)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedShell {
        scripts: Mutex<Vec<String>>,
        reply: ShellOutput,
    }

    impl ScriptedShell {
        fn new(stdout: &str) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(Vec::new()),
                reply: ShellOutput {
                    status: 0,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            })
        }
    }

    #[async_trait::async_trait]
    impl RemoteShell for ScriptedShell {
        async fn run(&self, script: &str) -> std::io::Result<ShellOutput> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn quote_doubles_single_quotes() {
        assert_eq!(quote("o'brien"), "'o''brien'");
        assert_eq!(quote("web01"), "'web01'");
        assert_eq!(quote("o\u{2019}brien"), "'o\u{2019}\u{2019}brien'");
        assert_eq!(
            quote("a\u{2018}b\u{201A}c\u{201B}d"),
            "'a\u{2018}\u{2018}b\u{201A}\u{201A}c\u{201B}\u{201B}d'"
        );
        assert_eq!(quote("\u{2019}; Remove-Item x; \u{2019}"), "'\u{2019}\u{2019}; Remove-Item x; \u{2019}\u{2019}'");
    }

    #[test]
    fn parse_accepts_bare_object_and_array() {
        let one = r#"{"HostName":"web01","RecordType":"A","Ttl":3600,"Data":"10.0.0.5"}"#;
        let recs = parse_records(one).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].data, "10.0.0.5");

        let many = format!("[{one},{one}]");
        assert_eq!(parse_records(&many).unwrap().len(), 2);
        assert!(parse_records("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_a_requests_ptr_and_quotes_arguments() {
        let shell = ScriptedShell::new("");
        let client = DnsClient::new("corp.example", shell.clone());

        client.add_a("web01", "10.0.0.5", 3600, true).await.unwrap();

        let scripts = shell.scripts.lock().unwrap();
        assert_eq!(
            scripts[0],
            "Add-DnsServerResourceRecordA -ZoneName 'corp.example' -Name 'web01' \
             -IPv4Address '10.0.0.5' -TimeToLive ([TimeSpan]::FromSeconds(3600)) -CreatePtr"
        );
    }

    #[tokio::test]
    async fn test_get_records_narrows_by_name_and_type() {
        let shell = ScriptedShell::new("[]");
        let client = DnsClient::new("corp.example", shell.clone());

        let recs = client
            .get_records(Some(RecordType::Cname), Some("www"))
            .await
            .unwrap();
        assert!(recs.is_empty());

        let scripts = shell.scripts.lock().unwrap();
        assert!(scripts[0].contains("-ZoneName 'corp.example' -Name 'www' -RRType CNAME"));
        assert!(scripts[0].contains("ConvertTo-Json"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let shell = Arc::new(ScriptedShell {
            scripts: Mutex::new(Vec::new()),
            reply: ShellOutput {
                status: 1,
                stdout: String::new(),
                stderr: "zone not found\n".into(),
            },
        });
        let client = DnsClient::new("corp.example", shell);

        let err = client.remove(RecordType::A, "web01", "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, Error::Command { status: 1, ref stderr, .. } if stderr == "zone not found"));
    }
}
