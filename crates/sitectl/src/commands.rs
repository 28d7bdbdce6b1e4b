use std::io::{self, BufRead, Write};
use std::sync::Arc;

use sc_infra::dns::{self, DnsRecord, RecordType};
use sc_infra::{Connector, Dispatcher, RemoteConnector, ServiceType, StorageDriver};

use crate::cli::{Cli, Command, DnsCommand, StorageCommand, Target, VmCommand};
use crate::config::CliConfig;
use crate::error::{CliError, Result};
use crate::output::{self, Hosts, Instances, Luns, Mappings, Records, Services};

/// Source of answers to confirmation questions.
pub trait Prompt {
    fn ask(&mut self, question: &str) -> io::Result<String>;
}

pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question: &str) -> io::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{question}")?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim().to_string())
    }
}

fn said_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

pub struct Context {
    pub config: CliConfig,
    pub dispatch: Dispatcher,
}

impl Context {
    pub fn new(config: CliConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let mut dispatch = Dispatcher::new(config.load_sites()?, connector);
        if let Some(timeout) = config.timeout {
            dispatch = dispatch.with_timeout(timeout);
        }
        Ok(Self { config, dispatch })
    }

    /// Ask unless `--yes` was given.
    fn confirm(&self, prompt: &mut dyn Prompt, question: &str) -> Result<bool> {
        if self.config.yes {
            return Ok(true);
        }
        Ok(said_yes(&prompt.ask(question)?))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::from_options(&cli.global);
    let ctx = Context::new(config, Arc::new(RemoteConnector::from_env()))?;
    let mut out = io::stdout().lock();
    execute(&ctx, cli.command, &mut StdinPrompt, &mut out).await
}

pub async fn execute(ctx: &Context, command: Command, prompt: &mut dyn Prompt, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Vm(cmd) => vm(ctx, cmd, prompt, out).await,
        Command::Storage(cmd) => storage(ctx, cmd, prompt, out).await,
        Command::Dns(cmd) => dns_command(ctx, cmd, prompt, out).await,
        Command::Sites => Ok(output::print_output(out, &Services(ctx.dispatch.sites()), ctx.config.json)?),
    }
}

async fn vm(ctx: &Context, cmd: VmCommand, prompt: &mut dyn Prompt, out: &mut dyn Write) -> Result<()> {
    match cmd {
        VmCommand::Create { target, profile } => {
            let profile = ctx.config.profile_store()?.load(&profile)?;
            let driver = ctx.dispatch.hypervisor(&target.site, &target.host).await?;
            let handle = driver.create_instance(&profile).await?;
            writeln!(out, "created {} ({})", handle.name, handle.id)?;
            if !handle.addresses.is_empty() {
                writeln!(out, "addresses: {}", handle.addresses.join(", "))?;
            }
        }
        VmCommand::Delete { target, name } => {
            ctx.dispatch.lookup(&target.site, ServiceType::Hypervisor, &target.host)?;
            if !ctx.config.yes {
                let answer = prompt.ask(&format!(
                    "Are you sure you want to delete VM '{name}'? (type 'yes' to confirm): "
                ))?;
                if !said_yes(&answer) {
                    writeln!(out, "VM deletion cancelled.")?;
                    return Ok(());
                }
                let typed = prompt.ask("Please enter the exact name of the VM to confirm deletion: ")?;
                if typed.trim() != name {
                    writeln!(out, "Entered VM name does not match. Deletion cancelled.")?;
                    return Ok(());
                }
            }
            let driver = ctx.dispatch.hypervisor(&target.site, &target.host).await?;
            driver.delete_instance(&name).await?;
            writeln!(out, "deleted {name}")?;
        }
        VmCommand::List { target } => {
            let driver = ctx.dispatch.hypervisor(&target.site, &target.host).await?;
            let instances = driver.list_instances().await?;
            output::print_output(out, &Instances(&instances), ctx.config.json)?;
        }
        VmCommand::Modify { target, name, profile } => {
            let profile = ctx.config.profile_store()?.load(&profile)?;
            let (_, entry) = ctx.dispatch.lookup(&target.site, ServiceType::Hypervisor, &target.host)?;
            let kind = entry.kind();
            if kind.needs_power_off_to_reconfigure()
                && !ctx.confirm(
                    prompt,
                    &format!("{kind} shuts '{name}' down before modifying it if it is running. Continue? (yes/no): "),
                )?
            {
                writeln!(out, "Modification cancelled.")?;
                return Ok(());
            }
            let driver = ctx.dispatch.hypervisor(&target.site, &target.host).await?;
            driver.modify_instance(&name, &profile).await?;
            writeln!(out, "modified {name} to match profile {}", profile.name)?;
        }
        VmCommand::Snapshot { target, name, snapshot } => {
            let driver = ctx.dispatch.hypervisor(&target.site, &target.host).await?;
            let snap = driver.snapshot_instance(&name, snapshot.as_deref()).await?;
            writeln!(out, "snapshot {} taken of {}", snap.name, snap.instance)?;
        }
    }
    Ok(())
}

async fn array(ctx: &Context, target: &Target) -> Result<Box<dyn StorageDriver>> {
    Ok(ctx.dispatch.storage(&target.site, &target.host).await?)
}

async fn storage(ctx: &Context, cmd: StorageCommand, prompt: &mut dyn Prompt, out: &mut dyn Write) -> Result<()> {
    let json = ctx.config.json;

    match cmd {
        StorageCommand::CreateLun { target, name, size_gb } => {
            let lun = array(ctx, &target).await?.create_lun(&name, size_gb).await?;
            writeln!(out, "created volume {} ({} GB)", lun.name, lun.size_gb)?;
        }
        StorageCommand::DeleteLun { target, name } => {
            ctx.dispatch.lookup(&target.site, ServiceType::Storage, &target.host)?;
            if !ctx.confirm(prompt, &format!("Are you sure you want to delete volume '{name}'? (yes/no): "))? {
                writeln!(out, "Delete operation cancelled.")?;
                return Ok(());
            }
            array(ctx, &target).await?.delete_lun(&name).await?;
            writeln!(out, "deleted volume {name}")?;
        }
        StorageCommand::ResizeLun { target, name, size_gb } => {
            array(ctx, &target).await?.resize_lun(&name, size_gb).await?;
            writeln!(out, "resized volume {name} to {size_gb} GB")?;
        }
        StorageCommand::CreateHost { target, name } => {
            let host = array(ctx, &target).await?.create_host(&name).await?;
            writeln!(out, "created host {}", host.name)?;
        }
        StorageCommand::AddInitiator { target, storage_host, initiator } => {
            array(ctx, &target).await?.add_initiator(&storage_host, &initiator).await?;
            writeln!(out, "added {initiator} to {storage_host}")?;
        }
        StorageCommand::MapVolume { target, volume, storage_host } => {
            let mapping = array(ctx, &target).await?.map_volume(&volume, &storage_host).await?;
            match mapping.lun {
                Some(lun) => writeln!(out, "mapped {} to {} as LUN {lun}", mapping.volume, mapping.host)?,
                None => writeln!(out, "mapped {} to {}", mapping.volume, mapping.host)?,
            }
        }
        StorageCommand::SnapshotLun { target, volume, suffix } => {
            let snap = array(ctx, &target).await?.snapshot_lun(&volume, suffix.as_deref()).await?;
            writeln!(out, "snapshot {snap} taken")?;
        }
        StorageCommand::ListHosts { target } => {
            let hosts = array(ctx, &target).await?.list_hosts().await?;
            output::print_output(out, &Hosts(&hosts), json)?;
        }
        StorageCommand::ListLuns { target } => {
            let luns = array(ctx, &target).await?.list_luns().await?;
            output::print_output(out, &Luns(&luns), json)?;
        }
        StorageCommand::ListHostLunMappings { target } => {
            let mappings = array(ctx, &target).await?.list_host_lun_mappings().await?;
            output::print_output(out, &Mappings(&mappings), json)?;
        }
    }
    Ok(())
}

fn build_record(rr_type: RecordType, name: String, value: String, ttl: Option<u32>, priority: Option<u16>) -> Result<DnsRecord> {
    let mut record = DnsRecord::new(rr_type, name, value);
    if let Some(ttl) = ttl {
        record = record.with_ttl(ttl);
    }
    match (rr_type, priority) {
        (RecordType::Mx, Some(p)) => record = record.with_priority(p),
        (_, Some(_)) => return Err(CliError::Usage("--priority only applies to MX records".into())),
        (_, None) => {}
    }
    Ok(record)
}

async fn dns_command(ctx: &Context, cmd: DnsCommand, prompt: &mut dyn Prompt, out: &mut dyn Write) -> Result<()> {
    let json = ctx.config.json;

    match cmd {
        DnsCommand::Get { target, rr_type, name } => {
            let rr_type = dns::parse_record_type(&rr_type)?;
            let server = ctx.dispatch.dns(&target.site, &target.host).await?;
            let records = server.get_record(rr_type, &name).await?;
            if records.is_empty() && !json {
                writeln!(out, "{rr_type} record for {name} does not exist.")?;
            } else {
                output::print_output(out, &Records(&records), json)?;
            }
        }
        DnsCommand::Add { target, rr_type, name, value, ttl, priority } => {
            let record = build_record(dns::parse_record_type(&rr_type)?, name, value, ttl, priority)?;
            let server = ctx.dispatch.dns(&target.site, &target.host).await?;
            server.add_record(&record).await?;
            writeln!(out, "added {record} in {}", server.zone())?;
        }
        DnsCommand::Del { target, rr_type, name, value } => {
            let rr_type = dns::parse_record_type(&rr_type)?;
            ctx.dispatch.lookup(&target.site, ServiceType::Dns, &target.host)?;
            if !ctx.confirm(
                prompt,
                &format!("Are you sure you want to delete the {rr_type} record for {name}? (yes/no): "),
            )? {
                writeln!(out, "Delete operation cancelled.")?;
                return Ok(());
            }
            let server = ctx.dispatch.dns(&target.site, &target.host).await?;
            server.delete_record(rr_type, &name, &value).await?;
            writeln!(out, "deleted {rr_type} record {name} {value}")?;
        }
        DnsCommand::List { target } => {
            let server = ctx.dispatch.dns(&target.site, &target.host).await?;
            let records = server.list_records().await?;
            output::print_output(out, &Records(&records), json)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sc_infra::config::Site;
    use sc_infra::ipam::IpAllocator;
    use sc_infra::secrets::SecretProvider;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SITES: &str = r#"
sites:
  east:
    secrets: { hosts: [http://127.0.0.1:9], path: sites/east }
    hypervisors:
      - { host: vc01, type: vsphere, url: http://127.0.0.1:9 }
    storage:
      - { host: pure01, type: purestorage, url: http://127.0.0.1:9 }
    dns:
      - { host: dc01, type: msdns, ssh: admin@dc01, zone: corp.example }
"#;

    /// Refuses every connection and counts the attempts.
    #[derive(Default)]
    struct NoNetwork {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for NoNetwork {
        async fn secrets(&self, _site: &Site) -> sc_infra::Result<Arc<dyn SecretProvider>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(sc_infra::Error::NoReachableSecretStore("test".into()))
        }

        async fn ipam(&self, _site: &Site, _secrets: &dyn SecretProvider) -> sc_infra::Result<Arc<dyn IpAllocator>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(sc_infra::Error::NoReachableSecretStore("test".into()))
        }
    }

    struct Scripted(VecDeque<&'static str>, Vec<String>);

    impl Scripted {
        fn new(answers: &[&'static str]) -> Self {
            Self(answers.iter().copied().collect(), Vec::new())
        }
    }

    impl Prompt for Scripted {
        fn ask(&mut self, question: &str) -> io::Result<String> {
            self.1.push(question.to_string());
            Ok(self.0.pop_front().unwrap_or_default().to_string())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Context,
        connector: Arc<NoNetwork>,
    }

    fn fixture(yes: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sites = dir.path().join("sites.yaml");
        std::fs::write(&sites, SITES).unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir(&profiles).unwrap();

        let config = CliConfig {
            sites,
            profiles,
            timeout: None,
            yes,
            json: false,
        };
        let connector = Arc::new(NoNetwork::default());
        let ctx = Context::new(config, connector.clone()).unwrap();
        Fixture { _dir: dir, ctx, connector }
    }

    fn target(host: &str) -> Target {
        Target {
            site: "east".into(),
            host: host.into(),
        }
    }

    async fn run_cmd(f: &Fixture, command: Command, prompt: &mut Scripted) -> (Result<()>, String) {
        let mut out = Vec::new();
        let result = execute(&f.ctx, command, prompt, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_declined_delete_never_connects() {
        let f = fixture(false);
        let mut prompt = Scripted::new(&["no"]);

        let cmd = Command::Vm(VmCommand::Delete {
            target: target("vc01"),
            name: "web01".into(),
        });
        let (result, out) = run_cmd(&f, cmd, &mut prompt).await;

        result.unwrap();
        assert_eq!(out, "VM deletion cancelled.\n");
        assert_eq!(prompt.1.len(), 1);
        assert_eq!(f.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_requires_exact_name() {
        let f = fixture(false);
        let mut prompt = Scripted::new(&["yes", "web02"]);

        let cmd = Command::Vm(VmCommand::Delete {
            target: target("vc01"),
            name: "web01".into(),
        });
        let (result, out) = run_cmd(&f, cmd, &mut prompt).await;

        result.unwrap();
        assert!(out.contains("does not match"));
        assert_eq!(f.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confirmed_delete_reaches_secret_store() {
        let f = fixture(true);
        let mut prompt = Scripted::new(&[]);

        let cmd = Command::Vm(VmCommand::Delete {
            target: target("vc01"),
            name: "web01".into(),
        });
        let (result, _) = run_cmd(&f, cmd, &mut prompt).await;

        assert!(matches!(
            result,
            Err(CliError::Infra(sc_infra::Error::NoReachableSecretStore(_)))
        ));
        assert!(prompt.1.is_empty());
        assert_eq!(f.connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_host_fails_before_prompting() {
        let f = fixture(false);
        let mut prompt = Scripted::new(&["yes"]);

        let cmd = Command::Dns(DnsCommand::Del {
            target: target("dc09"),
            rr_type: "A".into(),
            name: "web01".into(),
            value: "10.0.0.1".into(),
        });
        let (result, _) = run_cmd(&f, cmd, &mut prompt).await;

        assert!(matches!(
            result,
            Err(CliError::Infra(sc_infra::Error::ServiceNotFound { .. }))
        ));
        assert!(prompt.1.is_empty());
    }

    #[tokio::test]
    async fn test_modify_on_vsphere_asks_first() {
        let f = fixture(false);
        std::fs::write(
            f.ctx.config.profiles.join("web.yaml"),
            "hostname: \"web{index:02d}\"\ncpu: 2\nmemory_mib: 4096\ntemplate: tpl-ubuntu\n",
        )
        .unwrap();
        let mut prompt = Scripted::new(&["no"]);

        let cmd = Command::Vm(VmCommand::Modify {
            target: target("vc01"),
            name: "web01".into(),
            profile: "web".into(),
        });
        let (result, out) = run_cmd(&f, cmd, &mut prompt).await;

        result.unwrap();
        assert_eq!(out, "Modification cancelled.\n");
        assert!(prompt.1[0].starts_with("vsphere shuts 'web01' down"));
        assert_eq!(f.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_profile_is_reported_before_connecting() {
        let f = fixture(true);
        let cmd = Command::Vm(VmCommand::Create {
            target: target("vc01"),
            profile: "db".into(),
        });
        let (result, _) = run_cmd(&f, cmd, &mut Scripted::new(&[])).await;

        assert!(matches!(
            result,
            Err(CliError::Infra(sc_infra::Error::ProfileNotFound(ref p))) if p == "db"
        ));
        assert_eq!(f.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_record_input_is_rejected_locally() {
        let f = fixture(true);

        let cmd = Command::Dns(DnsCommand::Add {
            target: target("dc01"),
            rr_type: "SRV".into(),
            name: "_sip".into(),
            value: "x".into(),
            ttl: None,
            priority: None,
        });
        let (result, _) = run_cmd(&f, cmd, &mut Scripted::new(&[])).await;
        assert!(matches!(
            result,
            Err(CliError::Infra(sc_infra::Error::UnsupportedRecordType(_)))
        ));

        let cmd = Command::Dns(DnsCommand::Add {
            target: target("dc01"),
            rr_type: "A".into(),
            name: "web01".into(),
            value: "10.0.0.1".into(),
            ttl: None,
            priority: Some(10),
        });
        let (result, _) = run_cmd(&f, cmd, &mut Scripted::new(&[])).await;
        assert!(matches!(result, Err(CliError::Usage(_))));
    }

    #[tokio::test]
    async fn test_sites_lists_every_entry() {
        let f = fixture(false);
        let (result, out) = run_cmd(&f, Command::Sites, &mut Scripted::new(&[])).await;

        result.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].split_whitespace().eq(["east", "hypervisor", "vc01", "vsphere"]));
        assert!(lines[3].split_whitespace().eq(["east", "dns", "dc01", "msdns"]));
    }

    #[test]
    fn missing_site_file_is_config_not_found() {
        let config = CliConfig {
            sites: PathBuf::from("/nonexistent/sites.yaml"),
            profiles: PathBuf::from("/nonexistent/profiles"),
            timeout: None,
            yes: false,
            json: false,
        };
        let err = Context::new(config, Arc::new(NoNetwork::default())).err().unwrap();
        assert!(matches!(err, CliError::Infra(sc_infra::Error::ConfigNotFound(_))));
    }
}
