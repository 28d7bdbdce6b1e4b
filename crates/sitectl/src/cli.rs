//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Provision and manage VMs, LUNs and DNS records across sites.
#[derive(Parser, Debug)]
#[command(name = "sitectl")]
#[command(version)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// Site file.
    #[arg(long, env = "SITECTL_SITES", default_value = "sites.yaml", global = true)]
    pub sites: PathBuf,

    /// Directory of `<name>.yaml` VM profiles.
    #[arg(long, env = "SITECTL_PROFILES", default_value = "profiles", global = true)]
    pub profiles: PathBuf,

    /// Give up on long-running remote tasks after this many seconds.
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Skip confirmation prompts.
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hypervisor instances.
    #[command(subcommand)]
    Vm(VmCommand),

    /// Block storage arrays.
    #[command(subcommand)]
    Storage(StorageCommand),

    /// DNS records.
    #[command(subcommand)]
    Dns(DnsCommand),

    /// List configured sites and their services.
    Sites,
}

/// Site and service host every backend command is addressed to.
#[derive(Args, Debug, Clone)]
pub struct Target {
    pub site: String,
    pub host: String,
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// Create one instance from a profile at the first free name index.
    Create {
        #[command(flatten)]
        target: Target,
        profile: String,
    },
    Delete {
        #[command(flatten)]
        target: Target,
        name: String,
    },
    List {
        #[command(flatten)]
        target: Target,
    },
    /// Bring an instance in line with a profile.
    Modify {
        #[command(flatten)]
        target: Target,
        name: String,
        profile: String,
    },
    Snapshot {
        #[command(flatten)]
        target: Target,
        name: String,
        /// Defaults to `snapshot_<name>`.
        #[arg(long)]
        snapshot: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "snake_case")]
pub enum StorageCommand {
    CreateLun {
        #[command(flatten)]
        target: Target,
        name: String,
        size_gb: u64,
    },
    DeleteLun {
        #[command(flatten)]
        target: Target,
        name: String,
    },
    ResizeLun {
        #[command(flatten)]
        target: Target,
        name: String,
        size_gb: u64,
    },
    CreateHost {
        #[command(flatten)]
        target: Target,
        name: String,
    },
    /// Register an iSCSI IQN or Fibre Channel WWN on a host.
    AddInitiator {
        #[command(flatten)]
        target: Target,
        storage_host: String,
        initiator: String,
    },
    MapVolume {
        #[command(flatten)]
        target: Target,
        volume: String,
        storage_host: String,
    },
    SnapshotLun {
        #[command(flatten)]
        target: Target,
        volume: String,
        #[arg(long)]
        suffix: Option<String>,
    },
    ListHosts {
        #[command(flatten)]
        target: Target,
    },
    ListLuns {
        #[command(flatten)]
        target: Target,
    },
    ListHostLunMappings {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Subcommand, Debug)]
pub enum DnsCommand {
    Get {
        #[command(flatten)]
        target: Target,
        rr_type: String,
        name: String,
    },
    Add {
        #[command(flatten)]
        target: Target,
        rr_type: String,
        name: String,
        value: String,
        #[arg(long)]
        ttl: Option<u32>,
        /// MX preference.
        #[arg(long)]
        priority: Option<u16>,
    },
    #[command(alias = "delete")]
    Del {
        #[command(flatten)]
        target: Target,
        rr_type: String,
        name: String,
        value: String,
    },
    List {
        #[command(flatten)]
        target: Target,
    },
}
