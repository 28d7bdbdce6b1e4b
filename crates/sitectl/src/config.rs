use std::path::PathBuf;
use std::time::Duration;

use sc_infra::config::SiteTable;
use sc_infra::profile::ProfileStore;

use crate::cli::GlobalOptions;
use crate::error::Result;

/// Paths and overrides for one invocation. `.env` is loaded before the
/// command line is parsed, so `SITECTL_*` may come from either.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub sites: PathBuf,
    pub profiles: PathBuf,
    pub timeout: Option<Duration>,
    pub yes: bool,
    pub json: bool,
}

impl CliConfig {
    pub fn from_options(opts: &GlobalOptions) -> Self {
        Self {
            sites: opts.sites.clone(),
            profiles: opts.profiles.clone(),
            timeout: opts.timeout.map(Duration::from_secs),
            yes: opts.yes,
            json: opts.json,
        }
    }

    pub fn load_sites(&self) -> Result<SiteTable> {
        let table = SiteTable::load(&self.sites)?;
        tracing::debug!(path = %self.sites.display(), sites = ?table.names().collect::<Vec<_>>(), "config: site file loaded");
        Ok(table)
    }

    /// Opened on demand; only `vm create` and `vm modify` read profiles.
    pub fn profile_store(&self) -> Result<ProfileStore> {
        Ok(ProfileStore::open(&self.profiles)?)
    }
}
