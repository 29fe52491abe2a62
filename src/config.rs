//! `forge.yaml` loading: explicit path -> project-local -> user config dir
//! -> compiled-in defaults.

use std::path::{Path, PathBuf};

use eyre::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: PathBuf,
    pub log_dir: PathBuf,
    pub ledger_root: PathBuf,
    pub poll_fallback_interval_secs: u64,
    pub socket_path: PathBuf,
    pub bootstrap: BootstrapConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("forge");
        Self {
            store_path: data_dir.join("forge.sqlite"),
            log_dir: data_dir.join("logs"),
            ledger_root: PathBuf::from(".forge/ledgers"),
            poll_fallback_interval_secs: 60,
            socket_path: data_dir.join("forge.sock"),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

/// Profiles and pools declared directly in `forge.yaml`, as an alternative
/// to creating them one at a time with `forge profile add` / `forge pool
/// add`. Applied by [`BootstrapConfig::apply`] the first time `forge up`
/// runs against a fresh store; already-existing names are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub profiles: Vec<BootstrapProfile>,
    pub pools: Vec<BootstrapPool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapProfile {
    pub name: String,
    pub harness: String,
    pub command_template: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPool {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    /// Profile names, in selection order.
    #[serde(default)]
    pub members: Vec<String>,
}

impl BootstrapConfig {
    /// Create every declared profile/pool that does not already exist by
    /// name. Safe to call on every `forge up`: re-running against a store
    /// that already has these rows is a no-op.
    pub fn apply(&self, store: &crate::store::Store) -> crate::error::Result<()> {
        use crate::domain::{Pool, PoolMember, Profile};

        let existing_profiles = store.list_profiles()?;
        for decl in &self.profiles {
            if existing_profiles.iter().any(|p| p.name == decl.name) {
                continue;
            }
            let mut profile = Profile::new(uuid::Uuid::now_v7().to_string(), &decl.name, &decl.harness, &decl.command_template)
                .with_max_concurrency(decl.max_concurrency);
            profile.model = decl.model.clone();
            store.create_profile(profile)?;
            info!(name = %decl.name, "BootstrapConfig::apply: created profile from config");
        }

        let existing_pools = store.list_pools()?;
        for decl in &self.pools {
            let pool = match existing_pools.iter().find(|p| p.name == decl.name) {
                Some(p) => p.clone(),
                None => {
                    let created = store.create_pool(Pool::new(uuid::Uuid::now_v7().to_string(), &decl.name))?;
                    info!(name = %decl.name, "BootstrapConfig::apply: created pool from config");
                    created
                }
            };
            if decl.is_default && !pool.is_default {
                store.set_default_pool(&pool.id)?;
            }
            let profiles = store.list_profiles()?;
            let existing_members = store.list_pool_members(&pool.id)?;
            for (i, profile_name) in decl.members.iter().enumerate() {
                let Some(profile) = profiles.iter().find(|p| &p.name == profile_name) else {
                    warn!(pool = %decl.name, profile = %profile_name, "BootstrapConfig::apply: unknown profile in pool declaration, skipping");
                    continue;
                };
                if existing_members.iter().any(|m| m.profile_id == profile.id) {
                    continue;
                }
                store.add_pool_member(PoolMember {
                    pool_id: pool.id.clone(),
                    profile_id: profile.id.clone(),
                    weight: 1,
                    position: i as i64 + 1,
                })?;
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load with the fallback chain: explicit path (error if given but
    /// unreadable/unparseable) -> project-local `.forge/forge.yaml` (warn and
    /// continue on failure) -> user config dir `forge/forge.yaml` (same) ->
    /// defaults.
    pub fn load(explicit_path: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load_from_file(path).with_context(|| format!("loading config from {}", path.display()));
        }

        let project_local = PathBuf::from(".forge/forge.yaml");
        if project_local.exists() {
            match Self::load_from_file(&project_local) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(error = %e, path = %project_local.display(), "Config::load: failed to parse project-local config, continuing"),
            }
        }

        if let Some(user_path) = dirs::config_dir().map(|d| d.join("forge/forge.yaml")) {
            if user_path.exists() {
                match Self::load_from_file(&user_path) {
                    Ok(config) => return Ok(config),
                    Err(e) => warn!(error = %e, path = %user_path.display(), "Config::load: failed to parse user config, continuing"),
                }
            }
        }

        info!("Config::load: no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> eyre::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Config::load_from_file: loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_store_path() {
        let config = Config::default();
        assert!(config.store_path.to_string_lossy().ends_with("forge.sqlite"));
    }

    #[test]
    fn load_with_missing_explicit_path_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/forge.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_files_present_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = Config::load(None);
        std::env::set_current_dir(original).unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_path_loads_yaml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yaml");
        std::fs::write(&path, "poll_fallback_interval_secs: 5\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.poll_fallback_interval_secs, 5);
    }

    #[test]
    fn bootstrap_config_parses_from_yaml() {
        let yaml = "
bootstrap:
  profiles:
    - name: default
      harness: claude
      command_template: \"claude -p {prompt}\"
  pools:
    - name: main
      is_default: true
      members: [default]
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bootstrap.profiles.len(), 1);
        assert_eq!(config.bootstrap.profiles[0].name, "default");
        assert_eq!(config.bootstrap.pools[0].members, vec!["default".to_string()]);
    }

    #[test]
    fn bootstrap_apply_creates_declared_profiles_and_pools_idempotently() {
        let store = crate::store::Store::open_in_memory().unwrap();
        let bootstrap = BootstrapConfig {
            profiles: vec![BootstrapProfile {
                name: "default".to_string(),
                harness: "claude".to_string(),
                command_template: "claude -p {prompt}".to_string(),
                model: None,
                max_concurrency: 2,
            }],
            pools: vec![BootstrapPool {
                name: "main".to_string(),
                is_default: true,
                members: vec!["default".to_string()],
            }],
        };

        bootstrap.apply(&store).unwrap();
        bootstrap.apply(&store).unwrap();

        let profiles = store.list_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].max_concurrency, 2);

        let pools = store.list_pools().unwrap();
        assert_eq!(pools.len(), 1);
        assert!(pools[0].is_default);
        assert_eq!(store.list_pool_members(&pools[0].id).unwrap().len(), 1);
    }

    #[test]
    fn bootstrap_apply_skips_unknown_pool_member() {
        let store = crate::store::Store::open_in_memory().unwrap();
        let bootstrap = BootstrapConfig {
            profiles: vec![],
            pools: vec![BootstrapPool {
                name: "main".to_string(),
                is_default: false,
                members: vec!["nonexistent".to_string()],
            }],
        };
        bootstrap.apply(&store).unwrap();
        let pools = store.list_pools().unwrap();
        assert_eq!(store.list_pool_members(&pools[0].id).unwrap().len(), 0);
    }
}
