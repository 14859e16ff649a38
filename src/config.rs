//! TOML configuration loading.
//!
//! One main file plus an optional `conf.d/` directory whose `*.toml`
//! files are merged in sorted order: later files replace earlier keys
//! within the `targets`, `feeds` and `deliveries` sections, while the
//! `gui` section is replaced wholesale. The legacy `sources` section is
//! renamed to `deliveries` on read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_timeout() -> u64 {
    60
}

fn default_auth_type() -> String {
    "password".to_string()
}

fn default_tenant() -> String {
    "common".to_string()
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MainConfig {
    pub user_agent_plus: Option<String>,
    #[serde(default)]
    pub catchall_lists: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConfig {
    Gmail {
        credentials: String,
        token: String,
    },
    Imap {
        server: String,
        username: String,
        #[serde(default = "default_folder")]
        folder: String,
        password: Option<String>,
        password_file: Option<String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
        #[serde(default = "default_auth_type")]
        auth_type: String,
        client_id: Option<String>,
        #[serde(default = "default_tenant")]
        tenant: String,
        token: Option<String>,
    },
    Jmap {
        server: String,
        username: String,
        token: Option<String>,
        token_file: Option<String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    Maildir {
        path: String,
    },
    Pipe {
        command: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub feed: String,
    pub target: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub subfolder: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuiConfig {
    pub sync_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubsystemConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedConfig>,
    #[serde(default)]
    pub deliveries: BTreeMap<String, DeliveryConfig>,
    #[serde(default)]
    pub gui: GuiConfig,
    #[serde(default)]
    pub subsystem: SubsystemConfig,
}

/// Parse one TOML file into a raw table, applying the legacy
/// `sources` -> `deliveries` rename.
fn load_table(path: &Path) -> Result<toml::Table> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
    let mut table: toml::Table = content
        .parse()
        .map_err(|e| Error::Configuration(format!("TOML error in {}: {}", path.display(), e)))?;

    if table.contains_key("sources") && !table.contains_key("deliveries") {
        log::debug!("converting legacy \"sources\" to \"deliveries\" in config");
        if let Some(sources) = table.remove("sources") {
            table.insert("deliveries".to_string(), sources);
        }
    }

    Ok(table)
}

/// Merge an extra table into the base: section-level key replacement
/// for targets/feeds/deliveries, wholesale replacement for gui.
fn merge_tables(base: &mut toml::Table, extra: toml::Table) {
    for (key, value) in extra {
        match key.as_str() {
            "targets" | "feeds" | "deliveries" => {
                let toml::Value::Table(extra_section) = value else {
                    continue;
                };
                let section = base
                    .entry(key)
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                if let toml::Value::Table(section) = section {
                    for (k, v) in extra_section {
                        section.insert(k, v);
                    }
                }
            }
            "gui" => {
                base.insert(key, value);
            }
            _ => {
                base.entry(key).or_insert(value);
            }
        }
    }
}

/// Load the main config file and merge `conf.d/*.toml` in sorted order.
pub fn load_config(cfgfile: &Path) -> Result<Config> {
    if !cfgfile.exists() {
        return Err(Error::Configuration(format!(
            "config file not found: {}",
            cfgfile.display()
        )));
    }

    log::debug!("loading config from {}", cfgfile.display());
    let mut table = load_table(cfgfile)?;

    if let Some(parent) = cfgfile.parent() {
        let conf_d = parent.join("conf.d");
        if conf_d.is_dir() {
            let mut extra_files: Vec<PathBuf> = fs::read_dir(&conf_d)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            extra_files.sort();
            for path in extra_files {
                log::debug!("loading additional config from {}", path.display());
                merge_tables(&mut table, load_table(&path)?);
            }
        }
    }

    let config: Config = toml::Value::Table(table)
        .try_into()
        .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))?;

    log::debug!(
        "config loaded with {} targets, {} deliveries, and {} feeds",
        config.targets.len(),
        config.deliveries.len(),
        config.feeds.len()
    );

    Ok(config)
}

/// `$XDG_DATA_HOME/korgalore`, defaulting under `$HOME`.
pub fn xdg_data_dir() -> PathBuf {
    match std::env::var_os("XDG_DATA_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("korgalore"),
        _ => home_dir().join(".local/share/korgalore"),
    }
}

/// `$XDG_CONFIG_HOME/korgalore`, defaulting under `$HOME`.
pub fn xdg_config_dir() -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("korgalore"),
        _ => home_dir().join(".config/korgalore"),
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}
