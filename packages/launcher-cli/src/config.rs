// Launcher configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::backend::BackendSettings;
use crate::provision::RetryPolicy;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "LAUNCHER_CONFIG";

/// One entry of the plugin manifest: which backend kind to instantiate under
/// which name, and which settings keys it must be given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginDeclaration {
    pub name: String,

    /// Backend kind in the strategy table. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_keys: Vec<String>,
}

impl PluginDeclaration {
    pub fn for_kind(kind: &str) -> Self {
        Self {
            name: kind.to_string(),
            kind: None,
            required_keys: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LauncherConfig {
    /// Root under which each launch creates its `launcher-<uuid>` staging directory
    pub working_directory: PathBuf,

    pub keep_working_directory: bool,

    /// Bound on concurrent transfers within one phase
    pub file_provision_threads: usize,

    /// Retries for transient transfer failures
    pub file_provision_retries: u32,

    pub retry_base_delay_ms: u64,

    pub use_cache: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Executable used to run the tool
    pub runner: String,

    /// Extra arguments placed before `--outdir`
    pub runner_args: Vec<String>,

    /// Plugin manifest. Empty means every compiled-in backend under its kind name.
    pub plugins: Vec<PluginDeclaration>,

    /// Per-backend settings, keyed by plugin name
    #[serde(deserialize_with = "string_tables")]
    pub backends: BTreeMap<String, BackendSettings>,
}

impl LauncherConfig {
    /// Load configuration with the following priority:
    /// 1. explicit path (the `--config` flag)
    /// 2. LAUNCHER_CONFIG environment variable
    /// 3. ~/.config/launcher/config.toml
    /// 4. Defaults
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_with_env(explicit, from_env.as_deref()).await
    }

    /// `load` with the value of LAUNCHER_CONFIG passed in
    pub async fn load_with_env(explicit: Option<&Path>, from_env: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit.or(from_env) {
            return Self::from_file(path).await;
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::from_file(&config_path).await;
            }
        }

        Ok(Self::default())
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the config file path (~/.config/launcher/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("launcher").join("config.toml"))
    }

    /// Cache root, when the download cache is enabled
    pub fn cache_path(&self) -> Option<PathBuf> {
        if !self.use_cache {
            return None;
        }

        Some(self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("launcher")
        }))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.file_provision_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: 2.0,
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("./datastore"),
            keep_working_directory: false,
            file_provision_threads: 1,
            file_provision_retries: 3,
            retry_base_delay_ms: 100,
            use_cache: false,
            cache_dir: None,
            run_timeout_secs: None,
            runner: "cwltool".to_string(),
            runner_args: Vec::new(),
            plugins: Vec::new(),
            backends: BTreeMap::new(),
        }
    }
}

/// Backend settings are string maps; accept TOML scalars and stringify them
fn string_tables<'de, D>(deserializer: D) -> Result<BTreeMap<String, BackendSettings>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, BTreeMap<String, toml::Value>> = BTreeMap::deserialize(deserializer)?;

    raw.into_iter()
        .map(|(backend, table)| {
            let settings = table
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        toml::Value::String(s) => s,
                        toml::Value::Integer(i) => i.to_string(),
                        toml::Value::Float(f) => f.to_string(),
                        toml::Value::Boolean(b) => b.to_string(),
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "backends.{}.{} must be a scalar, got {}",
                                backend,
                                key,
                                other.type_str()
                            )))
                        }
                    };
                    Ok((key, value))
                })
                .collect::<Result<BackendSettings, D::Error>>()?;
            Ok((backend, settings))
        })
        .collect()
}
