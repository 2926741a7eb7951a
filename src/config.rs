use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use vigil_core::pdk::ModuleConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/vigil/vigil.ini";

pub const NODE_AGENT_SECTION: &str = "node-agent";
pub const CLUSTER_AGENT_SECTION: &str = "cluster-agent";
pub const KUBERNETES_SECTION: &str = "kubernetes";

/// Configuration of an agent, one [`ModuleConfig`] per section.
///
/// It is backed by an `INI` file parsed on creation; keys outside a section
/// are ignored.
#[derive(Debug, Clone)]
pub struct VigilConfig {
    config_file: PathBuf,
    configs: HashMap<String, ModuleConfig>,
}

impl VigilConfig {
    /// Load `custom_file` if given, the default file otherwise.
    pub fn load(custom_file: Option<&str>) -> Result<Self> {
        match custom_file {
            Some(custom_file) => Self::with_custom_file(custom_file),
            None => Self::new(),
        }
    }

    /// Construct a new [`VigilConfig`] using the default file, created empty if missing.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            if let Some(prefix) = config_file.parent() {
                std::fs::create_dir_all(prefix)
                    .with_context(|| format!("Error creating {}", prefix.display()))?;
            }
            File::create(&config_file)
                .with_context(|| format!("Error creating {}", config_file.display()))?;
        }
        Self::from_config_file(config_file)
    }

    /// Construct a new [`VigilConfig`] using a custom file.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();

        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        for (section, prop) in &conf {
            if let Some(section) = section {
                let section_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(Self {
            config_file,
            configs,
        })
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Configuration of `section`, empty when the file doesn't have it.
    pub fn get_module_config(&self, section: &str) -> ModuleConfig {
        self.configs.get(section).cloned().unwrap_or_default()
    }
}
