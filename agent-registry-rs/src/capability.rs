//! Static capability registry.
//!
//! Capabilities are probed once at startup (executables on `PATH`,
//! environment flags) and are read-only afterwards. Probing never executes
//! anything.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::BrokerError;

/// One probe as declared in a capabilities file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CapabilityProbe {
    pub name: String,
    /// Executable that must be found on `PATH`
    #[serde(default)]
    pub executable: Option<String>,
    /// Environment variable that must be set to a truthy value
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Configuration file structure for capabilities.toml
#[derive(Debug, Deserialize)]
struct CapabilityFile {
    #[serde(default)]
    capability: Vec<CapabilityProbe>,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, bool>,
}

impl CapabilityRegistry {
    /// Declares a capability with a fixed availability
    pub fn with_capability(mut self, name: impl Into<String>, available: bool) -> Self {
        self.capabilities.insert(name.into(), available);
        self
    }

    /// Runs every probe once. A probe with no conditions is always available;
    /// otherwise all of its conditions must hold.
    pub fn from_probes(probes: &[CapabilityProbe]) -> Self {
        let mut capabilities = BTreeMap::new();
        for probe in probes {
            let on_path = probe
                .executable
                .as_deref()
                .map_or(true, executable_on_path);
            let flagged = probe.env.as_deref().map_or(true, env_flag_set);
            let available = on_path && flagged;

            tracing::info!(
                capability = %probe.name,
                available = available,
                "Capability probed"
            );
            capabilities.insert(probe.name.clone(), available);
        }
        Self { capabilities }
    }

    /// Reads probes from a TOML file of `[[capability]]` tables. A missing
    /// file yields no probes.
    pub fn load_probes(path: &Path) -> Result<Vec<CapabilityProbe>, BrokerError> {
        if !path.exists() {
            tracing::warn!(
                "Capability file not found at {}, no capabilities declared",
                path.display()
            );
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Capabilities(format!("{}: {}", path.display(), e)))?;
        parse_probes(&content)
            .map_err(|e| BrokerError::Capabilities(format!("{}: {}", path.display(), e)))
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    /// Which of `required` are declared-unavailable or unknown
    pub fn missing<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        required
            .into_iter()
            .filter(|name| !self.is_available(name))
            .cloned()
            .collect()
    }

    pub fn available(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(_, available)| **available)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn all(&self) -> &BTreeMap<String, bool> {
        &self.capabilities
    }
}

fn parse_probes(content: &str) -> Result<Vec<CapabilityProbe>, toml::de::Error> {
    toml::from_str::<CapabilityFile>(content).map(|file| file.capability)
}

fn executable_on_path(name: &str) -> bool {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| {
        let full = dir.join(name);
        full.is_file() || (cfg!(windows) && full.with_extension("exe").is_file())
    })
}

fn env_flag_set(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false" && value != "no"
        }
        Err(_) => false,
    }
}
