use super::EnvMap;
use anyhow::{anyhow, Context, Result};
use std::path::Path;

pub const OVERLAY_FILE: &str = ".env";

/// The outermost env layer: the deployment root's `.env` plus CLI pairs.
///
/// Also the lookup source for CI-injected values (hosts, SSH credentials),
/// which fall back to the process environment when enabled.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub variables: EnvMap,
    process_env: bool,
}

impl Overlay {
    /// Load `<root>/.env`. A missing file is an empty overlay.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(OVERLAY_FILE);
        let mut variables = EnvMap::new();
        if path.exists() {
            let iter = dotenv::from_path_iter(&path)
                .with_context(|| format!("Failed to read env file: {:?}", path))?;
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Invalid line in env file: {:?}", path))?;
                variables.insert(key, value);
            }
        }
        Ok(Self {
            variables,
            process_env: true,
        })
    }

    /// An overlay that never consults the process environment.
    pub fn from_variables(variables: EnvMap) -> Self {
        Self {
            variables,
            process_env: false,
        }
    }

    /// Apply `KEY=VALUE` pairs given on the command line; they win over the file.
    pub fn extend_pairs(&mut self, pairs: &[String]) -> Result<()> {
        for pair in pairs {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("Empty key in '{}'", pair));
            }
            self.variables.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(value) = self.variables.get(key) {
            return Some(value.clone());
        }
        if self.process_env {
            return std::env::var(key).ok().filter(|v| !v.is_empty());
        }
        None
    }

    /// First key in `keys` that has a value.
    pub fn lookup_first(&self, keys: &[String]) -> Option<String> {
        keys.iter().find_map(|key| self.lookup(key))
    }

    pub fn host_for(&self, environment: &str, server: &str) -> Option<String> {
        self.lookup(&override_key(&[environment, server, "HOST"]))
    }
}

/// Suffixes of the keys that carry SSH credentials.
pub const CREDENTIAL_SUFFIXES: [&str; 2] = ["SSH_PRIVATE_KEY", "SSH_PASSWORD"];

/// `SSH_PASSWORD`, `STAGING_SSH_PASSWORD`, `PRODUCTION_M1_SSH_PRIVATE_KEY`, ...
pub fn is_credential_key(key: &str) -> bool {
    CREDENTIAL_SUFFIXES.iter().any(|suffix| {
        key == *suffix
            || key
                .strip_suffix(suffix)
                .is_some_and(|prefix| prefix.ends_with('_'))
    })
}

/// `["production", "web-1", "HOST"]` -> `PRODUCTION_WEB_1_HOST`
pub fn override_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| {
            part.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_")
}
