//! Registry credential lookup.
//!
//! Reads per-registry credentials from the Docker client configuration at
//! `~/.docker/config.json`, the same store other container tooling writes.
//! Entries may carry a base64 `auth` field or split username/password.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use serde::Deserialize;

use setmirror_core::error::{MirrorError, Result};

/// One `auths` entry of a Docker config file.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The subset of a Docker config file the mirror needs.
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Per-registry credential lookup over the Docker client config.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at the default path (`~/.docker/config.json`).
    pub fn default_path() -> Option<Self> {
        dirs::home_dir().map(|home| Self {
            path: home.join(".docker").join("config.json"),
        })
    }

    /// Credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Credentials for a registry host. Returns `(username, password)`,
    /// or `None` when the config has no usable entry.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let config: DockerConfig = serde_json::from_str(&data).map_err(|e| {
            MirrorError::Serialization(format!(
                "failed to parse {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let entry = match config.auths.get(registry) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Ok(Some((user.clone(), pass.clone())));
        }

        if let Some(auth) = &entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth)
                .map_err(|e| {
                    MirrorError::Serialization(format!("invalid auth entry for {}: {}", registry, e))
                })?;
            let decoded = String::from_utf8(decoded).map_err(|e| {
                MirrorError::Serialization(format!("invalid auth entry for {}: {}", registry, e))
            })?;
            if let Some((user, pass)) = decoded.split_once(':') {
                return Ok(Some((user.to_string(), pass.to_string())));
            }
        }

        Ok(None)
    }
}
