//! Registry credentials read from the Docker client configuration.
//!
//! Looks at `$DOCKER_CONFIG/config.json`, falling back to
//! `~/.docker/config.json`.  Only inline `auths.<host>.auth` entries are
//! understood; credential helpers are not invoked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::reference::DOCKER_HUB_REGISTRY;

/// Username/password pair for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Per-registry credentials keyed by normalized host.
#[derive(Debug, Clone, Default)]
pub struct DockerCredentials {
    entries: HashMap<String, RegistryAuth>,
}

impl DockerCredentials {
    /// An empty credential set (anonymous pulls only).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Path of the Docker client config file for this user, if one can be
    /// determined.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    /// Load credentials from the default location.  A missing file yields an
    /// empty set.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::anonymous()),
        }
    }

    /// Load credentials from a specific config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no docker config found");
                return Ok(Self::anonymous());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&data).map_err(|e| {
            OciError::Registry(format!(
                "failed to parse docker config {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse the contents of a Docker `config.json`.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: DockerConfigFile = serde_json::from_slice(data)?;
        let mut entries = HashMap::new();
        for (key, entry) in file.auths {
            if let Some(auth) = decode_entry(&entry)? {
                entries.insert(normalize_host(&key), auth);
            }
        }
        Ok(Self { entries })
    }

    /// Credentials for `registry`, if configured.
    pub fn get(&self, registry: &str) -> Option<&RegistryAuth> {
        self.entries.get(&normalize_host(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_entry(entry: &AuthEntry) -> Result<Option<RegistryAuth>> {
    if let Some(encoded) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| OciError::Registry(format!("invalid base64 in auth entry: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| OciError::Registry("auth entry is not valid UTF-8".to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| OciError::Registry("auth entry missing ':' separator".to_string()))?;
        return Ok(Some(RegistryAuth {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }
    match (&entry.username, &entry.password) {
        (Some(u), Some(p)) => Ok(Some(RegistryAuth {
            username: u.clone(),
            password: p.clone(),
        })),
        _ => Ok(None),
    }
}

/// Reduce a config key (`https://index.docker.io/v1/`, `ghcr.io`, …) to a
/// bare host, folding every Docker Hub alias onto the API host.
fn normalize_host(key: &str) -> String {
    let host = key
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host).to_lowercase();
    match host.as_str() {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
        _ => host,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
