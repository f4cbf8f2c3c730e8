//! Durable server configuration and process-level environment knobs
//! (spec.md §6 "Environment knobs"), split the way the teacher splits
//! `ConfigFile` (security-sensitive, written once with restricted
//! permissions) from directories passed on the command line.

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::prelude::*,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
fn chmod(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn chmod(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Security-sensitive server config, written once at `mesh-server init`
/// time with mode 0600, mirroring the teacher's `ConfigFile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    pub listen_port: u16,
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub issuer_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_jwks_cache_secs")]
    pub jwks_cache_secs: u64,
}

fn default_jwks_cache_secs() -> u64 {
    300
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            auth_enabled: false,
            issuer_url: None,
            client_id: None,
            client_secret: None,
            jwks_cache_secs: default_jwks_cache_secs(),
        }
    }
}

impl ConfigFile {
    pub fn jwks_cache_duration(&self) -> Duration {
        Duration::from_secs(self.jwks_cache_secs)
    }

    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let path = path.as_ref();
        let mut file = File::create(path)
            .map_err(|e| ServerError::Internal(format!("creating {}: {e}", path.display())))?;
        chmod(path, 0o600)
            .map_err(|e| ServerError::Internal(format!("chmod {}: {e}", path.display())))?;
        let toml = toml::to_string(self)
            .map_err(|e| ServerError::Internal(format!("serializing config: {e}")))?;
        file.write_all(toml.as_bytes())
            .map_err(|e| ServerError::Internal(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Internal(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| ServerError::Internal(format!("parsing {}: {e}", path.display())))
    }
}

/// Filesystem layout for the server process. One process serves every
/// network out of a single shared database (spec.md's REST surface
/// nests networks under one API, not one server per network, so unlike
/// the teacher's per-network `ServerConfig` there is exactly one config
/// file and one database file per deployment).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ServerConfig {
    pub fn new(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self { config_dir, data_dir }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("server").with_extension("toml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("meshd").with_extension("db")
    }
}

pub fn ensure_dirs_exist(dirs: &[&Path]) -> ServerResult<()> {
    for dir in dirs {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                chmod(dir, 0o700)
                    .map_err(|e| ServerError::Internal(format!("chmod {}: {e}", dir.display())))?;
            },
            Err(e) => return Err(ServerError::Internal(format!("creating {}: {e}", dir.display()))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");

        let written = ConfigFile {
            listen_port: 9090,
            auth_enabled: true,
            issuer_url: Some("https://idp.example".into()),
            client_id: Some("meshd".into()),
            client_secret: None,
            jwks_cache_secs: 120,
        };
        written.write_to_path(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        let read = ConfigFile::from_file(&path).unwrap();
        assert_eq!(read.listen_port, 9090);
        assert_eq!(read.issuer_url.as_deref(), Some("https://idp.example"));
    }

    #[test]
    fn ensure_dirs_exist_creates_restricted_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let data_dir = dir.path().join("data");
        ensure_dirs_exist(&[&config_dir, &data_dir]).unwrap();
        assert!(config_dir.is_dir());
        assert!(data_dir.is_dir());
    }
}
