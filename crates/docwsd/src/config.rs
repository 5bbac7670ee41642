//! Configuration: defaults, TOML file, `DOCWSD__*` environment overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use docwsd_protocol::{DEFAULT_CLIENT_PORT, DEFAULT_TRANSFER_PORT, DEFAULT_WORKER_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::jail::JailSpec;
use crate::pool::privilege::DebugIdentity;

/// Application name, used for config paths and the environment prefix.
pub const APP_NAME: &str = "docwsd";

/// Default number of workers kept ready.
pub const DEFAULT_PRESPAWN: usize = 10;

/// Configuration problems detected before serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("{first} and {second} must differ (both are {port})")]
    PortConflict {
        first: &'static str,
        second: &'static str,
        port: u16,
    },

    #[error("pool.prespawn must be at least 1")]
    InvalidPrespawn,

    #[error("invalid server.host {0:?}")]
    InvalidHost(String),

    #[error("{0} is required when the jail is enabled")]
    MissingSetting(&'static str),

    #[error("{setting} {path} is not a directory")]
    NotADirectory {
        setting: &'static str,
        path: PathBuf,
    },

    #[error("jail.app_subpath must be relative, got {0}")]
    AbsoluteSubpath(PathBuf),

    #[error("unable to access {path}: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to expand {value:?}: {message}")]
    Expand { value: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub jail: JailConfig,
    pub paths: PathsConfig,
    pub privileges: PrivilegesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub client_port: u16,
    /// Loopback-only listener for worker control connections.
    pub worker_port: u16,
    /// Loopback-only port of the file-transfer helper.
    pub transfer_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub prespawn: usize,
    /// How long a client waits for a worker before giving up.
    pub claim_timeout_secs: u64,
    /// Pause after a failed launch before trying again.
    pub spawn_backoff_ms: u64,
    /// Binary to launch for workers; defaults to the running executable.
    pub worker_program: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prespawn: DEFAULT_PRESPAWN,
            claim_timeout_secs: 10,
            spawn_backoff_ms: 1000,
            worker_program: None,
        }
    }
}

impl PoolConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn spawn_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn_backoff_ms)
    }

    /// Runtime worker threads for the server.
    pub fn runtime_threads(&self) -> usize {
        (self.prespawn * 2).max(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    pub enabled: bool,
    pub sys_template: Option<String>,
    pub app_template: Option<String>,
    pub child_root: Option<String>,
    pub app_subpath: String,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sys_template: None,
            app_template: None,
            child_root: None,
            app_subpath: "app".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Tile cache directory. Only its accessibility is checked.
    pub cache_dir: Option<String>,
    /// Startup lock; defaults to `<state_dir>/docwsd.lock`.
    pub lock_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegesConfig {
    /// Debug builds running as root switch to an ordinary user.
    pub simulate_non_root: bool,
    pub debug_uid: Option<u32>,
}

impl Default for PrivilegesConfig {
    fn default() -> Self {
        Self {
            simulate_non_root: true,
            debug_uid: None,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file (if present) and the environment.
    pub fn load(config_file: &Path, env_prefix: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let built = Config::builder()
            .set_default("logging.level", defaults.logging.level)?
            .set_default("server.host", defaults.server.host)?
            .set_default("server.client_port", i64::from(defaults.server.client_port))?
            .set_default("server.worker_port", i64::from(defaults.server.worker_port))?
            .set_default(
                "server.transfer_port",
                i64::from(defaults.server.transfer_port),
            )?
            .set_default("pool.prespawn", defaults.pool.prespawn as i64)?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }

    /// Check the settings needed to serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        for (first, a, second, b) in [
            ("server.client_port", server.client_port, "server.worker_port", server.worker_port),
            ("server.client_port", server.client_port, "server.transfer_port", server.transfer_port),
            ("server.worker_port", server.worker_port, "server.transfer_port", server.transfer_port),
        ] {
            if a == b && a != 0 {
                return Err(ConfigError::PortConflict {
                    first,
                    second,
                    port: a,
                });
            }
        }

        self.host()?;

        if self.pool.prespawn == 0 {
            return Err(ConfigError::InvalidPrespawn);
        }

        if self.jail.enabled {
            for (setting, value) in [
                ("jail.sys_template", &self.jail.sys_template),
                ("jail.app_template", &self.jail.app_template),
                ("jail.child_root", &self.jail.child_root),
            ] {
                let Some(value) = value else {
                    return Err(ConfigError::MissingSetting(setting));
                };
                let path = expand(value)?;
                if !path.is_dir() {
                    return Err(ConfigError::NotADirectory { setting, path });
                }
            }
            let subpath = Path::new(&self.jail.app_subpath);
            if subpath.is_absolute() {
                return Err(ConfigError::AbsoluteSubpath(subpath.to_path_buf()));
            }
        }

        if let Some(cache) = &self.paths.cache_dir {
            let path = expand(cache)?;
            check_access(&path)?;
        }

        Ok(())
    }

    /// Parsed bind address for the client listener.
    pub fn host(&self) -> Result<IpAddr, ConfigError> {
        self.server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))
    }

    /// Jail layout, or `None` when jails are disabled.
    pub fn jail_spec(&self) -> Result<Option<JailSpec>, ConfigError> {
        if !self.jail.enabled {
            return Ok(None);
        }
        let required = |setting: &'static str, value: &Option<String>| match value {
            Some(value) => expand(value),
            None => Err(ConfigError::MissingSetting(setting)),
        };
        Ok(Some(JailSpec {
            child_root: required("jail.child_root", &self.jail.child_root)?,
            sys_template: required("jail.sys_template", &self.jail.sys_template)?,
            app_template: required("jail.app_template", &self.jail.app_template)?,
            app_subpath: PathBuf::from(&self.jail.app_subpath),
        }))
    }

    /// Debug identity handed to workers.
    pub fn debug_identity(&self) -> DebugIdentity {
        DebugIdentity {
            simulate_non_root: self.privileges.simulate_non_root,
            uid: self.privileges.debug_uid,
        }
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand(value: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(value)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| ConfigError::Expand {
            value: value.to_string(),
            message: e.to_string(),
        })
}

fn check_access(path: &Path) -> Result<(), ConfigError> {
    use rustix::fs::{Access, access};

    access(path, Access::READ_OK | Access::WRITE_OK | Access::EXEC_OK).map_err(|e| {
        ConfigError::Inaccessible {
            path: path.to_path_buf(),
            source: e.into(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn jail_less() -> AppConfig {
        let mut config = AppConfig::default();
        config.jail.enabled = false;
        config
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.client_port, 9980);
        assert_eq!(config.server.worker_port, 9981);
        assert_eq!(config.server.transfer_port, 9979);
        assert_eq!(config.pool.prespawn, 10);
        assert_eq!(config.pool.runtime_threads(), 20);
        assert_eq!(config.jail.app_subpath, "app");
        assert!(config.jail.enabled);
    }

    #[test]
    fn test_runtime_threads_floor() {
        let mut config = AppConfig::default();
        config.pool.prespawn = 0;
        assert_eq!(config.pool.runtime_threads(), 2);
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nclient_port = 9000\n\n[pool]\nprespawn = 3\n",
        )
        .unwrap();

        let config = AppConfig::load(&path, "DOCWSD_TEST_LAYERS").unwrap();
        assert_eq!(config.server.client_port, 9000);
        assert_eq!(config.server.worker_port, 9981);
        assert_eq!(config.pool.prespawn, 3);
        assert_eq!(config.pool.claim_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_without_file() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig::load(&tmp.path().join("missing.toml"), "DOCWSD_TEST_MISSING").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_port_conflicts_rejected() {
        let mut config = jail_less();
        config.server.client_port = config.server.worker_port;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortConflict { port: 9981, .. })
        ));

        let mut config = jail_less();
        config.server.transfer_port = config.server.client_port;
        assert!(matches!(config.validate(), Err(ConfigError::PortConflict { .. })));
    }

    #[test]
    fn test_jail_settings_required() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSetting("jail.sys_template"))
        ));
    }

    #[test]
    fn test_jail_settings_must_be_directories() {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.jail.sys_template = Some(tmp.path().display().to_string());
        config.jail.app_template = Some(tmp.path().join("missing").display().to_string());
        config.jail.child_root = Some(tmp.path().display().to_string());

        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotADirectory {
                setting: "jail.app_template",
                ..
            })
        ));

        config.jail.app_template = Some(tmp.path().display().to_string());
        config.validate().unwrap();
        let spec = config.jail_spec().unwrap().unwrap();
        assert_eq!(spec.app_subpath, PathBuf::from("app"));

        config.jail.app_subpath = "/abs".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AbsoluteSubpath(_))
        ));
    }

    #[test]
    fn test_cache_dir_must_be_accessible() {
        let tmp = TempDir::new().unwrap();
        let mut config = jail_less();
        config.paths.cache_dir = Some(tmp.path().display().to_string());
        config.validate().unwrap();

        config.paths.cache_dir = Some(tmp.path().join("missing").display().to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inaccessible { .. })
        ));
    }

    #[test]
    fn test_invalid_host_and_prespawn() {
        let mut config = jail_less();
        config.server.host = "not an address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHost(_))));

        let mut config = jail_less();
        config.pool.prespawn = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPrespawn)));
    }

    #[test]
    fn test_jail_disabled_has_no_spec() {
        assert!(jail_less().jail_spec().unwrap().is_none());
    }
}
