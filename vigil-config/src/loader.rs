use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;
use vigil_core::config::DaemonConfig;

use super::{
    models::{
        Config, ConfigMetadata, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT, ServerConfig,
        sources::{EnvConfig, FileConfig},
    },
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["vigil.toml", "config/vigil.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default locations are resolved against. Defaults to the
    /// working directory.
    pub search_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    /// Loads `.env`, reads the process environment, then merges it over the
    /// config file.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv()
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Same as [`ConfigLoader::load`] with an already gathered environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let resolved = if let Some(explicit) = &self.options.config_path {
            Some((explicit.clone(), true))
        } else if let Some(from_env) = &env.config_path {
            Some((from_env.clone(), true))
        } else {
            self.default_location().map(|path| (path, false))
        };

        let Some((path, required)) = resolved else {
            return Ok((None, None));
        };

        if !path.exists() {
            if required {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "loaded config file");
        Ok((Some(file_config), Some(path)))
    }

    fn default_location(&self) -> Option<PathBuf> {
        let base = self.options.search_dir.as_deref().unwrap_or(Path::new(""));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|candidate| candidate.exists())
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        let config_present = file_config.is_some();
        let file = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .or(file.server.host)
                .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
            port: env
                .server_port
                .or(file.server.port)
                .unwrap_or(DEFAULT_SERVER_PORT),
        };

        let mut daemon = DaemonConfig {
            kb: file.kb,
            engine: file.engine,
            runner: file.runner,
            reaper: file.reaper,
        };
        if let Some(address) = env.kb_address {
            daemon.kb.address = address;
        }
        if let Some(path) = env.engine_path {
            daemon.engine.path = path;
        }
        if let Some(max) = env.max_parallel {
            daemon.runner.max_parallel = max;
        }
        if let Some(retention) = env.scan_retention_secs {
            daemon.reaper.retention_secs = retention;
        }

        if !config_present {
            warnings.push_with_hint(
                "No config file found; using built-in defaults",
                "Create vigil.toml or pass --config to tune the daemon",
            );
        }

        let config = Config {
            server,
            daemon,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok((config, warnings))
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file {path} not found")]
    MissingConfig { path: PathBuf },
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
