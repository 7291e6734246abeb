use lookout_remote::Credentials;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Run configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `credentials.toml` and `settings.json` (default: ./config).
    pub config_dir: PathBuf,
    /// Parent of the per-target download directories (default: ./output).
    pub output_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Base URL of the private API.
    pub api_url: String,
    pub download_concurrency: usize,
    pub download_timeout_secs: u64,
    /// Upper bound on feed pages fetched per run.
    pub max_pages: usize,
    /// Euclidean distance at or below which two faces match.
    pub tolerance: f32,
}

impl Config {
    /// Load configuration from `LOOKOUT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            config_dir: env_path("LOOKOUT_CONFIG_DIR").unwrap_or_else(|| PathBuf::from("config")),
            output_dir: env_path("LOOKOUT_OUTPUT_DIR").unwrap_or_else(|| PathBuf::from("output")),
            model_dir: env_path("LOOKOUT_MODEL_DIR").unwrap_or_else(lookout_core::default_model_dir),
            api_url: std::env::var("LOOKOUT_API_URL")
                .unwrap_or_else(|_| lookout_remote::DEFAULT_API_URL.to_string()),
            download_concurrency: env_parse("LOOKOUT_DOWNLOAD_CONCURRENCY", 8),
            download_timeout_secs: env_parse("LOOKOUT_DOWNLOAD_TIMEOUT_SECS", 30),
            max_pages: env_parse("LOOKOUT_MAX_PAGES", 500),
            tolerance: env_parse("LOOKOUT_TOLERANCE", lookout_core::DEFAULT_TOLERANCE),
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join("credentials.toml")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    /// Download directory for one target account. The handle becomes a
    /// single path component, so anything but an account name is refused.
    pub fn target_dir(&self, handle: &str) -> Result<PathBuf, ConfigError> {
        let valid = !handle.is_empty()
            && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
            && handle.chars().any(|c| c != '.');
        if !valid {
            return Err(ConfigError::InvalidHandle(handle.to_string()));
        }
        Ok(self.output_dir.join(handle))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("credentials file {path} has no [credentials] {key}")]
    Missing { path: PathBuf, key: &'static str },
    #[error("invalid account handle {0:?}")]
    InvalidHandle(String),
}

#[derive(Deserialize)]
struct CredentialsFile {
    credentials: Option<CredentialsSection>,
}

#[derive(Deserialize)]
struct CredentialsSection {
    username: Option<String>,
    password: Option<String>,
}

/// Read the `[credentials]` section of the credentials file.
pub fn load_credentials(path: &Path) -> Result<Credentials, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: CredentialsFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let missing = |key| ConfigError::Missing {
        path: path.to_path_buf(),
        key,
    };
    let section = file.credentials.ok_or_else(|| missing("section"))?;
    let username = section
        .username
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| missing("username"))?;
    let password = section
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| missing("password"))?;
    Ok(Credentials { username, password })
}
