//! Application-level configuration loading: remote host, polling cadence and push settings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the service looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "AP_TRACKER_CONFIG_PATH";

const DEFAULT_HOST: &str = "archipelago.gg";
const DEFAULT_FCM_BASE_URL: &str = "https://fcm.googleapis.com";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub polling: PollingConfig,
    pub push: PushConfig,
}

/// Where and how to reach the game-room service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub host: String,
    pub http_timeout_secs: u64,
    pub socket_timeout_secs: u64,
}

impl RemoteConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

/// Cadence of the supervisor and of each room poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub poll_interval_secs: u64,
    pub supervisor_interval_secs: u64,
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs)
    }
}

/// Push batching and transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Messages per transport request.
    pub chunk_size: usize,
    /// Pause between two chunks.
    pub chunk_delay_ms: u64,
    /// FCM project; without it notifications are only logged.
    pub fcm_project_id: Option<String>,
    /// Service-account key file; `GOOGLE_APPLICATION_CREDENTIALS` when unset.
    pub fcm_credentials_path: Option<PathBuf>,
    pub fcm_base_url: String,
    pub request_timeout_secs: u64,
}

impl PushConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        host = %app_config.remote.host,
                        poll_interval_secs = app_config.polling.poll_interval_secs,
                        "loaded tracker config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    archipelago_host: Option<String>,
    http_timeout_secs: Option<u64>,
    socket_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    supervisor_interval_secs: Option<u64>,
    push: RawPushConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPushConfig {
    chunk_size: Option<usize>,
    chunk_delay_ms: Option<u64>,
    fcm_project_id: Option<String>,
    fcm_credentials_path: Option<PathBuf>,
    fcm_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        // Zero intervals would turn the loops into busy spins.
        let at_least_one = |value: Option<u64>, default: u64| value.unwrap_or(default).max(1);

        Self {
            remote: RemoteConfig {
                host: value
                    .archipelago_host
                    .filter(|host| !host.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_HOST.to_owned()),
                http_timeout_secs: at_least_one(value.http_timeout_secs, 15),
                socket_timeout_secs: at_least_one(value.socket_timeout_secs, 10),
            },
            polling: PollingConfig {
                poll_interval_secs: at_least_one(value.poll_interval_secs, 60),
                supervisor_interval_secs: at_least_one(value.supervisor_interval_secs, 30),
            },
            push: value.push.into(),
        }
    }
}

impl From<RawPushConfig> for PushConfig {
    fn from(value: RawPushConfig) -> Self {
        Self {
            chunk_size: value.chunk_size.unwrap_or(10).max(1),
            chunk_delay_ms: value.chunk_delay_ms.unwrap_or(100),
            fcm_project_id: value.fcm_project_id.filter(|id| !id.is_empty()),
            fcm_credentials_path: value
                .fcm_credentials_path
                .filter(|path| !path.as_os_str().is_empty()),
            fcm_base_url: value
                .fcm_base_url
                .unwrap_or_else(|| DEFAULT_FCM_BASE_URL.to_owned()),
            request_timeout_secs: value.request_timeout_secs.unwrap_or(10).max(1),
        }
    }
}

/// Persistence backend selected by `STORAGE_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Mongo,
    /// Process-local store for development and tests; rooms do not survive a restart.
    Memory,
}

impl StorageBackend {
    const ENV: &'static str = "STORAGE_BACKEND";

    pub fn from_env() -> Self {
        Self::parse(env::var(Self::ENV).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => StorageBackend::Mongo,
            Some(value) if value.eq_ignore_ascii_case("mongo") => StorageBackend::Mongo,
            Some(value) if value.eq_ignore_ascii_case("memory") => StorageBackend::Memory,
            Some(value) => {
                warn!(value, "unknown storage backend; using mongo");
                StorageBackend::Mongo
            }
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
