//! Configuration types and loading.
//!
//! Settings come from a JSON file (default `$HOME/.Q4D/config.json`) and are
//! then overlaid with `Q4D_`-prefixed environment variables, one explicit
//! variable per setting. Everything is validated once, before dispatch starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::pipeline::types::RoutingConfig;

/// Default MQTT port when none is configured.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "Q4D_";

// ── Public configuration ────────────────────────────────────────────

/// Fully loaded configuration.
#[derive(Debug)]
pub struct Config {
    pub mqtt: BrokerConfig,
    pub routing: RoutingConfig,
    pub destinations: DestinationConfig,
}

/// MQTT broker connection settings.
#[derive(Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Generated (UUID v4) when not configured.
    pub client_id: String,
}

/// lftp parallelism knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LftpConfig {
    /// `mirror --parallel` and `pget -n`.
    pub threads: u32,
    /// `mirror --use-pget-n`.
    pub segments: u32,
}

impl Default for LftpConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            segments: 1,
        }
    }
}

/// Remote server the transfers are fetched from.
#[derive(Debug)]
pub struct ServerInfo {
    pub host: String,
    pub username: String,
    pub password: SecretString,
}

/// Credentials the transfer subprocess runs as (from `PUID`/`PGID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Everything the transfer executor needs. Read-only during dispatch.
#[derive(Debug)]
pub struct DestinationConfig {
    /// Routing code (lower-cased) → local destination directory.
    pub code_destinations: HashMap<String, PathBuf>,
    pub lftp: LftpConfig,
    pub server_info: ServerInfo,
    pub run_as: Option<RunAs>,
}

impl DestinationConfig {
    /// Look up the destination for a routing code, ignoring case.
    pub fn destination(&self, code: &str) -> Option<&Path> {
        self.code_destinations
            .get(&code.to_lowercase())
            .map(PathBuf::as_path)
    }
}

// ── File representation ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    mqtt: RawMqtt,
    server: RoutingConfig,
    client: RawClient,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawMqtt {
    host: String,
    port: u16,
    #[serde(alias = "user")]
    username: String,
    password: String,
    client_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawClient {
    code_destinations: HashMap<String, String>,
    lftp: LftpConfig,
    server_info: RawServerInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServerInfo {
    host: String,
    username: String,
    password: String,
}

// ── Loading ─────────────────────────────────────────────────────────

impl Config {
    /// Load from `path` (or the default location) and the process environment.
    ///
    /// An explicit path must exist. The default path is optional, since the
    /// environment alone may carry every setting.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|default| default.is_file()),
        };

        let raw = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                info!(path = %path.display(), "Using config file");
                RawConfig::parse(&text, &path.display().to_string())?
            }
            None => {
                warn!("No config file found, using environment only");
                RawConfig::default()
            }
        };

        raw.resolve(|key| std::env::var(key).ok())
    }

    /// Build a config from optional JSON text and an environment lookup.
    pub fn from_sources<F>(json: Option<&str>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = match json {
            Some(text) => RawConfig::parse(text, "<inline>")?,
            None => RawConfig::default(),
        };
        raw.resolve(env)
    }
}

impl RawConfig {
    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::ParseError {
            path: origin.into(),
            reason: e.to_string(),
        })
    }

    /// Apply the environment overlay, validate, and fill defaults.
    fn resolve<F>(mut self, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        apply_env_overlay(&mut self, &env)?;
        let run_as = run_as_from_env(&env)?;

        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mqtt.host".into(),
                hint: "Set it in the config file or via Q4D_MQTT_HOST".into(),
            });
        }

        let port = if self.mqtt.port == 0 {
            warn!(port = DEFAULT_MQTT_PORT, "MQTT port not set, using the default");
            DEFAULT_MQTT_PORT
        } else {
            self.mqtt.port
        };

        let client_id = if self.mqtt.client_id.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            warn!(client_id = %generated, "MQTT client id not set, generated a new one");
            generated
        } else {
            self.mqtt.client_id
        };

        let lftp = LftpConfig {
            threads: self.client.lftp.threads.max(1),
            segments: self.client.lftp.segments.max(1),
        };

        let code_destinations = self
            .client
            .code_destinations
            .into_iter()
            .map(|(code, path)| (code.to_lowercase(), PathBuf::from(path)))
            .collect();

        Ok(Config {
            mqtt: BrokerConfig {
                host: self.mqtt.host,
                port,
                username: self.mqtt.username,
                password: SecretString::from(self.mqtt.password),
                client_id,
            },
            routing: self.server,
            destinations: DestinationConfig {
                code_destinations,
                lftp,
                server_info: ServerInfo {
                    host: self.client.server_info.host,
                    username: self.client.server_info.username,
                    password: SecretString::from(self.client.server_info.password),
                },
                run_as,
            },
        })
    }
}

/// `$HOME/.Q4D/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".Q4D").join("config.json"))
}

/// Apply `Q4D_*` overrides, one key at a time.
fn apply_env_overlay<F>(raw: &mut RawConfig, env: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| env(&format!("{ENV_PREFIX}{key}"));

    if let Some(v) = var("MQTT_HOST") {
        raw.mqtt.host = v;
    }
    if let Some(v) = var("MQTT_PORT") {
        raw.mqtt.port = parse_number("mqtt.port", &v)?;
    }
    if let Some(v) = var("MQTT_USERNAME").or_else(|| var("MQTT_USER")) {
        raw.mqtt.username = v;
    }
    if let Some(v) = var("MQTT_PASSWORD") {
        raw.mqtt.password = v;
    }
    if let Some(v) = var("MQTT_CLIENTID") {
        raw.mqtt.client_id = v;
    }
    if let Some(v) = var("SERVER_DEFAULTCODE") {
        raw.server.default_code = v;
    }
    if let Some(v) = var("CLIENT_LFTP_THREADS") {
        raw.client.lftp.threads = parse_number("client.lftp.threads", &v)?;
    }
    if let Some(v) = var("CLIENT_LFTP_SEGMENTS") {
        raw.client.lftp.segments = parse_number("client.lftp.segments", &v)?;
    }
    if let Some(v) = var("CLIENT_SERVERINFO_HOST") {
        raw.client.server_info.host = v;
    }
    if let Some(v) = var("CLIENT_SERVERINFO_USERNAME") {
        raw.client.server_info.username = v;
    }
    if let Some(v) = var("CLIENT_SERVERINFO_PASSWORD") {
        raw.client.server_info.password = v;
    }

    Ok(())
}

/// Both `PUID` and `PGID` must be set for the override to apply.
fn run_as_from_env<F>(env: &F) -> Result<Option<RunAs>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match (env("PUID"), env("PGID")) {
        (Some(uid), Some(gid)) if !uid.is_empty() && !gid.is_empty() => Ok(Some(RunAs {
            uid: parse_number("PUID", &uid)?,
            gid: parse_number("PGID", &gid)?,
        })),
        _ => Ok(None),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{value:?}: {e}"),
        })
}
