// mskit-messaging-core/src/config.rs
use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

/// Delay between reconnect and resubscribe attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 30_000;

/// Environment prefix merged over file configuration by [`load_config`].
pub const ENV_PREFIX: &str = "MSKIT_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub options_durable: bool,
    #[serde(rename = "options_noAck", alias = "options_no_ack")]
    pub options_no_ack: bool,
    pub prefetch: u16,
    pub reconnect_delay_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: String::new(),
            options_durable: true,
            options_no_ack: false,
            prefetch: 1,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl AmqpConfig {
    /// Credentials and host must all be present.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() || self.host.is_empty() {
            return Err(MessagingError::Config(
                "input parameters validation failed: username, password and host are required"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn uri(&self) -> String {
        format!("amqp://{}:{}@{}", self.username, self.password, self.host)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn file_provider(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MessagingError::Config("config file must have an extension".into()))?;

    match extension {
        "json" => Ok(Figment::new().merge(Json::file(path))),
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        other => Err(MessagingError::Config(format!(
            "unsupported config file format: {other}"
        ))),
    }
}

fn extract<T>(figment: &Figment, section: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let extracted = if section.is_empty() {
        figment.extract()
    } else {
        figment.extract_inner(section)
    };
    extracted.map_err(|e| MessagingError::Config(format!("failed to load configuration: {e}")))
}

/// Environment keys are lowercased, except the camel-cased `options_noAck`.
fn env_key(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    match key.strip_suffix("options_noack") {
        Some(parent) => format!("{parent}options_noAck"),
        None => key,
    }
}

/// Loads `section` (a dotted path, empty for the whole document) from a
/// json, toml or yaml file.
pub fn load_config_from_file<T, P>(path: P, section: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let figment = file_provider(path.as_ref())?;
    extract(&figment, section)
}

/// Like [`load_config_from_file`], with `MSKIT_`-prefixed environment
/// variables merged on top. Nested keys use `__`, e.g. `MSKIT_AMQP__HOST`.
pub fn load_config<T, P>(path: P, section: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let env = Env::prefixed(ENV_PREFIX)
        .split("__")
        .map(|key| env_key(key.as_str()).into())
        .lowercase(false);
    let figment = file_provider(path.as_ref())?.merge(env);
    extract(&figment, section)
}
