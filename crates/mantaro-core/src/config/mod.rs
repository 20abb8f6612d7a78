//! Application configuration schemas.
//!
//! The API settings live in a JSON file (`api.json` by default) read
//! through the `config` crate, with `MANTARO_`-prefixed environment
//! variables layered on top. The cache and logging sections are built by
//! the entry point rather than read from that file.

pub mod cache;
pub mod logging;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::{error, info};

use crate::error::{AppError, ErrorKind};
use crate::result::AppResult;

/// Default location of the API configuration, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "api.json";

/// Prefix for environment variables that override file values.
pub const ENV_PREFIX: &str = "MANTARO";

/// API configuration loaded from `api.json`.
///
/// String fields only accept JSON strings; numbers or booleans in their
/// place are rejected rather than converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Patreon OAuth client secret.
    #[serde(deserialize_with = "strict_string")]
    pub patreon_secret: String,
    /// Patreon creator access token.
    #[serde(deserialize_with = "strict_string")]
    pub patreon_token: String,
    /// HTTP port the API listens on.
    pub port: u16,
    /// Whether to re-check patrons that were already recorded.
    #[serde(rename = "check")]
    pub check_old_patrons: bool,
    /// Shared secret expected from API clients.
    #[serde(deserialize_with = "strict_string")]
    pub auth: String,
    /// User agent sent on outgoing requests.
    #[serde(deserialize_with = "strict_string")]
    pub user_agent: String,
}

/// Placeholder document written on first run.
///
/// `user_agent` is intentionally absent: the operator has to add it.
#[derive(Debug, Serialize)]
struct ConfigTemplate {
    patreon_secret: &'static str,
    patreon_token: &'static str,
    port: u16,
    check: bool,
    auth: &'static str,
}

impl Default for ConfigTemplate {
    fn default() -> Self {
        Self {
            patreon_secret: "secret",
            patreon_token: "token",
            port: 5874,
            check: true,
            auth: "uuid",
        }
    }
}

impl Config {
    /// Load the configuration from `path`.
    ///
    /// When the file does not exist a placeholder template is written there
    /// and an error of kind [`ErrorKind::ConfigTemplateCreated`] is
    /// returned. Callers must not proceed in that case.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::load_with_env(path.as_ref(), config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: &Path, env: config::Environment) -> AppResult<Self> {
        info!("Loading configuration file << {}", path.display());

        if !path.exists() {
            write_template(path)?;
            let shown = display_path(path);
            error!("Could not find config file at {shown}, creating a new one...");
            error!("Generated new config file at {shown}.");
            error!("Please, fill the file with valid properties.");
            return Err(AppError::new(
                ErrorKind::ConfigTemplateCreated,
                format!("Generated new config file at {shown}"),
            ));
        }

        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents, env)
    }

    fn from_json(contents: &str, env: config::Environment) -> AppResult<Self> {
        // Environment values stay strings; `port` and `check` are converted
        // on deserialize, secrets are kept verbatim.
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Json))
            .add_source(env)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to parse config: {e}")))?;

        settings.try_deserialize().map_err(|e| {
            let message = match &e {
                config::ConfigError::NotFound(field) => {
                    format!("Failed to deserialize config: missing field `{field}`")
                }
                other => format!("Failed to deserialize config: {other}"),
            };
            AppError::with_source(ErrorKind::Configuration, message, e)
        })
    }
}

fn strict_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    struct StrictString;

    impl Visitor<'_> for StrictString {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_owned())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }
    }

    deserializer.deserialize_any(StrictString)
}

/// Load `api.json` from the working directory.
pub fn load_config() -> AppResult<Config> {
    Config::load(DEFAULT_CONFIG_FILE)
}

fn write_template(path: &Path) -> AppResult<()> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    ConfigTemplate::default().serialize(&mut ser)?;
    fs::write(path, buf)?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .display()
        .to_string()
}
