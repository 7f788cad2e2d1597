//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::codec::DEFAULT_MAX_LEN;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    #[validate]
    #[serde(default)]
    pub codec: CodecSettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    pub session: SessionSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedhub").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_api"))]
/// Listener settings. At least one of the two protocols must be enabled.
pub struct ApiSettings {
    /// The address of the numeric aggregation protocol. Leave this out to disable it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// numeric_address = "0.0.0.0:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_API__NUMERIC_ADDRESS=0.0.0.0:8080
    /// ```
    pub numeric_address: Option<SocketAddr>,

    /// The address of the session protocol. Leave this out to disable it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// session_address = "127.0.0.1:2413"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_API__SESSION_ADDRESS=127.0.0.1:2413
    /// ```
    pub session_address: Option<SocketAddr>,
}

impl ApiSettings {
    /// Checks that at least one listener is configured.
    fn validate_api(&self) -> Result<(), ValidationError> {
        match (&self.numeric_address, &self.session_address) {
            (None, None) => Err(ValidationError::new("no listener configured")),
            _ => Ok(()),
        }
    }
}

/// A wrapper for validate derive.
fn validate_api(s: &ApiSettings) -> Result<(), ValidationError> {
    s.validate_api()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Sanity bounds of the wire codecs.
pub struct CodecSettings {
    /// The maximal number of elements declared by a numeric update: doubles of a dense update,
    /// trees of a forest, bytes of a tree or stumps of a boosting update.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [codec]
    /// max_elements = 10000000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_CODEC__MAX_ELEMENTS=10000000
    /// ```
    #[validate(range(min = 1, max = 2147483647))]
    #[serde(default = "default_max_len")]
    pub max_elements: u32,

    /// The maximal length in bytes of a blob sent over the session protocol.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [codec]
    /// max_frame_len = 10000000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_CODEC__MAX_FRAME_LEN=10000000
    /// ```
    #[validate(range(min = 1, max = 2147483647))]
    #[serde(default = "default_max_len")]
    pub max_frame_len: u32,
}

fn default_max_len() -> u32 {
    DEFAULT_MAX_LEN
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_MAX_LEN,
            max_frame_len: DEFAULT_MAX_LEN,
        }
    }
}

/// The combination law of the numeric protocol.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Federated averaging of dense updates.
    Average,
    /// Append-and-vote over random forests.
    Forest,
    /// Append-and-vote over boosted decision stumps.
    Boosting,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        AggregationPolicy::Average
    }
}

/// The layout of a dense update.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenseLayout {
    /// `n`, then `n` doubles.
    Vector,
    /// `rows`, `cols`, then `rows * cols` doubles.
    Matrix,
}

impl Default for DenseLayout {
    fn default() -> Self {
        DenseLayout::Vector
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Numeric protocol settings.
pub struct AggregationSettings {
    /// The combination law, one of `average`, `forest` or `boosting`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// policy = "forest"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_AGGREGATION__POLICY=forest
    /// ```
    #[serde(default)]
    pub policy: AggregationPolicy,

    /// The layout of averaged updates, `vector` or `matrix`. Ignored by the ensemble policies.
    #[serde(default)]
    pub layout: DenseLayout,

    /// Whether a connection carries repeated rounds until the client disconnects, rather than a
    /// single exchange.
    #[serde(default)]
    pub persistent: bool,

    /// The number of accepted ensemble submissions from which the probes are evaluated and
    /// logged after every further submission.
    #[serde(default = "default_report_threshold")]
    pub report_threshold: usize,

    /// Sample rows evaluated by the ensemble vote.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// probes = [[1.0, 2.0], [2.0, 1.0]]
    /// ```
    #[serde(default)]
    pub probes: Vec<Vec<f64>>,
}

fn default_report_threshold() -> usize {
    2
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            policy: AggregationPolicy::default(),
            layout: DenseLayout::default(),
            persistent: false,
            report_threshold: default_report_threshold(),
            probes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Session protocol settings.
pub struct SessionSettings {
    /// The flat table of client grants, rewritten after every change.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [session]
    /// records_path = "client_records.txt"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_SESSION__RECORDS_PATH=/var/lib/fedhub/client_records.txt
    /// ```
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,

    /// The directory holding the `<name>.model` artifacts and optional `<name>.params` seeds.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_records_path() -> PathBuf {
    PathBuf::from("client_records.txt")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("loaded_models")
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A tracing filter directive.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "fedhub=debug,info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDHUB_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
