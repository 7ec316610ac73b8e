// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harness configuration.
//!
//! Sources are applied in order, later ones win:
//! 1. Defaults
//! 2. YAML file (`ftw-harness.yaml`, or the path in `FTW_CONFIG`)
//! 3. Environment variables prefixed with `FTW_`
//!
//! Command line flags are applied by the binary on top of the result.

pub mod env;
pub mod log_level;
pub mod yaml;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::{env::EnvConfigSource, log_level::LogLevel, yaml::YamlConfigSource};

/// Default YAML file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "ftw-harness.yaml";

/// Merges `Option<T>` source fields into `T` config fields when set.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Merges `Option<T>` source fields into `Option<T>` config fields when set.
#[macro_export]
macro_rules! merge_option {
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

#[derive(Debug, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    ParseError(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {:?}", e);
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        self.config.clone()
    }
}

/// How the load generator is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct GeneratorConfig {
    /// Executable, looked up on `PATH` when not absolute.
    pub program: String,
    /// Socket timeout handed to the generator.
    pub timeout: Duration,
    pub concurrency: u32,
    pub repetitions: u32,
    /// Output verbosity; packets are only printed from level 4 on.
    pub verbosity: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "wb".to_string(),
            timeout: Duration::from_secs(30),
            concurrency: 1,
            repetitions: 1,
            verbosity: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub log_level: LogLevel,
    /// Persistent store location; `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    /// Packet file written by `gen` and replayed by `start`.
    pub packet_path: PathBuf,
    pub generator: GeneratorConfig,
    /// Fixed sentinel secret for reproducible runs; random when `None`.
    pub delimiter_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            database: None,
            packet_path: default_packet_path(),
            generator: GeneratorConfig::default(),
            delimiter_secret: None,
        }
    }
}

/// `/tmp/test.<pid>.pkt`, or `./tmp/test.<pid>.pkt` without a `/tmp`.
#[must_use]
pub fn default_packet_path() -> PathBuf {
    let file = format!("test.{}.pkt", std::process::id());
    let system_tmp = Path::new("/tmp");
    if system_tmp.is_dir() {
        system_tmp.join(file)
    } else {
        PathBuf::from("tmp").join(file)
    }
}

/// Path of the YAML configuration file.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var_os("FTW_CONFIG").map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

#[must_use]
pub fn get_config(path: &Path) -> Config {
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource {
            path: path.to_path_buf(),
        }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        other => {
            error!("Failed to parse value, expected a string, got: {}, ignoring", other);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match u64::try_from(v) {
                Ok(v) => self.visit_u64(v),
                Err(_) => {
                    error!("Failed to parse duration: negative durations are not allowed, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v < 0f64 || !v.is_finite() {
                error!("Failed to parse duration: {v} is not a valid number of seconds, ignoring");
                return Ok(None);
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v.trim().parse::<f64>() {
                Ok(seconds) => self.visit_f64(seconds),
                Err(_) => {
                    error!("Failed to parse duration: {v:?} is not a number, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}
