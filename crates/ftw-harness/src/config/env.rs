// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;

use crate::{
    config::{
        deserialize_optional_duration_from_seconds, deserialize_optional_string,
        log_level::LogLevel, Config, ConfigError, ConfigSource,
    },
    merge_option, merge_option_to_value,
};

/// Flat view of the `FTW_*` environment variables.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    /// `FTW_LOG_LEVEL`
    pub log_level: Option<LogLevel>,
    /// `FTW_DATABASE`
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub database: Option<String>,
    /// `FTW_PACKET_PATH`
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub packet_path: Option<String>,
    /// `FTW_DELIMITER_SECRET`
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub delimiter_secret: Option<String>,
    /// `FTW_GENERATOR_PROGRAM`
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub generator_program: Option<String>,
    /// `FTW_GENERATOR_TIMEOUT`, in seconds
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub generator_timeout: Option<Duration>,
    pub generator_concurrency: Option<u32>,
    pub generator_repetitions: Option<u32>,
    pub generator_verbosity: Option<u32>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) {
    merge_option_to_value!(config, env_config, log_level);
    merge_option!(config, env_config, delimiter_secret);
    if let Some(database) = &env_config.database {
        config.database = Some(PathBuf::from(database));
    }
    if let Some(packet_path) = &env_config.packet_path {
        config.packet_path = PathBuf::from(packet_path);
    }
    merge_option_to_value!(config.generator, program, env_config, generator_program);
    merge_option_to_value!(config.generator, timeout, env_config, generator_timeout);
    merge_option_to_value!(config.generator, concurrency, env_config, generator_concurrency);
    merge_option_to_value!(config.generator, repetitions, env_config, generator_repetitions);
    merge_option_to_value!(config.generator, verbosity, env_config, generator_verbosity);
}

#[derive(Debug, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed("FTW_"));

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
