// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file configuration.
//!
//! ```yaml
//! log_level: info
//! database: ./results.db
//! packet_path: ./tmp/regression.pkt
//! delimiter_secret: magic
//! generator:
//!   program: /usr/local/bin/wb
//!   timeout: 30
//!   concurrency: 1
//!   repetitions: 1
//!   verbosity: 4
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::{
    config::{
        deserialize_optional_duration_from_seconds, deserialize_optional_string,
        log_level::LogLevel, Config, ConfigError, ConfigSource,
    },
    merge_option, merge_option_to_value,
};

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfig {
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub database: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub packet_path: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub delimiter_secret: Option<String>,
    pub generator: YamlGeneratorConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct YamlGeneratorConfig {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub program: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub timeout: Option<Duration>,
    pub concurrency: Option<u32>,
    pub repetitions: Option<u32>,
    pub verbosity: Option<u32>,
}

fn merge_config(config: &mut Config, yaml_config: &YamlConfig) {
    merge_option_to_value!(config, yaml_config, log_level);
    merge_option!(config, yaml_config, delimiter_secret);
    if let Some(database) = &yaml_config.database {
        config.database = Some(PathBuf::from(database));
    }
    if let Some(packet_path) = &yaml_config.packet_path {
        config.packet_path = PathBuf::from(packet_path);
    }

    let generator = &yaml_config.generator;
    merge_option_to_value!(config.generator, generator, program);
    merge_option_to_value!(config.generator, generator, timeout);
    merge_option_to_value!(config.generator, generator, concurrency);
    merge_option_to_value!(config.generator, generator, repetitions);
    merge_option_to_value!(config.generator, generator, verbosity);
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<YamlConfig>() {
            Ok(yaml_config) => merge_config(config, &yaml_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from yaml file: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
