// Copyright 2021 The corfu Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use corfu::storage::SegmentOptions;
use corfu::RuntimeParameters;
use serde::Deserialize;
use thiserror::Error;

pub const ENV_LOG_DIR: &str = "CORFU_LOG_DIR";
pub const ENV_EPOCH_TIMEOUT_MS: &str = "CORFU_EPOCH_TIMEOUT_MS";
pub const ENV_MAX_CACHE_BYTES: &str = "CORFU_MAX_CACHE_BYTES";

pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
    #[error("invalid value {value:?} of {name}")]
    InvalidValue { name: String, value: String },
}

/// The content of the toml config file, every field is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub data_dir: Option<String>,
    pub epoch_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_cache_bytes: Option<usize>,
    pub segment_width: Option<u64>,
    pub sync: Option<bool>,
    /// A json file mapping endpoints to socket addresses.
    pub named_file: Option<String>,
    pub layout_servers: Option<Vec<String>>,
}

/// The settings of a process. Values are taken from the command line, the
/// environment, the config file and the defaults, in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub epoch_timeout: Duration,
    pub request_timeout: Duration,
    /// The budget of the runtime read cache and of the log unit buffer pool.
    pub max_cache_bytes: usize,
    pub segment_width: u64,
    pub sync: bool,
    pub named_file: Option<String>,
    pub layout_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        let params = RuntimeParameters::default();
        let opts = SegmentOptions::default();
        Config {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            epoch_timeout: params.epoch_timeout,
            request_timeout: params.request_timeout,
            max_cache_bytes: params.max_cache_bytes,
            segment_width: opts.width,
            sync: opts.sync,
            named_file: None,
            layout_servers: Vec::new(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            name: String::from(name),
            value,
        })
}

impl Config {
    /// Load the config from the file at `path` (if any) and the process
    /// environment.
    pub fn load(path: Option<&str>) -> Result<Config, ConfigError> {
        Config::from_sources(path, |name| std::env::var(name).ok())
    }

    pub fn from_sources<F>(path: Option<&str>, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Read(String::from(path), e))?;
            let file: FileConfig =
                toml::from_str(&content).map_err(|e| ConfigError::Parse(String::from(path), e))?;
            config.apply_file(file);
        }

        if let Some(value) = env(ENV_LOG_DIR) {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env(ENV_EPOCH_TIMEOUT_MS) {
            config.epoch_timeout = Duration::from_millis(parse_env(ENV_EPOCH_TIMEOUT_MS, value)?);
        }
        if let Some(value) = env(ENV_MAX_CACHE_BYTES) {
            config.max_cache_bytes = parse_env(ENV_MAX_CACHE_BYTES, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(data_dir) = file.data_dir {
            self.data_dir = PathBuf::from(data_dir);
        }
        if let Some(ms) = file.epoch_timeout_ms {
            self.epoch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.request_timeout_ms {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = file.max_cache_bytes {
            self.max_cache_bytes = bytes;
        }
        if let Some(width) = file.segment_width {
            self.segment_width = width;
        }
        if let Some(sync) = file.sync {
            self.sync = sync;
        }
        if file.named_file.is_some() {
            self.named_file = file.named_file;
        }
        if let Some(layout_servers) = file.layout_servers {
            self.layout_servers = layout_servers;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &str, value: String| {
            Err(ConfigError::InvalidValue {
                name: String::from(name),
                value,
            })
        };
        if self.epoch_timeout.as_millis() == 0 {
            return invalid("epoch_timeout_ms", String::from("0"));
        }
        if self.request_timeout.as_millis() == 0 {
            return invalid("request_timeout_ms", String::from("0"));
        }
        if self.segment_width == 0 {
            return invalid("segment_width", String::from("0"));
        }
        Ok(())
    }

    /// Split a comma separated endpoint list given on the command line.
    pub fn set_layout_servers(&mut self, list: &str) -> Result<(), ConfigError> {
        let servers: Vec<String> = list
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: String::from("layout-servers"),
                value: String::from(list),
            });
        }
        self.layout_servers = servers;
        Ok(())
    }

    pub fn runtime_parameters(&self) -> RuntimeParameters {
        RuntimeParameters {
            request_timeout: std::cmp::min(self.request_timeout, self.epoch_timeout),
            epoch_timeout: self.epoch_timeout,
            max_cache_bytes: self.max_cache_bytes,
            ..RuntimeParameters::default()
        }
    }

    pub fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            width: self.segment_width,
            sync: self.sync,
            max_pool_bytes: self.max_cache_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(None, no_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.segment_options().width, 10_000);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn environment_overrides_file() {
        let file = config_file(
            r#"
            data_dir = "/var/lib/corfu"
            epoch_timeout_ms = 3000
            segment_width = 100
            sync = false
            layout_servers = ["a:9000", "b:9000"]
            "#,
        );
        let mut env = HashMap::new();
        env.insert(ENV_EPOCH_TIMEOUT_MS, String::from("500"));
        env.insert(ENV_MAX_CACHE_BYTES, String::from("1024"));

        let path = file.path().to_string_lossy().into_owned();
        let config = Config::from_sources(Some(&path), |name| env.get(name).cloned()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/corfu"));
        assert_eq!(config.epoch_timeout, Duration::from_millis(500));
        assert_eq!(config.segment_width, 100);
        assert_eq!(config.sync, false);
        assert_eq!(config.layout_servers, vec!["a:9000", "b:9000"]);

        let params = config.runtime_parameters();
        assert_eq!(params.max_cache_bytes, 1024);
        assert_eq!(params.request_timeout, Duration::from_millis(500));
        assert_eq!(config.segment_options().max_pool_bytes, 1024);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let result = Config::from_sources(None, |name| {
            if name == ENV_MAX_CACHE_BYTES {
                Some(String::from("lots"))
            } else {
                None
            }
        });
        assert_eq!(matches!(result, Err(ConfigError::InvalidValue { .. })), true);

        let file = config_file("segment_width = \"wide\"");
        let path = file.path().to_string_lossy().into_owned();
        let result = Config::from_sources(Some(&path), no_env);
        assert_eq!(matches!(result, Err(ConfigError::Parse(..))), true);

        let file = config_file("segment_width = 0");
        let path = file.path().to_string_lossy().into_owned();
        let result = Config::from_sources(Some(&path), no_env);
        assert_eq!(matches!(result, Err(ConfigError::InvalidValue { .. })), true);

        let mut config = Config::default();
        assert_eq!(config.set_layout_servers(" , ").is_err(), true);
        config.set_layout_servers("a:1, b:2").unwrap();
        assert_eq!(config.layout_servers, vec!["a:1", "b:2"]);
    }
}
