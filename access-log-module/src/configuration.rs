// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structures handling command line options and YAML deserialization for the access log module

use clap::{ArgAction, Parser, ValueEnum};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::writer::RotationPolicy;

const MEGABYTE: u64 = 1024 * 1024;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Command line options of the access log module
#[derive(Debug, Default, Parser)]
pub struct AccessLogOpt {
    /// Access log file path
    ///
    /// Special values are an empty string (disable logging) and - (write to standard output).
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Access log format
    #[clap(long, value_enum)]
    pub log_format: Option<LogFormatKind>,

    /// Size in megabytes at which the access log is rotated, 0 disables size-based rotation
    #[clap(long)]
    pub log_max_size: Option<u64>,

    /// Number of rotated access log files to keep, 0 keeps all of them
    #[clap(long)]
    pub log_max_backups: Option<usize>,

    /// Age in days after which rotated access log files are removed, 0 keeps them forever
    #[clap(long)]
    pub log_max_age: Option<u32>,

    /// Whether rotated access log files should be gzip-compressed (true or false)
    #[clap(long, action = ArgAction::Set)]
    pub log_compress: Option<bool>,

    /// Interval in seconds at which log file permissions are checked and corrected
    #[clap(long)]
    pub log_secure_interval: Option<u64>,
}

/// Format of the access log lines
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatKind {
    /// Common Log Format: `%h %l %u %t "%r" %>s %b`, `common` in config file
    #[default]
    Common,
    /// Combined Log Format, Common Log Format followed by quoted `Referer` and `User-Agent`
    /// header values, `combined` in config file
    Combined,
}

/// Configuration settings of the access log module
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessLogConf {
    /// Access log file path
    ///
    /// Special values are an empty string (disable logging) and - (write to standard output).
    pub log_file: PathBuf,
    /// Format of the log lines, `common` or `combined`
    pub log_format: LogFormatKind,
    /// Size in megabytes at which the log file is rotated. Size-based rotation is disabled if
    /// this is 0.
    pub log_max_size: u64,
    /// Number of rotated files to keep. If 0, rotated files are only removed due to their age.
    pub log_max_backups: usize,
    /// Age in days after which rotated files are removed. If 0, rotated files are only removed
    /// due to the number of backups.
    pub log_max_age: u32,
    /// If `true`, rotated files are compressed with gzip.
    pub log_compress: bool,
    /// Interval in seconds at which permissions of the log files are enforced.
    pub log_secure_interval: u64,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/apache2/access.log"),
            log_format: LogFormatKind::Common,
            log_max_size: 100,
            log_max_backups: 5,
            log_max_age: 30,
            log_compress: true,
            log_secure_interval: 60,
        }
    }
}

impl AccessLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if let Some(log_file) = opt.log_file {
            self.log_file = log_file;
        }

        if let Some(log_format) = opt.log_format {
            self.log_format = log_format;
        }

        if let Some(log_max_size) = opt.log_max_size {
            self.log_max_size = log_max_size;
        }

        if let Some(log_max_backups) = opt.log_max_backups {
            self.log_max_backups = log_max_backups;
        }

        if let Some(log_max_age) = opt.log_max_age {
            self.log_max_age = log_max_age;
        }

        if let Some(log_compress) = opt.log_compress {
            self.log_compress = log_compress;
        }

        if let Some(log_secure_interval) = opt.log_secure_interval {
            self.log_secure_interval = log_secure_interval;
        }
    }

    /// Rotation settings for the log file
    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_size: self.log_max_size.saturating_mul(MEGABYTE),
            max_backups: self.log_max_backups,
            max_age: DAY * self.log_max_age,
            compress: self.log_compress,
        }
    }

    /// Interval of the periodic permission checks
    pub fn secure_interval(&self) -> Duration {
        Duration::from_secs(self.log_secure_interval.max(1))
    }
}

/// Trait for configuration structures that can be loaded from YAML data. This trait has a
/// blanket implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from a YAML string.
    fn from_yaml<S>(yaml: S) -> Result<Self, Error>
    where
        S: AsRef<str>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref()).map_err(|source| Error::ReadConfiguration {
            path: path.as_ref().to_owned(),
            source,
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader)?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }

    fn from_yaml<S: AsRef<str>>(yaml: S) -> Result<Self, Error> {
        let conf = serde_yaml::from_str(yaml.as_ref())?;
        trace!("Loaded configuration: {conf:#?}");

        Ok(conf)
    }
}
