// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements the resolver configuration.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

/// The resolver configuration.
///
/// Everything except the database path has a default, so a minimal
/// TOML configuration is just `db_path = "..."`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The path of the backing SQLite database.
    pub db_path: PathBuf,

    /// The path of the degrade cache dump file.
    #[serde(default = "default_dump_file")]
    pub dump_file: PathBuf,

    /// The table holding zones as `(id, name)` rows.
    #[serde(default = "default_zones_table")]
    pub zones_table: String,

    /// The table holding records as
    /// `(id, zone_id, host, type, data, ttl, online)` rows.
    #[serde(default = "default_records_table")]
    pub records_table: String,

    /// How long the maintenance loops wait after a failed tick before
    /// retrying, in seconds.
    #[serde(default = "default_fail_interval_secs")]
    pub fail_interval_secs: u64,

    /// How long the maintenance loops sleep after a successful tick,
    /// in seconds.
    #[serde(default = "default_success_interval_secs")]
    pub success_interval_secs: u64,

    /// The bound on individual store queries, in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_dump_file() -> PathBuf {
    PathBuf::from("quarry-degrade.json")
}

fn default_zones_table() -> String {
    "zones".to_owned()
}

fn default_records_table() -> String {
    "records".to_owned()
}

fn default_fail_interval_secs() -> u64 {
    5
}

fn default_success_interval_secs() -> u64 {
    60
}

fn default_query_timeout_ms() -> u64 {
    3_000
}

impl Config {
    /// Creates a configuration for the database at `db_path` with every
    /// other setting at its default.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            dump_file: default_dump_file(),
            zones_table: default_zones_table(),
            records_table: default_records_table(),
            fail_interval_secs: default_fail_interval_secs(),
            success_interval_secs: default_success_interval_secs(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }

    /// Loads the configuration from the TOML file at `path`.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = fs::read(path.as_ref())?;
        let config: Self = toml::from_slice(&raw)?;
        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// The maintenance loops' retry interval after a failed tick.
    pub fn fail_interval(&self) -> Duration {
        Duration::from_secs(self.fail_interval_secs)
    }

    /// The maintenance loops' sleep interval after a successful tick.
    pub fn success_interval(&self) -> Duration {
        Duration::from_secs(self.success_interval_secs)
    }

    /// The bound on individual store queries.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when loading the configuration.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(toml::de::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read the configuration file: {}", err),
            Self::Parse(err) => write!(f, "failed to parse the configuration file: {}", err),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
