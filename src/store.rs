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

//! The gateway to the relational backing store.
//!
//! The resolver and the maintenance loops access the store through the
//! [`Store`] trait, so the algorithmic core is independent of the
//! actual database. The provided implementation, [`SqliteStore`],
//! executes parameterized lookups against an SQLite database.
//!
//! Two queries make up the whole contract: listing all zones as
//! `(id, name)` pairs, and listing the active records that match a
//! `(zone id, host, type)` triple exactly. A lookup that matches no
//! rows is a valid, empty result; only connectivity and query failures
//! are errors.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use crate::config::Config;
use crate::zone::APEX_HOST;

////////////////////////////////////////////////////////////////////////
// ROW TYPES AND THE STORE TRAIT                                      //
////////////////////////////////////////////////////////////////////////

/// A zone row: a registered naming boundary and the id under which the
/// store keys its records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Zone {
    pub id: i64,
    pub name: String,
}

/// A record row, as returned by [`Store::lookup`]. The store keys
/// records by zone id and does not know zone names; the caller derives
/// the record's fully qualified name with [`RecordRow::fqdn`] using the
/// zone name it supplied to the lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordRow {
    pub id: i64,
    pub zone_id: i64,
    pub host: String,
    pub rr_type: String,
    pub data: String,
    pub ttl: u32,
}

impl RecordRow {
    /// Derives the record's fully qualified name within the named
    /// zone. Apex records (host [`APEX_HOST`] or empty) take the zone
    /// name itself.
    pub fn fqdn(&self, zone_name: &str) -> String {
        if self.host.is_empty() || self.host == APEX_HOST {
            zone_name.to_owned()
        } else {
            format!("{}.{}", self.host, zone_name)
        }
    }
}

/// The seam between the resolver and the relational backing store.
///
/// Implementations must tolerate concurrent use: every query task and
/// both maintenance loops share one `Store`.
pub trait Store: Send + Sync {
    /// Lists all zones as `(id, name)` pairs.
    fn zones(&self) -> Result<Vec<Zone>, Error>;

    /// Lists the active records matching the given zone id, host label
    /// and record type exactly. Zero rows is a valid result and is
    /// *not* an error.
    fn lookup(&self, zone_id: i64, host: &str, rr_type: &str) -> Result<Vec<RecordRow>, Error>;

    /// Checks that the store is reachable.
    fn ping(&self) -> Result<(), Error>;

    /// Discards the current connection and establishes a fresh one.
    /// The health probe calls this after a failed ping.
    fn reconnect(&self) -> Result<(), Error>;
}

////////////////////////////////////////////////////////////////////////
// SQLITE IMPLEMENTATION                                              //
////////////////////////////////////////////////////////////////////////

/// A [`Store`] backed by an SQLite database.
///
/// The two query statements are built once from the configured table
/// names. Table names are validated as identifiers, since they are the
/// only non-parameterized part of the SQL. A busy timeout bounds every
/// query so that a locked database cannot stall query handling
/// indefinitely.
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    zone_sql: String,
    record_sql: String,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens the database described by `config`: its path, table names
    /// and query timeout.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::open(
            &config.db_path,
            &config.zones_table,
            &config.records_table,
            config.query_timeout(),
        )
    }

    /// Opens the database at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        zones_table: &str,
        records_table: &str,
        busy_timeout: Duration,
    ) -> Result<Self, Error> {
        let path = path.into();
        for table in [zones_table, records_table] {
            if !is_valid_table_name(table) {
                return Err(Error::Connection(format!("invalid table name {:?}", table)));
            }
        }
        let conn = connect(&path, busy_timeout)?;
        Ok(Self {
            path,
            busy_timeout,
            zone_sql: format!("SELECT id, name FROM {}", zones_table),
            record_sql: format!(
                "SELECT id, zone_id, host, type, data, ttl FROM {} \
                 WHERE zone_id = ?1 AND host = ?2 AND type = ?3 AND online <> 0",
                records_table,
            ),
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn zones(&self) -> Result<Vec<Zone>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare_cached(&self.zone_sql)?;
        let rows = statement.query_map([], |row| {
            Ok(Zone {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn lookup(&self, zone_id: i64, host: &str, rr_type: &str) -> Result<Vec<RecordRow>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare_cached(&self.record_sql)?;
        let rows = statement.query_map((zone_id, host, rr_type), |row| {
            Ok(RecordRow {
                id: row.get(0)?,
                zone_id: row.get(1)?,
                host: row.get(2)?,
                rr_type: row.get(3)?,
                data: row.get(4)?,
                ttl: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn ping(&self) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn reconnect(&self) -> Result<(), Error> {
        let fresh = connect(&self.path, self.busy_timeout)?;
        *self.conn.lock().unwrap() = fresh;
        Ok(())
    }
}

/// Opens a connection and configures its busy timeout.
fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection, Error> {
    let conn =
        Connection::open(path).map_err(|e| Error::Connection(e.to_string()))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| Error::Connection(e.to_string()))?;
    Ok(conn)
}

/// Returns whether `name` is acceptable as a table name: a
/// non-empty ASCII identifier.
fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when querying the backing store. Both variants
/// indicate that the store could not answer; they never stand for an
/// empty result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The store could not be reached or the connection could not be
    /// established.
    Connection(String),

    /// A query failed to execute.
    Query(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connection(detail) => write!(f, "store connection failed: {}", detail),
            Self::Query(detail) => write!(f, "store query failed: {}", detail),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Self::Query(error.to_string())
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = "\
        CREATE TABLE zones (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE); \
        CREATE TABLE records ( \
            id INTEGER PRIMARY KEY, \
            zone_id INTEGER NOT NULL, \
            host TEXT NOT NULL, \
            type TEXT NOT NULL, \
            data TEXT NOT NULL, \
            ttl INTEGER NOT NULL, \
            online INTEGER NOT NULL DEFAULT 1);";

    fn test_store(dir: &tempfile::TempDir) -> SqliteStore {
        let path = dir.path().join("store.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(
            "INSERT INTO zones (id, name) VALUES (1, 'example.com.'); \
             INSERT INTO records (zone_id, host, type, data, ttl, online) VALUES \
                 (1, 'svc', 'A', '10.0.0.1', 60, 1), \
                 (1, 'svc', 'A', '10.0.0.2', 60, 1), \
                 (1, 'svc', 'AAAA', '2001:db8::1', 60, 1), \
                 (1, 'old', 'A', '10.0.0.9', 60, 0);",
        )
        .unwrap();
        SqliteStore::open(&path, "zones", "records", Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn zones_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        assert_eq!(
            store.zones().unwrap(),
            vec![Zone {
                id: 1,
                name: "example.com.".to_owned(),
            }],
        );
    }

    #[test]
    fn lookup_matches_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let rows = store.lookup(1, "svc", "A").unwrap();
        let data: Vec<&str> = rows.iter().map(|r| r.data.as_str()).collect();
        assert_eq!(data, ["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn zero_rows_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        assert!(store.lookup(1, "nothing", "A").unwrap().is_empty());
        assert!(store.lookup(2, "svc", "A").unwrap().is_empty());
    }

    #[test]
    fn offline_records_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        assert!(store.lookup(1, "old", "A").unwrap().is_empty());
    }

    #[test]
    fn ping_and_reconnect_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        store.ping().unwrap();
        store.reconnect().unwrap();
        store.ping().unwrap();
        assert!(!store.lookup(1, "svc", "A").unwrap().is_empty());
    }

    #[test]
    fn bad_table_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let result = SqliteStore::open(&path, "zones; DROP", "records", Duration::ZERO);
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[test]
    fn the_configuration_reaches_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE dns_zones (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE); \
             CREATE TABLE dns_records ( \
                 id INTEGER PRIMARY KEY, \
                 zone_id INTEGER NOT NULL, \
                 host TEXT NOT NULL, \
                 type TEXT NOT NULL, \
                 data TEXT NOT NULL, \
                 ttl INTEGER NOT NULL, \
                 online INTEGER NOT NULL DEFAULT 1); \
             INSERT INTO dns_zones (id, name) VALUES (1, 'example.com.'); \
             INSERT INTO dns_records (zone_id, host, type, data, ttl) VALUES \
                 (1, 'svc', 'A', '10.0.0.1', 60);",
        )
        .unwrap();

        let mut config = Config::new(&path);
        config.zones_table = "dns_zones".to_owned();
        config.records_table = "dns_records".to_owned();
        config.query_timeout_ms = 250;

        let store = SqliteStore::from_config(&config).unwrap();
        assert_eq!(store.busy_timeout, Duration::from_millis(250));
        assert_eq!(store.zones().unwrap().len(), 1);
        let rows = store.lookup(1, "svc", "A").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, "10.0.0.1");
    }

    #[test]
    fn fqdn_derivation_handles_the_apex() {
        let row = |host: &str| RecordRow {
            id: 1,
            zone_id: 1,
            host: host.to_owned(),
            rr_type: "A".to_owned(),
            data: "10.0.0.1".to_owned(),
            ttl: 60,
        };
        assert_eq!(row("svc").fqdn("example.com."), "svc.example.com.");
        assert_eq!(row("@").fqdn("example.com."), "example.com.");
        assert_eq!(row("").fqdn("example.com."), "example.com.");
    }
}
