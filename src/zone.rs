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

//! The zone index and suffix matcher.
//!
//! A [`ZoneIndex`] maps fully qualified zone names to the opaque ids
//! under which the backing store keys their records. The index is an
//! immutable snapshot published wholesale: the zone refresh loop builds
//! a complete replacement map from the store and installs it with
//! [`ZoneIndex::replace`], so readers never observe a partially built
//! map.
//!
//! [`ZoneIndex::resolve`] implements the suffix match. The query name
//! is split into labels, and candidate zones are formed by dropping
//! labels from the left. Because the first candidate is the entire name
//! and each following candidate is one label shorter, the first hit is
//! the *longest* registered zone that is a suffix of the query name,
//! i.e. the most specific one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// The host label under which a zone's apex records are stored. The
/// suffix matcher produces this sentinel when the query name *is* the
/// zone name, so that apex records cannot collide with records for a
/// host whose label happens to be empty.
pub const APEX_HOST: &str = "@";

/// The reserved host label that matches any host when no exact or
/// CNAME match exists.
pub const WILDCARD_HOST: &str = "*";

/// The label separator in fully qualified domain names.
pub const LABEL_SEPARATOR: char = '.';

////////////////////////////////////////////////////////////////////////
// ZONE INDEX                                                         //
////////////////////////////////////////////////////////////////////////

/// An atomically published mapping from zone name to zone id.
#[derive(Debug, Default)]
pub struct ZoneIndex {
    map: RwLock<Arc<HashMap<String, i64>>>,
}

/// The result of a successful suffix match: the matched zone's id and
/// name, and the host label part of the query name (or [`APEX_HOST`]
/// when the query name is the zone name itself).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZoneCut {
    pub id: i64,
    pub host: String,
    pub zone: String,
}

impl ZoneIndex {
    /// Creates a new, initially empty `ZoneIndex`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `map` as the new snapshot, replacing the previous one
    /// wholesale. In-flight lookups continue against the snapshot they
    /// already hold.
    pub fn replace(&self, map: HashMap<String, i64>) {
        *self.map.write().unwrap() = Arc::new(map);
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<String, i64>> {
        self.map.read().unwrap().clone()
    }

    /// Looks up a zone name exactly, with no suffix matching. The
    /// wildcard fallback uses this to find the base zone directly.
    pub fn get(&self, zone: &str) -> Option<i64> {
        self.map.read().unwrap().get(zone).copied()
    }

    /// Returns the number of zones in the current snapshot.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Returns whether the current snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Finds the most specific registered zone that is a suffix of
    /// `fqdn` and splits the name at the zone boundary.
    pub fn resolve(&self, fqdn: &str) -> Result<ZoneCut, Error> {
        let map = self.snapshot();
        let labels: Vec<&str> = fqdn.split(LABEL_SEPARATOR).collect();
        for i in 0..labels.len() {
            let zone = labels[i..].join(".");
            if let Some(&id) = map.get(zone.as_str()) {
                let host = if i == 0 {
                    APEX_HOST.to_owned()
                } else {
                    labels[..i].join(".")
                };
                return Ok(ZoneCut { id, host, zone });
            }
        }
        Err(Error::NotRegistered)
    }
}

/// Strips the leftmost label from `fqdn`, producing the base zone name
/// the wildcard fallback searches. Returns [`None`] if there is no
/// label to strip.
pub fn base_zone(fqdn: &str) -> Option<&str> {
    fqdn.split_once(LABEL_SEPARATOR)
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise during suffix matching.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// No registered zone is a suffix of the query name.
    NotRegistered,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NotRegistered => f.write_str("the name is under no registered zone"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(zones: &[(&str, i64)]) -> ZoneIndex {
        let index = ZoneIndex::new();
        index.replace(
            zones
                .iter()
                .map(|&(name, id)| (name.to_owned(), id))
                .collect(),
        );
        index
    }

    #[test]
    fn hosts_under_a_zone_resolve() {
        let index = index_of(&[("example.com.", 7)]);
        let cut = index.resolve("svc.example.com.").unwrap();
        assert_eq!(
            cut,
            ZoneCut {
                id: 7,
                host: "svc".to_owned(),
                zone: "example.com.".to_owned(),
            },
        );
    }

    #[test]
    fn multi_label_hosts_resolve() {
        let index = index_of(&[("example.com.", 7)]);
        let cut = index.resolve("a.b.example.com.").unwrap();
        assert_eq!(cut.host, "a.b");
        assert_eq!(cut.zone, "example.com.");
    }

    #[test]
    fn the_apex_resolves_to_the_sentinel_host() {
        let index = index_of(&[("example.com.", 7)]);
        let cut = index.resolve("example.com.").unwrap();
        assert_eq!(cut.host, APEX_HOST);
        assert_eq!(cut.zone, "example.com.");
    }

    #[test]
    fn the_longest_zone_wins() {
        let index = index_of(&[("example.com.", 1), ("b.example.com.", 2)]);
        let cut = index.resolve("a.b.example.com.").unwrap();
        assert_eq!(cut.id, 2);
        assert_eq!(cut.host, "a");
        assert_eq!(cut.zone, "b.example.com.");
    }

    #[test]
    fn unregistered_names_fail() {
        let index = index_of(&[("example.com.", 1)]);
        assert_eq!(index.resolve("example.org."), Err(Error::NotRegistered));
        assert_eq!(
            ZoneIndex::new().resolve("svc.example.com."),
            Err(Error::NotRegistered),
        );
    }

    #[test]
    fn replacement_is_wholesale() {
        let index = index_of(&[("example.com.", 1), ("example.org.", 2)]);
        let before = index.snapshot();
        index.replace([("example.net.".to_owned(), 3)].into_iter().collect());
        assert_eq!(index.get("example.com."), None);
        assert_eq!(index.get("example.net."), Some(3));

        // The old snapshot is unchanged for readers that still hold it.
        assert_eq!(before.get("example.com."), Some(&1));
    }

    #[test]
    fn base_zone_strips_the_leftmost_label() {
        assert_eq!(base_zone("foo.example.com."), Some("example.com."));
        assert_eq!(base_zone("example.com."), Some("com."));
        assert_eq!(base_zone("com."), None);
        assert_eq!(base_zone("com"), None);
    }
}
