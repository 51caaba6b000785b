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

//! The resolver core: answer assembly and the degrade fallback.
//!
//! [`Resolver::resolve`] proceeds through a fixed sequence of
//! attempts. The query name is split at the zone boundary by the
//! suffix matcher; then the store is searched for a direct match on
//! the host label and query type; if that yields nothing, for CNAME
//! records at the same name (chasing each target one level); and if
//! the answer set is still empty and the query name is not a bare zone
//! apex, for wildcard records under the base zone. Each attempt either
//! contributes answers, contributes nothing, or fails.
//!
//! Failures never propagate to the caller. Any store error or
//! unregistered name, and equally an answer set that ends up empty,
//! routes to the degrade cache: if a previously served answer exists
//! for the `(query name, query type)` pair, it is served stale;
//! otherwise the resolver abstains and the surrounding pipeline moves
//! on to its next handler. A freshly assembled answer is written
//! through to the cache on the way out, so the cache always holds the
//! last answer that was actually served.

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};

use crate::config::Config;
use crate::degrade::{AnswerSet, DegradeCache, QueryKey};
use crate::maintenance;
use crate::rr::{self, Rr, TYPE_CNAME};
use crate::store::{self, SqliteStore, Store};
use crate::thread::{self, ThreadGroup};
use crate::zone::{self, ZoneCut, ZoneIndex, APEX_HOST, LABEL_SEPARATOR, WILDCARD_HOST};

////////////////////////////////////////////////////////////////////////
// THE RESOLVER                                                       //
////////////////////////////////////////////////////////////////////////

/// The result of a resolution, as seen by the surrounding pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// An answer was assembled (or served stale from the degrade
    /// cache); the records are ready to be written into a response.
    Answer(Vec<Rr>),

    /// This resolver has no opinion on the query. The caller should
    /// continue with its next handler.
    Abstain,
}

/// The resolver. It is generic over the [`Store`] seam; `S` is the
/// actual store implementation.
pub struct Resolver<S> {
    store: S,
    config: Config,
    zones: ZoneIndex,
    degrade: DegradeCache,
}

impl<S: Store> Resolver<S> {
    /// Creates a new `Resolver` answering from `store`. The zone index
    /// starts empty; it is populated by the zone refresh loop once
    /// [`Resolver::start`] has run.
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store,
            config,
            zones: ZoneIndex::new(),
            degrade: DegradeCache::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn zones(&self) -> &ZoneIndex {
        &self.zones
    }

    pub fn degrade(&self) -> &DegradeCache {
        &self.degrade
    }

    /// The startup lifecycle hook. Loads the persisted degrade cache
    /// and starts the two maintenance loops on `group`. The loops run
    /// until the group shuts down.
    pub fn start(self: &Arc<Self>, group: &Arc<ThreadGroup>) -> Result<(), thread::Error>
    where
        S: 'static,
    {
        self.degrade.load(&self.config.dump_file);

        let (resolver, group_cloned) = (self.clone(), group.clone());
        group.start(Some("zone refresher".to_owned()), move || {
            maintenance::zone_refresh_loop(resolver, group_cloned)
        })?;

        let (resolver, group_cloned) = (self.clone(), group.clone());
        group.start(Some("health probe".to_owned()), move || {
            maintenance::health_probe_loop(resolver, group_cloned)
        })?;

        info!("Resolver started");
        Ok(())
    }

    /// The shutdown lifecycle hook. Dumps the degrade cache to disk
    /// (best-effort). The caller is expected to have stopped handing
    /// queries to the resolver and to shut down the thread group
    /// afterwards.
    pub fn shutdown(&self) {
        self.degrade.dump(&self.config.dump_file);
        info!("Resolver shut down");
    }

    /// Resolves a query. This is the pipeline boundary: the surrounding
    /// server calls it once per incoming query, possibly from many
    /// threads at once.
    pub fn resolve(&self, qname: &str, qtype: &str) -> Outcome {
        debug!("Resolving {}/{}", qname, qtype);
        let key = QueryKey::new(qname, qtype);
        match self.assemble(qname, qtype) {
            Ok(texts) => {
                let answers = AnswerSet::from_texts(texts);
                if answers.is_empty() {
                    // No records exist for this name (decode failures
                    // aside), so there is nothing fresh to serve. A
                    // stale answer still beats none.
                    debug!("No records for {}/{}", qname, qtype);
                    self.fall_back(&key)
                } else {
                    self.degrade.put_if_changed(key, answers.clone());
                    Outcome::Answer(answers.into_records())
                }
            }
            Err(e) => {
                error!("Resolution of {}/{} failed: {}", qname, qtype, e);
                self.fall_back(&key)
            }
        }
    }

    /// The degrade edge: serves the last known good answer for `key`,
    /// or abstains if there is none.
    fn fall_back(&self, key: &QueryKey) -> Outcome {
        match self.degrade.get(key) {
            Some(answers) => {
                info!("Serving stale answer for {}/{}", key.fqdn, key.qtype);
                Outcome::Answer(answers.into_records())
            }
            None => Outcome::Abstain,
        }
    }

    /// Assembles the textual answer set for a query: direct match,
    /// then CNAME chase, then wildcard fallback. An empty result means
    /// no records exist; errors mean the attempt itself failed.
    fn assemble(&self, qname: &str, qtype: &str) -> Result<Vec<String>, ResolutionError> {
        let cut = self.zones.resolve(qname)?;
        debug!(
            "Matched zone {} (id {}), host {}",
            cut.zone, cut.id, cut.host,
        );

        let mut texts = Vec::new();
        for row in self.store.lookup(cut.id, &cut.host, qtype)? {
            texts.push(rr::text_form(
                &row.fqdn(&cut.zone),
                row.ttl,
                &row.rr_type,
                &row.data,
            ));
        }

        if texts.is_empty() {
            self.chase_cnames(&cut, qname, qtype, &mut texts)?;
        }

        // The wildcard fallback applies only if the query name extends
        // past the zone boundary. The apex check excludes the bare
        // zone apex; the dot count additionally excludes single-dot
        // names, whose remainder after the host label is not a fully
        // qualified base zone.
        if texts.is_empty()
            && cut.host != APEX_HOST
            && qname.matches(LABEL_SEPARATOR).count() > 1
        {
            self.try_wildcard(qname, qtype, &mut texts)?;
        }

        Ok(texts)
    }

    /// The CNAME chase. Each CNAME record at the query name
    /// contributes the CNAME itself plus the records of the requested
    /// type at its target. Only one level of indirection is chased: a
    /// target that is itself a CNAME is not followed further.
    fn chase_cnames(
        &self,
        cut: &ZoneCut,
        qname: &str,
        qtype: &str,
        texts: &mut Vec<String>,
    ) -> Result<(), ResolutionError> {
        for cname in self.store.lookup(cut.id, &cut.host, TYPE_CNAME)? {
            texts.push(rr::text_form(qname, cname.ttl, &cname.rr_type, &cname.data));

            let target = self.zones.resolve(&cname.data)?;
            for row in self.store.lookup(target.id, &target.host, qtype)? {
                texts.push(rr::text_form(
                    &row.fqdn(&target.zone),
                    row.ttl,
                    &row.rr_type,
                    &row.data,
                ));
            }
        }
        Ok(())
    }

    /// The wildcard fallback. The base zone (the query name minus its
    /// leftmost label) is looked up directly in the zone index, and
    /// wildcard records under it answer with the *original* query name
    /// but the record's TTL, type and data.
    fn try_wildcard(
        &self,
        qname: &str,
        qtype: &str,
        texts: &mut Vec<String>,
    ) -> Result<(), ResolutionError> {
        let base = zone::base_zone(qname).ok_or(zone::Error::NotRegistered)?;
        let zone_id = self.zones.get(base).ok_or(zone::Error::NotRegistered)?;
        for row in self.store.lookup(zone_id, WILDCARD_HOST, qtype)? {
            texts.push(rr::text_form(qname, row.ttl, &row.rr_type, &row.data));
        }
        Ok(())
    }
}

impl Resolver<SqliteStore> {
    /// Opens the SQLite store described by `config` (its path, table
    /// names and query timeout) and builds a resolver over it. This is
    /// the usual construction path: the store connection is
    /// established here, so [`Resolver::start`] only has to load the
    /// persisted cache and start the maintenance loops.
    pub fn open(config: Config) -> Result<Self, store::Error> {
        let store = SqliteStore::from_config(&config)?;
        Ok(Self::new(store, config))
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// The failures that route a resolution to the degrade edge. This type
/// never escapes [`Resolver::resolve`]; it exists so that the
/// assembly steps can use `?`.
#[derive(Clone, Debug, Eq, PartialEq)]
enum ResolutionError {
    Zone(zone::Error),
    Store(store::Error),
}

impl From<zone::Error> for ResolutionError {
    fn from(err: zone::Error) -> Self {
        Self::Zone(err)
    }
}

impl From<store::Error> for ResolutionError {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Zone(err) => err.fmt(f),
            Self::Store(err) => err.fmt(f),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
