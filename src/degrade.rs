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

//! The degrade cache: last known good answers, kept in memory and
//! persisted to disk.
//!
//! On every successful resolution the resolver writes the computed
//! answer set through to the cache; on any resolution failure it reads
//! the cache for a stale answer before abstaining. The cache therefore
//! always holds the last answer set that was actually served for each
//! `(query name, query type)` pair. Empty answer sets are never
//! written: a name with no records is not an answer, so negative
//! results are never served stale.
//!
//! The on-disk form is a JSON array of single-key objects,
//! `{"<fqdn>:<type>": ["<textual RR>", ...]}`. Persistence is
//! best-effort in both directions: a dump failure is logged and
//! otherwise ignored, and a missing or corrupt file loads as an empty
//! cache.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, error, warn};

use crate::rr::Rr;

/// The separator between the query name and the query type in on-disk
/// cache keys.
pub const KEY_SEPARATOR: char = ':';

/// The file mode of the dump file on Unix: readable only by the owner
/// and group.
#[cfg(unix)]
const DUMP_FILE_MODE: u32 = 0o640;

////////////////////////////////////////////////////////////////////////
// KEYS AND ANSWER SETS                                               //
////////////////////////////////////////////////////////////////////////

/// A degrade cache key: a query name and type, compared exactly.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QueryKey {
    pub fqdn: String,
    pub qtype: String,
}

impl QueryKey {
    pub fn new(fqdn: &str, qtype: &str) -> Self {
        Self {
            fqdn: fqdn.to_owned(),
            qtype: qtype.to_owned(),
        }
    }

    /// Produces the on-disk form of the key.
    fn to_disk(&self) -> String {
        format!("{}{}{}", self.fqdn, KEY_SEPARATOR, self.qtype)
    }

    /// Recovers a key from its on-disk form.
    fn from_disk(text: &str) -> Option<Self> {
        text.split_once(KEY_SEPARATOR)
            .map(|(fqdn, qtype)| Self::new(fqdn, qtype))
    }
}

/// A cached answer set, carrying both the textual forms (what gets
/// persisted) and the decoded records (what gets written into a
/// response).
///
/// The two sequences are kept in lock-step by construction: the only
/// constructor is [`AnswerSet::from_texts`], which decodes each textual
/// form and drops any string that fails to decode from *both*
/// sequences. The representations therefore cannot drift apart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnswerSet {
    texts: Vec<String>,
    records: Vec<Rr>,
}

impl AnswerSet {
    /// Decodes `texts` into an answer set, skipping any string that
    /// fails to decode.
    pub fn from_texts<I>(texts: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = Self {
            texts: Vec::new(),
            records: Vec::new(),
        };
        for text in texts {
            match text.parse::<Rr>() {
                Ok(rr) => {
                    set.texts.push(text);
                    set.records.push(rr);
                }
                Err(e) => warn!("Skipping undecodable record {:?}: {}", text, e),
            }
        }
        set
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn records(&self) -> &[Rr] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Rr> {
        self.records
    }
}

////////////////////////////////////////////////////////////////////////
// THE CACHE                                                          //
////////////////////////////////////////////////////////////////////////

/// The serialized form of the dump file: one single-key object per
/// cache entry.
type DumpDocument = Vec<BTreeMap<String, Vec<String>>>;

/// The degrade cache. A single mutex guards the map, covering both
/// individual reads/writes from query tasks and the bulk traversals of
/// [`DegradeCache::load`] and [`DegradeCache::dump`].
#[derive(Debug, Default)]
pub struct DegradeCache {
    entries: Mutex<HashMap<QueryKey, AnswerSet>>,
}

impl DegradeCache {
    /// Creates a new, initially empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached answer set for `key`, if any.
    pub fn get(&self, key: &QueryKey) -> Option<AnswerSet> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Writes `answers` through to the cache, unless the existing entry
    /// already holds a structurally equal record set (in which case the
    /// entry is left untouched) or `answers` is empty (negative results
    /// are never cached). Returns whether the entry was written.
    pub fn put_if_changed(&self, key: QueryKey, answers: AnswerSet) -> bool {
        if answers.is_empty() {
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(existing) if existing.records() == answers.records() => false,
            _ => {
                debug!("Caching answer for {}/{}", key.fqdn, key.qtype);
                entries.insert(key, answers);
                true
            }
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Loads the cache from the dump file at `path`, replacing the
    /// current contents wholesale. A missing or malformed file yields
    /// an empty cache; individual strings that fail to decode are
    /// skipped.
    pub fn load(&self, path: &Path) {
        let fresh = read_dump(path).unwrap_or_default();
        debug!(
            "Loaded {} degrade cache entries from {}",
            fresh.len(),
            path.display(),
        );
        *self.entries.lock().unwrap() = fresh;
    }

    /// Dumps the cache to the file at `path`. Best-effort: failures are
    /// logged and otherwise ignored.
    pub fn dump(&self, path: &Path) {
        let document: DumpDocument = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|(key, answers)| {
                    let mut entry = BTreeMap::new();
                    entry.insert(key.to_disk(), answers.texts().to_vec());
                    entry
                })
                .collect()
        };

        let content = match serde_json::to_vec(&document) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to serialize the degrade cache: {}", e);
                return;
            }
        };
        if let Err(e) = write_dump(path, &content) {
            error!(
                "Failed to dump the degrade cache to {}: {}",
                path.display(),
                e,
            );
            return;
        }
        debug!(
            "Dumped {} degrade cache entries to {}",
            document.len(),
            path.display(),
        );
    }
}

/// Reads and decodes the dump file. Entries whose textual forms all
/// fail to decode are dropped entirely, so an empty answer set can
/// never enter the cache through the load path either.
fn read_dump(path: &Path) -> Option<HashMap<QueryKey, AnswerSet>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No degrade cache dump at {}: {}", path.display(), e);
            return None;
        }
    };
    let document: DumpDocument = match serde_json::from_slice(&content) {
        Ok(document) => document,
        Err(e) => {
            error!(
                "Ignoring malformed degrade cache dump {}: {}",
                path.display(),
                e,
            );
            return None;
        }
    };

    let mut fresh = HashMap::new();
    for entry in document {
        for (disk_key, texts) in entry {
            let key = match QueryKey::from_disk(&disk_key) {
                Some(key) => key,
                None => {
                    warn!("Skipping malformed degrade cache key {:?}", disk_key);
                    continue;
                }
            };
            let answers = AnswerSet::from_texts(texts);
            if !answers.is_empty() {
                fresh.insert(key, answers);
            }
        }
    }
    Some(fresh)
}

/// Writes the dump file. On Unix the file is created with mode
/// [`DUMP_FILE_MODE`] directly, so the cache is never readable by
/// other users, not even between creation and a later chmod.
#[cfg(unix)]
fn write_dump(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(DUMP_FILE_MODE)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_dump(path: &Path, content: &[u8]) -> io::Result<()> {
    fs::write(path, content)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
