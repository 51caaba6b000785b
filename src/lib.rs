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

//! Quarry is a DNS resolver backend that answers queries from records
//! kept in a relational store.
//!
//! Quarry is not a complete DNS server. It is designed to slot into a
//! surrounding query-handling pipeline: the pipeline hands it a query
//! name and type, and Quarry either synthesizes an answer or abstains
//! so that the pipeline can try its next handler. Within that boundary
//! it implements:
//!
//! * a suffix-based zone matcher that finds the most specific
//!   registered zone for a query name (see [`zone`]);
//! * answer assembly with one level of CNAME chasing and a wildcard
//!   fallback (see [`resolver`]);
//! * a "degrade" cache that keeps serving the last known good answer
//!   for a query when the backing store is unreachable, and persists
//!   those answers across restarts (see [`degrade`]);
//! * two background maintenance loops that keep the resolver's view of
//!   the store current without blocking query handling (see
//!   [`maintenance`]).
//!
//! The backing store is accessed through the [`store::Store`] trait.
//! The provided implementation, [`store::SqliteStore`], executes
//! parameterized lookups against an SQLite database, but the resolver
//! itself works against any implementation of the seam.

pub mod config;
pub mod degrade;
pub mod maintenance;
pub mod resolver;
pub mod rr;
pub mod store;
pub mod thread;
pub mod zone;

pub use config::Config;
pub use resolver::{Outcome, Resolver};
