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

//! The background maintenance loops.
//!
//! Two loops run for the lifetime of the process, started by
//! [`Resolver::start`](crate::Resolver::start) and stopped only when
//! the owning [`ThreadGroup`] shuts down:
//!
//! * the zone refresh loop rebuilds the zone index wholesale from the
//!   store on each tick;
//! * the health probe pings the store on each tick and reopens the
//!   connection after a failed ping.
//!
//! Both loops retry on a short, fixed "fail" interval and otherwise
//! sleep for a longer "success" interval; neither ever gives up. They
//! communicate with query handling only through the atomically
//! published zone index, so a slow or failing tick never blocks a
//! query.

use std::sync::Arc;

use log::{debug, error};

use crate::resolver::Resolver;
use crate::store::Store;
use crate::thread::ThreadGroup;

/// The zone refresh loop. On each successful tick, a brand-new zone
/// map is built from the store's zone listing and published wholesale;
/// readers never observe a partial rebuild.
pub fn zone_refresh_loop<S: Store>(resolver: Arc<Resolver<S>>, group: Arc<ThreadGroup>) {
    loop {
        let interval = match resolver.store().zones() {
            Ok(zones) => {
                let map = zones.into_iter().map(|zone| (zone.name, zone.id)).collect();
                resolver.zones().replace(map);
                debug!("Refreshed the zone index: {} zones", resolver.zones().len());
                resolver.config().success_interval()
            }
            Err(e) => {
                error!("Failed to refresh the zone index: {}", e);
                resolver.config().fail_interval()
            }
        };
        if group.shutdown_wait(interval) {
            return;
        }
    }
}

/// The health probe loop. A failed ping triggers a reconnect attempt
/// before the next (short-interval) tick.
pub fn health_probe_loop<S: Store>(resolver: Arc<Resolver<S>>, group: Arc<ThreadGroup>) {
    loop {
        let interval = match resolver.store().ping() {
            Ok(()) => {
                debug!("Store ping succeeded");
                resolver.config().success_interval()
            }
            Err(e) => {
                error!("Failed to ping the store: {}", e);
                if let Err(e) = resolver.store().reconnect() {
                    error!("Failed to reconnect to the store: {}", e);
                }
                resolver.config().fail_interval()
            }
        };
        if group.shutdown_wait(interval) {
            return;
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::config::Config;
    use crate::store::{self, RecordRow, Zone};

    /// A store whose zone listing can be changed and made to fail, and
    /// which counts pings and reconnects.
    #[derive(Default)]
    struct ScriptedStore {
        zones: Mutex<Vec<Zone>>,
        failing: AtomicBool,
        pings: AtomicUsize,
        reconnects: AtomicUsize,
    }

    impl Store for ScriptedStore {
        fn zones(&self) -> Result<Vec<Zone>, store::Error> {
            if self.failing.load(Ordering::SeqCst) {
                Err(store::Error::Connection("scripted failure".to_owned()))
            } else {
                Ok(self.zones.lock().unwrap().clone())
            }
        }

        fn lookup(&self, _: i64, _: &str, _: &str) -> Result<Vec<RecordRow>, store::Error> {
            Ok(Vec::new())
        }

        fn ping(&self) -> Result<(), store::Error> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(store::Error::Connection("scripted failure".to_owned()))
            } else {
                Ok(())
            }
        }

        fn reconnect(&self) -> Result<(), store::Error> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::new("unused.db");
        config.fail_interval_secs = 0;
        config.success_interval_secs = 0;
        config
    }

    fn wait_until(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn the_zone_refresh_loop_publishes_new_snapshots() {
        let store = ScriptedStore::default();
        *store.zones.lock().unwrap() = vec![Zone {
            id: 1,
            name: "example.com.".to_owned(),
        }];
        let resolver = Arc::new(Resolver::new(store, fast_config()));
        let group = ThreadGroup::new();
        let (r, g) = (resolver.clone(), group.clone());
        group
            .start(Some("zone refresher".to_owned()), move || {
                zone_refresh_loop(r, g)
            })
            .unwrap();

        wait_until(|| resolver.zones().get("example.com.") == Some(1));

        *resolver.store().zones.lock().unwrap() = vec![Zone {
            id: 2,
            name: "example.org.".to_owned(),
        }];
        wait_until(|| resolver.zones().get("example.org.") == Some(2));
        assert_eq!(resolver.zones().get("example.com."), None);

        group.shut_down();
        group.await_shutdown();
    }

    #[test]
    fn the_zone_refresh_loop_keeps_the_old_snapshot_on_failure() {
        let store = ScriptedStore::default();
        *store.zones.lock().unwrap() = vec![Zone {
            id: 1,
            name: "example.com.".to_owned(),
        }];
        let resolver = Arc::new(Resolver::new(store, fast_config()));
        let group = ThreadGroup::new();
        let (r, g) = (resolver.clone(), group.clone());
        group
            .start(Some("zone refresher".to_owned()), move || {
                zone_refresh_loop(r, g)
            })
            .unwrap();
        wait_until(|| resolver.zones().get("example.com.") == Some(1));

        resolver.store().failing.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(resolver.zones().get("example.com."), Some(1));

        group.shut_down();
        group.await_shutdown();
    }

    #[test]
    fn the_health_probe_reconnects_after_a_failed_ping() {
        let store = ScriptedStore::default();
        store.failing.store(true, Ordering::SeqCst);
        let resolver = Arc::new(Resolver::new(store, fast_config()));
        let group = ThreadGroup::new();
        let (r, g) = (resolver.clone(), group.clone());
        group
            .start(Some("health probe".to_owned()), move || {
                health_probe_loop(r, g)
            })
            .unwrap();

        wait_until(|| resolver.store().reconnects.load(Ordering::SeqCst) >= 2);
        resolver.store().failing.store(false, Ordering::SeqCst);
        let reconnects = resolver.store().reconnects.load(Ordering::SeqCst);
        wait_until(|| resolver.store().pings.load(Ordering::SeqCst) >= reconnects + 2);

        group.shut_down();
        group.await_shutdown();
    }
}
