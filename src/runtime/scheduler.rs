//! Health probe scheduling and periodic housekeeping
//!
//! One tokio task per backend fires that backend's probe on its configured
//! interval. [`Housekeeping`] runs the cache sweep and the ACL host refresh.
//! Tasks are aborted on shutdown or when their owner is dropped.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::acl::DnsCache;
use super::backend::Backend;
use super::cache::ObjectCache;
use super::transport::BackendTransport;

/// Probe intervals are clamped to at least this.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Running probe tasks.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl HealthMonitor {
    /// Spawn one probe loop per backend. Must be called inside a tokio runtime.
    pub fn start(backends: &[Arc<Backend>], transport: Arc<dyn BackendTransport>) -> Self {
        let tasks = backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let transport = transport.clone();
                let name = backend.name().to_string();
                let period = backend.probe().spec().interval.max(MIN_PROBE_INTERVAL);
                let handle = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        let healthy = backend.probe().execute(&backend, transport.as_ref()).await;
                        debug!(
                            backend = %backend.name(),
                            healthy,
                            next_due = ?backend.probe().next_due(),
                            "probe executed"
                        );
                    }
                });
                (name, handle)
            })
            .collect();
        Self { tasks }
    }

    /// Number of probe loops.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no loops are running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Backends being probed.
    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(name, _)| name.as_str())
    }

    /// Abort every probe loop.
    pub fn shutdown(&mut self) {
        for (name, task) in self.tasks.drain(..) {
            task.abort();
            debug!(backend = %name, "probe loop stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background maintenance tasks owned by the runtime.
#[derive(Debug, Default)]
pub struct Housekeeping {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Housekeeping {
    /// No tasks yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge expired cache entries every `period`.
    pub fn sweep_cache(&mut self, cache: Arc<dyn ObjectCache>, period: Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "expired objects swept");
                }
            }
        });
        self.tasks.push(("cache-sweep", handle));
    }

    /// Re-resolve `hosts` into `dns` every `period`, starting immediately.
    pub fn refresh_dns(&mut self, dns: Arc<DnsCache>, hosts: Vec<String>, period: Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let resolved = dns.refresh(hosts.iter().map(String::as_str)).await;
                debug!(resolved, hosts = hosts.len(), "acl hosts refreshed");
            }
        });
        self.tasks.push(("dns-refresh", handle));
    }

    /// Names of the running tasks.
    pub fn tasks(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.iter().map(|(name, _)| *name)
    }

    /// Whether nothing is running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every task.
    pub fn shutdown(&mut self) {
        for (name, task) in self.tasks.drain(..) {
            task.abort();
            debug!(task = name, "housekeeping stopped");
        }
    }
}

impl Drop for Housekeeping {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Probe every backend once, concurrently, returning the outcomes in order.
pub async fn probe_all(backends: &[Arc<Backend>], transport: &dyn BackendTransport) -> Vec<bool> {
    join_all(
        backends
            .iter()
            .map(|backend| backend.probe().execute(backend, transport)),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cache::{ManualClock, MemoryObjectCache};
    use crate::runtime::context::{BackendResponse, CacheObject};
    use chrono::Utc;

    #[tokio::test]
    async fn cache_sweep_runs_until_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(MemoryObjectCache::with_clock(clock.clone()));
        let object = CacheObject::from_backend(&BackendResponse::default(), Utc::now());
        cache.set("old", object.clone(), chrono::Duration::seconds(1));
        clock.advance(chrono::Duration::seconds(2));

        let mut housekeeping = Housekeeping::new();
        housekeeping.sweep_cache(cache.clone(), Duration::from_millis(20));
        assert_eq!(housekeeping.tasks().collect::<Vec<_>>(), ["cache-sweep"]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired, 1);

        housekeeping.shutdown();
        assert!(housekeeping.is_empty());
        cache.set("later", object, chrono::Duration::seconds(1));
        clock.advance(chrono::Duration::seconds(2));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn dns_refresh_fills_the_snapshot() {
        let dns = Arc::new(DnsCache::default());
        let mut housekeeping = Housekeeping::new();
        housekeeping.refresh_dns(dns.clone(), vec!["127.0.0.1".to_string()], Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dns.len(), 1);
    }
}
