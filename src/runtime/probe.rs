//! Backend health probes
//!
//! A [`ProbeSpec`] is the compiled declaration. Every backend gets its own
//! [`Probe`] built from a spec, with a private sliding window of outcomes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::backend::Backend;
use super::transport::BackendTransport;

/// Probe declaration as compiled from the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Declared name, or `<backend>.probe` for inline probes.
    pub name: String,
    /// Backend that declared this probe inline.
    pub owner: Option<String>,
    /// Path requested on the backend.
    pub url: String,
    /// Status code counted as healthy.
    pub expected_response: u16,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Number of outcomes remembered.
    pub window: u32,
    /// Healthy outcomes required within the window.
    pub threshold: u32,
    /// Healthy outcomes seeded at start; `threshold - 1` when unset.
    pub initial: Option<u32>,
}

impl ProbeSpec {
    /// Probe with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            url: "/".to_string(),
            expected_response: 200,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            window: 8,
            threshold: 3,
            initial: None,
        }
    }

    /// Seed count actually applied.
    pub fn effective_initial(&self) -> u32 {
        self.initial
            .unwrap_or_else(|| self.threshold.saturating_sub(1))
    }
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self::new("default")
    }
}

#[derive(Debug, Default)]
struct Window {
    history: VecDeque<bool>,
    last_probed: Option<DateTime<Utc>>,
}

/// Runtime probe state owned by exactly one backend.
#[derive(Debug)]
pub struct Probe {
    spec: ProbeSpec,
    backend: String,
    window: Mutex<Window>,
    healthy: AtomicBool,
}

impl Probe {
    /// Build the probe for `backend` and seed its history.
    pub fn new(spec: ProbeSpec, backend: impl Into<String>) -> Self {
        let probe = Self {
            spec,
            backend: backend.into(),
            window: Mutex::new(Window::default()),
            healthy: AtomicBool::new(false),
        };
        probe.initialise();
        probe
    }

    /// The declaration this probe was built from.
    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    /// Clear the history and seed it with the initial healthy outcomes.
    pub fn initialise(&self) {
        let mut window = self.window.lock();
        window.history.clear();
        let seed = self.spec.effective_initial().min(self.spec.window);
        window.history.extend(std::iter::repeat_n(true, seed as usize));
        window.last_probed = None;
        self.recompute(&window);
    }

    /// Current health verdict.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Copy of the outcome window, oldest first.
    pub fn history(&self) -> Vec<bool> {
        self.window.lock().history.iter().copied().collect()
    }

    /// Time of the last executed probe.
    pub fn last_probed(&self) -> Option<DateTime<Utc>> {
        self.window.lock().last_probed
    }

    /// When the next probe is due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let last = self.last_probed()?;
        let interval = chrono::Duration::from_std(self.spec.interval).ok()?;
        Some(last + interval)
    }

    /// Append one outcome, evict past the window and recompute health.
    pub fn record(&self, outcome: bool) -> bool {
        let mut window = self.window.lock();
        window.history.push_back(outcome);
        while window.history.len() > self.spec.window as usize {
            window.history.pop_front();
        }
        window.last_probed = Some(Utc::now());
        self.recompute(&window)
    }

    fn recompute(&self, window: &Window) -> bool {
        let good = window.history.iter().filter(|ok| **ok).count();
        let healthy = good >= self.spec.threshold as usize;
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            tracing::info!(
                backend = %self.backend,
                probe = %self.spec.name,
                healthy,
                good,
                window = window.history.len(),
                "backend health changed"
            );
        }
        healthy
    }

    /// Issue one probe request and record the outcome.
    ///
    /// Transport failures and timeouts count as unhealthy outcomes.
    pub async fn execute(&self, backend: &Backend, transport: &dyn BackendTransport) -> bool {
        let outcome = match transport
            .probe(backend, &self.spec.url, self.spec.timeout)
            .await
        {
            Ok(status) => status == self.spec.expected_response,
            Err(err) => {
                tracing::warn!(
                    backend = %self.backend,
                    url = %self.spec.url,
                    error = %err,
                    "probe failed"
                );
                false
            }
        };
        self.record(outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(window: u32, threshold: u32, initial: Option<u32>) -> ProbeSpec {
        ProbeSpec {
            window,
            threshold,
            initial,
            ..ProbeSpec::new("p")
        }
    }

    #[test]
    fn defaults_match_declaration_defaults() {
        let spec = ProbeSpec::default();
        assert_eq!(spec.url, "/");
        assert_eq!(spec.expected_response, 200);
        assert_eq!(spec.timeout, Duration::from_secs(2));
        assert_eq!(spec.interval, Duration::from_secs(5));
        assert_eq!(spec.window, 8);
        assert_eq!(spec.threshold, 3);
        assert_eq!(spec.effective_initial(), 2);
    }

    #[test]
    fn seeded_one_short_of_threshold() {
        let probe = Probe::new(spec(8, 3, None), "b1");
        assert_eq!(probe.history(), vec![true, true]);
        assert!(!probe.is_healthy());
        assert!(probe.record(true));
    }

    #[test]
    fn failures_push_health_below_threshold() {
        let probe = Probe::new(spec(4, 3, Some(4)), "b1");
        assert!(probe.is_healthy());
        assert!(probe.record(false));
        assert!(!probe.record(false));
        assert_eq!(probe.history(), vec![true, true, false, false]);
        let last = probe.last_probed().unwrap();
        assert_eq!(probe.next_due(), Some(last + chrono::Duration::seconds(5)));
    }

    #[test]
    fn unprobed_backend_has_no_due_time() {
        assert_eq!(Probe::new(spec(8, 3, None), "b1").next_due(), None);
    }

    proptest! {
        #[test]
        fn window_is_bounded_and_health_follows_threshold(
            window in 1u32..12,
            threshold in 0u32..12,
            outcomes in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let probe = Probe::new(spec(window, threshold, Some(0)), "b");
            let mut expected: VecDeque<bool> = VecDeque::new();
            for outcome in outcomes {
                let healthy = probe.record(outcome);
                expected.push_back(outcome);
                if expected.len() > window as usize {
                    expected.pop_front();
                }
                let good = expected.iter().filter(|ok| **ok).count();
                prop_assert!(probe.history().len() <= window as usize);
                prop_assert_eq!(healthy, good >= threshold as usize);
            }
        }
    }
}
