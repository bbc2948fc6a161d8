//! Origin server descriptors

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{TransportError, TransportResult};
use super::probe::{Probe, ProbeSpec};

/// Backend declaration as compiled from the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Declared name.
    pub name: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Value sent as `Host` instead of the client's.
    pub host_header: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed until the response head arrives.
    pub first_byte_timeout: Duration,
    /// Time allowed between body chunks.
    pub between_bytes_timeout: Duration,
    /// Idle connections kept per host.
    pub max_connections: Option<u32>,
}

impl BackendSpec {
    /// Backend with default timeouts.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: String::new(),
            port: 80,
            host_header: None,
            connect_timeout: Duration::from_millis(3500),
            first_byte_timeout: Duration::from_secs(60),
            between_bytes_timeout: Duration::from_secs(60),
            max_connections: None,
        }
    }
}

/// Live backend: declaration, its own probe and a lazily built client.
#[derive(Debug)]
pub struct Backend {
    spec: BackendSpec,
    probe: Probe,
    client: OnceCell<reqwest::Client>,
}

impl Backend {
    /// Instantiate a backend; the probe gets a fresh, private history.
    pub fn new(spec: BackendSpec, probe: ProbeSpec) -> Self {
        let probe = Probe::new(probe, spec.name.clone());
        Self {
            spec,
            probe,
            client: OnceCell::new(),
        }
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Compiled declaration.
    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    /// Health probe bound to this backend.
    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    /// Snapshot of the probe verdict.
    pub fn is_healthy(&self) -> bool {
        self.probe.is_healthy()
    }

    /// `http://host:port` with IPv6 hosts bracketed.
    pub fn base_url(&self) -> String {
        let host = &self.spec.host;
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}", host, self.spec.port)
        } else {
            format!("http://{}:{}", host, self.spec.port)
        }
    }

    /// Absolute URL for a request path.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    /// HTTP client bound to this backend, built on first use.
    pub fn client(&self) -> TransportResult<&reqwest::Client> {
        self.client.get_or_try_init(|| {
            let mut builder = reqwest::Client::builder()
                .connect_timeout(self.spec.connect_timeout)
                .redirect(reqwest::redirect::Policy::none());
            if let Some(max) = self.spec.max_connections {
                builder = builder.pool_max_idle_per_host(max as usize);
            }
            builder.build().map_err(|err| TransportError::Connect {
                backend: self.spec.name.clone(),
                detail: err.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_backend_owns_its_probe_history() {
        let template = ProbeSpec::new("shared");
        let mut spec = BackendSpec::new("a");
        spec.host = "127.0.0.1".into();
        let a = Backend::new(spec.clone(), template.clone());
        spec.name = "b".into();
        let b = Backend::new(spec, template);

        a.probe().record(false);
        assert_eq!(a.probe().history().len(), 3);
        assert_eq!(b.probe().history().len(), 2);
    }

    #[test]
    fn urls_bracket_ipv6_hosts() {
        let mut spec = BackendSpec::new("v6");
        spec.host = "::1".into();
        spec.port = 8080;
        let backend = Backend::new(spec, ProbeSpec::default());
        assert_eq!(backend.url_for("/health"), "http://[::1]:8080/health");
        assert_eq!(backend.url_for("x"), "http://[::1]:8080/x");
    }
}
