#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use vclcore::interpreter::compile_source;
use vclcore::runtime::backend::Backend;
use vclcore::runtime::cache::ObjectCache;
use vclcore::runtime::context::{BackendRequest, BackendResponse};
use vclcore::runtime::error::{TransportError, TransportResult};
use vclcore::runtime::headers::Headers;
use vclcore::runtime::transport::BackendTransport;
use vclcore::runtime::{Runtime, RuntimeConfig};

/// Canned origin: every fetch gets the same response, probes get a status
/// per backend name.
#[derive(Default)]
pub struct MockTransport {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub fail: bool,
    pub probe_status: HashMap<String, u16>,
    pub fetches: Mutex<Vec<(String, BackendRequest)>>,
    pub probes: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn responding(status: u16) -> Self {
        Self {
            status,
            body: format!("status {status}"),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn unreachable() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn probe_status(mut self, backend: &str, status: u16) -> Self {
        self.probe_status.insert(backend.to_string(), status);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn fetched_backends(&self) -> Vec<String> {
        self.fetches
            .lock()
            .iter()
            .map(|(backend, _)| backend.clone())
            .collect()
    }
}

#[async_trait]
impl BackendTransport for MockTransport {
    async fn fetch(
        &self,
        backend: &Backend,
        request: &BackendRequest,
    ) -> TransportResult<BackendResponse> {
        self.fetches
            .lock()
            .push((backend.name().to_string(), request.clone()));
        if self.fail {
            return Err(TransportError::Connect {
                backend: backend.name().to_string(),
                detail: "connection refused".to_string(),
            });
        }
        let headers: Headers = self.headers.iter().cloned().collect();
        Ok(BackendResponse {
            status: i64::from(self.status),
            reason: "Mock".to_string(),
            headers,
            body: self.body.clone().into(),
            ..BackendResponse::default()
        })
    }

    async fn probe(&self, backend: &Backend, _path: &str, _limit: Duration) -> TransportResult<u16> {
        self.probes.lock().push(backend.name().to_string());
        match self.probe_status.get(backend.name()) {
            Some(status) => Ok(*status),
            None => Err(TransportError::Timeout {
                phase: "probe",
                millis: 0,
            }),
        }
    }
}

pub fn config(max_frontend_retries: u32, max_backend_retries: u32) -> RuntimeConfig {
    RuntimeConfig {
        max_frontend_retries,
        max_backend_retries,
        health_checks: false,
        hostname: "test-node".to_string(),
        ..RuntimeConfig::default()
    }
}

pub fn runtime(
    source: &str,
    config: RuntimeConfig,
    cache: Arc<dyn ObjectCache>,
    transport: Arc<MockTransport>,
) -> Runtime {
    let program = compile_source("test.vcl", source).unwrap();
    Runtime::new(config, Arc::new(program), cache, transport).unwrap()
}
