//! Request-processing runtime and public API
//!
//! [`Runtime`] ties a compiled policy to an object cache, a backend
//! transport and the health monitor, and drives each inbound request
//! through the frontend and backend state machines.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub mod acl;
pub mod backend;
pub mod cache;
pub mod context;
pub mod error;
pub mod fetch;
pub mod frontend;
pub mod handler;
pub mod headers;
pub mod probe;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod transport;

use crate::interpreter::{CompileOptions, CompiledProgram, Compiler, SystemHook};

use backend::Backend;
use cache::{MemoryObjectCache, ObjectCache};
use context::{InboundRequest, Response, VclContext};
use fetch::Fetcher;
use frontend::{Frontend, FrontendOutcome};
use handler::{CompiledHandler, VclHooks};
use scheduler::{HealthMonitor, Housekeeping};
use state::VclAction;
use transport::{BackendTransport, BufferedExchange, HttpTransport, InboundExchange};

pub use error::{Result, RuntimeError};

/// Configuration for the request runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Restarts allowed before a forced synthetic 500
    pub max_frontend_retries: u32,

    /// Backend fetch attempts before the fetch is abandoned
    pub max_backend_retries: u32,

    /// Object lifetime when the response carries no caching headers
    pub default_ttl_secs: i64,

    /// Value of `server.identity`
    pub server_identity: String,

    /// Value of `server.hostname`
    pub hostname: String,

    /// Whether [`Runtime::start`] spawns probe loops
    pub health_checks: bool,

    /// Entry bound for the in-memory object cache
    pub cache_max_entries: usize,

    /// Period of the expired-object sweep in milliseconds; 0 disables it
    pub cache_sweep_ms: u64,

    /// Period of the ACL host refresh in milliseconds; 0 disables it
    pub dns_refresh_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_frontend_retries: 5,
            max_backend_retries: 3,
            default_ttl_secs: 120,
            server_identity: "vclcore".to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            health_checks: true,
            cache_max_entries: cache::DEFAULT_MAX_ENTRIES,
            cache_sweep_ms: 60_000,
            dns_refresh_ms: 300_000,
        }
    }
}

impl RuntimeConfig {
    /// Default object lifetime.
    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.default_ttl_secs).unwrap_or_else(chrono::Duration::zero)
    }

    fn period(millis: u64) -> Option<Duration> {
        (millis > 0).then(|| Duration::from_millis(millis))
    }
}

/// The request runtime
///
/// Owns the compiled policy and its collaborators. Requests are processed
/// concurrently through `&self`; only starting and stopping background
/// tasks needs exclusive access.
pub struct Runtime {
    config: RuntimeConfig,
    program: Arc<CompiledProgram>,
    hooks: Arc<dyn VclHooks>,
    cache: Arc<dyn ObjectCache>,
    transport: Arc<dyn BackendTransport>,
    health: Option<HealthMonitor>,
    housekeeping: Housekeeping,
}

impl Runtime {
    /// Create a runtime for `program` and run its `vcl_init`.
    pub fn new(
        config: RuntimeConfig,
        program: Arc<CompiledProgram>,
        cache: Arc<dyn ObjectCache>,
        transport: Arc<dyn BackendTransport>,
    ) -> Result<Self> {
        let hooks: Arc<dyn VclHooks> = Arc::new(CompiledHandler::new(program.clone()));
        let runtime = Self {
            config,
            program,
            hooks,
            cache,
            transport,
            health: None,
            housekeeping: Housekeeping::new(),
        };
        runtime.lifecycle(SystemHook::Init)?;
        info!(
            backends = runtime.program.backends.len(),
            units = ?runtime.program.units,
            "runtime initialised"
        );
        Ok(runtime)
    }

    /// Compile `source` and build a runtime with an in-memory cache and
    /// the HTTP transport.
    pub fn from_source(config: RuntimeConfig, name: &str, source: &str) -> Result<Self> {
        let program = Compiler::new(CompileOptions::default()).compile(name, source)?;
        let cache = MemoryObjectCache::new().with_max_entries(config.cache_max_entries);
        Self::new(
            config,
            Arc::new(program),
            Arc::new(cache),
            Arc::new(HttpTransport::new()),
        )
    }

    /// Load a JSON configuration file.
    pub fn load_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
        storage::load_config(path)
    }

    /// Write `config` as JSON, replacing the file atomically.
    pub fn save_config(path: &Path, config: &RuntimeConfig) -> anyhow::Result<()> {
        storage::write_config(path, config)
    }

    /// Replace the hook implementation.
    pub fn with_hooks(mut self, hooks: Arc<dyn VclHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The compiled policy.
    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    /// The shared object cache.
    pub fn cache(&self) -> &Arc<dyn ObjectCache> {
        &self.cache
    }

    /// Declared backends in declaration order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.program
            .backends
            .iter()
            .map(|(_, backend)| backend.clone())
            .collect()
    }

    /// Spawn background tasks: probe loops when health checks are enabled,
    /// the cache sweep and the ACL host refresh. Must be called inside a
    /// tokio runtime. Calling it again does nothing.
    pub fn start(&mut self) {
        if self.config.health_checks && self.health.is_none() {
            let monitor = HealthMonitor::start(&self.backends(), self.transport.clone());
            info!(probes = monitor.len(), "health monitor started");
            self.health = Some(monitor);
        }
        if !self.housekeeping.is_empty() {
            return;
        }
        if let Some(period) = RuntimeConfig::period(self.config.cache_sweep_ms) {
            self.housekeeping.sweep_cache(self.cache.clone(), period);
        }
        let hosts = self.program.acl_hosts();
        if let (Some(dns), Some(period), false) = (
            &self.program.dns,
            RuntimeConfig::period(self.config.dns_refresh_ms),
            hosts.is_empty(),
        ) {
            self.housekeeping.refresh_dns(dns.clone(), hosts, period);
        }
        info!(tasks = ?self.housekeeping.tasks().collect::<Vec<_>>(), "housekeeping started");
    }

    /// Resolve every ACL host name once, returning how many resolved.
    pub async fn refresh_dns(&self) -> usize {
        match &self.program.dns {
            Some(dns) => {
                let hosts = self.program.acl_hosts();
                dns.refresh(hosts.iter().map(String::as_str)).await
            }
            None => 0,
        }
    }

    /// Stop background tasks and run `vcl_term`.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut monitor) = self.health.take() {
            monitor.shutdown();
        }
        self.housekeeping.shutdown();
        self.lifecycle(SystemHook::Term)
    }

    /// Process one request, writing its response to `exchange`.
    pub async fn handle(&self, exchange: &mut dyn InboundExchange) -> Result<FrontendOutcome> {
        let xid = Uuid::new_v4().simple().to_string();
        let span = info_span!(
            "request",
            xid = %xid,
            method = %exchange.request().method,
            url = %exchange.request().url,
        );
        let mut ctx = VclContext::new(xid, &self.config.hostname, &self.config.server_identity);
        self.process(&mut ctx, exchange).instrument(span).await
    }

    /// Process one request with a caller-supplied context.
    pub async fn process(
        &self,
        ctx: &mut VclContext,
        exchange: &mut dyn InboundExchange,
    ) -> Result<FrontendOutcome> {
        let fetcher = Fetcher::new(
            self.hooks.as_ref(),
            &self.program,
            self.cache.as_ref(),
            self.transport.as_ref(),
            i64::from(self.config.max_backend_retries),
            self.config.default_ttl(),
        );
        let frontend = Frontend::new(
            self.hooks.as_ref(),
            self.cache.as_ref(),
            &fetcher,
            i64::from(self.config.max_frontend_retries),
        );
        frontend.process(ctx, exchange).await
    }

    /// Run `request` through a buffered exchange and return what was written.
    pub async fn simulate(&self, request: InboundRequest) -> Result<(Response, FrontendOutcome)> {
        let mut exchange = BufferedExchange::new(request);
        let outcome = self.handle(&mut exchange).await?;
        let response = exchange.into_response().unwrap_or_default();
        Ok((response, outcome))
    }

    fn lifecycle(&self, hook: SystemHook) -> Result<()> {
        let mut ctx = VclContext::new(
            Uuid::new_v4().simple().to_string(),
            &self.config.hostname,
            &self.config.server_identity,
        );
        match self.hooks.dispatch(hook, &mut ctx)? {
            VclAction::Ok | VclAction::NoOp => Ok(()),
            other => Err(RuntimeError::Config(format!(
                "{} returned {other}",
                hook.name()
            ))),
        }
    }
}
