//! Backend fetch state machine
//!
//! Drives one origin fetch through Retry → Fetch → Response and on to
//! Deliver, looping back through Error and Retry on failures until the
//! attempt budget runs out and the machine abandons. Only 2xx origin
//! answers reach Response; other statuses and transport failures go to
//! Error. A hook that ends in `error` or `synth` delivers its synthetic
//! response straight away, uncached.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::interpreter::{CompiledProgram, SystemHook};

use super::backend::Backend;
use super::cache::ObjectCache;
use super::context::{BackendRequest, BackendResponse, CacheObject, VclContext};
use super::error::{Result, TransitionError};
use super::handler::{VclHooks, builtin};
use super::headers::Headers;
use super::state::{BackendState, VclAction};
use super::transport::BackendTransport;

/// Result of one run of the fetch machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Terminal state: `Deliver` or `Abandon`.
    pub state: BackendState,
    /// Every state visited, starting with `Retry`.
    pub trace: Vec<BackendState>,
    /// Outbound requests issued.
    pub attempts: i64,
}

/// Fetch machine bound to one policy and transport.
pub struct Fetcher<'a> {
    hooks: &'a dyn VclHooks,
    program: &'a CompiledProgram,
    cache: &'a dyn ObjectCache,
    transport: &'a dyn BackendTransport,
    max_retries: i64,
    default_ttl: Duration,
}

impl<'a> Fetcher<'a> {
    /// Machine allowing `max_retries` attempts per run.
    pub fn new(
        hooks: &'a dyn VclHooks,
        program: &'a CompiledProgram,
        cache: &'a dyn ObjectCache,
        transport: &'a dyn BackendTransport,
        max_retries: i64,
        default_ttl: Duration,
    ) -> Self {
        Self {
            hooks,
            program,
            cache,
            transport,
            max_retries,
            default_ttl,
        }
    }

    /// Run a fetch for the request in `ctx`. `pass` marks the backend
    /// request uncacheable.
    pub async fn run(&self, ctx: &mut VclContext, pass: bool) -> Result<FetchOutcome> {
        let mut state = BackendState::Retry;
        let mut trace = vec![state];
        let mut visits = 0;
        let mut sent = 0;

        while !state.is_terminal() {
            let next = match state {
                BackendState::Retry => {
                    visits += 1;
                    if visits > self.max_retries {
                        BackendState::Abandon
                    } else {
                        ctx.bereq = Some(backend_request(ctx, visits - 1, pass));
                        ctx.beresp = None;
                        BackendState::Fetch
                    }
                }
                BackendState::Fetch => {
                    let action = self.hooks.dispatch(SystemHook::BackendFetch, ctx)?;
                    if action == VclAction::Fetch {
                        sent += 1;
                        self.send(ctx).await
                    } else {
                        target(SystemHook::BackendFetch, action, ctx)?
                    }
                }
                BackendState::Response => {
                    let action = self.hooks.dispatch(SystemHook::BackendResponse, ctx)?;
                    target(SystemHook::BackendResponse, action, ctx)?
                }
                BackendState::Error => {
                    let action = self.hooks.dispatch(SystemHook::BackendError, ctx)?;
                    target(SystemHook::BackendError, action, ctx)?
                }
                BackendState::Deliver | BackendState::Abandon => break,
            };

            let next = state.transition(next)?;
            debug!(from = ?state, to = ?next, "backend transition");
            if next == BackendState::Deliver {
                self.deliver(ctx, state == BackendState::Error);
            }
            trace.push(next);
            state = next;
        }

        Ok(FetchOutcome {
            state,
            trace,
            attempts: sent,
        })
    }

    /// Backend for the next request: the hint when healthy, else the first
    /// healthy backend, else the hint or first backend regardless of health.
    pub fn select_backend(&self, hint: Option<&str>) -> Option<Arc<Backend>> {
        let backends = &self.program.backends;
        let hinted = hint.and_then(|name| backends.get(name));
        if let Some(backend) = hinted.filter(|backend| backend.is_healthy()) {
            return Some(backend.clone());
        }
        if let Some((_, backend)) = backends.iter().find(|(_, backend)| backend.is_healthy()) {
            return Some(backend.clone());
        }
        hinted
            .or_else(|| backends.iter().next().map(|(_, backend)| backend))
            .cloned()
    }

    async fn send(&self, ctx: &mut VclContext) -> BackendState {
        let Some(bereq) = ctx.bereq.as_mut() else {
            return BackendState::Error;
        };
        let Some(backend) = self.select_backend(bereq.backend.as_deref()) else {
            warn!(url = %bereq.url, "no backend declared");
            ctx.beresp = None;
            return BackendState::Error;
        };
        bereq.backend = Some(backend.name().to_string());

        match self.transport.fetch(&backend, bereq).await {
            Ok(mut beresp) => {
                beresp.backend = Some(backend.name().to_string());
                beresp.ttl = ttl_from_headers(&beresp.headers, Utc::now(), self.default_ttl);
                let status = beresp.status;
                ctx.beresp = Some(beresp);
                if is_success(status) {
                    BackendState::Response
                } else {
                    warn!(backend = %backend.name(), status, "backend returned a non-success status");
                    BackendState::Error
                }
            }
            Err(err) => {
                warn!(backend = %backend.name(), error = %err, "backend fetch failed");
                ctx.beresp = None;
                BackendState::Error
            }
        }
    }

    /// Build the object for a delivered fetch and store it when allowed.
    /// Responses delivered out of Error are never stored.
    fn deliver(&self, ctx: &mut VclContext, failed: bool) {
        let beresp = ctx.beresp.get_or_insert_with(|| BackendResponse {
            status: 503,
            reason: "Backend fetch failed".to_string(),
            uncacheable: true,
            ..BackendResponse::default()
        });
        let object = CacheObject::from_backend(beresp, Utc::now());
        let uncacheable = failed
            || object.uncacheable
            || ctx.bereq.as_ref().is_some_and(|bereq| bereq.uncacheable);
        if !uncacheable && object.ttl > Duration::zero() {
            let key = ctx.req.hash.digest();
            debug!(key = %key, ttl = object.ttl.num_seconds(), "storing object");
            self.cache.set(&key, object.clone(), object.ttl);
        }
        ctx.obj = Some(object);
    }
}

/// Whether an origin status counts as a usable response.
pub fn is_success(status: i64) -> bool {
    (200..300).contains(&status)
}

/// Map a backend hook's action onto the next state. `error` and `synth`
/// replace the backend response with the synthetic one and deliver it.
fn target(hook: SystemHook, action: VclAction, ctx: &mut VclContext) -> Result<BackendState> {
    if matches!(action, VclAction::DeliverContent | VclAction::Synth) {
        debug!(hook = hook.name(), status = ctx.resp.status, "synthetic backend response");
        synthetic_beresp(ctx);
        return Ok(BackendState::Deliver);
    }
    BackendState::from_action(action).ok_or_else(|| {
        TransitionError::UnmappedAction {
            hook: hook.name(),
            action: action.name(),
            side: "backend",
        }
        .into()
    })
}

fn synthetic_beresp(ctx: &mut VclContext) {
    builtin::synth(ctx);
    let backend = ctx.beresp.as_ref().and_then(|beresp| beresp.backend.clone());
    ctx.beresp = Some(BackendResponse {
        status: ctx.resp.status,
        reason: ctx.resp.reason.clone(),
        proto: ctx.resp.proto.clone(),
        headers: ctx.resp.headers.clone(),
        body: ctx.resp.body.clone(),
        uncacheable: true,
        backend,
        ..BackendResponse::default()
    });
}

fn backend_request(ctx: &VclContext, retries: i64, pass: bool) -> BackendRequest {
    BackendRequest {
        method: ctx.req.method.clone(),
        url: ctx.req.url.clone(),
        proto: ctx.req.proto.clone(),
        headers: ctx.req.headers.clone(),
        body: ctx.req.body.clone(),
        retries,
        backend: ctx.req.backend_hint.clone(),
        uncacheable: pass,
    }
}

fn directive_seconds(headers: &Headers, directive: &str) -> Option<i64> {
    headers
        .get_all("Cache-Control")
        .flat_map(|value| value.split(','))
        .filter_map(|part| part.trim().split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(directive))
        .and_then(|(_, value)| value.trim().trim_matches('"').parse().ok())
}

/// Object lifetime from response headers: `s-maxage`, then `max-age`,
/// then `Expires` relative to `now`, then `default`.
pub fn ttl_from_headers(headers: &Headers, now: DateTime<Utc>, default: Duration) -> Duration {
    if let Some(seconds) = directive_seconds(headers, "s-maxage") {
        return Duration::try_seconds(seconds).unwrap_or(default);
    }
    if let Some(seconds) = directive_seconds(headers, "max-age") {
        return Duration::try_seconds(seconds).unwrap_or(default);
    }
    if let Some(expires) = headers
        .get("Expires")
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
    {
        return (expires.with_timezone(&Utc) - now).max(Duration::zero());
    }
    default
}
