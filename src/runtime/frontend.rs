//! Frontend request state machine
//!
//! Every request starts in `Restart` and walks the legal-transition table
//! until `Done`. Hook results are mapped onto phases and validated against
//! the table before the machine moves; an illegal move aborts the request
//! with a 500. Evaluation failures inside a hook are not table moves: they
//! divert to the `Error` phase directly.

use tracing::{debug, error, warn};

use crate::interpreter::SystemHook;

use super::cache::ObjectCache;
use super::context::{InboundRequest, VclContext};
use super::error::{Result, RuntimeError, TransitionError};
use super::fetch::Fetcher;
use super::handler::VclHooks;
use super::state::{BackendState, FrontendState, VclAction};
use super::transport::InboundExchange;

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendOutcome {
    /// Phases visited, starting with `Restart` and ending with `Done`.
    pub trace: Vec<FrontendState>,
    /// Backend states visited across every fetch, in order.
    pub backend_trace: Vec<BackendState>,
}

/// How the machine reaches its next phase.
enum Step {
    /// A move checked against the transition table.
    Move(FrontendState),
    /// A failure diversion that bypasses the table.
    Divert(FrontendState),
}

/// Frontend machine bound to one policy, cache and fetcher.
pub struct Frontend<'a> {
    hooks: &'a dyn VclHooks,
    cache: &'a dyn ObjectCache,
    fetcher: &'a Fetcher<'a>,
    max_restarts: i64,
}

fn hook_for(state: FrontendState) -> Option<SystemHook> {
    match state {
        FrontendState::Receive => Some(SystemHook::Recv),
        FrontendState::Hash => Some(SystemHook::Hash),
        FrontendState::Hit => Some(SystemHook::Hit),
        FrontendState::Miss => Some(SystemHook::Miss),
        FrontendState::Pass | FrontendState::HitForPass => Some(SystemHook::Pass),
        FrontendState::Pipe => Some(SystemHook::Pipe),
        FrontendState::Purge => Some(SystemHook::Purge),
        FrontendState::Deliver => Some(SystemHook::Deliver),
        FrontendState::Synth => Some(SystemHook::Synth),
        FrontendState::Error => Some(SystemHook::Error),
        _ => None,
    }
}

/// Map a hook's action onto the next phase.
///
/// `deliver` from the response-producing phases means "write it out";
/// the `error` statement's `delivercontent` elsewhere goes through Synth
/// when the table allows it.
fn target(state: FrontendState, hook: SystemHook, action: VclAction) -> Result<Step> {
    use FrontendState::*;
    let responding = matches!(state, Deliver | Synth | Error);
    match action {
        VclAction::Deliver if responding => return Ok(Step::Move(DeliverContent)),
        VclAction::DeliverContent if !responding => {
            return Ok(if state.can_transition(Synth) {
                Step::Move(Synth)
            } else {
                Step::Divert(Error)
            });
        }
        _ => {}
    }
    FrontendState::from_action(action)
        .map(Step::Move)
        .ok_or_else(|| {
            TransitionError::UnmappedAction {
                hook: hook.name(),
                action: action.name(),
                side: "frontend",
            }
            .into()
        })
}

impl<'a> Frontend<'a> {
    /// Machine allowing `max_restarts` restarts per request.
    pub fn new(
        hooks: &'a dyn VclHooks,
        cache: &'a dyn ObjectCache,
        fetcher: &'a Fetcher<'a>,
        max_restarts: i64,
    ) -> Self {
        Self {
            hooks,
            cache,
            fetcher,
            max_restarts,
        }
    }

    /// Drive the request in `exchange` to completion.
    pub async fn process(
        &self,
        ctx: &mut VclContext,
        exchange: &mut dyn InboundExchange,
    ) -> Result<FrontendOutcome> {
        let inbound = exchange.request().clone();
        let mut state = FrontendState::Restart;
        let mut outcome = FrontendOutcome {
            trace: vec![state],
            backend_trace: Vec::new(),
        };
        let mut pass = false;

        while state != FrontendState::Done {
            let step = match self
                .step(state, ctx, &inbound, exchange, &mut pass, &mut outcome)
                .await
            {
                Ok(step) => step,
                Err(RuntimeError::Eval(err)) => {
                    warn!(state = ?state, error = %err, "hook evaluation failed");
                    ctx.synthesize(500, "Internal Server Error");
                    if state == FrontendState::Error {
                        Step::Divert(FrontendState::DeliverContent)
                    } else {
                        Step::Divert(FrontendState::Error)
                    }
                }
                Err(err) => return Err(self.abort(ctx, exchange, err).await),
            };

            let next = match step {
                Step::Divert(next) => next,
                Step::Move(next) => match state.transition(next) {
                    Ok(next) => next,
                    Err(err) => return Err(self.abort(ctx, exchange, err.into()).await),
                },
            };
            debug!(from = ?state, to = ?next, "frontend transition");
            outcome.trace.push(next);
            state = next;
        }

        Ok(outcome)
    }

    async fn abort(
        &self,
        ctx: &mut VclContext,
        exchange: &mut dyn InboundExchange,
        err: RuntimeError,
    ) -> RuntimeError {
        error!(xid = %ctx.req.xid, error = %err, "request aborted");
        ctx.synthesize(500, "Internal Server Error");
        if let Err(write) = exchange.respond(&ctx.resp).await {
            warn!(error = %write, "could not write abort response");
        }
        err
    }

    async fn step(
        &self,
        state: FrontendState,
        ctx: &mut VclContext,
        inbound: &InboundRequest,
        exchange: &mut dyn InboundExchange,
        pass: &mut bool,
        outcome: &mut FrontendOutcome,
    ) -> Result<Step> {
        let step = match state {
            FrontendState::Restart => {
                if ctx.req.restarts >= self.max_restarts {
                    warn!(restarts = ctx.req.restarts, "restart limit reached");
                    ctx.synthesize(500, "Too many restarts");
                    Step::Move(FrontendState::Synth)
                } else {
                    ctx.req.restarts += 1;
                    ctx.reset_from_inbound(inbound);
                    *pass = false;
                    Step::Move(FrontendState::Receive)
                }
            }
            FrontendState::Lookup => {
                if ctx.req.hash_always_miss {
                    Step::Move(FrontendState::Miss)
                } else {
                    match self.cache.get(&ctx.req.hash.digest()) {
                        Some(object) if object.uncacheable => {
                            Step::Move(FrontendState::HitForPass)
                        }
                        Some(object) => {
                            ctx.obj = Some(object);
                            Step::Move(FrontendState::Hit)
                        }
                        None => Step::Move(FrontendState::Miss),
                    }
                }
            }
            FrontendState::Busy => Step::Move(FrontendState::Lookup),
            FrontendState::Fetch => {
                let fetch = self.fetcher.run(ctx, *pass).await?;
                outcome.backend_trace.extend(fetch.trace);
                match fetch.state {
                    BackendState::Abandon => Step::Move(FrontendState::Restart),
                    _ => Step::Move(FrontendState::Deliver),
                }
            }
            FrontendState::DeliverContent => {
                exchange.respond(&ctx.resp).await?;
                Step::Move(FrontendState::Done)
            }
            FrontendState::Done => Step::Move(FrontendState::Done),
            _ => {
                match state {
                    FrontendState::Pass | FrontendState::HitForPass | FrontendState::Pipe => {
                        *pass = true
                    }
                    FrontendState::Purge => {
                        // Receive jumps straight here, so the key may not exist yet.
                        if ctx.req.hash.parts() == 0 {
                            self.hooks.dispatch(SystemHook::Hash, ctx)?;
                        }
                        let removed = self.cache.remove(&ctx.req.hash.digest());
                        debug!(removed, "purge");
                    }
                    FrontendState::Deliver => {
                        if let Some(object) = ctx.obj.clone() {
                            ctx.response_from_object(&object);
                        }
                    }
                    _ => {}
                }
                let Some(hook) = hook_for(state) else {
                    return Ok(Step::Move(FrontendState::Done));
                };
                let action = self.hooks.dispatch(hook, ctx)?;
                target(state, hook, action)?
            }
        };
        Ok(step)
    }
}
