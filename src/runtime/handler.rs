//! Hook dispatch
//!
//! [`VclHooks`] has one method per system hook. Every method defaults to
//! the built-in behaviour in [`builtin`]; [`CompiledHandler`] overrides
//! them with the policy's compiled bodies and falls back to the built-in
//! when a body is missing or falls through.

use std::sync::Arc;

use crate::interpreter::{CompiledProgram, Executor, SystemHook};

use super::context::VclContext;
use super::error::EvalResult;
use super::state::VclAction;

/// Built-in hook behaviour.
pub mod builtin {
    use super::*;

    /// Dispatch to the built-in for `hook`.
    pub fn run(hook: SystemHook, ctx: &mut VclContext) -> VclAction {
        match hook {
            SystemHook::Init | SystemHook::Term => VclAction::Ok,
            SystemHook::Recv => recv(ctx),
            SystemHook::Hash => hash(ctx),
            SystemHook::Hit => VclAction::Deliver,
            SystemHook::Miss | SystemHook::Pass | SystemHook::Pipe => VclAction::Fetch,
            SystemHook::Purge => purge(ctx),
            SystemHook::Deliver | SystemHook::Error => VclAction::Deliver,
            SystemHook::Synth => synth(ctx),
            SystemHook::BackendFetch => VclAction::Fetch,
            SystemHook::BackendResponse => backend_response(ctx),
            SystemHook::BackendError => VclAction::Retry,
        }
    }

    /// Pass anything that is not a plain GET/HEAD or that carries
    /// credentials; hash the rest.
    pub fn recv(ctx: &mut VclContext) -> VclAction {
        let method = ctx.req.method.as_str();
        if !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("HEAD") {
            return VclAction::Pass;
        }
        if ctx.req.headers.contains("Authorization") || ctx.req.headers.contains("Cookie") {
            return VclAction::Pass;
        }
        VclAction::Hash
    }

    /// Key on URL plus host (or server address when there is no Host).
    pub fn hash(ctx: &mut VclContext) -> VclAction {
        ctx.req.hash.add(ctx.req.url.as_bytes());
        match ctx.req.headers.get("Host") {
            Some(host) => ctx.req.hash.add(host.as_bytes()),
            None => {
                let server = ctx.server.ip.map(|ip| ip.to_string()).unwrap_or_default();
                ctx.req.hash.add(server.as_bytes());
            }
        }
        VclAction::Lookup
    }

    /// Acknowledge the purge with a synthetic 200.
    pub fn purge(ctx: &mut VclContext) -> VclAction {
        ctx.synthesize(200, "Purged");
        VclAction::Synth
    }

    /// Fill an empty synthetic response with a small HTML page.
    pub fn synth(ctx: &mut VclContext) -> VclAction {
        if ctx.resp.body.is_empty() {
            let page = format!(
                "<!DOCTYPE html>\n<html>\n  <head>\n    <title>{status} {reason}</title>\n  </head>\n  <body>\n    <h1>Error {status} {reason}</h1>\n    <p>XID: {xid}</p>\n  </body>\n</html>\n",
                status = ctx.resp.status,
                reason = ctx.resp.reason,
                xid = ctx.req.xid,
            );
            ctx.resp.headers.set("Content-Type", "text/html; charset=utf-8");
            ctx.resp.body = page.into();
        }
        VclAction::Deliver
    }

    /// Refuse to cache responses that are private, expired or set cookies.
    pub fn backend_response(ctx: &mut VclContext) -> VclAction {
        if let Some(beresp) = ctx.beresp.as_mut() {
            let private = beresp
                .headers
                .get_all("Cache-Control")
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .any(|directive| {
                    ["no-store", "no-cache", "private"]
                        .iter()
                        .any(|flag| directive.eq_ignore_ascii_case(flag))
                });
            if beresp.ttl <= chrono::Duration::zero()
                || beresp.headers.contains("Set-Cookie")
                || private
            {
                beresp.uncacheable = true;
            }
        }
        VclAction::Deliver
    }
}

/// Overridable hook table.
pub trait VclHooks: Send + Sync {
    /// `vcl_init`
    fn vcl_init(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Init, ctx))
    }

    /// `vcl_recv`
    fn vcl_recv(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::recv(ctx))
    }

    /// `vcl_hash`
    fn vcl_hash(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::hash(ctx))
    }

    /// `vcl_pipe`
    fn vcl_pipe(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Pipe, ctx))
    }

    /// `vcl_pass`
    fn vcl_pass(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Pass, ctx))
    }

    /// `vcl_hit`
    fn vcl_hit(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Hit, ctx))
    }

    /// `vcl_miss`
    fn vcl_miss(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Miss, ctx))
    }

    /// `vcl_deliver`
    fn vcl_deliver(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Deliver, ctx))
    }

    /// `vcl_purge`
    fn vcl_purge(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::purge(ctx))
    }

    /// `vcl_synth`
    fn vcl_synth(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::synth(ctx))
    }

    /// `vcl_error`
    fn vcl_error(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Error, ctx))
    }

    /// `vcl_backend_fetch`
    fn vcl_backend_fetch(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::BackendFetch, ctx))
    }

    /// `vcl_backend_response`
    fn vcl_backend_response(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::backend_response(ctx))
    }

    /// `vcl_backend_error`
    fn vcl_backend_error(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::BackendError, ctx))
    }

    /// `vcl_term`
    fn vcl_term(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        Ok(builtin::run(SystemHook::Term, ctx))
    }

    /// Invoke the method for `hook`.
    fn dispatch(&self, hook: SystemHook, ctx: &mut VclContext) -> EvalResult<VclAction> {
        match hook {
            SystemHook::Init => self.vcl_init(ctx),
            SystemHook::Recv => self.vcl_recv(ctx),
            SystemHook::Hash => self.vcl_hash(ctx),
            SystemHook::Pipe => self.vcl_pipe(ctx),
            SystemHook::Pass => self.vcl_pass(ctx),
            SystemHook::Hit => self.vcl_hit(ctx),
            SystemHook::Miss => self.vcl_miss(ctx),
            SystemHook::Deliver => self.vcl_deliver(ctx),
            SystemHook::Purge => self.vcl_purge(ctx),
            SystemHook::Synth => self.vcl_synth(ctx),
            SystemHook::Error => self.vcl_error(ctx),
            SystemHook::BackendFetch => self.vcl_backend_fetch(ctx),
            SystemHook::BackendResponse => self.vcl_backend_response(ctx),
            SystemHook::BackendError => self.vcl_backend_error(ctx),
            SystemHook::Term => self.vcl_term(ctx),
        }
    }
}

/// The built-in behaviour on its own, for running without a policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinHooks;

impl VclHooks for BuiltinHooks {}

/// Hooks backed by a compiled policy.
#[derive(Debug, Clone)]
pub struct CompiledHandler {
    program: Arc<CompiledProgram>,
}

impl CompiledHandler {
    /// Handler for `program`.
    pub fn new(program: Arc<CompiledProgram>) -> Self {
        Self { program }
    }

    /// The compiled policy.
    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    fn run(&self, hook: SystemHook, ctx: &mut VclContext) -> EvalResult<VclAction> {
        match Executor::new(&self.program).run_hook(hook, ctx)? {
            Some(action) => Ok(action),
            None => Ok(builtin::run(hook, ctx)),
        }
    }
}

impl VclHooks for CompiledHandler {
    fn vcl_init(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Init, ctx)
    }

    fn vcl_recv(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Recv, ctx)
    }

    fn vcl_hash(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Hash, ctx)
    }

    fn vcl_pipe(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Pipe, ctx)
    }

    fn vcl_pass(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Pass, ctx)
    }

    fn vcl_hit(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Hit, ctx)
    }

    fn vcl_miss(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Miss, ctx)
    }

    fn vcl_deliver(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Deliver, ctx)
    }

    fn vcl_purge(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Purge, ctx)
    }

    fn vcl_synth(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Synth, ctx)
    }

    fn vcl_error(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Error, ctx)
    }

    fn vcl_backend_fetch(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::BackendFetch, ctx)
    }

    fn vcl_backend_response(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::BackendResponse, ctx)
    }

    fn vcl_backend_error(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::BackendError, ctx)
    }

    fn vcl_term(&self, ctx: &mut VclContext) -> EvalResult<VclAction> {
        self.run(SystemHook::Term, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::compile_source;
    use crate::runtime::context::{BackendResponse, InboundRequest};

    fn context(method: &str) -> VclContext {
        let mut ctx = VclContext::new("7", "node", "vclcore");
        ctx.reset_from_inbound(&InboundRequest::new(method, "/a").with_header("Host", "h"));
        ctx
    }

    #[test]
    fn builtin_recv_passes_unsafe_and_private_requests() {
        assert_eq!(builtin::recv(&mut context("POST")), VclAction::Pass);
        let mut ctx = context("GET");
        assert_eq!(builtin::recv(&mut ctx), VclAction::Hash);
        ctx.req.headers.set("Cookie", "a=b");
        assert_eq!(builtin::recv(&mut ctx), VclAction::Pass);
    }

    #[test]
    fn builtin_backend_response_marks_private_objects() {
        let mut ctx = context("GET");
        ctx.beresp = Some(BackendResponse {
            status: 200,
            ttl: chrono::Duration::seconds(60),
            ..BackendResponse::default()
        });
        assert_eq!(builtin::backend_response(&mut ctx), VclAction::Deliver);
        assert!(!ctx.beresp.as_ref().unwrap().uncacheable);

        ctx.beresp
            .as_mut()
            .unwrap()
            .headers
            .set("Cache-Control", "max-age=60, Private");
        builtin::backend_response(&mut ctx);
        assert!(ctx.beresp.as_ref().unwrap().uncacheable);
    }

    #[test]
    fn builtin_synth_fills_empty_body() {
        let mut ctx = context("GET");
        ctx.synthesize(503, "Service Unavailable");
        assert_eq!(builtin::synth(&mut ctx), VclAction::Deliver);
        let body = String::from_utf8(ctx.resp.body.to_vec()).unwrap();
        assert!(body.contains("503 Service Unavailable"));
        assert!(body.contains("XID: 7"));
    }

    #[test]
    fn compiled_handler_falls_back_to_builtin() {
        let program = compile_source(
            "h.vcl",
            r#"sub vcl_recv { if (req.url ~ "^/admin") { return (pass); } }"#,
        )
        .unwrap();
        let handler = CompiledHandler::new(Arc::new(program));

        let mut ctx = context("GET");
        assert_eq!(handler.vcl_recv(&mut ctx).unwrap(), VclAction::Hash);
        ctx.req.url = "/admin/users".into();
        assert_eq!(
            handler.dispatch(SystemHook::Recv, &mut ctx).unwrap(),
            VclAction::Pass
        );
        // no vcl_hash body: built-in hashes url + host
        assert_eq!(handler.vcl_hash(&mut ctx).unwrap(), VclAction::Lookup);
        assert_eq!(ctx.req.hash.parts(), 2);
    }
}
