//! IR executor
//!
//! Runs lowered subroutines against a [`VclContext`]. All names were
//! resolved by the lowering pass, so evaluation is a direct walk over the
//! typed tree.

use bytes::Bytes;
use chrono::{Duration, Utc};
use std::cmp::Ordering;
use std::net::IpAddr;

use crate::runtime::context::VclContext;
use crate::runtime::error::{EvalError, EvalResult};
use crate::runtime::headers::Headers;
use crate::runtime::state::VclAction;

use super::ast::BinaryOp;
use super::ir::{
    CompiledProgram, ContextField, Conversion, ExprKind, HeaderObject, Place, Stmt, SystemHook,
    TypedExpr,
};
use super::literal::reason_phrase;
use super::value::{Value, ValueType};

/// Nested `call` limit.
pub const MAX_CALL_DEPTH: usize = 64;

/// How a statement list finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Return(VclAction),
    Fallback,
}

struct Frame {
    locals: Vec<Value>,
    depth: usize,
}

/// Executes a compiled program's subroutines.
#[derive(Debug, Clone, Copy)]
pub struct Executor<'p> {
    program: &'p CompiledProgram,
}

impl<'p> Executor<'p> {
    /// Executor over `program`.
    pub fn new(program: &'p CompiledProgram) -> Self {
        Self { program }
    }

    /// Run the policy's body for `hook`.
    ///
    /// `None` means the hook is not defined or its body fell through, and
    /// the built-in behaviour should decide.
    pub fn run_hook(&self, hook: SystemHook, ctx: &mut VclContext) -> EvalResult<Option<VclAction>> {
        let Some(&index) = self.program.hooks.get(&hook) else {
            return Ok(None);
        };
        Ok(match self.run_sub(index, ctx, 0)? {
            Flow::Return(action) => Some(action),
            Flow::Continue | Flow::Fallback => None,
        })
    }

    /// Run a custom subroutine by name, as `call name;` would.
    pub fn call(&self, name: &str, ctx: &mut VclContext) -> EvalResult<Option<VclAction>> {
        let Some((index, _)) = self.program.custom_sub(name) else {
            return Ok(None);
        };
        Ok(match self.run_sub(index, ctx, 0)? {
            Flow::Return(VclAction::NoOp) | Flow::Continue | Flow::Fallback => None,
            Flow::Return(action) => Some(action),
        })
    }

    fn run_sub(&self, index: usize, ctx: &mut VclContext, depth: usize) -> EvalResult<Flow> {
        if depth > MAX_CALL_DEPTH {
            return Err(EvalError::CallDepth(MAX_CALL_DEPTH));
        }
        let sub = self
            .program
            .subroutines
            .get(index)
            .ok_or(EvalError::MissingSubroutine(index))?;
        let mut frame = Frame {
            locals: sub.locals.iter().map(|ty| ty.zero()).collect(),
            depth,
        };
        self.exec_block(&sub.body, ctx, &mut frame)
    }

    fn exec_block(&self, body: &[Stmt], ctx: &mut VclContext, frame: &mut Frame) -> EvalResult<Flow> {
        for stmt in body {
            match self.exec(stmt, ctx, frame)? {
                Flow::Continue => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Continue)
    }

    fn exec(&self, stmt: &Stmt, ctx: &mut VclContext, frame: &mut Frame) -> EvalResult<Flow> {
        match stmt {
            Stmt::Assign { place, value } => {
                let value = self.eval(value, ctx, frame)?;
                store(place, value, ctx, frame)?;
            }
            Stmt::Unset(place) => unset(place, ctx, frame)?,
            Stmt::DeclareLocal { slot, value } => frame.locals[*slot] = value.clone(),
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if self.eval(cond, ctx, frame)?.truthy() {
                        return self.exec_block(body, ctx, frame);
                    }
                }
                return self.exec_block(otherwise, ctx, frame);
            }
            Stmt::Block(body) => return self.exec_block(body, ctx, frame),
            Stmt::HashData(expr) => {
                let value = self.eval(expr, ctx, frame)?;
                ctx.req.hash.add(value.to_string().as_bytes());
            }
            Stmt::Call { sub } => match self.run_sub(*sub, ctx, frame.depth + 1)? {
                Flow::Return(VclAction::NoOp) | Flow::Continue | Flow::Fallback => {}
                flow => return Ok(flow),
            },
            Stmt::Return(action) => return Ok(Flow::Return(*action)),
            Stmt::Synth { status, reason } => {
                let status = as_integer(&self.eval(status, ctx, frame)?)?;
                let reason = match reason {
                    Some(reason) => self.eval(reason, ctx, frame)?.to_string(),
                    None => reason_phrase(status).to_string(),
                };
                ctx.synthesize(status, reason);
                return Ok(Flow::Return(VclAction::Synth));
            }
            Stmt::Error { status, reason } => {
                ctx.synthesize(*status, reason.clone());
                return Ok(Flow::Return(VclAction::DeliverContent));
            }
            Stmt::Fallback => return Ok(Flow::Fallback),
        }
        Ok(Flow::Continue)
    }

    fn eval(&self, expr: &TypedExpr, ctx: &VclContext, frame: &Frame) -> EvalResult<Value> {
        match &expr.kind {
            ExprKind::Const(value) => Ok(value.clone()),
            ExprKind::Field(field) => Ok(read_field(*field, ctx)),
            ExprKind::Header { object, name } => Ok(Value::String(
                headers(*object, ctx)
                    .and_then(|headers| headers.get(name))
                    .unwrap_or_default()
                    .to_string(),
            )),
            ExprKind::Local(slot) => Ok(frame.locals[*slot].clone()),
            ExprKind::Not(inner) => Ok(Value::Bool(!self.eval(inner, ctx, frame)?.truthy())),
            ExprKind::Negate(inner) => eval_negate(&self.eval(inner, ctx, frame)?),
            ExprKind::Binary { op, lhs, rhs } => {
                let left = self.eval(lhs, ctx, frame)?;
                match op {
                    BinaryOp::Or if left.truthy() => Ok(Value::Bool(true)),
                    BinaryOp::And if !left.truthy() => Ok(Value::Bool(false)),
                    _ => eval_binary(*op, &left, &self.eval(rhs, ctx, frame)?),
                }
            }
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, ctx, frame)?.truthy() {
                    self.eval(then, ctx, frame)
                } else {
                    self.eval(otherwise, ctx, frame)
                }
            }
            ExprKind::RegexMatch {
                subject,
                regex,
                negated,
            } => {
                let subject = self.eval(subject, ctx, frame)?.to_string();
                Ok(Value::Bool(regex.is_match(&subject) != *negated))
            }
            ExprKind::AclMatch {
                subject,
                acl,
                negated,
            } => {
                let member = match self.eval(subject, ctx, frame) {
                    Ok(Value::Ip(addr)) => acl.is_match(addr),
                    Err(EvalError::InvalidAddress(_)) => false,
                    Ok(other) => return Err(mismatch(ValueType::Ip, &other)),
                    Err(err) => return Err(err),
                };
                Ok(Value::Bool(member != *negated))
            }
            ExprKind::Convert { expr, conversion } => {
                let value = self.eval(expr, ctx, frame)?;
                let text = value.to_string();
                convert(value, *conversion).ok_or(EvalError::InvalidAddress(text))
            }
        }
    }
}

fn mismatch(expected: ValueType, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        expected: expected.keyword(),
        found: found.ty().keyword(),
    }
}

fn as_integer(value: &Value) -> EvalResult<i64> {
    match value {
        Value::Integer(num) => Ok(*num),
        other => Err(mismatch(ValueType::Integer, other)),
    }
}

fn as_duration(value: &Value) -> EvalResult<Duration> {
    match value {
        Value::Duration(d) => Ok(*d),
        other => Err(mismatch(ValueType::Duration, other)),
    }
}

fn as_backend(value: &Value) -> Option<String> {
    match value {
        Value::Backend(name) | Value::String(name) if !name.is_empty() => Some(name.clone()),
        _ => None,
    }
}

/// Apply a conversion inserted by the type checker. `None` only for
/// text that is not an IP address.
pub fn convert(value: Value, conversion: Conversion) -> Option<Value> {
    match conversion {
        Conversion::ToString => Some(match value {
            Value::String(text) => Value::String(text),
            other => Value::String(other.to_string()),
        }),
        Conversion::ToBool => Some(Value::Bool(value.truthy())),
        Conversion::ToFloat => value.as_f64().map(Value::Float),
        Conversion::ToIp => match value {
            Value::Ip(addr) => Some(Value::Ip(addr)),
            other => other.to_string().trim().parse::<IpAddr>().ok().map(Value::Ip),
        },
    }
}

/// Arithmetic negation.
pub fn eval_negate(value: &Value) -> EvalResult<Value> {
    match value {
        Value::Integer(num) => num.checked_neg().map(Value::Integer).ok_or(EvalError::Overflow),
        Value::Float(num) => Ok(Value::Float(-num)),
        Value::Duration(d) => Ok(Value::Duration(-*d)),
        other => Err(mismatch(ValueType::Integer, other)),
    }
}

fn scale(duration: Duration, factor: f64) -> EvalResult<Duration> {
    let millis = (duration.num_milliseconds() as f64 * factor).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(EvalError::Overflow);
    }
    Duration::try_milliseconds(millis as i64).ok_or(EvalError::Overflow)
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => lhs.as_f64()?.partial_cmp(&rhs.as_f64()?),
    }
}

/// Evaluate a binary operator on already-typed operands.
pub fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    use BinaryOp::*;
    use Value::{Bool, Float, Integer, Time};

    let numeric = lhs.as_f64().zip(rhs.as_f64());
    let value = match (op, lhs, rhs) {
        (Or, _, _) => Bool(lhs.truthy() || rhs.truthy()),
        (And, _, _) => Bool(lhs.truthy() && rhs.truthy()),
        (BitOr, Bool(a), Bool(b)) => Bool(a | b),
        (BitXor, Bool(a), Bool(b)) => Bool(a ^ b),
        (BitAnd, Bool(a), Bool(b)) => Bool(a & b),
        (BitOr, Integer(a), Integer(b)) => Integer(a | b),
        (BitXor, Integer(a), Integer(b)) => Integer(a ^ b),
        (BitAnd, Integer(a), Integer(b)) => Integer(a & b),
        (Eq, _, _) => Bool(equal(lhs, rhs)),
        (Ne, _, _) => Bool(!equal(lhs, rhs)),
        (Lt | Le | Gt | Ge, _, _) => {
            let ordering = compare(lhs, rhs);
            if ordering.is_none() && lhs.ty() != rhs.ty() && numeric.is_none() {
                return Err(mismatch(lhs.ty(), rhs));
            }
            Bool(match (op, ordering) {
                (_, None) => false,
                (Lt, Some(ord)) => ord == Ordering::Less,
                (Le, Some(ord)) => ord != Ordering::Greater,
                (Gt, Some(ord)) => ord == Ordering::Greater,
                (_, Some(ord)) => ord != Ordering::Less,
            })
        }
        (Add, Value::String(a), _) => Value::String(format!("{a}{rhs}")),
        (Add, _, Value::String(b)) => Value::String(format!("{lhs}{b}")),
        (Add, Integer(a), Integer(b)) => Integer(a.checked_add(*b).ok_or(EvalError::Overflow)?),
        (Add, Value::Duration(a), Value::Duration(b)) => {
            Value::Duration(a.checked_add(b).ok_or(EvalError::Overflow)?)
        }
        (Add, Time(t), Value::Duration(d)) | (Add, Value::Duration(d), Time(t)) => {
            Time(t.checked_add_signed(*d).ok_or(EvalError::Overflow)?)
        }
        (Sub, Integer(a), Integer(b)) => Integer(a.checked_sub(*b).ok_or(EvalError::Overflow)?),
        (Sub, Value::Duration(a), Value::Duration(b)) => {
            Value::Duration(a.checked_sub(b).ok_or(EvalError::Overflow)?)
        }
        (Sub, Time(t), Value::Duration(d)) => {
            Time(t.checked_sub_signed(*d).ok_or(EvalError::Overflow)?)
        }
        (Sub, Time(a), Time(b)) => Value::Duration(a.signed_duration_since(*b)),
        (Mul, Integer(a), Integer(b)) => Integer(a.checked_mul(*b).ok_or(EvalError::Overflow)?),
        (Mul, Value::Duration(d), factor) | (Mul, factor, Value::Duration(d))
            if factor.as_f64().is_some() =>
        {
            Value::Duration(scale(*d, factor.as_f64().unwrap_or_default())?)
        }
        (Div, Integer(_), Integer(0)) | (Rem, Integer(_), Integer(0)) => {
            return Err(EvalError::DivisionByZero);
        }
        (Div, Integer(a), Integer(b)) => Integer(a.checked_div(*b).ok_or(EvalError::Overflow)?),
        (Rem, Integer(a), Integer(b)) => Integer(a.checked_rem(*b).ok_or(EvalError::Overflow)?),
        (Div, Value::Duration(d), divisor) if divisor.as_f64().is_some() => {
            let divisor = divisor.as_f64().unwrap_or_default();
            if divisor == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Value::Duration(scale(*d, 1.0 / divisor)?)
        }
        (Div, Value::Duration(a), Value::Duration(b)) => {
            if b.is_zero() {
                return Err(EvalError::DivisionByZero);
            }
            Float(a.num_milliseconds() as f64 / b.num_milliseconds() as f64)
        }
        (Add | Sub | Mul | Div, _, _) => {
            let Some((a, b)) = numeric else {
                return Err(mismatch(ValueType::Float, if lhs.as_f64().is_none() { lhs } else { rhs }));
            };
            Float(match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                _ if b == 0.0 => return Err(EvalError::DivisionByZero),
                _ => a / b,
            })
        }
        (_, _, _) => return Err(mismatch(lhs.ty(), rhs)),
    };
    Ok(value)
}

fn ip_or_zero(addr: Option<IpAddr>) -> Value {
    Value::Ip(addr.unwrap_or(IpAddr::from([0, 0, 0, 0])))
}

fn text(value: &str) -> Value {
    Value::String(value.to_string())
}

fn read_field(field: ContextField, ctx: &VclContext) -> Value {
    use ContextField::*;
    let value = match field {
        Now => Some(Value::Time(Utc::now())),
        LocalIp => Some(ip_or_zero(ctx.local.addr.map(|addr| addr.ip()))),
        LocalEndpoint => Some(Value::String(
            ctx.local.addr.map(|addr| addr.to_string()).unwrap_or_default(),
        )),
        LocalSocket => Some(text(&ctx.local.socket)),
        RemoteIp => Some(ip_or_zero(ctx.remote)),
        ClientIp => Some(ip_or_zero(ctx.client.ip)),
        ClientIdentity => Some(text(&ctx.client.identity)),
        ServerIp => Some(ip_or_zero(ctx.server.ip)),
        ServerHostname => Some(text(&ctx.server.hostname)),
        ServerIdentity => Some(text(&ctx.server.identity)),
        ServerPort => Some(Value::Integer(i64::from(ctx.server.port))),
        ReqMethod => Some(text(&ctx.req.method)),
        ReqUrl => Some(text(&ctx.req.url)),
        ReqProto => Some(text(&ctx.req.proto)),
        ReqHash => Some(Value::String(ctx.req.hash.digest())),
        ReqBackendHint => ctx.req.backend_hint.clone().map(Value::Backend),
        ReqRestarts => Some(Value::Integer(ctx.req.restarts.max(0))),
        ReqEsiLevel => Some(Value::Integer(ctx.req.esi_level)),
        ReqTtl => ctx.req.ttl.map(Value::Duration),
        ReqXid => Some(text(&ctx.req.xid)),
        ReqCanGzip => Some(Value::Bool(ctx.req.can_gzip)),
        ReqHashAlwaysMiss => Some(Value::Bool(ctx.req.hash_always_miss)),
        ReqHashIgnoreBusy => Some(Value::Bool(ctx.req.hash_ignore_busy)),
        ReqTopMethod => Some(text(&ctx.req_top.method)),
        ReqTopUrl => Some(text(&ctx.req_top.url)),
        ReqTopProto => Some(text(&ctx.req_top.proto)),
        BereqMethod => ctx.bereq.as_ref().map(|bereq| text(&bereq.method)),
        BereqUrl => ctx.bereq.as_ref().map(|bereq| text(&bereq.url)),
        BereqProto => ctx.bereq.as_ref().map(|bereq| text(&bereq.proto)),
        BereqRetries => ctx.bereq.as_ref().map(|bereq| Value::Integer(bereq.retries)),
        BereqBackend => ctx
            .bereq
            .as_ref()
            .and_then(|bereq| bereq.backend.clone())
            .map(Value::Backend),
        BereqUncacheable => ctx.bereq.as_ref().map(|bereq| Value::Bool(bereq.uncacheable)),
        BerespStatus => ctx.beresp.as_ref().map(|beresp| Value::Integer(beresp.status)),
        BerespReason => ctx.beresp.as_ref().map(|beresp| text(&beresp.reason)),
        BerespProto => ctx.beresp.as_ref().map(|beresp| text(&beresp.proto)),
        BerespTtl => ctx.beresp.as_ref().map(|beresp| Value::Duration(beresp.ttl)),
        BerespUncacheable => ctx
            .beresp
            .as_ref()
            .map(|beresp| Value::Bool(beresp.uncacheable)),
        BerespDoEsi => ctx.beresp.as_ref().map(|beresp| Value::Bool(beresp.do_esi)),
        BerespBackend => ctx
            .beresp
            .as_ref()
            .and_then(|beresp| beresp.backend.clone())
            .map(Value::Backend),
        ObjStatus => ctx.obj.as_ref().map(|obj| Value::Integer(obj.status)),
        ObjReason => ctx.obj.as_ref().map(|obj| text(&obj.reason)),
        ObjProto => ctx.obj.as_ref().map(|obj| text(&obj.proto)),
        ObjTtl => ctx.obj.as_ref().map(|obj| Value::Duration(obj.ttl)),
        ObjUncacheable => ctx.obj.as_ref().map(|obj| Value::Bool(obj.uncacheable)),
        ObjDoEsi => ctx.obj.as_ref().map(|obj| Value::Bool(obj.do_esi)),
        ObjLastUsed => ctx.obj.as_ref().map(|obj| Value::Time(obj.last_used)),
        RespStatus => Some(Value::Integer(ctx.resp.status)),
        RespReason => Some(text(&ctx.resp.reason)),
        RespProto => Some(text(&ctx.resp.proto)),
        RespBody => Some(Value::String(
            String::from_utf8_lossy(&ctx.resp.body).into_owned(),
        )),
    };
    value.unwrap_or_else(|| field.ty().zero())
}

fn write_field(field: ContextField, value: Value, ctx: &mut VclContext) -> EvalResult<()> {
    use ContextField::*;
    match field {
        ClientIdentity => ctx.client.identity = value.to_string(),
        ReqMethod => ctx.req.method = value.to_string(),
        ReqUrl => ctx.req.url = value.to_string(),
        ReqProto => ctx.req.proto = value.to_string(),
        ReqBackendHint => ctx.req.backend_hint = as_backend(&value),
        ReqTtl => ctx.req.ttl = Some(as_duration(&value)?),
        ReqHashAlwaysMiss => ctx.req.hash_always_miss = value.truthy(),
        ReqHashIgnoreBusy => ctx.req.hash_ignore_busy = value.truthy(),
        BereqMethod | BereqUrl | BereqProto | BereqBackend | BereqUncacheable => {
            let bereq = ctx.bereq.as_mut().ok_or(EvalError::Unavailable("bereq"))?;
            match field {
                BereqMethod => bereq.method = value.to_string(),
                BereqUrl => bereq.url = value.to_string(),
                BereqProto => bereq.proto = value.to_string(),
                BereqBackend => bereq.backend = as_backend(&value),
                _ => bereq.uncacheable = value.truthy(),
            }
        }
        BerespStatus | BerespReason | BerespProto | BerespTtl | BerespUncacheable
        | BerespDoEsi => {
            let beresp = ctx.beresp.as_mut().ok_or(EvalError::Unavailable("beresp"))?;
            match field {
                BerespStatus => beresp.status = as_integer(&value)?,
                BerespReason => beresp.reason = value.to_string(),
                BerespProto => beresp.proto = value.to_string(),
                BerespTtl => beresp.ttl = as_duration(&value)?,
                BerespUncacheable => beresp.uncacheable = value.truthy(),
                _ => beresp.do_esi = value.truthy(),
            }
        }
        RespStatus => ctx.resp.status = as_integer(&value)?,
        RespReason => ctx.resp.reason = value.to_string(),
        RespProto => ctx.resp.proto = value.to_string(),
        RespBody => ctx.resp.body = Bytes::from(value.to_string()),
        _ => return Err(EvalError::Unavailable("read-only member")),
    }
    Ok(())
}

fn headers(object: HeaderObject, ctx: &VclContext) -> Option<&Headers> {
    match object {
        HeaderObject::Req => Some(&ctx.req.headers),
        HeaderObject::ReqTop => Some(&ctx.req_top.headers),
        HeaderObject::Bereq => ctx.bereq.as_ref().map(|bereq| &bereq.headers),
        HeaderObject::Beresp => ctx.beresp.as_ref().map(|beresp| &beresp.headers),
        HeaderObject::Obj => ctx.obj.as_ref().map(|obj| &obj.headers),
        HeaderObject::Resp => Some(&ctx.resp.headers),
    }
}

fn headers_mut(object: HeaderObject, ctx: &mut VclContext) -> EvalResult<&mut Headers> {
    let headers = match object {
        HeaderObject::Req => Some(&mut ctx.req.headers),
        HeaderObject::Bereq => ctx.bereq.as_mut().map(|bereq| &mut bereq.headers),
        HeaderObject::Beresp => ctx.beresp.as_mut().map(|beresp| &mut beresp.headers),
        HeaderObject::Resp => Some(&mut ctx.resp.headers),
        HeaderObject::ReqTop | HeaderObject::Obj => None,
    };
    headers.ok_or(EvalError::Unavailable(object.name()))
}

fn store(place: &Place, value: Value, ctx: &mut VclContext, frame: &mut Frame) -> EvalResult<()> {
    match place {
        Place::Local(slot) => frame.locals[*slot] = value,
        Place::Header { object, name } => headers_mut(*object, ctx)?.set(name, value.to_string()),
        Place::Field(field) => write_field(*field, value, ctx)?,
    }
    Ok(())
}

fn unset(place: &Place, ctx: &mut VclContext, frame: &mut Frame) -> EvalResult<()> {
    match place {
        Place::Local(slot) => frame.locals[*slot] = frame.locals[*slot].ty().zero(),
        Place::Header { object, name } => {
            headers_mut(*object, ctx)?.remove(name);
        }
        Place::Field(ContextField::ReqTtl) => ctx.req.ttl = None,
        Place::Field(field) => write_field(*field, field.ty().zero(), ctx)?,
    }
    Ok(())
}
