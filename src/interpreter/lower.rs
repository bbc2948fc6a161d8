//! Expression and statement lowering.
//!
//! Walks subroutine bodies and produces typed IR. Every name is resolved
//! here: context members to [`ContextField`]s, headers to
//! [`HeaderObject`] lookups, locals to frame slots, ACLs and backends to
//! their compiled values, and `call` targets to subroutine indices.

use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::Arc;

use crate::runtime::acl::Acl;
use crate::runtime::backend::Backend;
use crate::runtime::state::VclAction;

use super::ast::{AssignOp, BinaryOp, Expr, ReturnValue, Statement, UnaryOp};
use super::ir::{
    CONTEXT_OBJECTS, ContextField, Conversion, ExprKind, HeaderObject, Place, Stmt, Subroutine,
    SystemHook, TypedExpr,
};
use super::literal::{self, lower_literal};
use super::registry::{DeclKind, Registry};
use super::runtime::{convert, eval_binary, eval_negate};
use super::value::{Value, ValueType};
use super::{CompileError, Result};

/// Names visible to subroutine code.
#[derive(Clone, Copy)]
pub struct Symbols<'a> {
    /// Declared backends.
    pub backends: &'a Registry<Arc<Backend>>,
    /// Declared ACLs.
    pub acls: &'a Registry<Arc<Acl>>,
    /// Custom subroutine indices.
    pub custom: &'a Registry<usize>,
}

/// Lower one subroutine. Hooks declared several times pass one body per
/// declaration; each body gets its own scope and they run in order.
pub fn lower_subroutine(
    symbols: Symbols<'_>,
    name: &str,
    hook: Option<SystemHook>,
    bodies: &[&[Statement]],
) -> Result<Subroutine> {
    let mut lowerer = Lowerer {
        symbols,
        hook,
        scopes: Vec::new(),
        locals: Vec::new(),
    };
    let mut body = Vec::new();
    for statements in bodies {
        body.extend(lowerer.lower_block(statements)?);
    }
    body.push(match hook {
        Some(_) => Stmt::Fallback,
        None => Stmt::Return(VclAction::NoOp),
    });
    Ok(Subroutine {
        name: name.to_string(),
        hook,
        body,
        locals: lowerer.locals,
    })
}

enum Resolved {
    Field(ContextField),
    Header(HeaderObject, String),
    Local(usize),
    Backend(String),
}

struct Lowerer<'a> {
    symbols: Symbols<'a>,
    hook: Option<SystemHook>,
    scopes: Vec<HashMap<String, usize>>,
    locals: Vec<ValueType>,
}

fn invalid_operands(op: BinaryOp, lhs: ValueType, rhs: ValueType) -> CompileError {
    CompileError::InvalidOperands {
        op: op.symbol().to_string(),
        operands: format!("{lhs} and {rhs}"),
    }
}

fn typed(kind: ExprKind, ty: ValueType) -> TypedExpr {
    TypedExpr { kind, ty }
}

/// Coerce `expr` to `to` using the conversion table: anything to STRING,
/// INT or STRING to BOOL, INT to REAL. Constants are folded.
pub fn coerce(expr: TypedExpr, to: ValueType) -> Result<TypedExpr> {
    if expr.ty == to {
        return Ok(expr);
    }
    let conversion = match (expr.ty, to) {
        (_, ValueType::String) => Conversion::ToString,
        (ValueType::Integer | ValueType::String, ValueType::Bool) => Conversion::ToBool,
        (ValueType::Integer, ValueType::Float) => Conversion::ToFloat,
        (from, to) => return Err(CompileError::InvalidCast { from, to }),
    };
    if let ExprKind::Const(value) = &expr.kind {
        if let Some(folded) = convert(value.clone(), conversion) {
            return Ok(TypedExpr::constant(folded));
        }
    }
    Ok(typed(
        ExprKind::Convert {
            expr: Box::new(expr),
            conversion,
        },
        to,
    ))
}

impl<'a> Lowerer<'a> {
    fn lower_block(&mut self, statements: &[Statement]) -> Result<Vec<Stmt>> {
        self.scopes.push(HashMap::new());
        let lowered = statements
            .iter()
            .map(|statement| self.lower_statement(statement))
            .collect::<Result<Vec<_>>>();
        self.scopes.pop();
        lowered
    }

    fn lookup_local(&self, name: &str) -> Option<usize> {
        let key = name.to_ascii_lowercase();
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&key).copied())
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<Stmt> {
        match statement {
            Statement::Set { target, op, value } => {
                let resolved = self.resolve(target)?;
                let place = self.place(&resolved, target)?;
                let place_ty = self.read(&resolved).ty;
                let value = self.lower_expr(value)?;
                let value = match op {
                    AssignOp::Set => value,
                    AssignOp::Add => self.combine(BinaryOp::Add, self.read(&resolved), value)?,
                    AssignOp::Sub => self.combine(BinaryOp::Sub, self.read(&resolved), value)?,
                };
                Ok(Stmt::Assign {
                    place,
                    value: coerce(value, place_ty)?,
                })
            }
            Statement::Unset(target) => {
                let resolved = self.resolve(target)?;
                Ok(Stmt::Unset(self.place(&resolved, target)?))
            }
            Statement::Call(name) => {
                if SystemHook::is_reserved(name) {
                    return Err(CompileError::ReservedCall(name.clone()));
                }
                let index = self
                    .symbols
                    .custom
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnknownReference {
                        kind: DeclKind::Subroutine,
                        name: name.clone(),
                    })?;
                Ok(Stmt::Call { sub: index })
            }
            Statement::Return(None) => Ok(match self.hook {
                Some(_) => Stmt::Fallback,
                None => Stmt::Return(VclAction::NoOp),
            }),
            Statement::Return(Some(ReturnValue::State(name))) => VclAction::from_dsl(name)
                .map(Stmt::Return)
                .ok_or_else(|| CompileError::UnknownReturn(name.clone())),
            Statement::Return(Some(ReturnValue::Synth { status, reason })) => {
                let status = coerce(self.lower_expr(status)?, ValueType::Integer)?;
                let reason = match reason {
                    Some(reason) => Some(coerce(self.lower_expr(reason)?, ValueType::String)?),
                    None => None,
                };
                Ok(Stmt::Synth { status, reason })
            }
            Statement::Error {
                status,
                description,
            } => {
                let status = match status {
                    Some(text) => literal::parse_status(text)?,
                    None => 503,
                };
                let reason = match description {
                    Some(text) => literal::text_of(text),
                    None => literal::reason_phrase(status).to_string(),
                };
                Ok(Stmt::Error { status, reason })
            }
            Statement::If {
                branches,
                otherwise,
            } => {
                let mut lowered = Vec::with_capacity(branches.len());
                for (cond, body) in branches {
                    let cond = coerce(self.lower_expr(cond)?, ValueType::Bool)?;
                    lowered.push((cond, self.lower_block(body)?));
                }
                let otherwise = match otherwise {
                    Some(body) => self.lower_block(body)?,
                    None => Vec::new(),
                };
                Ok(Stmt::If {
                    branches: lowered,
                    otherwise,
                })
            }
            Statement::Var { ty, name } => {
                let ty = ValueType::from_keyword(ty)
                    .ok_or_else(|| CompileError::UnknownType(ty.clone()))?;
                if self.lookup_local(name).is_some() {
                    return Err(CompileError::Redeclared(name.clone()));
                }
                let slot = self.locals.len();
                self.locals.push(ty);
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.to_ascii_lowercase(), slot);
                }
                Ok(Stmt::DeclareLocal {
                    slot,
                    value: ty.zero(),
                })
            }
            Statement::HashData(expr) => Ok(Stmt::HashData(self.lower_expr(expr)?)),
            Statement::Restart => Ok(Stmt::Return(VclAction::Restart)),
            Statement::Block(body) => Ok(Stmt::Block(self.lower_block(body)?)),
        }
    }

    fn resolve(&self, path: &[String]) -> Result<Resolved> {
        let Some(head) = path.first() else {
            return Err(CompileError::UnknownObject(String::new()));
        };
        if path.len() == 1 {
            if let Some(slot) = self.lookup_local(head) {
                return Ok(Resolved::Local(slot));
            }
            if head.eq_ignore_ascii_case("now") {
                return Ok(Resolved::Field(ContextField::Now));
            }
            if let Some(backend) = self.symbols.backends.get(head) {
                return Ok(Resolved::Backend(backend.name().to_string()));
            }
            return Err(CompileError::UnknownObject(head.clone()));
        }

        let object = head.to_ascii_lowercase();
        if !CONTEXT_OBJECTS.contains(&object.as_str()) {
            return Err(CompileError::UnknownObject(path.join(".")));
        }
        let unknown_member = || CompileError::UnknownMember {
            object: object.clone(),
            member: path[1..].join("."),
        };
        if path[1].eq_ignore_ascii_case("http") {
            let header_object = HeaderObject::from_name(&object).ok_or_else(unknown_member)?;
            if path.len() < 3 {
                return Err(unknown_member());
            }
            return Ok(Resolved::Header(header_object, path[2..].join(".")));
        }
        if path.len() != 2 {
            return Err(unknown_member());
        }
        ContextField::lookup(&object, &path[1])
            .map(Resolved::Field)
            .ok_or_else(unknown_member)
    }

    fn read(&self, resolved: &Resolved) -> TypedExpr {
        match resolved {
            Resolved::Field(field) => typed(ExprKind::Field(*field), field.ty()),
            Resolved::Header(object, name) => typed(
                ExprKind::Header {
                    object: *object,
                    name: name.clone(),
                },
                ValueType::String,
            ),
            Resolved::Local(slot) => typed(ExprKind::Local(*slot), self.locals[*slot]),
            Resolved::Backend(name) => TypedExpr::constant(Value::Backend(name.clone())),
        }
    }

    fn place(&self, resolved: &Resolved, path: &[String]) -> Result<Place> {
        let read_only = || CompileError::ReadOnly(path.join("."));
        match resolved {
            Resolved::Field(field) if field.writable() => Ok(Place::Field(*field)),
            Resolved::Header(object, name) if object.writable() => Ok(Place::Header {
                object: *object,
                name: name.clone(),
            }),
            Resolved::Local(slot) => Ok(Place::Local(*slot)),
            _ => Err(read_only()),
        }
    }

    fn lower_expr(&self, expr: &Expr) -> Result<TypedExpr> {
        match expr {
            Expr::Literal(literal) => Ok(TypedExpr::constant(lower_literal(literal)?)),
            Expr::Path(path) => Ok(self.read(&self.resolve(path)?)),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => {
                let inner = coerce(self.lower_expr(expr)?, ValueType::Bool)?;
                if let ExprKind::Const(Value::Bool(flag)) = inner.kind {
                    return Ok(TypedExpr::constant(Value::Bool(!flag)));
                }
                Ok(typed(ExprKind::Not(Box::new(inner)), ValueType::Bool))
            }
            Expr::Unary {
                op: UnaryOp::Negate,
                expr,
            } => {
                let inner = self.lower_expr(expr)?;
                if !matches!(
                    inner.ty,
                    ValueType::Integer | ValueType::Float | ValueType::Duration
                ) {
                    return Err(CompileError::InvalidOperands {
                        op: "-".to_string(),
                        operands: inner.ty.to_string(),
                    });
                }
                if let ExprKind::Const(value) = &inner.kind {
                    if let Ok(folded) = eval_negate(value) {
                        return Ok(TypedExpr::constant(folded));
                    }
                }
                let ty = inner.ty;
                Ok(typed(ExprKind::Negate(Box::new(inner)), ty))
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::Match | BinaryOp::NotMatch => {
                    self.lower_match(*op == BinaryOp::NotMatch, lhs, rhs)
                }
                _ => {
                    let lhs = self.lower_expr(lhs)?;
                    let rhs = self.lower_expr(rhs)?;
                    self.combine(*op, lhs, rhs)
                }
            },
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let cond = coerce(self.lower_expr(cond)?, ValueType::Bool)?;
                let then = self.lower_expr(then)?;
                let otherwise = self.lower_expr(otherwise)?;
                let ty = if then.ty == otherwise.ty {
                    then.ty
                } else if then.ty.is_numeric() && otherwise.ty.is_numeric() {
                    ValueType::Float
                } else {
                    ValueType::String
                };
                Ok(typed(
                    ExprKind::Conditional {
                        cond: Box::new(cond),
                        then: Box::new(coerce(then, ty)?),
                        otherwise: Box::new(coerce(otherwise, ty)?),
                    },
                    ty,
                ))
            }
        }
    }

    fn lower_match(&self, negated: bool, lhs: &Expr, rhs: &Expr) -> Result<TypedExpr> {
        let op = if negated {
            BinaryOp::NotMatch
        } else {
            BinaryOp::Match
        };
        match rhs {
            Expr::Literal(pattern) => {
                let pattern = literal::text_of(pattern);
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|err| CompileError::InvalidRegex {
                        pattern: pattern.clone(),
                        message: err.to_string(),
                    })?;
                let subject = coerce(self.lower_expr(lhs)?, ValueType::String)?;
                Ok(typed(
                    ExprKind::RegexMatch {
                        subject: Box::new(subject),
                        regex: Arc::new(regex),
                        negated,
                    },
                    ValueType::Bool,
                ))
            }
            Expr::Path(path) if path.len() == 1 => {
                let acl = self.symbols.acls.resolve(&path[0])?.clone();
                let subject = self.lower_expr(lhs)?;
                let subject = match subject.ty {
                    ValueType::Ip => subject,
                    ValueType::String => typed(
                        ExprKind::Convert {
                            expr: Box::new(subject),
                            conversion: Conversion::ToIp,
                        },
                        ValueType::Ip,
                    ),
                    other => {
                        return Err(CompileError::InvalidOperands {
                            op: op.symbol().to_string(),
                            operands: format!("{other} and ACL"),
                        });
                    }
                };
                Ok(typed(
                    ExprKind::AclMatch {
                        subject: Box::new(subject),
                        acl,
                        negated,
                    },
                    ValueType::Bool,
                ))
            }
            _ => Err(CompileError::InvalidOperands {
                op: op.symbol().to_string(),
                operands: "an expression other than a pattern or ACL name".to_string(),
            }),
        }
    }

    /// Type-check a binary operation, inserting conversions and folding
    /// constant operands.
    fn combine(&self, op: BinaryOp, lhs: TypedExpr, rhs: TypedExpr) -> Result<TypedExpr> {
        use ValueType::*;
        let (l, r) = (lhs.ty, rhs.ty);
        let numeric = l.is_numeric() && r.is_numeric();
        let numeric_result = if l == Integer && r == Integer {
            Integer
        } else {
            Float
        };

        let (lhs, rhs, ty) = match op {
            BinaryOp::Or | BinaryOp::And => (coerce(lhs, Bool)?, coerce(rhs, Bool)?, Bool),
            BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd => match (l, r) {
                (Bool, Bool) => (lhs, rhs, Bool),
                (Integer, Integer) => (lhs, rhs, Integer),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Eq | BinaryOp::Ne => {
                if l == r {
                    (lhs, rhs, Bool)
                } else if numeric {
                    (coerce(lhs, Float)?, coerce(rhs, Float)?, Bool)
                } else {
                    (coerce(lhs, String)?, coerce(rhs, String)?, Bool)
                }
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                if numeric && l != r {
                    (coerce(lhs, Float)?, coerce(rhs, Float)?, Bool)
                } else if l == r && matches!(l, Integer | Float | Duration | Time | String) {
                    (lhs, rhs, Bool)
                } else {
                    return Err(invalid_operands(op, l, r));
                }
            }
            BinaryOp::Add => match (l, r) {
                (String, _) | (_, String) => (coerce(lhs, String)?, coerce(rhs, String)?, String),
                _ if numeric => (
                    coerce(lhs, numeric_result)?,
                    coerce(rhs, numeric_result)?,
                    numeric_result,
                ),
                (Duration, Duration) => (lhs, rhs, Duration),
                (Time, Duration) | (Duration, Time) => (lhs, rhs, Time),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Sub => match (l, r) {
                _ if numeric => (
                    coerce(lhs, numeric_result)?,
                    coerce(rhs, numeric_result)?,
                    numeric_result,
                ),
                (Duration, Duration) | (Time, Time) => (lhs, rhs, Duration),
                (Time, Duration) => (lhs, rhs, Time),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Mul => match (l, r) {
                _ if numeric => (
                    coerce(lhs, numeric_result)?,
                    coerce(rhs, numeric_result)?,
                    numeric_result,
                ),
                (Duration, Integer | Float) | (Integer | Float, Duration) => (lhs, rhs, Duration),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Div => match (l, r) {
                _ if numeric => (
                    coerce(lhs, numeric_result)?,
                    coerce(rhs, numeric_result)?,
                    numeric_result,
                ),
                (Duration, Integer | Float) => (lhs, rhs, Duration),
                (Duration, Duration) => (lhs, rhs, Float),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Rem => match (l, r) {
                (Integer, Integer) => (lhs, rhs, Integer),
                _ => return Err(invalid_operands(op, l, r)),
            },
            BinaryOp::Match | BinaryOp::NotMatch => return Err(invalid_operands(op, l, r)),
        };

        if let (ExprKind::Const(a), ExprKind::Const(b)) = (&lhs.kind, &rhs.kind) {
            if let Ok(folded) = eval_binary(op, a, b) {
                return Ok(TypedExpr::constant(folded));
            }
        }
        Ok(typed(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::ast::Declaration;
    use crate::interpreter::parser::parse_source;
    use crate::runtime::acl::{AclBuilder, AclEntry};
    use crate::runtime::backend::BackendSpec;
    use crate::runtime::probe::ProbeSpec;

    struct Fixture {
        backends: Registry<Arc<Backend>>,
        acls: Registry<Arc<Acl>>,
        custom: Registry<usize>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut backends = Registry::new(DeclKind::Backend);
            let mut spec = BackendSpec::new("web");
            spec.host = "127.0.0.1".into();
            backends
                .insert("web", Arc::new(Backend::new(spec, ProbeSpec::default())))
                .unwrap();
            let mut acls = Registry::new(DeclKind::Acl);
            let acl = AclBuilder::new()
                .include(AclEntry::subnet("10.0.0.0/8").unwrap())
                .build("office");
            acls.insert("office", Arc::new(acl)).unwrap();
            let mut custom = Registry::new(DeclKind::Subroutine);
            custom.insert("helper", 0).unwrap();
            Self {
                backends,
                acls,
                custom,
            }
        }

        fn lower(&self, src: &str) -> Result<Subroutine> {
            let unit = parse_source("lower.vcl", src)?;
            let Some(Declaration::Sub(sub)) = unit.declarations.first() else {
                panic!("sub expected");
            };
            let symbols = Symbols {
                backends: &self.backends,
                acls: &self.acls,
                custom: &self.custom,
            };
            lower_subroutine(
                symbols,
                &sub.name,
                SystemHook::from_name(&sub.name),
                &[sub.body.as_slice()],
            )
        }
    }

    #[test]
    fn hooks_end_in_fallback_and_custom_subs_in_noop() {
        let fixture = Fixture::new();
        let hook = fixture.lower("sub vcl_recv { }").unwrap();
        assert!(matches!(hook.body.last(), Some(Stmt::Fallback)));
        let custom = fixture.lower("sub other { }").unwrap();
        assert!(matches!(
            custom.body.last(),
            Some(Stmt::Return(VclAction::NoOp))
        ));
    }

    #[test]
    fn unknown_objects_and_members_are_compile_errors() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture
                .lower("sub vcl_recv { set foo.bar = 1; }")
                .unwrap_err(),
            CompileError::UnknownObject("foo.bar".into())
        );
        assert_eq!(
            fixture
                .lower("sub vcl_recv { set req.colour = \"red\"; }")
                .unwrap_err(),
            CompileError::UnknownMember {
                object: "req".into(),
                member: "colour".into()
            }
        );
    }

    #[test]
    fn read_only_members_cannot_be_assigned() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture
                .lower("sub vcl_recv { set req.xid = \"x\"; }")
                .unwrap_err(),
            CompileError::ReadOnly("req.xid".into())
        );
        assert!(fixture
            .lower("sub vcl_deliver { set obj.http.x = \"y\"; }")
            .is_err());
    }

    #[test]
    fn conversion_table() {
        let fixture = Fixture::new();
        // int and string to bool, anything to string
        fixture
            .lower(
                r#"sub vcl_recv { var BOOL b; set b = 1; set b = "yes"; set req.http.x = 5s; }"#,
            )
            .unwrap();
        assert_eq!(
            fixture
                .lower("sub vcl_recv { var INT n; set n = \"7\"; }")
                .unwrap_err(),
            CompileError::InvalidCast {
                from: ValueType::String,
                to: ValueType::Integer
            }
        );
        assert!(fixture
            .lower("sub vcl_recv { var RTIME d; set d = 10; }")
            .is_err());
    }

    #[test]
    fn redeclaration_checks_enclosing_scopes() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture
                .lower("sub vcl_recv { var INT n; if (true) { var STRING n; } }")
                .unwrap_err(),
            CompileError::Redeclared("n".into())
        );
        // Sibling scopes may reuse a name.
        let sub = fixture
            .lower("sub vcl_recv { { var INT n; } { var STRING n; } }")
            .unwrap();
        assert_eq!(sub.locals, vec![ValueType::Integer, ValueType::String]);
    }

    #[test]
    fn variables_are_scoped_to_their_block() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture
                .lower("sub vcl_recv { { var INT n; } set n = 1; }")
                .unwrap_err(),
            CompileError::UnknownObject("n".into())
        );
    }

    #[test]
    fn call_targets_are_checked() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.lower("sub vcl_recv { call vcl_hash; }").unwrap_err(),
            CompileError::ReservedCall("vcl_hash".into())
        );
        assert!(matches!(
            fixture.lower("sub vcl_recv { call nothing; }").unwrap_err(),
            CompileError::UnknownReference {
                kind: DeclKind::Subroutine,
                ..
            }
        ));
        let sub = fixture.lower("sub vcl_recv { call HELPER; }").unwrap();
        assert!(matches!(sub.body[0], Stmt::Call { sub: 0 }));
    }

    #[test]
    fn match_operands() {
        let fixture = Fixture::new();
        fixture
            .lower(r#"sub vcl_recv { if (client.ip ~ office && req.http.x-ip !~ office && req.url ~ "^/a") { return (pass); } }"#)
            .unwrap();
        assert!(matches!(
            fixture
                .lower("sub vcl_recv { if (req.restarts ~ office) { return (pass); } }")
                .unwrap_err(),
            CompileError::InvalidOperands { .. }
        ));
        assert!(matches!(
            fixture
                .lower("sub vcl_recv { if (client.ip ~ nowhere) { return (pass); } }")
                .unwrap_err(),
            CompileError::UnknownReference {
                kind: DeclKind::Acl,
                ..
            }
        ));
        assert!(matches!(
            fixture
                .lower(r#"sub vcl_recv { if (req.url ~ "(") { return (pass); } }"#)
                .unwrap_err(),
            CompileError::InvalidRegex { .. }
        ));
    }

    #[test]
    fn constants_fold_and_backends_resolve() {
        let fixture = Fixture::new();
        let sub = fixture
            .lower(r#"sub vcl_recv { set req.http.x = "a" + 1 + 2; set req.backend_hint = web; }"#)
            .unwrap();
        let Stmt::Assign { value, .. } = &sub.body[0] else {
            panic!("assign expected");
        };
        assert!(matches!(&value.kind, ExprKind::Const(Value::String(s)) if s == "a12"));
        let Stmt::Assign { value, .. } = &sub.body[1] else {
            panic!("assign expected");
        };
        assert!(matches!(&value.kind, ExprKind::Const(Value::Backend(name)) if name == "web"));
    }

    #[test]
    fn operator_type_errors() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture
                .lower(r#"sub vcl_recv { if ("a" & 1) { return (pass); } }"#)
                .unwrap_err(),
            CompileError::InvalidOperands { .. }
        ));
        assert!(matches!(
            fixture
                .lower(r#"sub vcl_recv { if (req.url < 3) { return (pass); } }"#)
                .unwrap_err(),
            CompileError::InvalidOperands { .. }
        ));
    }

    #[test]
    fn returns_and_errors() {
        let fixture = Fixture::new();
        let sub = fixture
            .lower(r#"sub vcl_recv { error 404; return (synth(403, "No")); return (hit-for-pass); }"#)
            .unwrap();
        assert!(matches!(
            &sub.body[0],
            Stmt::Error { status: 404, reason } if reason == "Not Found"
        ));
        assert!(matches!(&sub.body[1], Stmt::Synth { reason: Some(_), .. }));
        assert!(matches!(
            &sub.body[2],
            Stmt::Return(VclAction::HitForPass)
        ));
        assert_eq!(
            fixture
                .lower("sub vcl_recv { return (teleport); }")
                .unwrap_err(),
            CompileError::UnknownReturn("teleport".into())
        );
    }
}
