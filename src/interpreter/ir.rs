use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::runtime::acl::{Acl, DnsCache};
use crate::runtime::backend::Backend;
use crate::runtime::probe::ProbeSpec;
use crate::runtime::state::VclAction;

use super::ast::BinaryOp;
use super::registry::{DeclKind, Registry};
use super::value::{Value, ValueType};

/// Fully compiled policy: named objects plus lowered subroutines.
#[derive(Debug)]
pub struct CompiledProgram {
    /// Probe templates, including the implicit `default`.
    pub probes: Registry<ProbeSpec>,
    /// Live backends in declaration order.
    pub backends: Registry<Arc<Backend>>,
    /// Frozen ACLs.
    pub acls: Registry<Arc<Acl>>,
    /// Every lowered subroutine; custom ones and hooks alike.
    pub subroutines: Vec<Subroutine>,
    /// Custom subroutine name to index in `subroutines`.
    pub custom: Registry<usize>,
    /// Hook to index in `subroutines`.
    pub hooks: HashMap<SystemHook, usize>,
    /// Units compiled, in the order they were first seen.
    pub units: Vec<String>,
    /// Shared snapshot answering ACL host entries, unless the compiler was
    /// given its own resolver.
    pub dns: Option<Arc<DnsCache>>,
}

impl CompiledProgram {
    /// Empty program.
    pub fn empty() -> Self {
        Self {
            probes: Registry::new(DeclKind::Probe),
            backends: Registry::new(DeclKind::Backend),
            acls: Registry::new(DeclKind::Acl),
            subroutines: Vec::new(),
            custom: Registry::new(DeclKind::Subroutine),
            hooks: HashMap::new(),
            units: Vec::new(),
            dns: None,
        }
    }

    /// Lowered body of `hook`, if the policy defines it.
    pub fn hook(&self, hook: SystemHook) -> Option<&Subroutine> {
        self.hooks.get(&hook).map(|index| &self.subroutines[*index])
    }

    /// Custom subroutine by name.
    pub fn custom_sub(&self, name: &str) -> Option<(usize, &Subroutine)> {
        let index = *self.custom.get(name)?;
        Some((index, &self.subroutines[index]))
    }

    /// Backend by name.
    pub fn backend(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.get(name)
    }

    /// Distinct host names referenced by ACL entries.
    pub fn acl_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .acls
            .iter()
            .flat_map(|(_, acl)| acl.hosts().map(str::to_string).collect::<Vec<_>>())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

/// Reserved subroutines invoked by the state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemHook {
    /// `vcl_init`
    Init,
    /// `vcl_recv`
    Recv,
    /// `vcl_hash`
    Hash,
    /// `vcl_pipe`
    Pipe,
    /// `vcl_pass`
    Pass,
    /// `vcl_hit`
    Hit,
    /// `vcl_miss`
    Miss,
    /// `vcl_deliver`
    Deliver,
    /// `vcl_purge`
    Purge,
    /// `vcl_synth`
    Synth,
    /// `vcl_error`
    Error,
    /// `vcl_backend_fetch`
    BackendFetch,
    /// `vcl_backend_response` (also `vcl_fetch`)
    BackendResponse,
    /// `vcl_backend_error`
    BackendError,
    /// `vcl_term`
    Term,
}

const HOOK_NAMES: &[(&str, SystemHook)] = &[
    ("vcl_init", SystemHook::Init),
    ("vcl_recv", SystemHook::Recv),
    ("vcl_hash", SystemHook::Hash),
    ("vcl_pipe", SystemHook::Pipe),
    ("vcl_pass", SystemHook::Pass),
    ("vcl_hit", SystemHook::Hit),
    ("vcl_miss", SystemHook::Miss),
    ("vcl_deliver", SystemHook::Deliver),
    ("vcl_purge", SystemHook::Purge),
    ("vcl_synth", SystemHook::Synth),
    ("vcl_error", SystemHook::Error),
    ("vcl_backend_fetch", SystemHook::BackendFetch),
    ("vcl_backend_response", SystemHook::BackendResponse),
    ("vcl_fetch", SystemHook::BackendResponse),
    ("vcl_backend_error", SystemHook::BackendError),
    ("vcl_term", SystemHook::Term),
];

impl SystemHook {
    /// Hook for a subroutine name; `None` means the sub is custom.
    pub fn from_name(name: &str) -> Option<SystemHook> {
        HOOK_NAMES
            .iter()
            .find(|(hook_name, _)| hook_name.eq_ignore_ascii_case(name))
            .map(|(_, hook)| *hook)
    }

    /// Canonical subroutine name.
    pub fn name(self) -> &'static str {
        HOOK_NAMES
            .iter()
            .find(|(_, hook)| *hook == self)
            .map(|(name, _)| *name)
            .unwrap_or("vcl_unknown")
    }

    /// Whether `name` uses the reserved system prefix.
    pub fn is_reserved(name: &str) -> bool {
        name.get(..4)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("vcl_"))
    }
}

/// One lowered subroutine.
#[derive(Debug, Clone)]
pub struct Subroutine {
    /// Name as declared.
    pub name: String,
    /// Set for reserved hooks.
    pub hook: Option<SystemHook>,
    /// Lowered statements, ending in a fallback or a no-op return.
    pub body: Vec<Stmt>,
    /// Types of local variable slots.
    pub locals: Vec<ValueType>,
}

/// Objects whose headers can be addressed with `<object>.http.<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderObject {
    /// `req`
    Req,
    /// `req_top`
    ReqTop,
    /// `bereq`
    Bereq,
    /// `beresp`
    Beresp,
    /// `obj`
    Obj,
    /// `resp`
    Resp,
}

impl HeaderObject {
    /// Object for a top-level identifier.
    pub fn from_name(name: &str) -> Option<HeaderObject> {
        match name {
            "req" => Some(HeaderObject::Req),
            "req_top" => Some(HeaderObject::ReqTop),
            "bereq" => Some(HeaderObject::Bereq),
            "beresp" => Some(HeaderObject::Beresp),
            "obj" => Some(HeaderObject::Obj),
            "resp" => Some(HeaderObject::Resp),
            _ => None,
        }
    }

    /// Source name.
    pub fn name(self) -> &'static str {
        match self {
            HeaderObject::Req => "req",
            HeaderObject::ReqTop => "req_top",
            HeaderObject::Bereq => "bereq",
            HeaderObject::Beresp => "beresp",
            HeaderObject::Obj => "obj",
            HeaderObject::Resp => "resp",
        }
    }

    /// Whether headers on this object can be modified.
    pub fn writable(self) -> bool {
        !matches!(self, HeaderObject::ReqTop | HeaderObject::Obj)
    }
}

/// Scalar members of the request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ContextField {
    Now,
    LocalIp,
    LocalEndpoint,
    LocalSocket,
    RemoteIp,
    ClientIp,
    ClientIdentity,
    ServerIp,
    ServerHostname,
    ServerIdentity,
    ServerPort,
    ReqMethod,
    ReqUrl,
    ReqProto,
    ReqHash,
    ReqBackendHint,
    ReqRestarts,
    ReqEsiLevel,
    ReqTtl,
    ReqXid,
    ReqCanGzip,
    ReqHashAlwaysMiss,
    ReqHashIgnoreBusy,
    ReqTopMethod,
    ReqTopUrl,
    ReqTopProto,
    BereqMethod,
    BereqUrl,
    BereqProto,
    BereqRetries,
    BereqBackend,
    BereqUncacheable,
    BerespStatus,
    BerespReason,
    BerespProto,
    BerespTtl,
    BerespUncacheable,
    BerespDoEsi,
    BerespBackend,
    ObjStatus,
    ObjReason,
    ObjProto,
    ObjTtl,
    ObjUncacheable,
    ObjDoEsi,
    ObjLastUsed,
    RespStatus,
    RespReason,
    RespProto,
    RespBody,
}

/// (object, normalized member, field). Members are matched after removing
/// underscores and lower-casing.
const FIELD_TABLE: &[(&str, &str, ContextField)] = &[
    ("local", "ip", ContextField::LocalIp),
    ("local", "endpoint", ContextField::LocalEndpoint),
    ("local", "socket", ContextField::LocalSocket),
    ("remote", "ip", ContextField::RemoteIp),
    ("client", "ip", ContextField::ClientIp),
    ("client", "identity", ContextField::ClientIdentity),
    ("server", "ip", ContextField::ServerIp),
    ("server", "hostname", ContextField::ServerHostname),
    ("server", "identity", ContextField::ServerIdentity),
    ("server", "port", ContextField::ServerPort),
    ("req", "method", ContextField::ReqMethod),
    ("req", "url", ContextField::ReqUrl),
    ("req", "proto", ContextField::ReqProto),
    ("req", "hash", ContextField::ReqHash),
    ("req", "backendhint", ContextField::ReqBackendHint),
    ("req", "backend", ContextField::ReqBackendHint),
    ("req", "restarts", ContextField::ReqRestarts),
    ("req", "esilevel", ContextField::ReqEsiLevel),
    ("req", "ttl", ContextField::ReqTtl),
    ("req", "xid", ContextField::ReqXid),
    ("req", "cangzip", ContextField::ReqCanGzip),
    ("req", "hashalwaysmiss", ContextField::ReqHashAlwaysMiss),
    ("req", "hashignorebusy", ContextField::ReqHashIgnoreBusy),
    ("req_top", "method", ContextField::ReqTopMethod),
    ("req_top", "url", ContextField::ReqTopUrl),
    ("req_top", "proto", ContextField::ReqTopProto),
    ("bereq", "method", ContextField::BereqMethod),
    ("bereq", "url", ContextField::BereqUrl),
    ("bereq", "proto", ContextField::BereqProto),
    ("bereq", "retries", ContextField::BereqRetries),
    ("bereq", "backend", ContextField::BereqBackend),
    ("bereq", "uncacheable", ContextField::BereqUncacheable),
    ("beresp", "status", ContextField::BerespStatus),
    ("beresp", "statuscode", ContextField::BerespStatus),
    ("beresp", "reason", ContextField::BerespReason),
    ("beresp", "description", ContextField::BerespReason),
    ("beresp", "proto", ContextField::BerespProto),
    ("beresp", "ttl", ContextField::BerespTtl),
    ("beresp", "uncacheable", ContextField::BerespUncacheable),
    ("beresp", "doesi", ContextField::BerespDoEsi),
    ("beresp", "backend", ContextField::BerespBackend),
    ("obj", "status", ContextField::ObjStatus),
    ("obj", "statuscode", ContextField::ObjStatus),
    ("obj", "reason", ContextField::ObjReason),
    ("obj", "description", ContextField::ObjReason),
    ("obj", "proto", ContextField::ObjProto),
    ("obj", "ttl", ContextField::ObjTtl),
    ("obj", "uncacheable", ContextField::ObjUncacheable),
    ("obj", "doesi", ContextField::ObjDoEsi),
    ("obj", "lastused", ContextField::ObjLastUsed),
    ("resp", "status", ContextField::RespStatus),
    ("resp", "statuscode", ContextField::RespStatus),
    ("resp", "reason", ContextField::RespReason),
    ("resp", "description", ContextField::RespReason),
    ("resp", "proto", ContextField::RespProto),
    ("resp", "body", ContextField::RespBody),
];

/// Top-level identifiers that name context objects.
pub const CONTEXT_OBJECTS: &[&str] = &[
    "local", "remote", "client", "server", "req", "req_top", "bereq", "beresp", "obj", "resp",
];

impl ContextField {
    /// Resolve `object.member`.
    pub fn lookup(object: &str, member: &str) -> Option<ContextField> {
        let member: String = member
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        FIELD_TABLE
            .iter()
            .find(|(obj, name, _)| *obj == object && *name == member)
            .map(|(_, _, field)| *field)
    }

    /// Static type of the member.
    pub fn ty(self) -> ValueType {
        use ContextField::*;
        match self {
            Now | ObjLastUsed => ValueType::Time,
            LocalIp | RemoteIp | ClientIp | ServerIp => ValueType::Ip,
            ServerPort | ReqRestarts | ReqEsiLevel | BereqRetries | BerespStatus | ObjStatus
            | RespStatus => ValueType::Integer,
            ReqTtl | BerespTtl | ObjTtl => ValueType::Duration,
            ReqCanGzip | ReqHashAlwaysMiss | ReqHashIgnoreBusy | BereqUncacheable
            | BerespUncacheable | BerespDoEsi | ObjUncacheable | ObjDoEsi => ValueType::Bool,
            ReqBackendHint | BereqBackend | BerespBackend => ValueType::Backend,
            LocalEndpoint | LocalSocket | ClientIdentity | ServerHostname | ServerIdentity
            | ReqMethod | ReqUrl | ReqProto | ReqHash | ReqXid | ReqTopMethod | ReqTopUrl
            | ReqTopProto | BereqMethod | BereqUrl | BereqProto | BerespReason | BerespProto
            | ObjReason | ObjProto | RespReason | RespProto | RespBody => ValueType::String,
        }
    }

    /// Whether policy code may assign the member.
    pub fn writable(self) -> bool {
        use ContextField::*;
        matches!(
            self,
            ClientIdentity
                | ReqMethod
                | ReqUrl
                | ReqProto
                | ReqBackendHint
                | ReqTtl
                | ReqHashAlwaysMiss
                | ReqHashIgnoreBusy
                | BereqMethod
                | BereqUrl
                | BereqProto
                | BereqBackend
                | BereqUncacheable
                | BerespStatus
                | BerespReason
                | BerespProto
                | BerespTtl
                | BerespUncacheable
                | BerespDoEsi
                | RespStatus
                | RespReason
                | RespProto
                | RespBody
        )
    }
}

/// Binary operators surviving lowering (match operators become dedicated nodes).
pub type BinOp = BinaryOp;

/// Runtime conversions inserted by the type checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Any value to its string form.
    ToString,
    /// Integer or string to boolean.
    ToBool,
    /// Integer to float.
    ToFloat,
    /// String to IP address; unparsable text yields `None` at match time.
    ToIp,
}

/// Expression with its static type.
#[derive(Debug, Clone)]
pub struct TypedExpr {
    /// Node.
    pub kind: ExprKind,
    /// Result type.
    pub ty: ValueType,
}

impl TypedExpr {
    /// Constant node.
    pub fn constant(value: Value) -> Self {
        Self {
            ty: value.ty(),
            kind: ExprKind::Const(value),
        }
    }
}

/// Expression nodes.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Literal or folded constant.
    Const(Value),
    /// Scalar context member.
    Field(ContextField),
    /// Header lookup; absent headers read as the empty string.
    Header {
        /// Owning object.
        object: HeaderObject,
        /// Header name.
        name: String,
    },
    /// Local variable slot.
    Local(usize),
    /// Boolean negation.
    Not(Box<TypedExpr>),
    /// Arithmetic negation.
    Negate(Box<TypedExpr>),
    /// Typed binary operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<TypedExpr>,
        /// Right operand.
        rhs: Box<TypedExpr>,
    },
    /// `cond ? then : otherwise`
    Conditional {
        /// Condition (BOOL).
        cond: Box<TypedExpr>,
        /// Value when true.
        then: Box<TypedExpr>,
        /// Value when false.
        otherwise: Box<TypedExpr>,
    },
    /// `subject ~ "regex"`
    RegexMatch {
        /// STRING subject.
        subject: Box<TypedExpr>,
        /// Precompiled pattern.
        regex: Arc<Regex>,
        /// `!~`
        negated: bool,
    },
    /// `subject ~ acl`
    AclMatch {
        /// IP or STRING subject.
        subject: Box<TypedExpr>,
        /// Resolved ACL.
        acl: Arc<Acl>,
        /// `!~`
        negated: bool,
    },
    /// Inserted conversion.
    Convert {
        /// Source expression.
        expr: Box<TypedExpr>,
        /// Conversion applied.
        conversion: Conversion,
    },
}

/// Assignable locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Place {
    /// Scalar member.
    Field(ContextField),
    /// Header on an object.
    Header {
        /// Owning object.
        object: HeaderObject,
        /// Header name.
        name: String,
    },
    /// Local slot.
    Local(usize),
}

/// Lowered statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Store a value.
    Assign {
        /// Target.
        place: Place,
        /// Value, already of the target's type.
        value: TypedExpr,
    },
    /// Remove a header or reset a member to its zero value.
    Unset(Place),
    /// Initialise a local slot.
    DeclareLocal {
        /// Slot.
        slot: usize,
        /// Zero value.
        value: Value,
    },
    /// if / else-if / else chain.
    If {
        /// Condition/body pairs in order.
        branches: Vec<(TypedExpr, Vec<Stmt>)>,
        /// Else body (possibly empty).
        otherwise: Vec<Stmt>,
    },
    /// Nested block.
    Block(Vec<Stmt>),
    /// Fold a value into the request hash.
    HashData(TypedExpr),
    /// Invoke a custom subroutine; a non-no-op result returns from the caller.
    Call {
        /// Index into `CompiledProgram::subroutines`.
        sub: usize,
    },
    /// Return an action.
    Return(VclAction),
    /// Set the response status line and return `synth`.
    Synth {
        /// INT status.
        status: TypedExpr,
        /// STRING reason, standard phrase when absent.
        reason: Option<TypedExpr>,
    },
    /// Set the response status line and return `delivercontent`.
    Error {
        /// Status code.
        status: i64,
        /// Description.
        reason: String,
    },
    /// Continue with the built-in behaviour of the enclosing hook.
    Fallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_names_include_legacy_fetch() {
        assert_eq!(SystemHook::from_name("VCL_RECV"), Some(SystemHook::Recv));
        assert_eq!(
            SystemHook::from_name("vcl_fetch"),
            Some(SystemHook::BackendResponse)
        );
        assert_eq!(SystemHook::BackendResponse.name(), "vcl_backend_response");
        assert_eq!(SystemHook::from_name("normalize"), None);
        assert!(SystemHook::is_reserved("vcl_custom"));
        assert!(!SystemHook::is_reserved("vcl"));
    }

    #[test]
    fn member_lookup_ignores_underscores() {
        assert_eq!(
            ContextField::lookup("req", "backend_hint"),
            Some(ContextField::ReqBackendHint)
        );
        assert_eq!(
            ContextField::lookup("beresp", "do_esi"),
            Some(ContextField::BerespDoEsi)
        );
        assert_eq!(ContextField::lookup("req", "nonsense"), None);
        assert!(!ContextField::ReqXid.writable());
        assert!(ContextField::RespBody.writable());
    }
}
