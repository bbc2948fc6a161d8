//! Named-object compilers for `probe`, `backend` and `acl` declarations.
//!
//! Declaration fields are bound through explicit setter tables keyed by the
//! normalized field name (underscores removed, lower-cased). A field missing
//! from the table is a compile error.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::acl::{Acl, AclBuilder, AclEntry, HostResolver};
use crate::runtime::backend::BackendSpec;
use crate::runtime::probe::ProbeSpec;

use super::ast::{AclDecl, FieldAssign, FieldValue, Literal, ObjectDecl};
use super::literal::{self, lower_literal};
use super::registry::{DeclKind, Registry};
use super::value::{Value, ValueType};
use super::{CompileError, Result};

type ProbeSetter = fn(&mut ProbeSpec, Value) -> Result<()>;
type BackendSetter = fn(&mut BackendSpec, Value) -> Result<()>;

/// Strip underscores and lower-case a field name.
pub fn normalize_field(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn cast_error(value: &Value, to: ValueType) -> CompileError {
    CompileError::InvalidCast {
        from: value.ty(),
        to,
    }
}

fn as_string(value: Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(cast_error(&other, ValueType::String)),
    }
}

fn as_u32(value: Value) -> Result<u32> {
    match value {
        Value::Integer(num) => u32::try_from(num).map_err(|_| CompileError::InvalidLiteral {
            kind: "non-negative integer",
            text: num.to_string(),
        }),
        other => Err(cast_error(&other, ValueType::Integer)),
    }
}

fn as_duration(value: Value) -> Result<Duration> {
    match value {
        Value::Duration(d) => Ok(literal::to_std(d)),
        other => Err(cast_error(&other, ValueType::Duration)),
    }
}

fn as_status(value: Value) -> Result<u16> {
    let code = as_u32(value)?;
    u16::try_from(code)
        .ok()
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| CompileError::InvalidLiteral {
            kind: "status code",
            text: code.to_string(),
        })
}

fn as_port(value: Value) -> Result<u16> {
    let text = match value {
        Value::Integer(num) => num.to_string(),
        Value::String(text) => text,
        other => return Err(cast_error(&other, ValueType::Integer)),
    };
    text.trim()
        .parse::<u16>()
        .map_err(|_| CompileError::InvalidLiteral { kind: "port", text })
}

static PROBE_FIELDS: Lazy<HashMap<&'static str, ProbeSetter>> = Lazy::new(|| {
    let mut fields: HashMap<&'static str, ProbeSetter> = HashMap::new();
    fields.insert("url", |probe, value| {
        probe.url = as_string(value)?;
        Ok(())
    });
    fields.insert("expectedresponse", |probe, value| {
        probe.expected_response = as_status(value)?;
        Ok(())
    });
    fields.insert("timeout", |probe, value| {
        probe.timeout = as_duration(value)?;
        Ok(())
    });
    fields.insert("interval", |probe, value| {
        probe.interval = as_duration(value)?;
        Ok(())
    });
    fields.insert("window", |probe, value| {
        probe.window = as_u32(value)?;
        Ok(())
    });
    fields.insert("threshold", |probe, value| {
        probe.threshold = as_u32(value)?;
        Ok(())
    });
    fields.insert("initial", |probe, value| {
        probe.initial = Some(as_u32(value)?);
        Ok(())
    });
    fields
});

static BACKEND_FIELDS: Lazy<HashMap<&'static str, BackendSetter>> = Lazy::new(|| {
    let mut fields: HashMap<&'static str, BackendSetter> = HashMap::new();
    fields.insert("host", |backend, value| {
        backend.host = as_string(value)?;
        Ok(())
    });
    fields.insert("port", |backend, value| {
        backend.port = as_port(value)?;
        Ok(())
    });
    fields.insert("hostheader", |backend, value| {
        backend.host_header = Some(as_string(value)?);
        Ok(())
    });
    fields.insert("connecttimeout", |backend, value| {
        backend.connect_timeout = as_duration(value)?;
        Ok(())
    });
    fields.insert("firstbytetimeout", |backend, value| {
        backend.first_byte_timeout = as_duration(value)?;
        Ok(())
    });
    fields.insert("betweenbytestimeout", |backend, value| {
        backend.between_bytes_timeout = as_duration(value)?;
        Ok(())
    });
    fields.insert("maxconnections", |backend, value| {
        backend.max_connections = Some(as_u32(value)?);
        Ok(())
    });
    fields
});

fn literal_of<'a>(kind: DeclKind, field: &'a FieldAssign) -> Result<&'a Literal> {
    match &field.value {
        FieldValue::Literal(lit) => Ok(lit),
        FieldValue::Name(name) => Err(CompileError::InvalidLiteral {
            kind: "field value",
            text: format!("{kind} .{} = {name}", field.name),
        }),
        FieldValue::Inline(_) => Err(CompileError::InvalidLiteral {
            kind: "field value",
            text: format!("{kind} .{} = {{...}}", field.name),
        }),
    }
}

/// Apply `.field = value;` lines to a probe.
pub fn apply_probe_fields(probe: &mut ProbeSpec, fields: &[FieldAssign]) -> Result<()> {
    for field in fields {
        let key = normalize_field(&field.name);
        let setter = PROBE_FIELDS
            .get(key.as_str())
            .ok_or_else(|| CompileError::UnknownField {
                kind: DeclKind::Probe,
                field: field.name.clone(),
            })?;
        let value = lower_literal(literal_of(DeclKind::Probe, field)?)?;
        setter(probe, value)?;
    }
    Ok(())
}

/// Compile a named `probe` declaration.
pub fn compile_probe(decl: &ObjectDecl) -> Result<ProbeSpec> {
    let mut probe = ProbeSpec::new(decl.name.clone());
    apply_probe_fields(&mut probe, &decl.fields)?;
    Ok(probe)
}

/// Compile a `backend` declaration and resolve the probe it uses.
///
/// Named probes are copied out of `probes`; inline probes are compiled here
/// and tagged with the backend's name. Backends without a probe get a copy
/// of `default`.
pub fn compile_backend(
    decl: &ObjectDecl,
    probes: &Registry<ProbeSpec>,
) -> Result<(BackendSpec, ProbeSpec)> {
    let mut backend = BackendSpec::new(decl.name.clone());
    let mut probe = None;

    for field in &decl.fields {
        let key = normalize_field(&field.name);
        if key == "probe" {
            probe = Some(match &field.value {
                FieldValue::Name(name) => probes.resolve(name)?.clone(),
                FieldValue::Literal(lit) => probes.resolve(&literal::text_of(lit))?.clone(),
                FieldValue::Inline(fields) => {
                    let mut inline = ProbeSpec::new(format!("{}.probe", decl.name));
                    inline.owner = Some(decl.name.clone());
                    apply_probe_fields(&mut inline, fields)?;
                    inline
                }
            });
            continue;
        }

        let setter = BACKEND_FIELDS
            .get(key.as_str())
            .ok_or_else(|| CompileError::UnknownField {
                kind: DeclKind::Backend,
                field: field.name.clone(),
            })?;
        let value = lower_literal(literal_of(DeclKind::Backend, field)?)?;
        setter(&mut backend, value)?;
    }

    if backend.host.trim().is_empty() {
        return Err(CompileError::MissingField {
            kind: DeclKind::Backend,
            name: decl.name.clone(),
            field: "host",
        });
    }

    let probe = match probe {
        Some(probe) => probe,
        None => probes.resolve("default")?.clone(),
    };
    Ok((backend, probe))
}

/// Compile an `acl` declaration into a frozen [`Acl`].
pub fn compile_acl(decl: &AclDecl, resolver: Option<Arc<dyn HostResolver>>) -> Result<Acl> {
    let mut builder = AclBuilder::new();
    if let Some(resolver) = resolver {
        builder = builder.resolver(resolver);
    }
    for line in &decl.entries {
        let text = literal::text_of(&line.text);
        let entry = match &line.mask {
            Some(mask) => AclEntry::subnet(&format!("{text}/{mask}"))?,
            None => AclEntry::parse(&text, line.ignorable)?,
        };
        builder = builder.entry(entry, line.negated);
    }
    Ok(builder.build(decl.name.clone()))
}
