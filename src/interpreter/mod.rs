//! Policy compiler for the VCL dialect.
//!
//! Source text is parsed into an [`ast::SourceUnit`], named objects (probes,
//! backends, ACLs) are compiled into runtime values, and subroutines are
//! lowered into a typed IR that [`runtime`] executes directly against a
//! request context. Nothing is resolved by name at request time.

/// Parse tree for policy source.
pub mod ast;
/// Compiler driver: includes, pass ordering and handler assembly.
pub mod builder;
/// Typed intermediate representation.
pub mod ir;
/// Literal lowering and duration formatting.
pub mod literal;
/// Expression and statement lowering.
pub mod lower;
/// Probe, backend and ACL declaration compilers.
pub mod objects;
/// Recursive-descent parser.
pub mod parser;
/// Case-insensitive declaration registry.
pub mod registry;
/// IR executor.
pub mod runtime;
/// Runtime values and their types.
pub mod value;

pub use ast::SourceUnit;
pub use builder::{CompileOptions, Compiler, compile_source};
pub use ir::{CompiledProgram, Subroutine, SystemHook};
pub use parser::parse_source;
pub use registry::{DeclKind, Registry};
pub use runtime::Executor;
pub use value::{Value, ValueType};

use thiserror::Error;

/// Convenience result alias for compiler operations.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors raised while parsing or compiling policy source.
///
/// Compilation stops at the first error; no partial program is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The source does not parse.
    #[error("syntax error in {unit}: {message} at line {line}, column {column}")]
    Syntax {
        /// Source unit name.
        unit: String,
        /// What went wrong.
        message: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },

    /// A probe, backend, ACL or subroutine name was declared twice.
    #[error("{kind} name is not unique: {name}")]
    DuplicateName {
        /// Declaration category.
        kind: DeclKind,
        /// Offending name.
        name: String,
    },

    /// An identifier names no context object, local, or backend.
    #[error("Unable to determine top-level object: {0}")]
    UnknownObject(String),

    /// A member does not exist on a context object.
    #[error("context member not found: {object}.{member}")]
    UnknownMember {
        /// Context object.
        object: String,
        /// Member path.
        member: String,
    },

    /// A member exists but cannot be assigned.
    #[error("context member is read-only: {0}")]
    ReadOnly(String),

    /// A named reference could not be resolved.
    #[error("unknown {kind} reference: {name}")]
    UnknownReference {
        /// Declaration category.
        kind: DeclKind,
        /// Missing name.
        name: String,
    },

    /// A declaration field is not recognised for its object kind.
    #[error("unknown field .{field} on {kind}")]
    UnknownField {
        /// Declaration category.
        kind: DeclKind,
        /// Field as written.
        field: String,
    },

    /// A required declaration field is missing.
    #[error("{kind} {name} is missing required field .{field}")]
    MissingField {
        /// Declaration category.
        kind: DeclKind,
        /// Declared name.
        name: String,
        /// Missing field.
        field: &'static str,
    },

    /// A value cannot be converted to the required type.
    #[error("Invalid cast from {from} to {to}")]
    InvalidCast {
        /// Source type.
        from: ValueType,
        /// Target type.
        to: ValueType,
    },

    /// An operator was applied to operand types it does not support.
    #[error("operator {op} cannot be applied to {operands}")]
    InvalidOperands {
        /// Operator token.
        op: String,
        /// Operand type description.
        operands: String,
    },

    /// An operator token is not part of the language.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// A literal is malformed (duration, integer, subnet, status code...).
    #[error("malformed {kind} literal: {text}")]
    InvalidLiteral {
        /// Literal category.
        kind: &'static str,
        /// Literal text.
        text: String,
    },

    /// A regular expression failed to compile.
    #[error("invalid regular expression {pattern:?}: {message}")]
    InvalidRegex {
        /// Pattern text.
        pattern: String,
        /// Regex engine message.
        message: String,
    },

    /// `call` targeted a system hook.
    #[error("cannot call reserved subroutine {0}")]
    ReservedCall(String),

    /// A local variable was declared while already visible.
    #[error("variable {0} is already declared in this or an enclosing scope")]
    Redeclared(String),

    /// `var` used a type name the language does not have.
    #[error("unknown variable type: {0}")]
    UnknownType(String),

    /// `return(...)` named a state that does not exist.
    #[error("unknown return state: {0}")]
    UnknownReturn(String),

    /// An included file could not be loaded.
    #[error("unable to include {name}: {message}")]
    Include {
        /// Include name as written.
        name: String,
        /// Provider message.
        message: String,
    },
}
