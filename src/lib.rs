//! vclcore – a VCL policy compiler and request-processing engine
//!
//! This crate implements the core of an HTTP caching proxy:
//! - A compiler from VCL policy source to a typed, directly executable IR
//! - Named probes, backends and access-control lists built at compile time
//! - Frontend and backend state machines validated against static
//!   transition tables
//! - A pluggable object cache, backend transport and health monitor

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Policy compiler: parser, named-object compilers and IR lowering
pub mod interpreter;

/// Request-processing runtime built around the compiled policy
pub mod runtime;

// Re-export key types for convenience
pub use interpreter::{CompileError, CompiledProgram, Compiler, compile_source};
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of vclcore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
