//! Compiler driver
//!
//! Expands includes, then turns declarations into a [`CompiledProgram`]:
//! probes, backends, ACLs, and lowered subroutines.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::runtime::acl::{DnsCache, HostResolver};
use crate::runtime::backend::Backend;
use crate::runtime::probe::ProbeSpec;
use crate::runtime::storage::FileProvider;

use super::ast::{Declaration, SourceUnit, Statement, SubDecl};
use super::ir::{CompiledProgram, SystemHook};
use super::literal;
use super::lower::{Symbols, lower_subroutine};
use super::objects::{compile_acl, compile_backend, compile_probe};
use super::parser::parse_source;
use super::{CompileError, Result};

/// Knobs that affect compilation.
#[derive(Clone, Default)]
pub struct CompileOptions {
    /// Resolver used by ACL host entries. When unset, the program gets a
    /// fresh [`DnsCache`] that the runtime refreshes in the background.
    pub resolver: Option<Arc<dyn HostResolver>>,
}

/// Compiler driver.
///
/// Resolves includes through an optional [`FileProvider`], caches parse
/// trees by content digest, then compiles named objects and subroutines in
/// dependency order: probes, backends, ACLs, subroutines.
pub struct Compiler {
    options: CompileOptions,
    provider: Option<Arc<dyn FileProvider>>,
    parsed: Mutex<HashMap<blake3::Hash, Arc<SourceUnit>>>,
}

impl Compiler {
    /// Compiler without an include provider.
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            provider: None,
            parsed: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `include` declarations through `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn FileProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Number of distinct sources parsed so far.
    pub fn cached_units(&self) -> usize {
        self.parsed.lock().len()
    }

    /// Load `name` from the provider and compile it.
    pub fn compile_file(&self, name: &str) -> Result<CompiledProgram> {
        let source = self.load(name)?;
        self.compile(name, &source)
    }

    /// Compile `source`, registered under `name`.
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledProgram> {
        let root = self.parse(name, source)?;
        let mut units = vec![name.to_string()];
        let mut declarations = Vec::new();
        self.expand(&root, &mut units, &mut declarations)?;

        let mut program = CompiledProgram::empty();
        program.units = units;

        for decl in &declarations {
            if let Declaration::Probe(probe) = decl {
                program.probes.insert(&probe.name, compile_probe(probe)?)?;
            }
        }
        if !program.probes.contains("default") {
            program.probes.insert("default", ProbeSpec::new("default"))?;
        }

        for decl in &declarations {
            if let Declaration::Backend(backend) = decl {
                let (spec, probe) = compile_backend(backend, &program.probes)?;
                program
                    .backends
                    .insert(&backend.name, Arc::new(Backend::new(spec, probe)))?;
            }
        }

        let resolver: Arc<dyn HostResolver> = match &self.options.resolver {
            Some(resolver) => resolver.clone(),
            None => {
                let dns = Arc::new(DnsCache::default());
                program.dns = Some(dns.clone());
                dns
            }
        };
        for decl in &declarations {
            if let Declaration::Acl(acl) = decl {
                let compiled = compile_acl(acl, Some(resolver.clone()))?;
                program.acls.insert(&acl.name, Arc::new(compiled))?;
            }
        }

        let mut custom: Vec<&SubDecl> = Vec::new();
        let mut hooks: Vec<(SystemHook, Vec<&[Statement]>)> = Vec::new();
        for decl in &declarations {
            let Declaration::Sub(sub) = decl else {
                continue;
            };
            match SystemHook::from_name(&sub.name) {
                Some(hook) => match hooks.iter_mut().find(|(seen, _)| *seen == hook) {
                    Some((_, bodies)) => bodies.push(sub.body.as_slice()),
                    None => hooks.push((hook, vec![sub.body.as_slice()])),
                },
                None => {
                    program.custom.insert(&sub.name, custom.len())?;
                    custom.push(sub);
                }
            }
        }

        let symbols = Symbols {
            backends: &program.backends,
            acls: &program.acls,
            custom: &program.custom,
        };
        let mut subroutines = Vec::with_capacity(custom.len() + hooks.len());
        for sub in &custom {
            subroutines.push(lower_subroutine(symbols, &sub.name, None, &[sub.body.as_slice()])?);
        }
        let mut hook_index = HashMap::new();
        for (hook, bodies) in &hooks {
            hook_index.insert(*hook, subroutines.len());
            subroutines.push(lower_subroutine(symbols, hook.name(), Some(*hook), bodies)?);
        }
        program.subroutines = subroutines;
        program.hooks = hook_index;

        info!(
            unit = name,
            includes = program.units.len() - 1,
            backends = program.backends.len(),
            acls = program.acls.len(),
            subroutines = program.subroutines.len(),
            "policy compiled"
        );
        Ok(program)
    }

    fn load(&self, name: &str) -> Result<String> {
        let provider = self.provider.as_ref().ok_or_else(|| CompileError::Include {
            name: name.to_string(),
            message: "no file provider configured".to_string(),
        })?;
        provider
            .read_source(name)
            .map_err(|err| CompileError::Include {
                name: name.to_string(),
                message: format!("{err:#}"),
            })
    }

    fn parse(&self, name: &str, source: &str) -> Result<Arc<SourceUnit>> {
        let digest = blake3::hash(source.as_bytes());
        if let Some(unit) = self.parsed.lock().get(&digest) {
            debug!(unit = name, "parse cache hit");
            return Ok(unit.clone());
        }
        let unit = Arc::new(parse_source(name, source)?);
        self.parsed.lock().insert(digest, unit.clone());
        Ok(unit)
    }

    /// Splice included units in place. Each name is loaded at most once,
    /// which also breaks include cycles.
    fn expand(
        &self,
        unit: &SourceUnit,
        seen: &mut Vec<String>,
        out: &mut Vec<Declaration>,
    ) -> Result<()> {
        for decl in &unit.declarations {
            let Declaration::Include(target) = decl else {
                out.push(decl.clone());
                continue;
            };
            let name = literal::text_of(target);
            if seen.contains(&name) {
                debug!(include = %name, "include already loaded");
                continue;
            }
            seen.push(name.clone());
            let source = self.load(&name)?;
            let included = self.parse(&name, &source)?;
            self.expand(&included, seen, out)?;
        }
        Ok(())
    }
}

/// Compile a single self-contained source with default options.
pub fn compile_source(name: &str, source: &str) -> Result<CompiledProgram> {
    Compiler::new(CompileOptions::default()).compile(name, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::registry::DeclKind;
    use crate::runtime::storage::MemoryFileProvider;

    #[test]
    fn default_probe_is_injected_once() {
        let program = compile_source("main.vcl", "").unwrap();
        assert!(program.probes.contains("default"));

        let program = compile_source(
            "main.vcl",
            "probe default { .window = 4; } backend b { .host = \"h\"; }",
        )
        .unwrap();
        assert_eq!(program.probes.len(), 1);
        assert_eq!(program.backend("b").unwrap().probe().spec().window, 4);
    }

    #[test]
    fn duplicate_backend_aborts_compilation() {
        let err = compile_source(
            "main.vcl",
            r#"backend b { .host = "a"; } backend B { .host = "c"; }"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::DuplicateName {
                kind: DeclKind::Backend,
                name: "B".into()
            }
        );
        assert_eq!(err.to_string(), "Backend name is not unique: B");
    }

    #[test]
    fn repeated_hooks_run_in_declaration_order() {
        let program = compile_source(
            "main.vcl",
            r#"
            sub vcl_recv { set req.http.a = "1"; }
            sub helper { }
            sub vcl_recv { set req.http.b = "2"; }
            "#,
        )
        .unwrap();
        let recv = program.hook(SystemHook::Recv).unwrap();
        // two assignments plus the trailing fallback
        assert_eq!(recv.body.len(), 3);
        assert_eq!(program.custom_sub("helper").unwrap().0, 0);
    }

    #[test]
    fn legacy_fetch_hook_name() {
        let program = compile_source("main.vcl", "sub vcl_fetch { return (deliver); }").unwrap();
        assert_eq!(
            program.hook(SystemHook::BackendResponse).unwrap().name,
            "vcl_backend_response"
        );
    }

    #[test]
    fn includes_are_loaded_once_and_cycles_terminate() {
        let provider = MemoryFileProvider::new()
            .with_file("a.vcl", "include \"b.vcl\"; acl a { \"10.0.0.1\"; }")
            .with_file("b.vcl", "include \"a.vcl\"; backend web { .host = \"h\"; }");
        let compiler = Compiler::new(CompileOptions::default()).with_provider(Arc::new(provider));
        let program = compiler
            .compile(
                "main.vcl",
                "include \"a.vcl\"; include \"b.vcl\"; sub vcl_recv { if (client.ip ~ a) { set req.backend_hint = web; } }",
            )
            .unwrap();
        assert_eq!(program.units, vec!["main.vcl", "a.vcl", "b.vcl"]);
        assert_eq!(program.backends.len(), 1);
        assert_eq!(compiler.cached_units(), 3);
    }

    #[test]
    fn include_without_provider_fails() {
        let err = compile_source("main.vcl", "include \"x.vcl\";").unwrap_err();
        assert!(matches!(err, CompileError::Include { name, .. } if name == "x.vcl"));
    }

    #[test]
    fn identical_sources_are_parsed_once() {
        let compiler = Compiler::new(CompileOptions::default());
        compiler.compile("one.vcl", "sub vcl_recv { }").unwrap();
        compiler.compile("two.vcl", "sub vcl_recv { }").unwrap();
        assert_eq!(compiler.cached_units(), 1);
    }
}
