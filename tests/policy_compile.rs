use std::fs;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vclcore::interpreter::{CompileOptions, Compiler, DeclKind, SystemHook, compile_source};
use vclcore::runtime::acl::HostResolver;
use vclcore::runtime::probe::Probe;
use vclcore::runtime::storage::DirectoryFileProvider;
use vclcore::CompileError;

struct NoDns;

impl HostResolver for NoDns {
    fn resolve(&self, _host: &str) -> Vec<IpAddr> {
        Vec::new()
    }
}

#[test]
fn named_probe_fields_are_applied() {
    let program = compile_source(
        "probe.vcl",
        r#"probe myprobe { .url="/health"; .window=10; .expected_response=201; .timeout=5s; .interval=1m; .threshold=7; .initial=6; }"#,
    )
    .unwrap();

    let spec = program.probes.get("myprobe").unwrap();
    assert_eq!(spec.url, "/health");
    assert_eq!(spec.expected_response, 201);
    assert_eq!(spec.window, 10);
    assert_eq!(spec.threshold, 7);
    assert_eq!(spec.initial, Some(6));
    assert_eq!(spec.timeout, Duration::from_secs(5));
    assert_eq!(spec.interval, Duration::from_secs(60));

    let probe = Probe::new(spec.clone(), "b1");
    assert_eq!(probe.history(), vec![true; 6]);
    assert!(!probe.is_healthy());
}

#[test]
fn acl_includes_subnet_and_excludes_host() {
    let compiler = Compiler::new(CompileOptions {
        resolver: Some(Arc::new(NoDns)),
    });
    let program = compiler
        .compile(
            "acl.vcl",
            r#"acl office { "10.0.0.0/8"; !"badhost.example"; }"#,
        )
        .unwrap();

    let office = program.acls.get("OFFICE").unwrap();
    assert!(office.is_match("10.1.2.3".parse().unwrap()));
    assert!(!office.is_match("203.0.113.1".parse().unwrap()));
}

#[test]
fn duplicate_backend_is_rejected() {
    let err = compile_source(
        "dup.vcl",
        r#"
        backend b1 { .host = "127.0.0.1"; }
        backend b1 { .host = "127.0.0.2"; }
        "#,
    )
    .unwrap_err();

    assert!(matches!(
        err,
        CompileError::DuplicateName {
            kind: DeclKind::Backend,
            ..
        }
    ));
    assert!(err.to_string().contains("name is not unique"));
}

#[test]
fn backends_share_named_probes_but_not_history() {
    let program = compile_source(
        "shared.vcl",
        r#"
        probe health { .url = "/ping"; .threshold = 1; .initial = 1; }
        backend a { .host = "10.0.0.1"; .port = "8080"; .probe = health; }
        backend b { .host = "10.0.0.2"; .probe = health; }
        backend c { .host = "10.0.0.3"; .probe = { .url = "/inline"; }; }
        backend d { .host = "10.0.0.4"; }
        "#,
    )
    .unwrap();

    let a = program.backend("a").unwrap();
    let b = program.backend("b").unwrap();
    assert_eq!(a.spec().port, 8080);
    assert_eq!(a.probe().spec().url, "/ping");
    assert!(a.is_healthy() && b.is_healthy());

    a.probe().record(false);
    assert!(!a.is_healthy());
    assert!(b.is_healthy());

    let c = program.backend("c").unwrap();
    assert_eq!(c.probe().spec().name, "c.probe");
    assert_eq!(c.probe().spec().owner.as_deref(), Some("c"));

    let d = program.backend("d").unwrap();
    assert_eq!(d.probe().spec().name, "default");
    assert_eq!(
        program.backends.iter().map(|(name, _)| name).collect::<Vec<_>>(),
        ["a", "b", "c", "d"]
    );
}

#[test]
fn unknown_fields_and_references_fail() {
    let err = compile_source("x.vcl", r#"probe p { .colour = "red"; }"#).unwrap_err();
    assert!(matches!(err, CompileError::UnknownField { .. }));

    let err = compile_source("x.vcl", r#"backend b { .host = "h"; .probe = nope; }"#).unwrap_err();
    assert!(matches!(err, CompileError::UnknownReference { .. }));

    let err = compile_source("x.vcl", "sub vcl_recv { set req.nothing = 1; }").unwrap_err();
    assert!(matches!(err, CompileError::UnknownMember { .. }));

    let err = compile_source("x.vcl", "sub vcl_recv { call vcl_hash; }").unwrap_err();
    assert!(matches!(err, CompileError::ReservedCall(_)));
}

#[test]
fn includes_resolve_from_a_directory() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("main.vcl"),
        r#"
        include "backends.vcl";
        include "acls.vcl";
        sub vcl_recv {
            if (client.ip ~ internal) { set req.backend_hint = origin; }
        }
        "#,
    )
    .unwrap();
    fs::write(
        dir.path().join("backends.vcl"),
        r#"include "acls.vcl"; backend origin { .host = "127.0.0.1"; }"#,
    )
    .unwrap();
    fs::write(dir.path().join("acls.vcl"), r#"acl internal { "127.0.0.0"/8; }"#).unwrap();

    let compiler = Compiler::new(CompileOptions::default())
        .with_provider(Arc::new(DirectoryFileProvider::new(dir.path())));
    let program = compiler.compile_file("main.vcl").unwrap();

    assert_eq!(program.units, ["main.vcl", "backends.vcl", "acls.vcl"]);
    assert!(program.backend("origin").is_some());
    assert!(program.acls.contains("internal"));
    assert!(program.hook(SystemHook::Recv).is_some());
}

#[test]
fn missing_include_is_a_compile_error() {
    let dir = TempDir::new().unwrap();
    let compiler = Compiler::new(CompileOptions::default())
        .with_provider(Arc::new(DirectoryFileProvider::new(dir.path())));
    let err = compiler
        .compile("main.vcl", r#"include "absent.vcl";"#)
        .unwrap_err();
    assert!(matches!(err, CompileError::Include { ref name, .. } if name == "absent.vcl"));
}

#[test]
fn syntax_errors_report_position() {
    let err = compile_source("broken.vcl", "sub vcl_recv {\n  set req.url = ;\n}").unwrap_err();
    match err {
        CompileError::Syntax { unit, line, .. } => {
            assert_eq!(unit, "broken.vcl");
            assert_eq!(line, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
}
