//! vclcore CLI - Command-line interface for the policy engine
//!
//! Compiles a policy file and either summarises it or drives one request
//! through the engine against the declared backends.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vclcore::interpreter::{CompileOptions, CompiledProgram, Compiler};
use vclcore::runtime::cache::MemoryObjectCache;
use vclcore::runtime::context::InboundRequest;
use vclcore::runtime::storage::DirectoryFileProvider;
use vclcore::runtime::transport::HttpTransport;
use vclcore::runtime::{Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "vclcore")]
#[command(about = "VCL policy compiler and request engine", long_about = None)]
struct Cli {
    /// JSON runtime configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy and list what it declares
    Check {
        /// Policy file
        file: PathBuf,
    },

    /// Run one request through a policy
    Simulate {
        /// Policy file
        file: PathBuf,

        /// Request target
        #[arg(long, default_value = "/")]
        url: String,

        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Extra request headers as `Name: value`
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Write the effective runtime configuration as JSON
    InitConfig {
        /// Destination file
        path: PathBuf,
    },
}

fn compile(file: &Path) -> Result<CompiledProgram> {
    let root = file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid policy path {:?}", file))?;
    let compiler = Compiler::new(CompileOptions::default())
        .with_provider(Arc::new(DirectoryFileProvider::new(root)));
    compiler
        .compile_file(name)
        .with_context(|| format!("failed to compile {:?}", file))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Runtime::load_config(path)?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Check { file } => {
            let program = compile(&file)?;
            println!("Policy {:?} compiled", file);
            println!("  Units: {}", program.units.join(", "));
            for (name, probe) in program.probes.iter() {
                println!(
                    "  probe {} url={} expect={} window={} threshold={}",
                    name, probe.url, probe.expected_response, probe.window, probe.threshold
                );
            }
            for (name, backend) in program.backends.iter() {
                println!(
                    "  backend {} -> {} (probe {})",
                    name,
                    backend.base_url(),
                    backend.probe().spec().name
                );
            }
            for (name, acl) in program.acls.iter() {
                println!(
                    "  acl {} ({} include, {} exclude)",
                    name,
                    acl.include().len(),
                    acl.exclude().len()
                );
            }
            for sub in &program.subroutines {
                let kind = if sub.hook.is_some() { "hook" } else { "sub" };
                println!("  {} {} ({} locals)", kind, sub.name, sub.locals.len());
            }
        }

        Commands::Simulate {
            file,
            url,
            method,
            headers,
        } => {
            let program = compile(&file)?;
            let cache = MemoryObjectCache::new().with_max_entries(config.cache_max_entries);
            let runtime = Runtime::new(
                config,
                Arc::new(program),
                Arc::new(cache),
                Arc::new(HttpTransport::new()),
            )?;
            runtime.refresh_dns().await;

            let mut request = InboundRequest::new(method, url);
            for header in &headers {
                let (name, value) = header
                    .split_once(':')
                    .with_context(|| format!("header {:?} is not `Name: value`", header))?;
                request = request.with_header(name.trim(), value.trim());
            }

            let (response, outcome) = runtime.simulate(request).await?;
            println!("{} {} {}", response.proto, response.status, response.reason);
            for (name, value) in response.headers.iter() {
                println!("{}: {}", name, value);
            }
            println!();
            println!("{}", String::from_utf8_lossy(&response.body));
            println!();
            println!("Frontend: {:?}", outcome.trace);
            if !outcome.backend_trace.is_empty() {
                println!("Backend:  {:?}", outcome.backend_trace);
            }
        }

        Commands::InitConfig { path } => {
            Runtime::save_config(&path, &config)?;
            println!("Configuration written to {:?}", path);
        }
    }

    Ok(())
}
