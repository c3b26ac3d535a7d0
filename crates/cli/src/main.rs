use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keel_apply::{transform, ApplyOptions, DeleteOptions, Manifest, ManifestConfig, Outcome, PropagationPolicy};
use keel_patch::schema::SchemaRegistry;
use keel_source::PathSource;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Reconcile manifests against a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Cascade { Orphan, Background, Foreground }

#[derive(Args, Debug)]
struct ManifestArgs {
    /// Comma-separated manifest files, directories or http(s) URLs
    #[arg(short = 'f', long = "filename", env = "KEEL_FILENAME")]
    filename: String,
    /// Descend into subdirectories
    #[arg(short = 'R', long = "recursive", action = ArgAction::SetTrue)]
    recursive: bool,
    /// Put namespaced resources into this namespace
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Annotation holding the last-applied snapshot
    #[arg(long = "annotation", env = "KEEL_LAST_APPLIED_ANNOTATION")]
    annotation: Option<String>,
    /// Plain JSON merge patches even for kinds with known merge keys
    #[arg(long = "rfc7386", env = "KEEL_RFC7386", action = ArgAction::SetTrue)]
    rfc7386: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update every resource, in order
    Apply {
        #[command(flatten)]
        manifest: ManifestArgs,
        /// Overlay the manifest onto live objects when a merged update is rejected
        #[arg(long = "overwrite", action = ArgAction::SetTrue)]
        overwrite: bool,
        /// Server-side dry run
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        #[arg(long = "field-manager", default_value = "keel")]
        field_manager: String,
    },
    /// Delete every resource, in reverse order
    Delete {
        #[command(flatten)]
        manifest: ManifestArgs,
        #[arg(long = "grace-period")]
        grace_period: Option<u32>,
        #[arg(long = "cascade", value_enum)]
        cascade: Option<Cascade>,
        /// Server-side dry run
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Print the merge patches apply would send
    Diff {
        #[command(flatten)]
        manifest: ManifestArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Token cancelled on ctrl-c; resources already handled stay handled.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping after the current resource");
            child.cancel();
        }
    });
    token
}

async fn load(args: &ManifestArgs) -> Result<Manifest> {
    let source = PathSource::new(args.filename.clone()).recursive(args.recursive);
    let mut config = ManifestConfig::from_env();
    if let Some(a) = args.annotation.as_deref().filter(|a| !a.is_empty()) {
        config.last_applied_annotation = a.to_string();
    }
    config.rfc7386 |= args.rfc7386;
    let mut manifest = Manifest::from_source(&source)
        .with_context(|| format!("reading {}", args.filename))?
        .with_config(config)
        .with_oracle(Arc::new(SchemaRegistry::builtin()));
    if let Some(ns) = args.namespace.as_deref() {
        manifest = manifest.transform(&[transform::inject_namespace(ns)])?;
    }
    let client = keel_kubehub::connect().await?;
    info!(resources = manifest.len(), "manifest loaded");
    Ok(manifest.with_client(Arc::new(client)))
}

fn report(output: Output, manifest: &Manifest, outcomes: &[Outcome], reversed: bool) -> Result<()> {
    let mut resources = manifest.resources();
    if reversed {
        resources.reverse();
    }
    match output {
        Output::Human => {
            for (r, o) in resources.iter().zip(outcomes) {
                println!("{} • {} • {:?}", r.gvk(), r.display_name(), o);
            }
        }
        Output::Json => {
            let rows: Vec<_> = resources
                .iter()
                .zip(outcomes)
                .map(|(r, o)| serde_json::json!({"kind": r.kind(), "namespace": r.namespace(), "name": r.name(), "outcome": o}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let token = cancel_on_ctrl_c();

    match cli.command {
        Commands::Apply { manifest, overwrite, dry_run, field_manager } => {
            let m = load(&manifest).await?;
            let opts = ApplyOptions { dry_run, field_manager: Some(field_manager), overwrite };
            let outcomes = m.apply(&token, &opts).await?;
            report(cli.output, &m, &outcomes, false)?;
        }
        Commands::Delete { manifest, grace_period, cascade, dry_run } => {
            let m = load(&manifest).await?;
            let opts = DeleteOptions {
                dry_run,
                grace_period_seconds: grace_period,
                propagation_policy: cascade.map(|c| match c {
                    Cascade::Orphan => PropagationPolicy::Orphan,
                    Cascade::Background => PropagationPolicy::Background,
                    Cascade::Foreground => PropagationPolicy::Foreground,
                }),
                ..DeleteOptions::default()
            };
            let outcomes = m.delete(&token, &opts).await?;
            report(cli.output, &m, &outcomes, true)?;
        }
        Commands::Diff { manifest } => {
            let m = load(&manifest).await?;
            let patches = m.dry_run(&token).await?;
            match cli.output {
                Output::Human => {
                    for p in &patches {
                        println!("{}", serde_json::to_string(p)?);
                    }
                    if patches.is_empty() {
                        println!("no changes");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&patches)?),
            }
        }
    }
    Ok(())
}
