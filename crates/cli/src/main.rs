use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use strata_api::{InProcApi, StrataApi};
use strata_fetch::FileFetcher;
use strata_resolve::{build_ancestry, default_cache_ttl, Resolver, ResolverOptions};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stratactl", version, about = "Strata tag-layer resolver CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding the tag document tree (default.json, <tag>/conf.json, ...)
    #[arg(long = "root", global = true, default_value = ".")]
    root: PathBuf,

    /// Hostname used for domain-based tag routing
    #[arg(long = "hostname", global = true, env = "STRATA_HOSTNAME", default_value = "")]
    hostname: String,

    /// Explicit tag override (beats domain mapping and defaultTag)
    #[arg(long = "tag", global = true)]
    tag: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve and print the effective bundle for the active tag
    Resolve {
        /// Bypass and clear the cache before resolving
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Print the tag a resolution would use
    Tag,
    /// Print the ancestry chain for a tag, root ancestor first
    Ancestry {
        /// Leaf tag (default: the resolved active tag)
        tag: Option<String>,
    },
    /// Compute the minimal override document from a desired-state JSON file
    Delta {
        /// JSON file shaped {"events": [...], "tips": [...]}
        desired: PathBuf,
        /// Target tag (default: the resolved active tag)
        #[arg(long = "tag")]
        target: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STRATA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STRATA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STRATA_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let fetcher = Arc::new(FileFetcher::new(&cli.root));
    let resolver = Arc::new(Resolver::new(
        fetcher,
        ResolverOptions {
            hostname: cli.hostname.clone(),
            cache_ttl: default_cache_ttl(),
        },
    ));
    if let Some(tag) = cli.tag.as_deref() {
        if let Err(e) = resolver.set_active_tag(tag) {
            error!(error = %e, "invalid --tag override");
            eprintln!("invalid --tag override: {e}");
            std::process::exit(2);
        }
    }
    let api = InProcApi::new(resolver);

    match cli.command {
        Commands::Resolve { force } => {
            info!(force, "resolve invoked");
            match api.resolve(force).await {
                Ok(bundle) => match cli.output {
                    Output::Human => {
                        println!("tag: {}", bundle.tag);
                        println!(
                            "events: {} ({} archived) • tips: {}",
                            bundle.events.len(),
                            bundle.archived_events.len(),
                            bundle.tips.len()
                        );
                        for e in &bundle.events {
                            let id = e.get("id").and_then(|v| v.as_str()).unwrap_or("-");
                            let archived = e
                                .get("archived")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false);
                            let state = if archived { "archived" } else { "active" };
                            println!("  {:<28} {}", id, state);
                        }
                        for t in &bundle.tips {
                            let id = t.get("id").and_then(|v| v.as_str()).unwrap_or("-");
                            println!("  {:<28} tip", id);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&*bundle)?),
                },
                Err(e) => {
                    error!(error = %e, "resolve failed");
                    eprintln!("resolve error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Tag => match api.resolver().resolved_tag().await {
            Ok(tag) => println!("{tag}"),
            Err(e) => {
                error!(error = %e, "tag resolution failed");
                eprintln!("tag error: {e}");
                std::process::exit(1);
            }
        },
        Commands::Ancestry { tag } => {
            let leaf = match tag {
                Some(t) => match strata_core::sanitize_tag(&t) {
                    Some(t) => t,
                    None => {
                        eprintln!("tag {t:?} sanitizes to empty");
                        std::process::exit(2);
                    }
                },
                None => match api.resolver().resolved_tag().await {
                    Ok(t) => t,
                    Err(e) => {
                        eprintln!("tag error: {e}");
                        std::process::exit(1);
                    }
                },
            };
            let fetcher = api.resolver().fetcher();
            let chain = build_ancestry(&*fetcher, &leaf).await;
            let tags: Vec<&str> = chain.iter().map(|l| l.tag.as_str()).collect();
            match cli.output {
                Output::Human => {
                    for (i, t) in tags.iter().enumerate() {
                        println!("{:>2}. {}", i + 1, t);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&tags)?),
            }
        }
        Commands::Delta { desired, target } => {
            let raw = tokio::fs::read(&desired).await?;
            let body: serde_json::Value = serde_json::from_slice(&raw)?;
            let events = body
                .get("events")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let tips = body
                .get("tips")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            info!(events = events.len(), tips = tips.len(), "delta invoked");
            match api.build_override(&events, &tips, target.as_deref()).await {
                Ok(doc) => match cli.output {
                    Output::Human => {
                        println!("tag: {} (updated {})", doc.tag, doc.updated);
                        println!(
                            "events: {} • archive: {} • tips: {}",
                            doc.events.len(),
                            doc.events_archive.len(),
                            doc.tips.len()
                        );
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                },
                Err(e) => {
                    error!(error = %e, "delta failed");
                    eprintln!("delta error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
