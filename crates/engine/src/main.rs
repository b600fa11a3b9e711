//! Larder engine daemon and maintenance tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use larder_core::config::LarderConfig;
use larder_core::{CacheName, StorePath, Visibility};
use larder_engine::{CacheSettings, Engine, GcPolicy, PushOptions, ReclaimTarget, metrics};
use larder_signer::KeyPair;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Larder - a deduplicating multi-tenant Nix binary cache engine
#[derive(Parser, Debug)]
#[command(name = "larderd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LARDER_CONFIG", default_value = "larder.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the GC scheduler until interrupted
    Run,
    /// Run one GC sweep now
    Gc {
        /// Reclaim until stored object bytes are at or below this
        #[arg(long)]
        budget_bytes: Option<u64>,
        /// Reclaim at most this many objects
        #[arg(long)]
        max_objects: Option<u64>,
        /// Report what would be reclaimed without deleting anything
        #[arg(long)]
        dry_run: bool,
        /// Print Prometheus metrics after the sweep
        #[arg(long)]
        print_metrics: bool,
    },
    /// Cache management commands
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Push a NAR file into a cache
    Push {
        cache: String,
        store_path: String,
        file: PathBuf,
    },
    /// Pull a NAR from a cache into a file
    Pull {
        cache: String,
        store_path: String,
        output: PathBuf,
    },
    /// Generate a signing key pair
    Keygen {
        name: String,
        /// Write the secret key here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check storage and database connectivity
    Health,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Create a cache
    Create {
        name: String,
        #[arg(long)]
        public: bool,
        #[arg(long, default_value_t = larder_core::DEFAULT_PRIORITY)]
        priority: i32,
        /// Entry retention in seconds (0 keeps entries forever)
        #[arg(long)]
        retention_secs: Option<u64>,
    },
    /// Delete a cache and its entries
    Delete { name: String },
    /// List caches
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    if let Command::Keygen { name, output } = &cli.command {
        return keygen(name, output.as_deref()).await;
    }

    let config = load_config(&cli.config)?;
    metrics::register_metrics();

    let engine = Arc::new(
        Engine::open(config)
            .await
            .context("failed to start engine")?,
    );

    match cli.command {
        Command::Run => run(engine).await,
        Command::Gc {
            budget_bytes,
            max_objects,
            dry_run,
            print_metrics,
        } => {
            let mut policy = GcPolicy::from_config(&engine.config().gc).dry_run(dry_run);
            if budget_bytes.is_some() || max_objects.is_some() {
                policy = policy.with_target(ReclaimTarget {
                    budget_bytes,
                    max_objects,
                });
            }
            let report = engine.run_gc_sweep(Some(policy)).await?;
            print_json(&report)?;
            if print_metrics {
                print!("{}", metrics::gather_text()?);
            }
            Ok(())
        }
        Command::Cache { command } => cache_command(&engine, command).await,
        Command::Push {
            cache,
            store_path,
            file,
        } => {
            let cache = engine.get_cache(&CacheName::new(cache)?).await?;
            let store_path = StorePath::parse(&store_path)?;
            let reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let result = engine
                .push(
                    cache.cache_id,
                    &store_path,
                    ReaderStream::new(reader),
                    PushOptions::default(),
                )
                .await?;
            print_json(&result)
        }
        Command::Pull {
            cache,
            store_path,
            output,
        } => {
            let cache = engine.get_cache(&CacheName::new(cache)?).await?;
            let store_path = StorePath::parse(&store_path)?;
            let mut response = engine.pull(cache.cache_id, &store_path).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("failed to create {}", output.display()))?;
            while let Some(piece) = response.stream.next().await {
                file.write_all(&piece?).await?;
            }
            file.flush().await?;
            println!("{}", response.narinfo.to_narinfo_text());
            Ok(())
        }
        Command::Health => {
            engine.health_check().await?;
            println!("ok");
            Ok(())
        }
        Command::Keygen { .. } => Ok(()),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Config file (optional) overlaid with `LARDER_` environment variables,
/// e.g. `LARDER_GC__INTERVAL_SECS=3600`.
fn load_config(path: &str) -> Result<LarderConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults", path);
    }

    figment
        .merge(Env::prefixed("LARDER_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn run(engine: Arc<Engine>) -> Result<()> {
    tracing::info!("Larder v{}", env!("CARGO_PKG_VERSION"));
    engine
        .health_check()
        .await
        .context("startup health check failed")?;

    let shutdown = CancellationToken::new();
    let scheduler = match engine.config().gc.interval() {
        Some(interval) => Some(Arc::clone(engine.gc()).spawn_scheduler(interval, shutdown.clone())),
        None => {
            tracing::info!("Automatic GC disabled");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.await.context("GC scheduler panicked")?;
    }
    Ok(())
}

async fn cache_command(engine: &Engine, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Create {
            name,
            public,
            priority,
            retention_secs,
        } => {
            let settings = CacheSettings {
                visibility: Visibility::from_public(public),
                priority,
                retention_secs,
                ..CacheSettings::new(CacheName::new(name)?)
            };
            let cache = engine.create_cache(settings).await?;
            print_json(&cache)
        }
        CacheCommand::Delete { name } => {
            let cache = engine.get_cache(&CacheName::new(name)?).await?;
            let removed = engine.delete_cache(cache.cache_id).await?;
            println!("Deleted cache {} ({removed} entries)", cache.name);
            Ok(())
        }
        CacheCommand::List => {
            let caches = engine.list_caches().await?;
            print_json(&caches)
        }
    }
}

async fn keygen(name: &str, output: Option<&Path>) -> Result<()> {
    let keypair = KeyPair::generate(name);
    let secret_key = keypair.to_nix_secret_key();
    let public_key = keypair.to_nix_public_key();

    if let Some(path) = output {
        tokio::fs::write(path, &secret_key)
            .await
            .with_context(|| format!("failed to write key to {}", path.display()))?;
        println!("Secret key written to: {}", path.display());
    } else {
        println!("Secret key:");
        println!("{secret_key}");
    }

    println!("\nPublic key:");
    println!("{public_key}");
    println!("\nAdd this to your nix.conf trusted-public-keys:");
    println!("  trusted-public-keys = {public_key}");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
