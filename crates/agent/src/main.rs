//! Agent binary.

use anyhow::{Context, Result};
use clap::Parser;
use drover_agent::{Agent, AgentState};
use drover_core::AgentConfig;
use drover_metadata::{ControlDb, NodeProbe};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Could not attach to the local database node.
const EXIT_NO_NODE: i32 = 2;
/// The configured blob store is unreachable.
const EXIT_NO_STORE: i32 = 3;

/// Backup/restore agent; run one alongside every database node.
#[derive(Parser, Debug)]
#[command(name = "drover-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DROVER_CONFIG", default_value = "config/agent.toml")]
    config: String,

    /// Connection string of the local node (overrides the config file)
    #[arg(long, env = "DROVER_MONGODB_URI")]
    mongodb_uri: Option<String>,
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        figment = figment.merge(Toml::file(&args.config));
    }
    figment = figment.merge(Env::prefixed("DROVER_").split("__"));
    if let Some(uri) = &args.mongodb_uri {
        figment = figment.merge(Serialized::default("mongodb_uri", uri.clone()));
    }
    figment
        .extract()
        .context("failed to load configuration; set mongodb_uri via file or DROVER_MONGODB_URI")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(EXIT_NO_NODE);
        }
    };

    std::process::exit(run(config).await);
}

async fn run(config: AgentConfig) -> i32 {
    tracing::info!("drover-agent v{}", env!("CARGO_PKG_VERSION"));

    let db = match ControlDb::connect(&config.mongodb_uri).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "cannot connect to the database");
            return EXIT_NO_NODE;
        }
    };
    if let Err(e) = db.ensure_setup().await {
        tracing::error!(error = %e, "cannot prepare the control database");
        return EXIT_NO_NODE;
    }

    let node = match NodeProbe::connect(&config.mongodb_uri).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "cannot connect to the local node");
            return EXIT_NO_NODE;
        }
    };
    match node.info().await {
        Ok(info) => {
            let version = node.mongo_version().await.unwrap_or_default();
            tracing::info!(
                replset = %info.set_name,
                primary = info.is_primary,
                config_svr = info.config_svr,
                server = %version,
                "attached to the local node"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "local node is not responding");
            return EXIT_NO_NODE;
        }
    }

    // Surface storage misconfiguration at startup instead of at the first
    // backup. An unset config is fine: operations fail politely until the
    // operator runs `droverctl config set`.
    match db.get_store_config().await {
        Ok(Some(cfg)) => {
            let healthy = match drover_storage::from_config(&cfg.storage).await {
                Ok(storage) => storage.health_check().await,
                Err(e) => Err(e),
            };
            if let Err(e) = healthy {
                tracing::error!(error = %e, "blob store unreachable");
                return EXIT_NO_STORE;
            }
            tracing::info!("blob store verified");
        }
        Ok(None) => tracing::warn!("storage is not configured yet"),
        Err(e) => tracing::warn!(error = %e, "cannot read storage configuration"),
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling running operations");
                shutdown.cancel();
            }
        });
    }

    let agent = Agent::new(
        AgentState {
            db,
            node,
            tunables: config.tunables,
        },
        shutdown,
    );

    match agent.run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "agent loop failed");
            1
        }
    }
}
