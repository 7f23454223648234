use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bugnest::auth::issue_token;
use bugnest::config::ServerConfig;
use bugnest::participants::{MetaClient, ParticipantResolver};
use bugnest::server::{AppState, create_router};
use bugnest::signature::{HmacSigner, PayloadSigner};
use bugnest::store::SqliteStore;
use bugnest::store::users::{self, NewUser};
use bugnest::webhooks::{DeliveryQueue, DeliveryWorker};

#[derive(Parser)]
#[command(name = "bugnest")]
#[command(about = "A multi-tenant issue tracker backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short, env = "BUGNEST_PORT")]
        port: Option<u16>,

        /// Public origin of this service (e.g. "https://todo.example.org")
        #[arg(long, env = "BUGNEST_ORIGIN")]
        origin: Option<String>,

        /// Origin of the identity service
        #[arg(long, env = "BUGNEST_META_ORIGIN")]
        meta_origin: Option<String>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database schema
    Init {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Create a user and print an API token for it
    CreateUser {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long)]
        username: String,

        #[arg(long)]
        email: String,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// TOML config file; environment and flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(long, env = "BUGNEST_DATABASE")]
    database: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(database) = &self.database {
            config.database.clone_from(database);
        }
        if let Ok(key) = std::env::var("BUGNEST_INTERNAL_KEY") {
            config.internal_key = key;
        }
        Ok(config)
    }
}

fn open_store(config: &ServerConfig) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = config.database.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteStore::new(&config.database)
        .with_context(|| format!("failed to open {}", config.database.display()))?;
    Ok(store)
}

fn run_init(config: &ServerConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    store.initialize()?;
    println!("Initialized database at {}", config.database.display());
    Ok(())
}

fn run_create_user(config: &ServerConfig, username: String, email: String) -> anyhow::Result<()> {
    if !config.database.exists() {
        bail!("Database not initialized. Run 'bugnest admin init' first.");
    }
    let store = open_store(config)?;
    let (user, raw_token) = store.transaction(|tx| {
        let user = users::create_user(
            tx,
            &NewUser {
                username,
                email,
                ..NewUser::default()
            },
        )?;
        let token = issue_token(tx, user.id)?;
        Ok((user, token))
    })?;

    println!();
    println!("========================================");
    println!("Created user '{}' with token:", user.username);
    println!();
    println!("  {raw_token}");
    println!();
    println!("========================================");
    println!();

    Ok(())
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;
    if !config.database.exists() {
        bail!("Database not initialized. Run 'bugnest admin init' first.");
    }

    let store = Arc::new(open_store(&config)?);
    store.initialize()?;

    let signer: Arc<dyn PayloadSigner> = Arc::new(HmacSigner::new(config.internal_key.as_bytes()));
    // The identity client is blocking; build it off the async workers.
    let identity = {
        let (meta_origin, origin) = (config.meta_origin.clone(), config.origin.clone());
        let signer = Arc::clone(&signer);
        tokio::task::spawn_blocking(move || MetaClient::new(&meta_origin, &origin, signer)).await??
    };
    let resolver = ParticipantResolver::new(Arc::new(identity));

    let deliveries = DeliveryQueue::new();
    let worker = DeliveryWorker::new(
        Arc::clone(&store),
        Arc::clone(&signer),
        config.webhook_max_attempts,
        deliveries.clone(),
    )?;
    let (stop_worker, worker_shutdown) = oneshot::channel();
    let worker = worker.spawn(worker_shutdown);

    let addr = config.socket_addr()?;
    let state = Arc::new(AppState::new(store, config, resolver, signer, deliveries));
    let app = create_router(state);

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    info!("Shutting down");
    let _ = stop_worker.send(());
    worker.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bugnest=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init { config } => run_init(&config.load()?)?,
            AdminCommands::CreateUser {
                config,
                username,
                email,
            } => run_create_user(&config.load()?, username, email)?,
        },
        Commands::Serve {
            config,
            host,
            port,
            origin,
            meta_origin,
        } => {
            let mut config = config.load()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(origin) = origin {
                config.origin = origin;
            }
            if let Some(meta_origin) = meta_origin {
                config.meta_origin = meta_origin;
            }
            run_server(config).await?;
        }
    }

    Ok(())
}
