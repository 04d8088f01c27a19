//! forms-server: run the form sync server or mint identity tokens.
//!
//! ```bash
//! # Serve in memory, creating responses on first join
//! FORMS_SYNC_SECRET=s3cret forms-server serve --auto-create
//!
//! # Serve from a RocksDB directory
//! forms-server serve --secret s3cret --storage ./data --bind 0.0.0.0:9090
//!
//! # Create an empty response record and print its document id
//! forms-server create --storage ./data
//!
//! # Mint a token for a respondent
//! forms-server token --secret s3cret --id u-42 --email ana@example.com --role respondent
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use forms_sync::{
    Identity, ResponseStore, Role, RocksStore, ServerConfig, StoreConfig, SyncServer,
    TokenIssuer, TokenVerifier,
};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "forms-server")]
#[command(version)]
#[command(about = "Real-time collaborative form response server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server
    Serve {
        /// Address to bind to
        #[arg(long, env = "FORMS_SYNC_BIND", default_value = "127.0.0.1:9090")]
        bind: String,

        /// RocksDB directory (in-memory if omitted)
        #[arg(long, env = "FORMS_SYNC_STORAGE")]
        storage: Option<PathBuf>,

        /// Shared secret used to verify tokens
        #[arg(long, env = "FORMS_SYNC_SECRET", hide_env_values = true)]
        secret: String,

        /// Create empty responses for unknown documents on join
        #[arg(long, env = "FORMS_SYNC_AUTO_CREATE")]
        auto_create: bool,

        /// Frames queued per connection before broadcasts to it are dropped
        #[arg(long, default_value_t = 256)]
        outbox_capacity: usize,
    },

    /// Create an empty response record in a RocksDB directory
    Create {
        #[arg(long, env = "FORMS_SYNC_STORAGE")]
        storage: PathBuf,

        /// Document id to use (random if omitted)
        #[arg(long)]
        document: Option<Uuid>,
    },

    /// Mint a signed identity token
    Token {
        #[arg(long, env = "FORMS_SYNC_SECRET", hide_env_values = true)]
        secret: String,

        #[arg(long)]
        id: String,

        #[arg(long)]
        email: String,

        /// admin or respondent
        #[arg(long, default_value = "respondent")]
        role: Role,

        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            bind,
            storage,
            secret,
            auto_create,
            outbox_capacity,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                outbox_capacity,
                storage_path: storage,
                auto_create_responses: auto_create,
            };
            let verifier = Arc::new(TokenVerifier::new(secret.as_bytes()));
            let server = SyncServer::new(config, verifier)?;
            server.run().await?;
        }
        Commands::Create { storage, document } => {
            let store = RocksStore::open(StoreConfig {
                path: storage,
                ..StoreConfig::default()
            })?;
            let document_id = document.unwrap_or_else(Uuid::new_v4);
            let state = store.create_response(document_id).await?;
            store.sync()?;
            log::info!("Response for {document_id} is at version {}", state.version);
            println!("{document_id}");
        }
        Commands::Token {
            secret,
            id,
            email,
            role,
            ttl_secs,
        } => {
            let issuer = TokenIssuer::new(secret.as_bytes())
                .with_ttl(chrono::Duration::seconds(ttl_secs));
            println!("{}", issuer.issue(&Identity::new(id, email, role)));
        }
    }
    Ok(())
}
