//! # filesync CLI
//!
//! ## Usage
//!
//! ```bash
//! filesync --config ./config/filesync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `filesync init` | Create the SQLite database and run schema migrations |
//! | `filesync scope add` / `scope list` | Manage sync scopes |
//! | `filesync auth url` / `auth exchange` | Authorize a connector and store a credential |
//! | `filesync sync <scope>` | Run one sync pass for a scope |
//! | `filesync prune <scope>` | Reconcile deletions for a scope |
//! | `filesync search "<query>"` | Search indexed documents |
//! | `filesync stats` | Show index and scope statistics |
//! | `filesync schedule` | Run the scheduler loop |
//! | `filesync serve` | Run the HTTP API and the scheduler |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use filesync::commands::{self, NewScope};
use filesync::config;
use filesync::context::AppContext;
use filesync::logging::{self, LogFormat};
use filesync::migrate;
use filesync::scheduler::Scheduler;
use filesync::search;
use filesync::server;
use filesync::stats;

/// filesync: incremental sync and hybrid search for remote document stores.
#[derive(Parser)]
#[command(name = "filesync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/filesync.toml")]
    config: PathBuf,

    /// Diagnostic log format on stderr: `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage sync scopes.
    Scope {
        #[command(subcommand)]
        action: ScopeAction,
    },

    /// Authorize a connector.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Run one sync pass for a scope.
    Sync {
        /// Scope id.
        scope: String,
    },

    /// Remove documents that no longer exist remotely.
    Prune {
        /// Scope id.
        scope: String,
    },

    /// Search indexed documents.
    Search {
        /// Search query text.
        query: String,

        /// Maximum number of documents to return.
        #[arg(long)]
        size: Option<usize>,

        /// Only return documents linked to this scope.
        #[arg(long)]
        scope: Option<String>,

        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Show index and scope statistics.
    Stats,

    /// Run the scheduler loop until interrupted.
    Schedule,

    /// Run the HTTP API and the scheduler until interrupted.
    Serve,
}

#[derive(Subcommand)]
enum ScopeAction {
    /// Create a scope.
    Add {
        #[arg(long)]
        name: String,

        /// Credential id from `filesync auth exchange`.
        #[arg(long)]
        credential: String,

        #[arg(long, default_value = "box")]
        connector: String,

        /// Root folder id (repeatable). Defaults to the account root.
        #[arg(long = "folder")]
        folders: Vec<String>,

        /// Allowed file extension (repeatable). Empty allows all.
        #[arg(long = "ext")]
        exts: Vec<String>,

        #[arg(long)]
        max_size_mb: Option<u64>,
    },

    /// List scopes.
    List,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Print the authorization URL.
    Url {
        #[arg(long, default_value = "box")]
        connector: String,
    },

    /// Exchange an authorization code and store the credential.
    Exchange {
        #[arg(long, default_value = "box")]
        connector: String,

        #[arg(long)]
        code: String,

        /// Credential id. A UUID is generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scope { action } => match action {
            ScopeAction::Add {
                name,
                credential,
                connector,
                folders,
                exts,
                max_size_mb,
            } => {
                commands::scope_add(
                    &cfg,
                    NewScope {
                        name,
                        connector,
                        credential_id: credential,
                        folder_ids: folders,
                        include_exts: exts,
                        max_size_mb,
                    },
                )
                .await?;
            }
            ScopeAction::List => {
                commands::scope_list(&cfg).await?;
            }
        },
        Commands::Auth { action } => match action {
            AuthAction::Url { connector } => {
                commands::auth_url(&cfg, &connector).await?;
            }
            AuthAction::Exchange {
                connector,
                code,
                id,
            } => {
                commands::auth_exchange(&cfg, &connector, &code, id).await?;
            }
        },
        Commands::Sync { scope } => {
            commands::sync(&cfg, &scope).await?;
        }
        Commands::Prune { scope } => {
            commands::prune(&cfg, &scope).await?;
        }
        Commands::Search {
            query,
            size,
            scope,
            json,
        } => {
            search::run_search(&cfg, &query, size, scope, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Schedule => {
            let ctx = AppContext::open(&cfg).await?;
            let scheduler = Arc::new(Scheduler::new(
                ctx.orchestrator.clone(),
                cfg.scheduler.clone(),
            ));
            scheduler
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            ctx.close().await;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
