//! Lamad Store CLI
//!
//! Administrative access to a lamad-store database.
//!
//! ## Usage
//!
//! ```bash
//! # Create the storage directory, config and schema
//! lamad-store init
//!
//! # Row counts
//! lamad-store stats
//!
//! # Assembled module as seen by a user
//! lamad-store module <module-id> --user alice
//!
//! # A user's interaction log on a node
//! lamad-store log <node-id> --user alice
//!
//! # Grant a level on a node
//! lamad-store grant <node-id> --user bob --level EDIT --by alice
//! lamad-store grant <node-id> --group <group-id> --level VIEW --by alice --expires-at 2030-01-01T00:00:00Z
//! ```
//!
//! Output is pretty-printed JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lamad_store::db::models::{PermissionLevel, Principal};
use lamad_store::services::events::spawn_logging_listener;
use lamad_store::{Config, LearningDb, Services};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lamad-store")]
#[command(about = "Content graph, permissions and interaction logs for a learning platform")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "LAMAD_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "LAMAD_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create storage directory, default config and schema
    Init,

    /// Print row counts
    Stats,

    /// Show a module with its lessons and exercises
    Module {
        id: String,
        #[arg(long)]
        user: String,
    },

    /// Show a user's interaction log on a node
    Log {
        node: String,
        #[arg(long)]
        user: String,
    },

    /// Grant a permission level on a node
    Grant {
        node: String,
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        user: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        level: PermissionLevel,
        /// Acting user, must hold ADMIN on the node
        #[arg(long)]
        by: String,
        /// RFC 3339 expiry
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("lamad_store=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    let db = Arc::new(LearningDb::open(&config)?);
    let services = Services::new(db.clone(), &config);
    let _listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            info!(db = %config.db_path().display(), "Storage initialized");
            print_json(&db.stats()?)?;
        }
        Command::Stats => print_json(&db.stats()?)?,
        Command::Module { id, user } => print_json(&services.graph.get_module(&id, &user)?)?,
        Command::Log { node, user } => print_json(&services.interactions.get(&node, &user)?)?,
        Command::Grant {
            node,
            user,
            group,
            level,
            by,
            expires_at,
        } => {
            let principal = match (user, group) {
                (Some(user), _) => Principal::User(user),
                (None, Some(group)) => Principal::Group(group),
                (None, None) => return Err("either --user or --group is required".into()),
            };
            let grant = services
                .permissions
                .grant(&node, principal, level, &by, expires_at)?;
            print_json(&grant)?;
        }
    }

    Ok(())
}
