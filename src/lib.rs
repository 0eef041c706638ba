//! Lamad Store - content graph, permissions and interaction logs for a
//! learning platform
//!
//! Learning material is a typed graph: MODULE nodes own LESSON and EXERCISE
//! nodes through DEPENDENCY links. Every read and write is gated by a
//! permission resolver, and each learner's answers are kept in an append-only
//! log per (node, user).
//!
//! ## Architecture
//!
//! - **Stores** (`db`): SQLite-backed CRUD, no business rules
//! - **PermissionResolver**: grants, groups, expiry, inheritance along the graph, public defaults
//! - **ContentGraphService**: create / edit / publish with transactional link invariants
//! - **InteractionService**: validates events against the live lesson body, then appends atomically
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/lamad-store/
//! ├── lamad.db       # SQLite database (WAL mode)
//! └── config.toml    # Configuration
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lamad_store::body::ModuleBody;
//! use lamad_store::{Config, LearningDb, Services};
//!
//! # fn main() -> Result<(), lamad_store::StorageError> {
//! let config = Config::default();
//! let db = Arc::new(LearningDb::open(&config)?);
//! let services = Services::new(db, &config);
//!
//! let module = services.graph.create_module(
//!     ModuleBody { title: "Algorithms".into(), ..Default::default() },
//!     "alice",
//! )?;
//! services.graph.publish(&module.id, "alice")?;
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use db::{LearningDb, DbStats};
pub use error::StorageError;
pub use services::Services;
