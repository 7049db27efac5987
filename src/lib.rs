//! # File Indexer
//!
//! A pluggable file-indexing crawler.
//!
//! Data sources are walked once per run. Every file is sniffed (mime,
//! encoding, description) and handed to an ordered set of handler plugins,
//! each of which persists what it extracts into its own SQLite schema.
//! Plugins declare which other plugins must run before them; the resolver
//! turns those declarations into steps and the dispatcher runs each step to
//! completion before starting the next.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │   Backends   │──▶│  Enumeration  │──▶│  Dispatcher  │
//! │ file://, ... │   │     cache     │   │ steps, pool  │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                               │ WorkItem
//!                      ┌────────────────────────┤
//!                      ▼                        ▼
//!                ┌───────────┐          ┌───────────────┐
//!                │  Handlers │─────────▶│ Store/Upserts │
//!                │ core, ... │          │ SQLite (sqlx) │
//!                └───────────┘          └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fidx plan                     # show which handlers run in which step
//! fidx init                     # create the database files
//! fidx run                      # crawl every data source
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and exit codes |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`models`] | File handles and descriptors |
//! | [`magic`] | Mime, encoding and description sniffing |
//! | [`backend`] | Filesystem backend contract and scheme registry |
//! | [`connector_fs`] | Local filesystem backend |
//! | [`enumeration`] | Replayable file listings |
//! | [`db`] | Database connection and schema attachment |
//! | [`store`] | Storage handle |
//! | [`capability`] | Parallel-connection capability probe |
//! | [`upsert`] | Idempotent get-or-create |
//! | [`schema`] | Per-plugin table definitions |
//! | [`traits`] | Handler plugin trait and registry |
//! | [`resolver`] | Dependency resolution into steps |
//! | [`dispatch`] | The dispatch engine |
//! | [`progress`] | Crawl progress reporting |
//! | [`handlers`] | Built-in handler plugins |
//! | [`extract`] | Document summaries |
//! | [`crawl`] | Application wiring |
//! | [`sources`] | Data source health |

pub mod backend;
pub mod capability;
pub mod config;
pub mod connector_fs;
pub mod crawl;
pub mod db;
pub mod dispatch;
pub mod enumeration;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod logging;
pub mod magic;
pub mod models;
pub mod progress;
pub mod resolver;
pub mod schema;
pub mod sources;
pub mod store;
pub mod traits;
pub mod upsert;
