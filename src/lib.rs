//! # filesync
//!
//! Incremental sync and hybrid search indexing for remote document stores.
//!
//! filesync walks a remote folder tree (Box today), keeps a local record of
//! every file per sync scope, indexes new and changed files into a
//! chunked keyword + vector index, and reconciles deletions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ Connector  │──▶│ SyncOrchestrator │──▶│    SQLite     │
//! │   (Box)    │   │ upsert/index/prune│  │ docs + index  │
//! └────────────┘   └────────┬─────────┘   └───────┬───────┘
//!        ▲                  │                     │
//!  TokenRefresher      LocalCopies        ┌───────┴───────┐
//!                                         ▼               ▼
//!                                   ┌──────────┐    ┌──────────┐
//!                                   │   CLI    │    │   HTTP   │
//!                                   └──────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! filesync init
//! filesync auth url --connector box
//! filesync auth exchange --connector box --code <code> --id box-main
//! filesync scope add --name team-docs --credential box-main --folder 0
//! filesync sync <scope-id>
//! filesync search "quarterly audit"
//! filesync serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`connector`] | Provider capability trait and registry |
//! | [`connector_box`] | Box connector |
//! | [`auth`] | Token refresh and code exchange |
//! | [`sync`] | Sync orchestrator and prune |
//! | [`scheduler`] | Periodic dispatcher |
//! | [`storage`] | Local copies of originals |
//! | [`extract`] | Text extraction |
//! | [`embedding`] | Embedding providers |
//! | [`sqlite_store`] / [`sqlite_index`] | SQLite persistence |
//! | [`server`] | HTTP trigger and search API |

pub mod auth;
pub mod commands;
pub mod config;
pub mod connector;
pub mod connector_box;
pub mod context;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod logging;
pub mod migrate;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod sqlite_index;
pub mod sqlite_store;
pub mod stats;
pub mod storage;
pub mod sync;
