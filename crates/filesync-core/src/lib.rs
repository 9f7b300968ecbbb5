//! # filesync core
//!
//! Runtime-agnostic logic for filesync: data models, the chunker, the
//! embedding service, remote enumeration, the search index service, and
//! the storage traits every backend implements.
//!
//! This crate contains no SQL, HTTP, or filesystem I/O. The `filesync`
//! application crate supplies SQLite stores, the Box connector, and the
//! sync orchestrator on top of it.

pub mod chunk;
pub mod embedding;
pub mod enumerate;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{Result, SyncError};
