//! Backup Server Library
//!
//! Versioned, chunked, checksum-verified backup ingestion over HTTP.
//! The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Sessions, chunk storage, versioning, assembly and verification
//! - `db`: SQLite persistence for backups, files, clients and audit logs
//! - `routes`: HTTP handlers

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;

#[cfg(test)]
mod testutil;
