//! Tessera common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Tessera components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{StmtEnvConfig, STMT_HEADER_SIZE};
pub use error::{Result, TesseraError};
pub use types::{Lsn, StmtFlags, StmtType};
