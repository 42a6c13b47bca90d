//! Configuration structures for the Tessera statement environment.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Size of the fixed statement header in bytes.
pub const STMT_HEADER_SIZE: usize = 24;

/// Configuration of a statement environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmtEnvConfig {
    /// Maximum total size of a single statement (header + field map + data).
    pub max_tuple_size: usize,
    /// Cache functional index keys next to the statement they were built from.
    pub functional_key_cache: bool,
    /// Target false positive rate of per-run bloom filters.
    pub bloom_fpr: f64,
    /// Chunk size of the generational statement region.
    pub region_generation_size: usize,
}

impl Default for StmtEnvConfig {
    fn default() -> Self {
        Self {
            max_tuple_size: 1024 * 1024,              // 1 MB
            functional_key_cache: true,
            bloom_fpr: 0.05,
            region_generation_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl StmtEnvConfig {
    /// Checks that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_tuple_size < STMT_HEADER_SIZE {
            return Err(TesseraError::InvalidParameter {
                name: "max_tuple_size".to_string(),
                value: self.max_tuple_size.to_string(),
            });
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(TesseraError::InvalidParameter {
                name: "bloom_fpr".to_string(),
                value: self.bloom_fpr.to_string(),
            });
        }
        if self.region_generation_size == 0 {
            return Err(TesseraError::ConfigError(
                "region_generation_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
