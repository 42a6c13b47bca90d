//! Error types for Tessera.

use thiserror::Error;

/// Result type alias using TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur in Tessera statement operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    // Memory errors
    #[error("Failed to allocate {size} bytes in {allocator} for {object}")]
    OutOfMemory {
        size: usize,
        allocator: &'static str,
        object: &'static str,
    },

    #[error("Failed to allocate {size} bytes for tuple: tuple is too large (max {max})")]
    MaxTupleSize { size: usize, max: usize },

    // Data errors
    #[error("Invalid MsgPack - {0}")]
    InvalidMsgPack(String),

    #[error("Tuple field {field} type does not match one required by operation: expected {expected}, got {actual}")]
    FieldType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Tuple field count {actual} is less than required by space format or defined indexes (expected at least {expected})")]
    MinFieldCount { expected: u32, actual: u32 },

    #[error("Invalid key part count in an exact match (expected {expected}, got {actual})")]
    ExactMatch { expected: u32, actual: u32 },

    #[error("Supplied key type of part {part} does not match index part type: expected {expected}")]
    KeyPartType { part: u32, expected: String },

    #[error("Invalid key definition: {0}")]
    InvalidKeyDef(String),

    #[error("Illegal JSON path '{path}': {reason}")]
    InvalidJsonPath { path: String, reason: String },

    // Function errors
    #[error("Key format doesn't match one defined in functional index '{func}': {message}")]
    FunctionalExtractor { func: String, message: String },

    #[error("Function '{0}' does not exist")]
    NoSuchFunction(String),

    #[error("Function '{0}' already exists")]
    FunctionExists(String),

    #[error("{0}")]
    FunctionFailed(String),

    // Statement lifecycle errors
    #[error("Statement is referenced {refs} times and cannot be modified in place")]
    StmtShared { refs: u32 },

    #[error("Functional keys of the statement are already being materialized")]
    MaterializeInProgress,

    #[error("Key definition is multikey but no multikey index was given")]
    MultikeyIndexRequired,

    // Wire errors
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: i64, reason: String },

    #[error("Can't decode statement at LSN {lsn}: {source}")]
    StmtDecode {
        lsn: i64,
        #[source]
        source: Box<TesseraError>,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns the diagnostic message without any category prefix.
    ///
    /// Used when one error is re-attributed to a stored function.
    pub fn errmsg(&self) -> String {
        match self {
            TesseraError::FunctionFailed(msg) => msg.clone(),
            TesseraError::FunctionalExtractor { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns true for errors a client caused by sending bad data.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TesseraError::InvalidMsgPack(_)
                | TesseraError::FieldType { .. }
                | TesseraError::MinFieldCount { .. }
                | TesseraError::ExactMatch { .. }
                | TesseraError::KeyPartType { .. }
                | TesseraError::MaxTupleSize { .. }
                | TesseraError::FunctionalExtractor { .. }
        )
    }
}
