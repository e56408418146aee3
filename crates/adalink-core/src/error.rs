use thiserror::Error;

use crate::types::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

/// Malformed input at configuration time: URLs, option lists, field queries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed connection string: {reason}")]
    MalformedUrl { reason: String },

    #[error("unknown option key: {key}")]
    UnknownOption { key: String },

    #[error("conflicting options: {first} and {second}")]
    ConflictingOptions {
        first: &'static str,
        second: &'static str,
    },

    #[error("invalid database id: {value}")]
    InvalidDbid { value: String },

    #[error("invalid port: {value}")]
    InvalidPort { value: String },

    #[error("unknown field name in query: {name}")]
    UnknownField { name: String },

    #[error("invalid field query element: {element}")]
    InvalidQueryElement { element: String },

    #[error("invalid search expression: {reason}")]
    InvalidSearch { reason: String },

    #[error("database {dbid} is not configured for local access")]
    LocalNotConfigured { dbid: u32 },

    #[error("TLS transport requested but not available for this build")]
    TlsUnavailable,
}

/// Violations of the wire formats: frames, control blocks, record layouts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated input at byte {at}, need {needed} bytes")]
    Truncated { at: usize, needed: usize },

    #[error("unexpected frame type: {0}")]
    UnexpectedFrameType(u8),

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("frame length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid buffer tag: 0x{0:02x}")]
    InvalidBufferTag(u8),

    #[error("buffer count mismatch: sent {sent}, received {received}")]
    BufferCountMismatch { sent: usize, received: usize },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Non-zero, non-EOF Adabas response with the context needed for diagnosis.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("adabas response {response} subcode {subcode} on {command}")]
pub struct ServerError {
    pub command: Command,
    pub response: u16,
    pub subcode: u16,
}

/// Misuse of a handle lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("session is closed")]
    SessionClosed,

    #[error("session is busy with another call")]
    SessionBusy,

    #[error("store issued without prior store_fields")]
    StoreFieldsMissing,

    #[error("read request has no field query")]
    QueryMissing,

    #[error("update within a read stream must use a distinct command id")]
    InterleavedUpdate,
}

/// Map and repository constraint violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("map {map}: field {field} references unknown short name {short_name}")]
    UnknownShortName {
        map: String,
        field: String,
        short_name: String,
    },

    #[error("map {0} already exists in the repository")]
    DuplicateMap(String),

    #[error("map {0} not found")]
    UnknownMap(String),

    #[error("map {map} is not stored, cannot {operation}")]
    NotStored {
        map: String,
        operation: &'static str,
    },

    #[error("map record malformed: {reason}")]
    MalformedMapRecord { reason: String },
}

impl Error {
    /// Adabas response code carried by this error, when it wraps a server
    /// response.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display_names_command_and_codes() {
        let err = Error::from(ServerError {
            command: Command::L3,
            response: 113,
            subcode: 4,
        });
        assert_eq!(err.to_string(), "adabas response 113 subcode 4 on L3");
        assert_eq!(err.response_code(), Some(113));
    }

    #[test]
    fn config_error_names_offending_key() {
        let err = ConfigError::UnknownOption {
            key: "shard".to_string(),
        };
        assert_eq!(err.to_string(), "unknown option key: shard");
    }
}
