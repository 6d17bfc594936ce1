// Serialization layer - JSON text frames, as carried by broker connections
//!
//! Decoding failures are protocol violations: the caller logs and drops the
//! frame, the connection stays open.

use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, ServerMessage};

/// Serialize a log-to-replica message
pub fn encode_server(msg: &ServerMessage) -> Result<String> {
    serde_json::to_string(msg)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))
}

/// Deserialize a log-to-replica message
pub fn decode_server(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text)
        .map_err(|e| SyncError::Protocol(format!("Failed to decode message: {}", e)))
}

/// Serialize a replica-to-log message
pub fn encode_client(msg: &ClientMessage) -> Result<String> {
    serde_json::to_string(msg)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))
}

/// Deserialize a replica-to-log message
pub fn decode_client(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text)
        .map_err(|e| SyncError::Protocol(format!("Failed to decode message: {}", e)))
}
