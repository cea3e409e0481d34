//! Link configuration
//!
//! All tunable parameters for one link session.
//! Values come from a JSON file, with CLI flags overriding individual fields.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rpc::codec::CodecKind;
use crate::rpc::permission::Permission;
use crate::rpc::session::SessionOptions;
use crate::rpc::transport::MessageBudget;

/// Core link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    // --- Identity ---
    /// Link name announced in logs
    pub name: String,
    /// Broker or peer address (`host:port`)
    pub broker: String,

    // --- Roles ---
    /// Issue requests to the peer
    pub requester: bool,
    /// Serve the local tree to the peer
    pub responder: bool,
    /// Highest level the peer may act at on the local tree
    pub peer_permission: Permission,

    // --- Wire ---
    /// Payload encoding
    pub codec: CodecKind,
    /// Soft cap on one outbound message (bytes)
    pub max_message_bytes: usize,
    /// Soft cap on frames in one outbound message
    pub max_frames_per_message: usize,
    /// Hard cap on one length-prefixed transport frame (bytes)
    pub max_frame_size: usize,

    // --- Timing ---
    /// Transport read poll interval (milliseconds)
    pub read_poll_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "dslink".to_string(),
            broker: "127.0.0.1:8090".to_string(),

            requester: true,
            responder: true,
            peer_permission: Permission::Config,

            codec: CodecKind::Json,
            max_message_bytes: 16 * 1024,
            max_frames_per_message: 64,
            max_frame_size: 1024 * 1024, // 1 MiB

            read_poll_ms: 1,
        }
    }
}

impl LinkConfig {
    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.requester && !self.responder {
            return Err(Error::Config("requester and responder are both disabled"));
        }
        if self.max_message_bytes == 0 || self.max_frames_per_message == 0 {
            return Err(Error::Config("message budget must be non-zero"));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be non-zero"));
        }
        if self.max_message_bytes > self.max_frame_size {
            return Err(Error::Config("max_message_bytes exceeds max_frame_size"));
        }
        if self.read_poll_ms == 0 {
            return Err(Error::Config("read_poll_ms must be non-zero"));
        }
        if self.broker.is_empty() {
            return Err(Error::Config("broker address is empty"));
        }
        Ok(())
    }

    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|_| Error::Config("malformed config JSON"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|_| Error::Config("config file could not be read"))?;
        Self::from_json_str(&json)
    }

    pub fn budget(&self) -> MessageBudget {
        MessageBudget {
            max_bytes: self.max_message_bytes,
            max_frames: self.max_frames_per_message,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            requester: self.requester,
            responder: self.responder,
            peer_permission: self.peer_permission,
        }
    }
}
