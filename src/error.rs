//! Error types for lntest-harness.

use crate::role::Role;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a test topology.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was invoked out of order (e.g. before `start_node`).
    #[error("sequencing error: {0}")]
    Sequencing(String),

    /// One or more nodes failed to reach the ready state.
    #[error("node startup failed for {}: {reason}", format_roles(.roles))]
    Startup {
        /// Roles that never became ready.
        roles: Vec<Role>,
        /// Human readable reason.
        reason: String,
    },

    /// A peer link could not be established.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Funding was not confirmed within the configured bound.
    #[error("insufficient confirmation: {0}")]
    InsufficientConfirmation(String),

    /// A channel failed to reach the open state.
    #[error("channel {from} -> {to} failed to open: {reason}")]
    ChannelOpen {
        /// Initiating role.
        from: Role,
        /// Remote role.
        to: Role,
        /// Human readable reason.
        reason: String,
    },

    /// A protocol call exceeded its time bound.
    #[error("{method} on {role} timed out after {timeout:?}")]
    RpcTimeout {
        /// Role the call was issued against.
        role: Role,
        /// RPC method name.
        method: &'static str,
        /// Configured bound.
        timeout: Duration,
    },

    /// A protocol call was rejected by the node.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// A role name or role lookup that is not part of the topology.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Spawning or supervising a node process failed.
    #[error("process error: {0}")]
    Process(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn format_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
