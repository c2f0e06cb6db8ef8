use gossip_core::{PushPullError, SendError};
use std::io;
use thiserror::Error;

/// Errors surfaced by the node's public operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Push/pull exchange failed: {0}")]
    PushPull(#[from] PushPullError),

    #[error("Failed to send message: {0}")]
    Send(#[from] SendError),

    #[error("Cannot dial {0}-byte member address")]
    BadAddress(usize),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
