use serial_link::{LinkError, PacketError};
use thiserror::Error;

/// Errors that can occur in the host driver
#[derive(Error, Debug)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Link task stopped")]
    Closed,
    #[error("Link task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, HostError>;
