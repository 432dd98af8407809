//! Error taxonomy shared by the client, the server and the side channels.
use std::{io, net::IpAddr};

use thiserror::Error;

use crate::protocol::TransportError;

#[derive(Debug, Error)]
pub enum DtpError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("side channel IO error: {0}")]
    Io(#[from] io::Error),

    #[error("session is not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an `INTERNAL_ERROR` control message.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("call number mismatch, expected {expected:#018x} got {actual:#018x}")]
    CallNumberMismatch { expected: i64, actual: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("implementation error: {0}")]
    Implementation(String),

    #[error("no side channel listener available for {0}")]
    PoolExhausted(IpAddr),

    #[error("listener pool is closed")]
    PoolClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("thread pool is shut down")]
    ThreadPool,
}

impl DtpError {
    /// Errors after which the structured channel can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            DtpError::Transport(e) => e.is_fatal(),
            DtpError::Io(_) | DtpError::ConnectionClosed | DtpError::NotConnected => true,
            _ => false,
        }
    }
}

pub type Result<T, E = DtpError> = std::result::Result<T, E>;
