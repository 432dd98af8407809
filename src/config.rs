//! Construction-time settings for servers, clients and side channels.
//!
//! None of these values travel on the wire; both peers may be configured
//! differently. Binaries fill them from command line flags, library users
//! start from [`Default`] and override what they need.
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Largest structured frame accepted from a peer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Timeouts applied to every side channel transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long a listener waits for the peer to connect.
    pub accept_timeout: Duration,
    /// How long a connector waits for the TCP handshake.
    pub connect_timeout: Duration,
    /// Socket read timeout applied to wired side channels.
    pub read_timeout: Duration,
    /// How long a read on a pending reference waits for the side channel.
    pub wire_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            wire_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Caps concurrently served connections.
    pub max_handler_threads: usize,
    pub max_listeners_per_bind_addr: usize,
    /// Caps concurrently running side channel transfers.
    pub max_raw_data_threads: usize,
    /// How long a handler waits for a free side channel listener.
    pub acquire_timeout: Duration,
    /// Attempts made when an ephemeral bind reports `AddrInUse`.
    pub bind_retries: usize,
    /// Connections idle for longer than this are closed.
    pub idle_timeout: Option<Duration>,
    pub max_frame_len: usize,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            max_handler_threads: 15,
            max_listeners_per_bind_addr: 8,
            max_raw_data_threads: 16,
            acquire_timeout: Duration::from_secs(30),
            bind_retries: 5,
            idle_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_raw_data_threads: usize,
    /// Read timeout on the structured channel while awaiting a response.
    pub request_timeout: Option<Duration>,
    pub max_frame_len: usize,
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_raw_data_threads: 4,
            request_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            transfer: TransferConfig::default(),
        }
    }
}
