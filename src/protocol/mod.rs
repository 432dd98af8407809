//! The DTP request/response protocol.
//!
//! Two peers exchange structured business messages over one ordered
//! [`Session`], one request in flight at a time. Binary payloads referenced
//! by those messages ([`RawData`]) never travel inline: each one gets its own
//! short-lived TCP side channel, negotiated right after the message that
//! references it.
//!
//! # Overview
//!
//! - The server ([`Server`]) accepts connections and runs one handler per
//!   connection on a bounded handler pool. Each handler reads a request,
//!   announces side channel ports for the raw data it references, invokes
//!   the [`Responder`], writes the response and announces ports for the raw
//!   data the response carries.
//! - The client ([`Client`]) mirrors that negotiation, connecting out to the
//!   announced ports instead of listening.
//! - Side channel listeners come from a [`ListenerPool`] capped per bind
//!   address; transfers run on a raw data pool separate from the handler
//!   pool so large payloads never starve the request loop.
//!
//! # Binary Format
//!
//! Structured frames on the session:
//!
//! - 1 byte frame kind (`0` business message, `1` control message);
//! - 4 byte big-endian payload length;
//! - the bincode payload (big-endian, fixed-width integers).
//!
//! A raw data field is encoded as its id rendered as a string. Each side
//! channel starts with an 8 byte big-endian call number followed by the raw
//! payload, terminated by the pusher closing its end.
//!
//! # See Also
//!
//! - [`config`](crate::config): timeouts and pool sizes.
//! - [`blob`](crate::blob): a complete responder built on this module.
mod client;
mod control;
mod handler;
mod listener;
mod raw_data;
mod server;
mod thread;
mod transfer;
mod transport;

pub use client::Client;
pub use control::{ControlAction, ControlMessage, RawDataPort};
pub use handler::Responder;
pub use listener::{ListenerLease, ListenerPool, SideChannelListener};
pub use raw_data::{RawData, RawDataScope, RawDataState};
pub use server::Server;
pub use thread::ThreadPool;
pub use transfer::{BLOCK_SIZE, CALL_NUMBER_LEN, CallNumber, connect_lazy_pull, connect_push};
pub use transport::{Incoming, Session, SessionCloser, TransportError};
