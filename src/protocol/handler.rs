//! Per-connection request loop on the server.
//!
//! A handler owns its [`Session`] for the whole life of the connection and
//! processes one request at a time:
//!
//! 1. read a request, recording the raw data it references;
//! 2. announce a listener per referenced id and pull each payload lazily;
//! 3. hand the request to the [`Responder`];
//! 4. write the response, announce a listener per raw data bound into the
//!    response and push each payload;
//! 5. let the responder release per-request resources, then loop.
//!
//! Side channel transfers run on the raw data pool and are never awaited by
//! the loop.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bincode::{Decode, Encode};
use log::{debug, error, info, trace, warn};

use crate::{config::TransferConfig, error::Result};

use super::{
    ControlMessage, Incoming, RawData, RawDataPort, RawDataScope, Session,
    listener::{ListenerLease, ListenerPool},
    raw_data::lock,
    thread::ThreadPool,
    transfer::{CallNumber, spawn_transfer},
    transport::SessionCloser,
};

/// Business logic plugged into a [`Server`](super::Server). One instance is
/// created per connection.
pub trait Responder: Send + 'static {
    type Request: Decode<RawDataScope> + Send;
    type Response: Encode;

    /// Produces the response to `request`. Raw data sent back with the
    /// response must be created through `outgoing`.
    fn respond(&mut self, request: Self::Request, outgoing: &RawDataScope) -> Self::Response;

    /// The request/response pair has been dispatched and may be released.
    fn release(&mut self) {}

    /// The connection is gone.
    fn finalize(&mut self, _peer: SocketAddr) {}
}

/// State shared by the acceptor and every handler of a server.
pub(crate) struct HandlerContext {
    pub(crate) listeners: ListenerPool,
    pub(crate) raw_data_pool: ThreadPool,
    pub(crate) registry: HandlerRegistry,
    pub(crate) transfer: TransferConfig,
    pub(crate) idle_timeout: Option<Duration>,
}

/// Lets the server close a handler it does not own.
#[derive(Debug)]
pub(crate) struct HandlerHandle {
    closed: Arc<AtomicBool>,
    session: SessionCloser,
}

impl HandlerHandle {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.session.close();
    }
}

/// Handlers with a live connection.
#[derive(Debug, Default)]
pub(crate) struct HandlerRegistry {
    active: Mutex<HashMap<u64, HandlerHandle>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, id: u64, handle: HandlerHandle) {
        lock(&self.active).insert(id, handle);
    }

    pub(crate) fn unregister(&self, id: u64) {
        lock(&self.active).remove(&id);
    }

    /// Removes an arbitrary handler from the set.
    pub(crate) fn pop(&self) -> Option<HandlerHandle> {
        let mut active = lock(&self.active);
        let id = *active.keys().next()?;
        active.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.active).len()
    }
}

/// Which way the payloads of a negotiation flow.
#[derive(Debug, Clone, Copy)]
enum Direction {
    /// The peer pushes, we wire the socket into a pending reference.
    Pull,
    /// We push the bytes of a bound reference.
    Push,
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

pub(crate) struct Handler<R: Responder> {
    id: u64,
    session: Session,
    responder: R,
    context: Arc<HandlerContext>,
    closed: Arc<AtomicBool>,
}

impl<R: Responder> Handler<R> {
    pub(crate) fn new(
        id: u64,
        session: Session,
        responder: R,
        context: Arc<HandlerContext>,
    ) -> Self {
        Self {
            id,
            session,
            responder,
            context,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn handle(&self) -> Result<HandlerHandle> {
        Ok(HandlerHandle {
            closed: Arc::clone(&self.closed),
            session: self.session.closer()?,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.is_closed()
    }

    /// Serves requests until the peer leaves, the handler is closed, or an
    /// unrecoverable error occurs.
    pub(crate) fn run(mut self) {
        let peer = self.session.remote_addr();
        info!("handler {} serving {peer}", self.id);

        if let Err(e) = self.session.set_read_timeout(self.context.idle_timeout) {
            warn!("handler {} could not set idle timeout: {e}", self.id);
        }

        while !self.is_closed() {
            match self.serve_one() {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(e) if self.is_closed() => {
                    debug!("handler {} stopped while closing: {e}", self.id);
                    break;
                }
                Err(e) => {
                    error!("handler {} failed: {e}", self.id);
                    break;
                }
            }
        }

        self.finalize(peer);
    }

    fn serve_one(&mut self) -> Result<Step> {
        let transfer = self.context.transfer;
        let request_scope = RawDataScope::new(transfer.wire_timeout);

        let request = match self.session.read::<R::Request>(&request_scope) {
            Ok(Some(Incoming::Message(request))) => request,
            Ok(Some(Incoming::Control(control))) => {
                request_scope.discard();
                return self.reply_error(format!(
                    "unexpected {:?} control message in place of a request",
                    control.action
                ));
            }
            Ok(None) => {
                debug!("handler {} reached end of stream", self.id);
                return Ok(Step::Stop);
            }
            Err(e) if self.is_closed() || e.is_timeout() => {
                debug!("handler {} read ended: {e}", self.id);
                return Ok(Step::Stop);
            }
            Err(e) if e.is_fatal() => {
                warn!("handler {} lost its connection: {e}", self.id);
                return Ok(Step::Stop);
            }
            Err(e) => {
                warn!("handler {} could not read request: {e}", self.id);
                request_scope.discard();
                return self.reply_error(e.to_string());
            }
        };

        let pulls = request_scope.take();
        if !pulls.is_empty() && !self.negotiate(&pulls, Direction::Pull)? {
            return Ok(Step::Continue);
        }

        let outgoing = RawDataScope::new(transfer.wire_timeout);
        let response = self.responder.respond(request, &outgoing);
        drop(pulls);

        if let Err(e) = self.session.write(&response) {
            if e.is_fatal() {
                return Err(e.into());
            }
            error!("handler {} could not encode response: {e}", self.id);
            outgoing.discard();
            return self.reply_error(e.to_string());
        }
        self.session.flush()?;

        let pushes = outgoing.take();
        if !pushes.is_empty() {
            self.negotiate(&pushes, Direction::Push)?;
        }

        self.responder.release();
        Ok(Step::Continue)
    }

    fn reply_error(&mut self, message: String) -> Result<Step> {
        self.session
            .write_control(&ControlMessage::internal_error(message))?;
        self.session.flush()?;
        Ok(Step::Continue)
    }

    /// Reserves one listener per reference, starts the transfers and
    /// announces the ports. Returns `false` when listeners were unavailable
    /// and an `INTERNAL_ERROR` was announced instead.
    fn negotiate(&mut self, refs: &[RawData], direction: Direction) -> Result<bool> {
        let ip = self.session.local_addr().ip();
        let acquired: Result<Vec<ListenerLease>> = refs
            .iter()
            .map(|_| self.context.listeners.acquire(ip))
            .collect();
        let leases = match acquired {
            Ok(leases) => leases,
            Err(e) => {
                warn!("handler {} cannot open side channels: {e}", self.id);
                for raw in refs {
                    raw.fail(e.to_string());
                    raw.close();
                }
                self.reply_error(e.to_string())?;
                return Ok(false);
            }
        };

        let mut ports = Vec::with_capacity(refs.len());
        for (raw, lease) in refs.iter().zip(leases) {
            let call = CallNumber::mint();
            ports.push(RawDataPort {
                id: raw.id(),
                call_number: call.value(),
                port: lease.port(),
            });
            trace!(
                "handler {} raw data {} {direction:?} on port {}",
                self.id,
                raw.id(),
                lease.port()
            );

            let raw = raw.clone();
            let pool = &self.context.raw_data_pool;
            match direction {
                Direction::Pull => spawn_transfer(
                    pool,
                    format!("pull of raw data {}", raw.id()),
                    move || lease.serve_lazy_pull(&raw, call),
                )?,
                Direction::Push => spawn_transfer(
                    pool,
                    format!("push of raw data {}", raw.id()),
                    move || lease.serve_push(raw, call).map(|_| ()),
                )?,
            }
        }

        self.session
            .write_control(&ControlMessage::raw_data_ports(ports))?;
        self.session.flush()?;
        Ok(true)
    }

    fn finalize(mut self, peer: SocketAddr) {
        self.closed.store(true, Ordering::Release);
        self.context.registry.unregister(self.id);
        self.session.close();
        self.responder.finalize(peer);
        info!("handler {} closed connection from {peer}", self.id);
    }
}
