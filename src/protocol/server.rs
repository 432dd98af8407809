use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::{DtpError, Result},
};

use super::{
    Responder, Session,
    handler::{Handler, HandlerContext, HandlerRegistry},
    listener::{ACCEPT_POLL_INTERVAL, ListenerPool, poll_accept},
    raw_data::lock,
    thread::ThreadPool,
};

type Factory<R> = dyn Fn() -> R + Send + Sync;

/// Accepts connections and serves each one with its own [`Responder`].
///
/// Every live connection occupies one handler pool thread, so
/// `max_handler_threads` caps concurrent connections. Side channel transfers
/// run on a separate raw data pool.
pub struct Server<R: Responder> {
    config: ServerConfig,
    factory: Arc<Factory<R>>,
    context: Arc<HandlerContext>,
    handler_pool: Arc<ThreadPool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: Arc<AtomicBool>,
}

impl<R: Responder> Server<R> {
    pub fn new<F>(config: ServerConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        let context = HandlerContext {
            listeners: ListenerPool::from_config(&config)?,
            raw_data_pool: ThreadPool::new("dtp-raw-data", config.max_raw_data_threads)?,
            registry: HandlerRegistry::default(),
            transfer: config.transfer,
            idle_timeout: config.idle_timeout,
        };

        Ok(Self {
            handler_pool: Arc::new(ThreadPool::new("dtp-handler", config.max_handler_threads)?),
            config,
            factory: Arc::new(factory),
            context: Arc::new(context),
            acceptor: Mutex::new(None),
            local_addr: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Binds the configured address and launches the accept thread. Calling
    /// it again while running returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut acceptor = lock(&self.acceptor);
        if let (Some(_), Some(addr)) = (acceptor.as_ref(), *lock(&self.local_addr)) {
            return Ok(addr);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(DtpError::ConnectionClosed);
        }

        let listener = TcpListener::bind(self.config.address)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("listening at {addr}");

        let accept = AcceptLoop {
            listener,
            factory: Arc::clone(&self.factory),
            context: Arc::clone(&self.context),
            handler_pool: Arc::clone(&self.handler_pool),
            closed: Arc::clone(&self.closed),
            max_frame_len: self.config.max_frame_len,
            next_id: AtomicU64::new(1),
        };
        let handle = thread::Builder::new()
            .name("dtp-acceptor".to_string())
            .spawn(move || accept.run())?;

        *acceptor = Some(handle);
        *lock(&self.local_addr) = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Number of connections currently registered.
    pub fn active_handlers(&self) -> usize {
        self.context.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting, closes every connection and every side channel
    /// listener. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing server");

        if let Some(acceptor) = lock(&self.acceptor).take() {
            if acceptor.join().is_err() {
                error!("acceptor thread panicked");
            }
        }

        // handlers unregister themselves concurrently; pop until empty
        while let Some(handler) = self.context.registry.pop() {
            handler.close();
        }
        self.context.listeners.close();
        info!("server closed");
    }
}

impl<R: Responder> Drop for Server<R> {
    fn drop(&mut self) {
        self.close();
    }
}

struct AcceptLoop<R: Responder> {
    listener: TcpListener,
    factory: Arc<Factory<R>>,
    context: Arc<HandlerContext>,
    handler_pool: Arc<ThreadPool>,
    closed: Arc<AtomicBool>,
    max_frame_len: usize,
    next_id: AtomicU64,
}

impl<R: Responder> AcceptLoop<R> {
    fn run(self) {
        while !self.closed.load(Ordering::Acquire) {
            match poll_accept(&self.listener) {
                Ok(Some((stream, peer))) => {
                    if let Err(e) = self.spawn_handler(stream) {
                        warn!("could not serve {peer}: {e}");
                    }
                }
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        debug!("acceptor stopped");
    }

    fn spawn_handler(&self, stream: TcpStream) -> Result<()> {
        let responder = (self.factory)();
        let session = Session::new(stream, self.max_frame_len)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let handler = Handler::new(id, session, responder, Arc::clone(&self.context));
        self.context.registry.register(id, handler.handle()?);
        if let Err(e) = self.handler_pool.execute(move || handler.run()) {
            self.context.registry.unregister(id);
            return Err(e);
        }
        Ok(())
    }
}
