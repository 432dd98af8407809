//! Ephemeral side channel listeners and the per-address pool that owns them.
//!
//! A listener services exactly one transfer at a time. The pool lends it out
//! as a [`ListenerLease`]; dropping the lease hands the listener back, or
//! retires it for good once its socket has been closed.
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Write},
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::{
    config::{ServerConfig, TransferConfig},
    error::{DtpError, Result},
};

use super::{
    raw_data::{RawData, lock},
    transfer::{CallNumber, push_payload},
};

/// Interval between non-blocking accept attempts.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One non-blocking accept attempt; `None` when nobody is waiting.
pub(crate) fn poll_accept(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match listener.accept() {
        Ok((stream, peer)) => {
            stream.set_nonblocking(false)?;
            Ok(Some((stream, peer)))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e),
    }
}

/// Server socket bound to an OS-assigned port, used for one side channel
/// transfer at a time.
#[derive(Debug)]
pub struct SideChannelListener {
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    handling: AtomicBool,
    transfer: TransferConfig,
}

impl SideChannelListener {
    /// Binds an ephemeral port on `ip`, retrying while the OS reports the
    /// address as in use.
    pub fn bind(ip: IpAddr, retries: usize, transfer: TransferConfig) -> Result<Self> {
        let mut attempt = 0;
        let socket = loop {
            match TcpListener::bind(SocketAddr::new(ip, 0)) {
                Ok(socket) => break socket,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < retries => {
                    attempt += 1;
                    warn!("side channel bind on {ip} in use, retry {attempt}/{retries}");
                }
                Err(e) => return Err(e.into()),
            }
        };
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        debug!("side channel listener bound at {local_addr}");

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_addr,
            handling: AtomicBool::new(false),
            transfer,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True once the server socket has been closed.
    pub fn is_inactive(&self) -> bool {
        lock(&self.socket).is_none()
    }

    pub fn close(&self) {
        if lock(&self.socket).take().is_some() {
            debug!("side channel listener {} closed", self.local_addr);
        }
    }

    pub(crate) fn begin_handling(&self) -> Result<()> {
        self.handling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                DtpError::Implementation(format!(
                    "listener {} is already servicing a transfer",
                    self.local_addr
                ))
            })
    }

    fn end_handling(&self) {
        self.handling.store(false, Ordering::Release);
    }

    /// Waits up to the accept timeout for the peer. Failures other than the
    /// timeout leave the listener inactive.
    fn accept(&self) -> Result<TcpStream> {
        let deadline = Instant::now() + self.transfer.accept_timeout;
        loop {
            let accepted = {
                let socket = lock(&self.socket);
                let Some(socket) = socket.as_ref() else {
                    return Err(DtpError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        format!("listener {} is closed", self.local_addr),
                    )));
                };
                poll_accept(socket)
            };

            match accepted {
                Ok(Some((stream, peer))) => {
                    trace!("side channel {} accepted {peer}", self.local_addr);
                    return Ok(stream);
                }
                Ok(None) if Instant::now() >= deadline => {
                    return Err(DtpError::Timeout("side channel accept"));
                }
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Arc<SideChannelListener>>,
    tracked: Vec<Arc<SideChannelListener>>,
    closed: bool,
}

impl PoolState {
    fn forget(&mut self, listener: &Arc<SideChannelListener>) {
        self.tracked.retain(|l| !Arc::ptr_eq(l, listener));
        self.idle.retain(|l| !Arc::ptr_eq(l, listener));
    }
}

/// Listeners for a single bind address.
#[derive(Debug)]
struct AddressPool {
    ip: IpAddr,
    max: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl AddressPool {
    fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        create: impl Fn() -> Result<SideChannelListener>,
    ) -> Result<ListenerLease> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);

        loop {
            if state.closed {
                return Err(DtpError::PoolClosed);
            }

            while let Some(listener) = state.idle.pop_front() {
                if listener.is_inactive() {
                    state.forget(&listener);
                    continue;
                }
                return Ok(ListenerLease::new(listener, Arc::clone(self)));
            }

            if state.tracked.len() < self.max {
                let listener = Arc::new(create()?);
                state.tracked.push(Arc::clone(&listener));
                return Ok(ListenerLease::new(listener, Arc::clone(self)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DtpError::PoolExhausted(self.ip));
            }
            trace!("waiting for a side channel listener on {}", self.ip);
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Returns a listener after use; inactive ones are retired instead.
    fn release(&self, listener: Arc<SideChannelListener>) {
        listener.end_handling();
        let mut state = lock(&self.state);
        if listener.is_inactive() || state.closed {
            drop(state);
            self.retire(listener);
            return;
        }

        state.idle.push_back(listener);
        drop(state);
        self.available.notify_one();
    }

    /// Drops a listener permanently, freeing its slot under the cap.
    fn retire(&self, listener: Arc<SideChannelListener>) {
        listener.close();
        lock(&self.state).forget(&listener);
        debug!("side channel listener {} retired", listener.local_addr());
        self.available.notify_one();
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        for listener in state.tracked.drain(..) {
            listener.close();
        }
        state.idle.clear();
        drop(state);
        self.available.notify_all();
    }
}

/// Bounded pools of side channel listeners keyed by local bind address.
#[derive(Debug)]
pub struct ListenerPool {
    pools: Mutex<HashMap<IpAddr, Arc<AddressPool>>>,
    max_per_addr: usize,
    acquire_timeout: Duration,
    bind_retries: usize,
    transfer: TransferConfig,
    closed: AtomicBool,
}

impl ListenerPool {
    pub fn new(
        max_per_addr: usize,
        acquire_timeout: Duration,
        bind_retries: usize,
        transfer: TransferConfig,
    ) -> Result<Self> {
        if max_per_addr == 0 {
            return Err(DtpError::InvalidArgument(
                "at least one listener per bind address is required".to_string(),
            ));
        }

        Ok(Self {
            pools: Mutex::new(HashMap::new()),
            max_per_addr,
            acquire_timeout,
            bind_retries,
            transfer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(
            config.max_listeners_per_bind_addr,
            config.acquire_timeout,
            config.bind_retries,
            config.transfer,
        )
    }

    fn address_pool(&self, ip: IpAddr) -> Arc<AddressPool> {
        let mut pools = lock(&self.pools);
        let pool = pools.entry(ip).or_insert_with(|| {
            Arc::new(AddressPool {
                ip,
                max: self.max_per_addr,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            })
        });
        Arc::clone(pool)
    }

    /// Blocks until a listener on `ip` is idle or can be created under the
    /// per-address cap.
    pub fn acquire(&self, ip: IpAddr) -> Result<ListenerLease> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DtpError::PoolClosed);
        }

        let (retries, transfer) = (self.bind_retries, self.transfer);
        self.address_pool(ip)
            .acquire(self.acquire_timeout, || SideChannelListener::bind(ip, retries, transfer))
    }

    /// Listeners currently alive for `ip`, idle or leased.
    pub fn listener_count(&self, ip: IpAddr) -> usize {
        lock(&self.pools)
            .get(&ip)
            .map(|pool| lock(&pool.state).tracked.len())
            .unwrap_or(0)
    }

    pub fn idle_count(&self, ip: IpAddr) -> usize {
        lock(&self.pools)
            .get(&ip)
            .map(|pool| lock(&pool.state).idle.len())
            .unwrap_or(0)
    }

    /// Closes every tracked listener, leased or idle.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pools: Vec<_> = lock(&self.pools).values().cloned().collect();
        for pool in pools {
            pool.close();
        }
        info!("listener pool closed");
    }
}

impl Drop for ListenerPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A listener reserved for one transfer. Dropping the lease returns it.
#[derive(Debug)]
pub struct ListenerLease {
    listener: Option<Arc<SideChannelListener>>,
    pool: Arc<AddressPool>,
}

impl ListenerLease {
    fn new(listener: Arc<SideChannelListener>, pool: Arc<AddressPool>) -> Self {
        Self {
            listener: Some(listener),
            pool,
        }
    }

    fn listener(&self) -> Result<&Arc<SideChannelListener>> {
        self.listener
            .as_ref()
            .ok_or_else(|| DtpError::Implementation("listener lease already released".to_string()))
    }

    pub fn port(&self) -> u16 {
        self.listener.as_ref().map(|l| l.port()).unwrap_or(0)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    pub fn release(self) {}

    /// Accepts the peer, checks the call number it presents, then streams
    /// every byte of `raw` to it. Returns the number of bytes pushed.
    pub fn serve_push(self, mut raw: RawData, call: CallNumber) -> Result<u64> {
        let result = self.accept_checked(call).and_then(|mut socket| {
            let pushed = push_payload(&mut raw, &mut socket)?;
            debug!("raw data {} pushed {pushed} bytes", raw.id());
            Ok(pushed)
        });
        raw.close();
        result
    }

    fn accept_checked(&self, call: CallNumber) -> Result<TcpStream> {
        let listener = self.listener()?;
        listener.begin_handling()?;

        let mut socket = listener.accept()?;
        socket.set_read_timeout(Some(listener.transfer.read_timeout))?;
        socket.set_write_timeout(Some(listener.transfer.read_timeout))?;
        let presented = CallNumber::read_from(&mut socket)?;
        if let Err(e) = call.verify(presented) {
            warn!("side channel {} rejected: {e}", listener.local_addr());
            let _ = socket.shutdown(std::net::Shutdown::Both);
            return Err(e);
        }
        Ok(socket)
    }

    /// Accepts the peer, announces the call number, and wires the socket
    /// into `raw` for the consumer to read at its own pace. The lease moves
    /// into `raw` and is returned once the payload is exhausted or closed.
    pub fn serve_lazy_pull(self, raw: &RawData, call: CallNumber) -> Result<()> {
        let result = self
            .accept_announced(call)
            .and_then(|(socket, lease)| raw.wire_socket(socket, Some(lease)));
        if let Err(e) = &result {
            raw.fail(format!("side channel for raw data {} failed: {e}", raw.id()));
        }
        result
    }

    fn accept_announced(self, call: CallNumber) -> Result<(TcpStream, ListenerLease)> {
        let listener = self.listener()?;
        listener.begin_handling()?;

        let mut socket = listener.accept()?;
        socket.set_read_timeout(Some(listener.transfer.read_timeout))?;
        call.write_to(&mut socket)?;
        socket.flush()?;
        Ok((socket, self))
    }
}

impl Drop for ListenerLease {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.pool.release(listener);
        }
    }
}
