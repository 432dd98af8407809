//! Raw data references: binary payloads that travel beside a structured
//! message instead of inside it.
//!
//! A [`RawData`] is a shared handle. The sender creates it *bound* to a real
//! byte source; the receiver's decoder creates it *pending* from the id found
//! in the message, and a side channel later *wires* a socket into it. Readers
//! that arrive before the socket block on a condition variable until the
//! reference is wired, fails, or the wire timeout elapses.
//!
//! On the structured channel a reference is encoded as its id rendered as a
//! string, never as bytes. Every reference decoded from a message, and every
//! reference bound for an outgoing message, is recorded in a [`RawDataScope`]
//! so the connection layer knows which side channels to negotiate.
use std::{
    fmt,
    io::{self, Read},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use bincode::{
    BorrowDecode, Decode, Encode,
    de::{BorrowDecoder, Decoder},
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use log::{debug, trace};

use crate::{
    config::TransferConfig,
    error::{DtpError, Result},
};

use super::listener::ListenerLease;

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

fn next_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Observable lifecycle of a [`RawData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDataState {
    Bound,
    Pending,
    Wired,
    Exhausted,
    Failed,
    Closed,
}

enum State {
    Bound(Box<dyn Read + Send>),
    Pending,
    Wired(Box<dyn Read + Send>),
    // Source lent to a reader outside the lock.
    Reading(RawDataState),
    Exhausted,
    Failed(String),
    Closed,
}

impl State {
    fn kind(&self) -> RawDataState {
        match self {
            State::Bound(_) => RawDataState::Bound,
            State::Pending => RawDataState::Pending,
            State::Wired(_) => RawDataState::Wired,
            State::Reading(kind) => *kind,
            State::Exhausted => RawDataState::Exhausted,
            State::Failed(_) => RawDataState::Failed,
            State::Closed => RawDataState::Closed,
        }
    }
}

struct Shared {
    id: i64,
    wire_timeout: Duration,
    // Bound through a scope, so a side channel is negotiated for it.
    scoped: bool,
    state: Mutex<State>,
    wired: Condvar,
    // Clone of the wired socket, used to unblock a reader on close.
    closer: Mutex<Option<TcpStream>>,
    // Listener kept reserved until the payload is consumed.
    lease: Mutex<Option<ListenerLease>>,
}

/// Handle to a binary payload exchanged over a side channel.
///
/// Clones share the same payload. A reference is meant for a single logical
/// consumer: a second clone that reads while another is mid-read waits for
/// that read to finish, and chunks are interleaved between them.
#[derive(Clone)]
pub struct RawData {
    shared: Arc<Shared>,
}

impl RawData {
    fn with_state(id: i64, wire_timeout: Duration, scoped: bool, state: State) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                wire_timeout,
                scoped,
                state: Mutex::new(state),
                wired: Condvar::new(),
                closer: Mutex::new(None),
                lease: Mutex::new(None),
            }),
        }
    }

    /// Creates a bound reference backed by `source`, readable immediately.
    /// It cannot be encoded into a message; use [`RawDataScope::bind`] for
    /// that.
    pub(crate) fn from_source<R>(source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::with_state(
            next_id(),
            TransferConfig::default().wire_timeout,
            false,
            State::Bound(Box::new(source)),
        )
    }

    /// Creates a pending placeholder for the id decoded from a message.
    pub fn pending(id: &str, wire_timeout: Duration) -> Result<Self> {
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|e| DtpError::InvalidArgument(format!("raw data id '{id}': {e}")))?;
        Ok(Self::with_state(id, wire_timeout, false, State::Pending))
    }

    pub fn id(&self) -> i64 {
        self.shared.id
    }

    pub fn state(&self) -> RawDataState {
        lock(&self.shared.state).kind()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == RawDataState::Pending
    }

    /// Attaches the byte source a pending reference has been waiting for and
    /// wakes every blocked reader.
    pub fn wire<R>(&self, source: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        self.attach(Box::new(source), None, None)
    }

    /// Wires a side channel socket; `lease` stays reserved until the payload
    /// is exhausted or the reference is closed.
    pub(crate) fn wire_socket(&self, socket: TcpStream, lease: Option<ListenerLease>) -> Result<()> {
        let closer = socket.try_clone()?;
        self.attach(Box::new(socket), Some(closer), lease)
    }

    fn attach(
        &self,
        source: Box<dyn Read + Send>,
        closer: Option<TcpStream>,
        lease: Option<ListenerLease>,
    ) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if !matches!(*state, State::Pending) {
            return Err(DtpError::Implementation(format!(
                "raw data {} cannot be wired while {:?}",
                self.id(),
                state.kind()
            )));
        }

        *state = State::Wired(source);
        *lock(&self.shared.closer) = closer;
        *lock(&self.shared.lease) = lease;
        drop(state);

        self.shared.wired.notify_all();
        trace!("raw data {} wired", self.id());
        Ok(())
    }

    /// Marks a pending reference as failed so blocked readers stop waiting.
    pub(crate) fn fail(&self, reason: String) {
        let mut state = lock(&self.shared.state);
        if matches!(*state, State::Pending) {
            debug!("raw data {} failed: {reason}", self.id());
            *state = State::Failed(reason);
            drop(state);
            self.shared.wired.notify_all();
        }
    }

    /// Releases the underlying stream or socket and, for a reference filled
    /// by a listener, hands that listener back to its pool.
    pub fn close(&self) {
        let closer = lock(&self.shared.closer).take();
        if let Some(socket) = closer {
            let _ = socket.shutdown(Shutdown::Both);
        }

        let previous = std::mem::replace(&mut *lock(&self.shared.state), State::Closed);
        drop(previous);
        self.shared.wired.notify_all();
        self.release_lease();
    }

    fn release_lease(&self) {
        let lease = lock(&self.shared.lease).take();
        drop(lease);
    }

    /// Reads the whole payload into memory.
    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.clone().read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for RawData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let shared = &self.shared;
        let state = lock(&shared.state);
        let (mut state, _) = shared
            .wired
            .wait_timeout_while(state, shared.wire_timeout, |s| {
                matches!(s, State::Pending | State::Reading(_))
            })
            .unwrap_or_else(|e| e.into_inner());

        let (kind, mut source) = match std::mem::replace(&mut *state, State::Closed) {
            State::Bound(source) => (RawDataState::Bound, source),
            State::Wired(source) => (RawDataState::Wired, source),
            other => {
                let result = unreadable(&other, shared);
                *state = other;
                return result;
            }
        };
        *state = State::Reading(kind);
        drop(state);

        let result = source.read(buf);
        let exhausted = matches!(result, Ok(0)) && !buf.is_empty();

        let mut state = lock(&shared.state);
        // closed during the read: the source is dropped with whatever it returned
        if !matches!(*state, State::Reading(_)) {
            return unreadable(&state, shared);
        }
        *state = match kind {
            _ if exhausted => State::Exhausted,
            RawDataState::Bound => State::Bound(source),
            _ => State::Wired(source),
        };
        drop(state);
        shared.wired.notify_all();

        if exhausted {
            lock(&shared.closer).take();
            self.release_lease();
        }
        result
    }
}

/// Outcome of a read on a reference that has no source to read from.
fn unreadable(state: &State, shared: &Shared) -> io::Result<usize> {
    match state {
        State::Pending => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "raw data {} was not wired within {:?}",
                shared.id, shared.wire_timeout
            ),
        )),
        State::Reading(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("raw data {} is busy with another reader", shared.id),
        )),
        State::Exhausted => Ok(0),
        State::Failed(reason) => Err(io::Error::other(reason.clone())),
        State::Closed => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            format!("raw data {} is closed", shared.id),
        )),
        State::Bound(_) | State::Wired(_) => Ok(0),
    }
}

impl fmt::Debug for RawData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawData")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for RawData {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for RawData {}

impl Encode for RawData {
    /// Only references bound through a [`RawDataScope`] and not yet read can
    /// travel; anything else would announce an id nobody serves.
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        if !self.shared.scoped || self.state() != RawDataState::Bound {
            return Err(EncodeError::OtherString(format!(
                "raw data {} ({:?}) has no side channel to travel on",
                self.id(),
                self.state()
            )));
        }
        self.id().to_string().encode(encoder)
    }
}

impl Decode<RawDataScope> for RawData {
    fn decode<D: Decoder<Context = RawDataScope>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let id = <String as Decode<RawDataScope>>::decode(decoder)?;
        let scope = decoder.context();
        let data = RawData::pending(&id, scope.wire_timeout)
            .map_err(|e| DecodeError::OtherString(e.to_string()))?;
        scope.record(data.clone());
        Ok(data)
    }
}

impl<'de> BorrowDecode<'de, RawDataScope> for RawData {
    fn borrow_decode<D: BorrowDecoder<'de, Context = RawDataScope>>(
        decoder: &mut D,
    ) -> Result<Self, DecodeError> {
        <Self as Decode<RawDataScope>>::decode(decoder)
    }
}

/// Accumulates the raw data references of one message.
///
/// A scope is opened per phase (request or response, on either peer). It is
/// the bincode decode context for incoming messages and the place where
/// outgoing references are bound. Clones share the same list.
#[derive(Debug, Clone)]
pub struct RawDataScope {
    entries: Arc<Mutex<Vec<RawData>>>,
    wire_timeout: Duration,
}

impl RawDataScope {
    pub fn new(wire_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            wire_timeout,
        }
    }

    /// Creates a bound reference for an outgoing message.
    pub fn bind<R>(&self, source: R) -> RawData
    where
        R: Read + Send + 'static,
    {
        let data = RawData::with_state(
            next_id(),
            self.wire_timeout,
            true,
            State::Bound(Box::new(source)),
        );
        self.record(data.clone());
        data
    }

    pub fn record(&self, data: RawData) {
        trace!("raw data {} recorded", data.id());
        lock(&self.entries).push(data);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        lock(&self.entries).iter().map(RawData::id).collect()
    }

    /// Empties the scope, returning what it collected in recording order.
    pub fn take(&self) -> Vec<RawData> {
        std::mem::take(&mut *lock(&self.entries))
    }

    /// Closes and forgets every recorded reference.
    pub fn discard(&self) {
        for data in self.take() {
            data.close();
        }
    }

    pub fn wire_timeout(&self) -> Duration {
        self.wire_timeout
    }
}

impl Default for RawDataScope {
    fn default() -> Self {
        Self::new(TransferConfig::default().wire_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use crate::protocol::transport::wire_config;

    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn read_chunked(data: &mut RawData, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0; chunk];
        loop {
            let n = data.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn bound_reads_exact_bytes_for_any_chunking() {
        let bytes = payload(10_000);

        for chunk in [1, 7, 4096, 65536] {
            let mut data = RawData::from_source(Cursor::new(bytes.clone()));
            assert_eq!(read_chunked(&mut data, chunk), bytes);
            assert_eq!(data.state(), RawDataState::Exhausted);
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = RawData::from_source(io::empty());
        let b = RawData::from_source(io::empty());
        assert!(b.id() > a.id());
    }

    #[test]
    fn pending_rejects_non_numeric_id() {
        let err = RawData::pending("not-a-number", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, DtpError::InvalidArgument(_)));
    }

    #[test]
    fn pending_read_blocks_until_wired() {
        let data = RawData::pending("42", Duration::from_secs(10)).unwrap();
        let (tx, rx) = mpsc::channel();

        let reader = data.clone();
        thread::spawn(move || tx.send(reader.read_to_vec().unwrap()).unwrap());

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        data.wire(Cursor::new(b"late bytes".to_vec())).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"late bytes");
    }

    #[test]
    fn pending_read_times_out_without_wire() {
        let mut data = RawData::pending("7", Duration::from_millis(50)).unwrap();
        let started = Instant::now();

        let err = data.read(&mut [0; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn reads_after_wire_do_not_block() {
        let data = RawData::pending("8", Duration::from_secs(30)).unwrap();
        data.wire(Cursor::new(vec![1, 2, 3])).unwrap();

        let started = Instant::now();
        assert_eq!(data.read_to_vec().unwrap(), vec![1, 2, 3]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wire_happens_once() {
        let data = RawData::pending("9", Duration::from_secs(1)).unwrap();
        data.wire(io::empty()).unwrap();

        let err = data.wire(io::empty()).unwrap_err();
        assert!(matches!(err, DtpError::Implementation(_)));

        let bound = RawData::from_source(io::empty());
        assert!(bound.wire(io::empty()).is_err());
    }

    #[test]
    fn failure_wakes_blocked_reader() {
        let data = RawData::pending("10", Duration::from_secs(30)).unwrap();
        let reader = data.clone();
        let handle = thread::spawn(move || reader.read_to_vec());

        thread::sleep(Duration::from_millis(50));
        data.fail("side channel refused".to_string());

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("side channel refused"));
    }

    #[test]
    fn closed_reference_rejects_reads_and_wiring() {
        let data = RawData::pending("11", Duration::from_secs(30)).unwrap();
        data.close();

        assert_eq!(data.state(), RawDataState::Closed);
        assert!(data.read_to_vec().is_err());
        assert!(data.wire(io::empty()).is_err());
    }

    #[test]
    fn encodes_as_id_string() {
        let data = RawDataScope::default().bind(Cursor::new(vec![0xAA; 128]));

        let encoded = bincode::encode_to_vec(&data, wire_config()).unwrap();
        let expected = bincode::encode_to_vec(data.id().to_string(), wire_config()).unwrap();
        assert_eq!(encoded, expected);
    }

    #[test]
    fn only_scoped_bound_references_encode() {
        let unscoped = RawData::from_source(Cursor::new(vec![1, 2, 3]));
        assert!(bincode::encode_to_vec(&unscoped, wire_config()).is_err());

        let received = RawData::pending("77", Duration::from_secs(1)).unwrap();
        assert!(bincode::encode_to_vec(&received, wire_config()).is_err());

        let consumed = RawDataScope::default().bind(io::empty());
        consumed.read_to_vec().unwrap();
        assert!(bincode::encode_to_vec(&consumed, wire_config()).is_err());
    }

    #[test]
    fn state_is_observable_during_blocked_read() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (socket, _) = listener.accept().unwrap();

        let data = RawData::pending("12", Duration::from_secs(30)).unwrap();
        data.wire_socket(socket, None).unwrap();

        let reader = data.clone();
        let handle = thread::spawn(move || reader.read_to_vec());
        thread::sleep(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel();
        let observer = data.clone();
        thread::spawn(move || tx.send(observer.state()).unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            RawDataState::Wired
        );

        data.close();
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        drop(peer);
    }

    #[test]
    fn decoding_records_pending_reference_in_scope() {
        let scope = RawDataScope::new(Duration::from_secs(1));
        let encoded = bincode::encode_to_vec("1234".to_string(), wire_config()).unwrap();

        let (decoded, _): (RawData, usize) =
            bincode::decode_from_slice_with_context(&encoded, wire_config(), scope.clone())
                .unwrap();

        assert_eq!(decoded.id(), 1234);
        assert!(decoded.is_pending());
        assert_eq!(scope.ids(), vec![1234]);
    }

    #[test]
    fn scope_bind_records_and_take_empties() {
        let scope = RawDataScope::default();
        let a = scope.bind(io::empty());
        let b = scope.bind(io::empty());

        assert_eq!(scope.ids(), vec![a.id(), b.id()]);
        let taken = scope.take();
        assert_eq!(taken, vec![a, b]);
        assert!(scope.is_empty());
    }
}
