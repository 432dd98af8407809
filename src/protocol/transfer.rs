//! Connector side of the side channel, and the handshake both sides share.
//!
//! # Wire layout
//!
//! A side channel carries exactly 8 bytes of big-endian call number followed
//! by the raw payload, terminated by the pusher closing its end.
//!
//! # Handshake
//!
//! The endpoint that drains or produces the whole payload right away *reads*
//! and validates the call number first. The endpoint that only wires the
//! socket into a [`RawData`] for later consumption *writes* the call number
//! as soon as the connection is up. Either peer can be listener or
//! connector, pusher or puller.
use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
};

use log::{debug, warn};

use crate::{
    config::TransferConfig,
    error::{DtpError, Result},
};

use super::{RawData, thread::ThreadPool};

pub const CALL_NUMBER_LEN: usize = size_of::<i64>();

/// Copy block size for payload transfers.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// One-time token correlating a side channel with its negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallNumber(i64);

impl CallNumber {
    pub fn mint() -> Self {
        Self(rand::random())
    }

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; CALL_NUMBER_LEN] {
        self.0.to_be_bytes()
    }

    pub(crate) fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()
    }

    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0; CALL_NUMBER_LEN];
        reader.read_exact(&mut buf)?;
        Ok(Self(i64::from_be_bytes(buf)))
    }

    pub(crate) fn verify(self, presented: CallNumber) -> Result<()> {
        if self == presented {
            Ok(())
        } else {
            Err(DtpError::CallNumberMismatch {
                expected: self.0,
                actual: presented.0,
            })
        }
    }
}

impl fmt::Debug for CallNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallNumber({:#018x})", self.0)
    }
}

/// Streams `raw` into `socket` until EOF, then closes the write half.
pub(crate) fn push_payload(raw: &mut RawData, socket: &mut TcpStream) -> Result<u64> {
    let mut buf = vec![0; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let n = raw.read(&mut buf)?;
        if n == 0 {
            break;
        }
        socket.write_all(&buf[..n])?;
        total += n as u64;
    }
    socket.flush()?;
    socket.shutdown(Shutdown::Write)?;
    Ok(total)
}

fn connect(addr: SocketAddr, transfer: &TransferConfig) -> Result<TcpStream> {
    let socket = TcpStream::connect_timeout(&addr, transfer.connect_timeout)?;
    socket.set_read_timeout(Some(transfer.read_timeout))?;
    socket.set_write_timeout(Some(transfer.read_timeout))?;
    Ok(socket)
}

/// Connects to the peer's listener, validates the call number it announces,
/// then pushes every byte of `raw`. Returns the number of bytes pushed.
pub fn connect_push(
    addr: SocketAddr,
    mut raw: RawData,
    call: CallNumber,
    transfer: &TransferConfig,
) -> Result<u64> {
    let result = connect(addr, transfer).and_then(|mut socket| {
        let presented = CallNumber::read_from(&mut socket)?;
        if let Err(e) = call.verify(presented) {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(e);
        }
        push_payload(&mut raw, &mut socket)
    });
    raw.close();
    result
}

/// Connects to the peer's listener, announces the call number and wires the
/// socket into `raw` for lazy consumption.
pub fn connect_lazy_pull(
    addr: SocketAddr,
    raw: &RawData,
    call: CallNumber,
    transfer: &TransferConfig,
) -> Result<()> {
    let result = connect(addr, transfer).and_then(|mut socket| {
        call.write_to(&mut socket)?;
        raw.wire_socket(socket, None)
    });
    if let Err(e) = &result {
        raw.fail(format!("side channel to {addr} failed: {e}"));
    }
    result
}

/// Runs a transfer on the raw data pool, logging how it ended.
pub(crate) fn spawn_transfer<F>(pool: &ThreadPool, what: String, task: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    pool.execute(move || match task() {
        Ok(()) => debug!("{what} complete"),
        Err(e) => warn!("{what} failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        net::TcpListener,
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    fn transfer() -> TransferConfig {
        TransferConfig {
            accept_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            wire_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn call_number_is_big_endian() {
        let call = CallNumber::new(0x0102_0304_0506_0708);
        assert_eq!(call.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = CallNumber::read_from(&mut Cursor::new(call.to_bytes())).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn minted_call_numbers_differ() {
        assert_ne!(CallNumber::mint(), CallNumber::mint());
    }

    #[test]
    fn connect_push_refuses_wrong_announcement() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            CallNumber::new(5).write_to(&mut socket).unwrap();
            let mut received = Vec::new();
            let _ = socket.read_to_end(&mut received);
            received
        });

        let raw = RawData::from_source(Cursor::new(vec![9; 4096]));
        let err = connect_push(addr, raw.clone(), CallNumber::new(6), &transfer()).unwrap_err();

        assert!(matches!(
            err,
            DtpError::CallNumberMismatch {
                expected: 6,
                actual: 5
            }
        ));
        assert!(peer.join().unwrap().is_empty());
    }

    #[test]
    fn push_to_stalled_consumer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let call = CallNumber::mint();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let peer = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            call.write_to(&mut socket).unwrap();
            let _ = release_rx.recv();
        });

        let stalled = TransferConfig {
            read_timeout: Duration::from_millis(300),
            ..transfer()
        };
        let raw = RawData::from_source(io::repeat(0x5A).take(1 << 30));
        let started = Instant::now();

        assert!(connect_push(addr, raw, call, &stalled).is_err());
        assert!(started.elapsed() < Duration::from_secs(20));

        release_tx.send(()).unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn connect_lazy_pull_announces_then_wires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let call = CallNumber::mint();

        let peer = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let presented = CallNumber::read_from(&mut socket).unwrap();
            socket.write_all(b"payload").unwrap();
            presented
        });

        let pending = RawData::pending("5", Duration::from_secs(5)).unwrap();
        connect_lazy_pull(addr, &pending, call, &transfer()).unwrap();

        assert_eq!(pending.read_to_vec().unwrap(), b"payload");
        assert_eq!(peer.join().unwrap(), call);
    }

    #[test]
    fn failed_connect_fails_pending_reference() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let pending = RawData::pending("6", Duration::from_secs(5)).unwrap();
        assert!(connect_lazy_pull(addr, &pending, CallNumber::mint(), &transfer()).is_err());
        assert!(pending.read_to_vec().is_err());
    }
}
