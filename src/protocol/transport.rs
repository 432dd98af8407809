use std::{
    io::{self, BufReader, BufWriter, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use log::trace;
use thiserror::Error;

use super::{ControlMessage, RawDataScope};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrame(u8),
    #[error("expected a {expected} frame")]
    UnexpectedFrame { expected: &'static str },
}

impl TransportError {
    /// Whether the byte stream may be misaligned after this error.
    ///
    /// Encode and decode failures happen on a fully buffered frame, so the
    /// next frame still starts where expected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::FrameTooLarge { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Io(e) => {
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
            }
            _ => false,
        }
    }
}

/// Bincode configuration of every structured payload.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

const FRAME_MESSAGE: u8 = 0x00;
const FRAME_CONTROL: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Message,
    Control,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Message => FRAME_MESSAGE,
            FrameKind::Control => FRAME_CONTROL,
        }
    }
}

/// Writes `kind`, a big-endian `u32` length and the payload.
pub(crate) fn write_frame<W: Write>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&[kind.tag()])?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Reads one frame. `None` means the peer closed the stream between frames.
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<(FrameKind, Vec<u8>)>, TransportError> {
    let mut tag = [0; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut len = [0; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;

    match tag[0] {
        FRAME_MESSAGE => Ok(Some((FrameKind::Message, payload))),
        FRAME_CONTROL => Ok(Some((FrameKind::Control, payload))),
        other => Err(TransportError::UnknownFrame(other)),
    }
}

/// A structured frame as read from the session.
#[derive(Debug)]
pub enum Incoming<T> {
    Message(T),
    Control(ControlMessage),
}

/// Ordered, bidirectional channel of structured messages over TCP.
pub struct Session {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    stream: TcpStream,
    remote: SocketAddr,
    local: SocketAddr,
    closed: Arc<AtomicBool>,
    max_frame_len: usize,
}

impl Session {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream.try_clone()?),
            stream,
            remote,
            local,
            closed: Arc::new(AtomicBool::new(false)),
            max_frame_len,
        })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A, max_frame_len: usize) -> Result<Self, TransportError> {
        Self::new(TcpStream::connect(addr)?, max_frame_len)
    }

    pub fn write<T: Encode>(&mut self, message: &T) -> Result<(), TransportError> {
        let payload = bincode::encode_to_vec(message, wire_config())?;
        write_frame(&mut self.writer, FrameKind::Message, &payload)
    }

    pub fn write_control(&mut self, control: &ControlMessage) -> Result<(), TransportError> {
        trace!("-> {control:?}");
        let payload = bincode::encode_to_vec(control, wire_config())?;
        write_frame(&mut self.writer, FrameKind::Control, &payload)
    }

    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Reads the next frame. Raw data references found while decoding a
    /// business message are recorded in `scope`.
    pub fn read<T>(&mut self, scope: &RawDataScope) -> Result<Option<Incoming<T>>, TransportError>
    where
        T: Decode<RawDataScope>,
    {
        let Some((kind, payload)) = read_frame(&mut self.reader, self.max_frame_len)? else {
            return Ok(None);
        };

        match kind {
            FrameKind::Message => {
                let (message, _): (T, usize) =
                    bincode::decode_from_slice_with_context(&payload, wire_config(), scope.clone())?;
                Ok(Some(Incoming::Message(message)))
            }
            FrameKind::Control => Ok(Some(Incoming::Control(decode_control(&payload)?))),
        }
    }

    /// Reads a frame that must be a control message.
    pub fn read_control(&mut self) -> Result<Option<ControlMessage>, TransportError> {
        match read_frame(&mut self.reader, self.max_frame_len)? {
            None => Ok(None),
            Some((FrameKind::Control, payload)) => Ok(Some(decode_control(&payload)?)),
            Some((FrameKind::Message, _)) => {
                Err(TransportError::UnexpectedFrame { expected: "control" })
            }
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Shuts the socket down, unblocking any reader on another thread.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.stream.peer_addr().is_ok()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_host_address(&self) -> IpAddr {
        self.remote.ip()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Handle that closes this session from another thread.
    pub fn closer(&self) -> Result<SessionCloser, TransportError> {
        Ok(SessionCloser {
            stream: self.stream.try_clone()?,
            closed: Arc::clone(&self.closed),
        })
    }
}

fn decode_control(payload: &[u8]) -> Result<ControlMessage, TransportError> {
    let (control, _): (ControlMessage, usize) = bincode::decode_from_slice(payload, wire_config())?;
    trace!("<- {control:?}");
    Ok(control)
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct SessionCloser {
    stream: TcpStream,
    closed: Arc<AtomicBool>,
}

impl SessionCloser {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
