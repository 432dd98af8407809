//! Client side of a connection: sends one request at a time and mirrors the
//! server's side channel negotiation, connecting out instead of listening.
use std::{
    io::Read,
    net::{SocketAddr, ToSocketAddrs},
};

use bincode::{Decode, Encode};
use log::{debug, info};

use crate::{
    config::ClientConfig,
    error::{DtpError, Result},
};

use super::{
    ControlAction, ControlMessage, Incoming, RawData, RawDataScope, Session, TransportError,
    thread::ThreadPool,
    transfer::{CallNumber, connect_lazy_pull, connect_push, spawn_transfer},
};

pub struct Client {
    session: Session,
    config: ClientConfig,
    raw_data_pool: ThreadPool,
    outgoing: RawDataScope,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        let session = Session::connect(addr, config.max_frame_len)?;
        session.set_read_timeout(config.request_timeout)?;
        info!("connected to {}", session.remote_addr());

        Ok(Self {
            raw_data_pool: ThreadPool::new("dtp-client-raw-data", config.max_raw_data_threads)?,
            outgoing: RawDataScope::new(config.transfer.wire_timeout),
            session,
            config,
        })
    }

    /// Binds `source` as raw data for the next request. Every reference bound
    /// here must appear in that request.
    pub fn bind_raw_data<R>(&self, source: R) -> RawData
    where
        R: Read + Send + 'static,
    {
        self.outgoing.bind(source)
    }

    /// Sends `request` and waits for the response. Raw data in the request is
    /// pushed in the background; raw data in the response is returned
    /// pending and fills as the server pushes it.
    pub fn request<Req, Resp>(&mut self, request: &Req) -> Result<Resp>
    where
        Req: Encode,
        Resp: Decode<RawDataScope>,
    {
        let pushes = self.outgoing.take();
        if !self.session.is_connected() {
            close_all(&pushes);
            return Err(DtpError::NotConnected);
        }

        let result = self.exchange(request, pushes);
        if let Err(e) = &result {
            // nothing was written, or the server answered in place
            let aligned = matches!(
                e,
                DtpError::Remote(_) | DtpError::Transport(TransportError::Serialize(_))
            );
            if !aligned {
                debug!("closing session after failed request: {e}");
                self.session.close();
            }
        }
        result
    }

    fn exchange<Req, Resp>(&mut self, request: &Req, pushes: Vec<RawData>) -> Result<Resp>
    where
        Req: Encode,
        Resp: Decode<RawDataScope>,
    {
        if let Err(e) = self.session.write(request).and_then(|_| self.session.flush()) {
            close_all(&pushes);
            return Err(e.into());
        }

        if !pushes.is_empty() {
            let control = match self.expect_ports(pushes.len()) {
                Ok(control) => control,
                Err(e) => {
                    close_all(&pushes);
                    return Err(e);
                }
            };
            self.start_pushes(&control, pushes)?;
        }

        let incoming = RawDataScope::new(self.config.transfer.wire_timeout);
        let response = match self.session.read::<Resp>(&incoming) {
            Ok(Some(Incoming::Message(response))) => response,
            Ok(Some(Incoming::Control(control))) => {
                incoming.discard();
                return Err(match control.action {
                    ControlAction::InternalError => remote_error(control),
                    ControlAction::RawDataPorts => DtpError::Protocol(
                        "raw data ports announced in place of a response".to_string(),
                    ),
                });
            }
            Ok(None) => return Err(DtpError::ConnectionClosed),
            Err(e) => {
                incoming.discard();
                return Err(e.into());
            }
        };

        let pulls = incoming.take();
        if !pulls.is_empty() {
            let control = match self.expect_ports(pulls.len()) {
                Ok(control) => control,
                Err(e) => {
                    fail_all(&pulls, &e);
                    return Err(e);
                }
            };
            self.start_pulls(&control, pulls)?;
        }

        Ok(response)
    }

    /// Reads the control message announcing `expected` side channel ports.
    fn expect_ports(&mut self, expected: usize) -> Result<ControlMessage> {
        let control = self
            .session
            .read_control()?
            .ok_or(DtpError::ConnectionClosed)?;

        match control.action {
            ControlAction::InternalError => Err(remote_error(control)),
            ControlAction::RawDataPorts if control.ports.len() == expected => Ok(control),
            ControlAction::RawDataPorts => Err(DtpError::Protocol(format!(
                "expected {expected} raw data ports, got {}",
                control.ports.len()
            ))),
        }
    }

    fn side_channel(&self, control: &ControlMessage, raw: &RawData) -> Result<(SocketAddr, CallNumber)> {
        let port = control.port_for(raw.id()).ok_or_else(|| {
            DtpError::Protocol(format!("no side channel announced for raw data {}", raw.id()))
        })?;
        Ok((
            SocketAddr::new(self.session.remote_host_address(), port.port),
            CallNumber::new(port.call_number),
        ))
    }

    fn start_pushes(&self, control: &ControlMessage, pushes: Vec<RawData>) -> Result<()> {
        let planned: Result<Vec<_>> = pushes
            .iter()
            .map(|raw| self.side_channel(control, raw))
            .collect();
        let planned = match planned {
            Ok(planned) => planned,
            Err(e) => {
                close_all(&pushes);
                return Err(e);
            }
        };

        let transfer = self.config.transfer;
        for (raw, (addr, call)) in pushes.into_iter().zip(planned) {
            spawn_transfer(
                &self.raw_data_pool,
                format!("push of raw data {} to {addr}", raw.id()),
                move || connect_push(addr, raw, call, &transfer).map(|_| ()),
            )?;
        }
        Ok(())
    }

    fn start_pulls(&self, control: &ControlMessage, pulls: Vec<RawData>) -> Result<()> {
        let planned: Result<Vec<_>> = pulls
            .iter()
            .map(|raw| self.side_channel(control, raw))
            .collect();
        let planned = match planned {
            Ok(planned) => planned,
            Err(e) => {
                fail_all(&pulls, &e);
                return Err(e);
            }
        };

        let transfer = self.config.transfer;
        for (raw, (addr, call)) in pulls.into_iter().zip(planned) {
            spawn_transfer(
                &self.raw_data_pool,
                format!("pull of raw data {} from {addr}", raw.id()),
                move || connect_lazy_pull(addr, &raw, call, &transfer),
            )?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    pub fn close(&self) {
        self.session.close();
    }
}

fn remote_error(control: ControlMessage) -> DtpError {
    DtpError::Remote(
        control
            .message
            .unwrap_or_else(|| format!("peer answered with {:?}", control.action)),
    )
}

fn close_all(refs: &[RawData]) {
    for raw in refs {
        raw.close();
    }
}

fn fail_all(refs: &[RawData], error: &DtpError) {
    for raw in refs {
        raw.fail(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        net::{TcpListener, TcpStream},
        thread,
        time::Duration,
    };

    use crate::{
        config::TransferConfig,
        protocol::{
            RawDataPort,
            transport::{FrameKind, read_frame, wire_config, write_frame},
        },
    };

    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            transfer: TransferConfig {
                accept_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(5),
                read_timeout: Duration::from_secs(5),
                wire_timeout: Duration::from_secs(5),
            },
            ..ClientConfig::default()
        }
    }

    /// Runs `script` as a hand-written server on the accepted socket.
    fn scripted_server<F>(script: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || script(listener.accept().unwrap().0));
        addr
    }

    fn send_control(socket: &mut TcpStream, control: &ControlMessage) {
        let payload = bincode::encode_to_vec(control, wire_config()).unwrap();
        write_frame(socket, FrameKind::Control, &payload).unwrap();
    }

    #[test]
    fn port_count_mismatch_is_a_protocol_error() {
        let addr = scripted_server(|mut socket| {
            read_frame(&mut socket, 1024).unwrap();
            send_control(
                &mut socket,
                &ControlMessage::raw_data_ports(vec![
                    RawDataPort {
                        id: 1,
                        call_number: 1,
                        port: 1,
                    },
                    RawDataPort {
                        id: 2,
                        call_number: 2,
                        port: 2,
                    },
                ]),
            );
            thread::sleep(Duration::from_millis(200));
        });

        let mut client = Client::connect(addr, config()).unwrap();
        let data = client.bind_raw_data(Cursor::new(vec![1, 2, 3]));
        let err = client.request::<_, String>(&data).unwrap_err();

        assert!(matches!(err, DtpError::Protocol(_)));
        assert!(!client.is_connected());
        assert!(data.read_to_vec().is_err());
    }

    #[test]
    fn internal_error_in_place_of_response() {
        let addr = scripted_server(|mut socket| {
            read_frame(&mut socket, 1024).unwrap();
            send_control(&mut socket, &ControlMessage::internal_error("boom"));
            thread::sleep(Duration::from_millis(200));
        });

        let mut client = Client::connect(addr, config()).unwrap();
        let err = client.request::<_, String>(&"ping".to_string()).unwrap_err();

        assert!(matches!(err, DtpError::Remote(message) if message == "boom"));
        assert!(client.is_connected());
    }

    #[test]
    fn ports_in_place_of_response_close_the_session() {
        let addr = scripted_server(|mut socket| {
            read_frame(&mut socket, 1024).unwrap();
            send_control(
                &mut socket,
                &ControlMessage::raw_data_ports(vec![RawDataPort {
                    id: 5,
                    call_number: 5,
                    port: 5,
                }]),
            );
            thread::sleep(Duration::from_millis(200));
        });

        let mut client = Client::connect(addr, config()).unwrap();
        let err = client.request::<_, String>(&"ping".to_string()).unwrap_err();

        assert!(matches!(err, DtpError::Protocol(_)));
        assert!(!client.is_connected());
        let err = client.request::<_, String>(&"again".to_string()).unwrap_err();
        assert!(matches!(err, DtpError::NotConnected));
    }

    #[test]
    fn unscoped_raw_data_is_refused_before_sending() {
        let addr = scripted_server(|_socket| thread::sleep(Duration::from_millis(200)));

        let mut client = Client::connect(addr, config()).unwrap();
        let stray = RawData::from_source(Cursor::new(vec![1, 2, 3]));
        let err = client.request::<_, String>(&stray).unwrap_err();

        assert!(matches!(err, DtpError::Transport(TransportError::Serialize(_))));
        assert!(client.is_connected());
    }

    #[test]
    fn closed_client_is_not_connected() {
        let addr = scripted_server(|_socket| thread::sleep(Duration::from_millis(200)));

        let mut client = Client::connect(addr, config()).unwrap();
        client.close();

        let err = client.request::<_, String>(&"ping".to_string()).unwrap_err();
        assert!(matches!(err, DtpError::NotConnected));
    }

    #[test]
    fn server_hanging_up_is_reported() {
        let addr = scripted_server(|mut socket| {
            read_frame(&mut socket, 1024).unwrap();
        });

        let mut client = Client::connect(addr, config()).unwrap();
        let err = client.request::<_, String>(&"ping".to_string()).unwrap_err();
        assert!(matches!(err, DtpError::ConnectionClosed | DtpError::Transport(_)));
    }
}
