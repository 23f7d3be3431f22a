use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    sync::mpsc::{self, Receiver, TryRecvError},
    thread,
    time::Duration,
};

use anyhow::Context;
use log::{debug, info, warn};
use mpp_common::{Connection, Connector, DatagramSocket};

const CONNECT_STACK_SIZE: usize = 8 * 1024;

/// The node's UDP socket: bound to the MPP port, joined to the multicast group, never blocking.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub fn bind(port: u16, group: Ipv4Addr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .with_context(|| format!("failed to bind UDP port {port}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to make the UDP socket non-blocking")?;
        match socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => info!("Joined multicast group {group} on port {port}"),
            Err(err) => warn!("Could not join multicast group {group}: {err}"),
        }
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpEndpoint {
    fn send_to(&mut self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, target)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Opens TCP connections on a short-lived helper thread so the tick never waits on a handshake
/// or a name lookup.
#[derive(Debug, Default)]
pub struct StdConnector;

impl StdConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for StdConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout_ms: u64,
    ) -> io::Result<Box<dyn Connection>> {
        let (tx, rx) = mpsc::channel();
        let host = host.to_string();
        let timeout = Duration::from_millis(timeout_ms.max(1));
        thread::Builder::new()
            .name("mpp-connect".into())
            .stack_size(CONNECT_STACK_SIZE)
            .spawn(move || {
                if tx.send(open(&host, port, timeout)).is_err() {
                    debug!("Connect to {host}:{port} finished after it was abandoned");
                }
            })?;
        Ok(Box::new(StdConnection::Pending(rx)))
    }
}

fn open(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(ErrorKind::NotFound, format!("{host} did not resolve"));
    for address in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                debug!("Connected to {address}");
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

enum StdConnection {
    Pending(Receiver<io::Result<TcpStream>>),
    Open(TcpStream),
    Closed,
}

impl Connection for StdConnection {
    fn poll_connect(&mut self) -> io::Result<bool> {
        let polled = match self {
            Self::Open(_) => return Ok(true),
            Self::Closed => return Err(ErrorKind::NotConnected.into()),
            Self::Pending(rx) => rx.try_recv(),
        };
        match polled {
            Ok(Ok(stream)) => {
                *self = Self::Open(stream);
                Ok(true)
            }
            Ok(Err(err)) => {
                *self = Self::Closed;
                Err(err)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                *self = Self::Closed;
                Err(io::Error::other("connect thread vanished"))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Open(stream) => stream.write(buf),
            _ => Err(ErrorKind::NotConnected.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Open(stream) => stream.read(buf),
            _ => Err(ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self) {
        if let Self::Open(stream) = self {
            let _ = stream.shutdown(Shutdown::Both);
        }
        *self = Self::Closed;
    }
}
