use std::{io, net::SocketAddr};

/// Non-blocking datagram endpoint.
pub trait DatagramSocket {
    fn send_to(&mut self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// `Ok(None)` when nothing is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Starts outbound TCP connections without blocking the caller.
pub trait Connector {
    fn connect(&mut self, host: &str, port: u16, timeout_ms: u64)
        -> io::Result<Box<dyn Connection>>;
}

/// A TCP stream that is polled, never waited on.
///
/// `write` and `read` follow the non-blocking socket convention: `WouldBlock` means try again
/// on a later tick and `Ok(0)` from `read` means the peer closed the stream.
pub trait Connection {
    /// `Ok(true)` once established.
    fn poll_connect(&mut self) -> io::Result<bool>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self);
}

/// The I/O a tick is allowed to touch.
pub struct Transport<'a> {
    pub datagrams: &'a mut dyn DatagramSocket,
    pub connector: &'a mut dyn Connector,
}
