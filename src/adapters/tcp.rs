//! Non-blocking TCP transport adapter.
//!
//! Wraps a `std::net::TcpStream` in non-blocking mode so the I/O task can
//! poll it from its reactor timers. `WouldBlock` maps to "0 bytes", an
//! orderly shutdown by the peer maps to [`TransportError::NotConnected`].

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use log::info;

use crate::error::TransportError;
use crate::rpc::transport::Transport;

pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    connected: bool,
}

impl TcpTransport {
    /// Connect to `addr` (`host:port`).
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Adopt an accepted or already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        if let Some(peer) = peer {
            info!("IO: TCP connected to {}", peer);
        }
        Ok(Self {
            stream,
            peer,
            connected: true,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn fail(&mut self, e: std::io::Error) -> TransportError {
        self.connected = false;
        TransportError::from(e)
    }
}

fn transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

impl Transport for TcpTransport {
    type Error = TransportError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Err(TransportError::NotConnected)
            }
            Ok(n) => Ok(n),
            Err(e) if transient(e.kind()) => Ok(0),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if transient(e.kind()) => Ok(0),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        match self.stream.flush() {
            Ok(()) => Ok(()),
            Err(e) if transient(e.kind()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
