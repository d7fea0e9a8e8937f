//! TCP byte transport.
//!
//! Socket deadlines surface as `Timeout`, which a session treats as
//! "try again later". Any other socket failure is fatal to the session.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use sealwire_core::{Error, Status, Transport};

use crate::config::TransportConfig;
use crate::error::TransportError;

/// [`Transport`] over a connected `TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

fn is_timeout(err: &io::Error) -> bool {
    // Unix reports an expired socket deadline as WouldBlock, Windows as
    // TimedOut.
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn socket_error(status: Status, err: &io::Error) -> Error {
    if is_timeout(err) {
        Error::new(Status::Timeout)
    } else {
        Error::with_detail(status, err.to_string())
    }
}

impl TcpTransport {
    /// Connect to `config.address`, trying each resolved address in turn.
    pub fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let failed = |reason: String| TransportError::ConnectionFailed {
            address: config.address.clone(),
            reason,
        };
        let addrs = config
            .address
            .to_socket_addrs()
            .map_err(|err| failed(err.to_string()))?;

        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    tracing::debug!(%addr, "connected");
                    return Self::from_stream(stream);
                }
                Err(err) => last = Some(err),
            }
        }
        Err(failed(last.map_or_else(
            || "address resolved to nothing".to_string(),
            |err| err.to_string(),
        )))
    }

    /// Wrap an already connected stream, such as one from `accept`.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    /// Remote address, if the socket still knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> sealwire_core::Result<usize> {
        self.stream
            .read(buf)
            .map_err(|err| socket_error(Status::Read, &err))
    }

    fn write(&mut self, buf: &[u8]) -> sealwire_core::Result<usize> {
        self.stream
            .write(buf)
            .map_err(|err| socket_error(Status::Write, &err))
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> sealwire_core::Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|err| Error::with_detail(Status::BadParam, err.to_string()))
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> sealwire_core::Result<()> {
        self.stream
            .set_write_timeout(timeout)
            .map_err(|err| Error::with_detail(Status::BadParam, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig::new(listener.local_addr().unwrap().to_string());
        let client = TcpTransport::connect(&config).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_read_deadline_is_timeout() {
        let (mut client, _server) = connected();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert_eq!(err.status(), Status::Timeout);
    }

    #[test]
    fn test_bytes_flow_and_close_reads_zero() {
        let (mut client, mut server) = connected();
        assert!(client.peer_addr().is_some());
        assert_eq!(client.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        drop(server);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_connect_refused_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let config = TransportConfig::new(address.clone())
            .with_connect_timeout(Duration::from_secs(2));
        match TcpTransport::connect(&config) {
            Err(TransportError::ConnectionFailed { address: dialled, .. }) => {
                assert_eq!(dialled, address)
            }
            other => panic!("expected connection failure, got {other:?}"),
        }
    }
}
