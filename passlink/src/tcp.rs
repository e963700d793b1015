//! Blocking TCP transport over `std::net`.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};

use crate::transport::{Transport, TransportError, CONNECT_TIMEOUT};

/// TCP transport with per-call read timeouts and `TCP_NODELAY` set, so
/// small command PDUs are not held back by the kernel.
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(TransportError::Io)?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(TransportError::Io)?;
                    debug!("connected to {addr}");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    warn!("connect to {addr} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .map(TransportError::Io)
            .unwrap_or(TransportError::NotConnected))
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("disconnected from {}:{}", self.host, self.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        match stream.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(err) => {
                self.disconnect();
                Err(TransportError::Io(err))
            }
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        // A zero read timeout would mean "block forever" to the socket.
        let timeout = timeout.max(Duration::from_millis(1));
        stream
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Io)?;

        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.disconnect();
                Err(TransportError::Closed)
            }
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(Vec::new())
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(err) => {
                self.disconnect();
                Err(TransportError::Io(err))
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_sends_and_times_out_on_silence() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).unwrap();
            peer.write_all(&buf).unwrap();
            // Hold the connection open until the client hangs up.
            let _ = peer.read(&mut [0u8; 1]);
            buf
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port());
        transport.connect().unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.send(&[1, 2, 3, 4]).unwrap(), 4);

        // Echo comes back, then silence times out with an empty buffer.
        let mut got = Vec::new();
        while got.len() < 4 {
            let chunk = transport.receive(Duration::from_millis(500)).unwrap();
            assert!(!chunk.is_empty(), "echo should arrive before the timeout");
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert!(transport
            .receive(Duration::from_millis(20))
            .unwrap()
            .is_empty());

        transport.disconnect();
        assert_eq!(server.join().unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn remote_close_reports_once_then_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port());
        transport.connect().unwrap();
        server.join().unwrap();

        let mut saw_close = false;
        for _ in 0..10 {
            match transport.receive(Duration::from_millis(100)) {
                Err(TransportError::Closed) => {
                    saw_close = true;
                    break;
                }
                Ok(_) => continue,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_close);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.receive(Duration::from_millis(10)),
            Err(TransportError::NotConnected)
        ));
    }
}
