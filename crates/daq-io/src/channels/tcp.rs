//! TCP socket channel.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use daq_core::channel::{Channel, ChannelInterrupt};
use tracing::{debug, info};

/// Client connection to a network sensor.
///
/// The first read after [`connect`](Self::connect) or
/// [`reconnect`](Self::reconnect) is marked as new input. A peer close is
/// reported as `UnexpectedEof`, which ends the reader.
#[derive(Debug)]
pub struct TcpChannel {
    name: String,
    address: String,
    nonblocking: bool,
    timeout: Duration,
    stream: Option<TcpStream>,
    fresh: bool,
    new_input: bool,
}

impl TcpChannel {
    /// Connect to `address` within `timeout`.
    pub fn connect(
        name: impl Into<String>,
        address: impl Into<String>,
        nonblocking: bool,
        timeout: Duration,
    ) -> io::Result<Self> {
        let mut channel = Self {
            name: name.into(),
            address: address.into(),
            nonblocking,
            timeout,
            stream: None,
            fresh: false,
            new_input: false,
        };
        channel.reconnect()?;
        Ok(channel)
    }

    /// Drop the current connection (if any) and connect again.
    pub fn reconnect(&mut self) -> io::Result<()> {
        if let Some(old) = self.stream.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        let addr = resolve(&self.address)?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(self.nonblocking)?;
        info!(channel = %self.name, %addr, "Connected");
        self.stream = Some(stream);
        self.fresh = true;
        Ok(())
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(ErrorKind::AddrNotAvailable, format!("cannot resolve {address}"))
    })
}

impl Channel for TcpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream()?.read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("{} closed by peer", self.address),
            ));
        }
        self.new_input = std::mem::take(&mut self.fresh);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn is_new_input(&self) -> bool {
        self.new_input
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(stream) = self.stream.take() {
            debug!(channel = %self.name, "Closing");
            match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    fn interrupter(&self) -> Option<Box<dyn ChannelInterrupt>> {
        let clone = self.stream.as_ref()?.try_clone().ok()?;
        Some(Box::new(TcpInterrupt(clone)))
    }
}

/// Shuts the socket down so a blocked read returns.
struct TcpInterrupt(TcpStream);

impl ChannelInterrupt for TcpInterrupt {
    fn interrupt(&self) -> io::Result<()> {
        match self.0.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_read_marks_new_input_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"hello").unwrap();
            let mut echo = [0u8; 3];
            conn.read_exact(&mut echo).unwrap();
            echo
        });

        let mut channel =
            TcpChannel::connect("tcp", addr.to_string(), false, Duration::from_secs(2)).unwrap();
        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).unwrap();
        assert!(n > 0);
        assert!(channel.is_new_input());
        assert_eq!(channel.write(b"ack").unwrap(), 3);

        assert_eq!(&server.join().unwrap(), b"ack");
        let mut rest = n;
        while rest < 5 {
            rest += channel.read(&mut buf).unwrap();
            assert!(!channel.is_new_input());
        }
        let err = channel.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_interrupt_unblocks_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(5));
            drop(conn);
        });

        let mut channel =
            TcpChannel::connect("tcp", addr.to_string(), false, Duration::from_secs(2)).unwrap();
        let interrupt = channel.interrupter().unwrap();
        let reader = thread::spawn(move || channel.read(&mut [0u8; 8]));
        thread::sleep(Duration::from_millis(50));
        interrupt.interrupt().unwrap();
        assert!(reader.join().unwrap().is_err());
    }
}
