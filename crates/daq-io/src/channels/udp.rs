//! UDP datagram channel.

use std::io::{self, ErrorKind};
use std::net::UdpSocket;
use std::time::Duration;

use daq_core::channel::Channel;
use tracing::info;

/// How long a read waits for a datagram before reporting no data.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One datagram per read.
///
/// Messages never span datagrams, so every read is new input: a partial
/// message left over from the previous datagram is garbage.
#[derive(Debug)]
pub struct UdpChannel {
    name: String,
    socket: Option<UdpSocket>,
    connected: bool,
}

impl UdpChannel {
    /// Bind to `bind`, optionally accepting datagrams only from `connect`.
    pub fn bind(name: impl Into<String>, bind: &str, connect: Option<&str>) -> io::Result<Self> {
        let name = name.into();
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        if let Some(peer) = connect {
            socket.connect(peer)?;
        }
        info!(channel = %name, local = %socket.local_addr()?, "UDP socket bound");
        Ok(Self {
            name,
            socket: Some(socket),
            connected: connect.is_some(),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket()?.local_addr()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl Channel for UdpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket()?.recv(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "UDP channel has no peer to send to",
            ));
        }
        self.socket()?.send(buf)
    }

    fn is_new_input(&self) -> bool {
        true
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_round_trip() {
        let mut channel = UdpChannel::bind("udp", "127.0.0.1:0", None).unwrap();
        let addr = channel.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"$GPGGA,1*00\r\n", addr).unwrap();

        let mut buf = [0u8; 64];
        let mut n = 0;
        for _ in 0..20 {
            n = channel.read(&mut buf).unwrap_or(0);
            if n > 0 {
                break;
            }
        }
        assert_eq!(&buf[..n], b"$GPGGA,1*00\r\n");
        assert!(channel.is_new_input());
        assert_eq!(channel.write(b"x").unwrap_err().kind(), ErrorKind::NotConnected);
    }
}
