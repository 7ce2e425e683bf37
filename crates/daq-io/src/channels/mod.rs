//! [`Channel`] backends and construction from configuration.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod udp;

use std::time::Duration;

use daq_core::channel::Channel;
use daq_core::config::{parse_separator, ChannelConfig};
use daq_core::error::{AppResult, DaqError};

pub use mock::MockChannel;
#[cfg(feature = "serial")]
pub use serial::{SerialChannel, SerialSettings};
pub use tcp::TcpChannel;
pub use udp::UdpChannel;

/// Open the channel a sensor's configuration describes.
pub fn open(name: &str, config: &ChannelConfig) -> AppResult<Box<dyn Channel>> {
    let channel_err = |e: std::io::Error| DaqError::Channel {
        channel: name.to_string(),
        message: e.to_string(),
    };

    match config {
        ChannelConfig::Tcp {
            address,
            nonblocking,
            connect_timeout_ms,
        } => {
            let channel = TcpChannel::connect(
                name,
                address.clone(),
                *nonblocking,
                Duration::from_millis(*connect_timeout_ms),
            )
            .map_err(channel_err)?;
            Ok(Box::new(channel))
        }
        ChannelConfig::Udp { bind, connect } => {
            let channel = UdpChannel::bind(name, bind, connect.as_deref()).map_err(channel_err)?;
            Ok(Box::new(channel))
        }
        #[cfg(feature = "serial")]
        ChannelConfig::Serial {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
            read_timeout_ms,
        } => {
            let settings = SerialSettings {
                baud_rate: *baud_rate,
                data_bits: *data_bits,
                parity: *parity,
                stop_bits: *stop_bits,
                read_timeout: Duration::from_millis(*read_timeout_ms),
            };
            let channel = SerialChannel::open(name, port, settings).map_err(channel_err)?;
            Ok(Box::new(channel))
        }
        #[cfg(not(feature = "serial"))]
        ChannelConfig::Serial { port, .. } => Err(DaqError::Configuration(format!(
            "sensor '{name}': serial port {port} requires the `serial` feature"
        ))),
        ChannelConfig::Mock {
            data,
            interval_ms,
            repeat,
        } => {
            let bytes = parse_separator(data)
                .map_err(|e| DaqError::Configuration(format!("sensor '{name}': {e}")))?;
            Ok(Box::new(MockChannel::replay(
                name,
                bytes,
                Duration::from_millis(*interval_ms),
                *repeat,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mock_from_config() {
        let config = ChannelConfig::Mock {
            data: "\\xff\\x01".into(),
            interval_ms: 0,
            repeat: false,
        };
        let mut channel = open("bench", &config).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[0xff, 0x01]);
        assert_eq!(channel.name(), "bench");
    }

    #[test]
    fn test_open_tcp_failure_is_channel_error() {
        // port 1 on localhost is closed
        let config = ChannelConfig::Tcp {
            address: "127.0.0.1:1".into(),
            nonblocking: false,
            connect_timeout_ms: 200,
        };
        assert!(matches!(
            open("gps", &config),
            Err(DaqError::Channel { channel, .. }) if channel == "gps"
        ));
    }
}
