//! Serial port channel (requires the `serial` feature).

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use daq_core::channel::Channel;
use daq_core::config::Parity;
use serialport::{DataBits, SerialPort, StopBits};
use tracing::info;

/// Line settings for [`SerialChannel::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Line speed in bits per second.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: u8,
    /// Parity bit.
    pub parity: Parity,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Bounds a blocking read so the reader can notice a stop request.
    pub read_timeout: Duration,
}

/// Serial line to an instrument.
///
/// The read timeout is reported as "no data". The first read after open is
/// new input.
pub struct SerialChannel {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    settings: SerialSettings,
    fresh: bool,
    new_input: bool,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialChannel {
    /// Open `path` with `settings`.
    pub fn open(name: impl Into<String>, path: &str, settings: SerialSettings) -> io::Result<Self> {
        let name = name.into();
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unsupported data bits {other}"),
                ))
            }
        };
        let stop_bits = if settings.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(path, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(settings.read_timeout)
            .open()?;
        info!(channel = %name, path, baud = settings.baud_rate, "Serial port opened");

        Ok(Self {
            name,
            port: Some(port),
            settings,
            fresh: true,
            new_input: false,
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl Channel for SerialChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.port()?.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(0),
            Err(e) => return Err(e),
        };
        if n > 0 {
            self.new_input = std::mem::take(&mut self.fresh);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.port()?.write(buf) {
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(ErrorKind::WouldBlock.into()),
            other => other,
        }
    }

    fn is_new_input(&self) -> bool {
        self.new_input
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }

    fn baud_rate(&self) -> Option<u32> {
        Some(self.settings.baud_rate)
    }

    fn bits_per_byte(&self) -> u32 {
        1 + u32::from(self.settings.data_bits)
            + u32::from(self.settings.parity != Parity::None)
            + u32::from(self.settings.stop_bits)
    }
}
