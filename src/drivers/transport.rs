use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};

use crate::drivers::RadarError;

/// Baud rate the radar firmware expects on its native USB port.
pub const USB_BAUD: u32 = 1_000_000;
/// Baud rate for the radar's UART header.
pub const UART_BAUD: u32 = 115_200;
/// Pause the radar needs between commands when talking over UART.
pub const SETTLE_DELAY: Duration = Duration::from_millis(5);

/// Physical link to the radar. USB links are paced by the device itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Link {
    #[default]
    Usb,
    Uart,
}

impl Link {
    pub fn baud(self) -> u32 {
        match self {
            Link::Usb => USB_BAUD,
            Link::Uart => UART_BAUD,
        }
    }

    pub fn settle_delay(self) -> Option<Duration> {
        match self {
            Link::Usb => None,
            Link::Uart => Some(SETTLE_DELAY),
        }
    }

    pub fn settle(self) {
        if let Some(delay) = self.settle_delay() {
            std::thread::sleep(delay);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FrameConfig {
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for FrameConfig {
    /// 8N1, the only framing either device speaks.
    fn default() -> Self {
        Self {
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// Byte-level duplex connection to one device.
pub trait SerialTransport: Send {
    fn link(&self) -> Link;

    /// Returns the bytes before the next `\n`, or an empty vec if none arrived in time.
    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, RadarError>;

    /// Fills `buf` until it is full or `timeout` runs out; returns how many bytes arrived.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, RadarError>;

    fn write(&mut self, bytes: &[u8]) -> Result<(), RadarError>;

    /// Safe to call more than once.
    fn close(&mut self);
}

/// `serialport`-backed transport used for real hardware.
pub struct SerialPortTransport {
    name: String,
    link: Link,
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialPortTransport {
    pub fn open(name: &str, baud: u32, frame: FrameConfig, link: Link) -> Result<Self, RadarError> {
        let port = serialport::new(name, baud)
            .data_bits(frame.data_bits)
            .parity(frame.parity)
            .stop_bits(frame.stop_bits)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| RadarError::Connection {
                port: name.to_string(),
                source,
            })?;
        debug!("opened {name} at {baud} baud");
        Ok(Self {
            name: name.to_string(),
            link,
            port: Some(port),
            pending: Vec::new(),
        })
    }

    /// Opens the radar port at the baud rate its link requires.
    pub fn open_radar(name: &str, link: Link) -> Result<Self, RadarError> {
        Self::open(name, link.baud(), FrameConfig::default(), link)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, RadarError> {
        self.port.as_mut().ok_or_else(|| {
            RadarError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "serial port already closed",
            ))
        })
    }

    /// One bounded read; `Ok(0)` means the deadline passed with nothing to read.
    fn read_some(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, RadarError> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(0);
        }
        let port = self.port_mut()?;
        port.set_timeout(deadline - now)
            .map_err(|err| RadarError::Io(err.into()))?;
        loop {
            match port.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::TimedOut => return Ok(0),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl SerialTransport for SerialPortTransport {
    fn link(&self) -> Link {
        self.link
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, RadarError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return Ok(line);
            }
            let n = self.read_some(&mut chunk, deadline)?;
            if n == 0 {
                // partial bytes stay in `pending` for the next call
                return Ok(Vec::new());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, RadarError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], deadline)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), RadarError> {
        let port = self.port_mut()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closed {}", self.name);
        }
        self.pending.clear();
    }
}

impl Drop for SerialPortTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// One line per detected port: `name: product [vid:pid]`.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => format!(
                    "{}: {} [{:04x}:{:04x}]",
                    port.port_name,
                    info.product.unwrap_or_default(),
                    info.vid,
                    info.pid
                ),
                other => format!("{}: {:?}", port.port_name, other),
            })
            .collect(),
        Err(err) => {
            warn!("could not enumerate serial ports: {err}");
            Vec::new()
        }
    }
}

/// First USB port that reports itself as a "USB Serial Device", which is how the radar enumerates.
pub fn detect_radar_port() -> Option<String> {
    serialport::available_ports()
        .ok()?
        .into_iter()
        .find(|port| match &port.port_type {
            SerialPortType::UsbPort(info) => info
                .product
                .as_deref()
                .is_some_and(|p| p.contains("USB Serial Device")),
            _ => false,
        })
        .map(|port| port.port_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uart_link_settles_and_usb_does_not() {
        assert_eq!(Link::Usb.settle_delay(), None);
        assert_eq!(Link::Uart.settle_delay(), Some(Duration::from_millis(5)));
        assert_eq!(Link::Usb.baud(), 1_000_000);
        assert_eq!(Link::Uart.baud(), 115_200);
    }

    #[test]
    fn opening_missing_port_is_a_connection_error() {
        let err = SerialPortTransport::open_radar("/dev/does-not-exist-uradsense", Link::Usb)
            .err()
            .unwrap();
        assert!(matches!(err, RadarError::Connection { .. }));
    }
}
