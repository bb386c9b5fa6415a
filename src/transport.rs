//! Bus transport for VoSPI packets
//!
//! The core only ever asks for one thing from the bus: a fixed-length full-duplex
//! transfer. [`PacketTransport`] is that seam. [`SpiTransport`] adapts any
//! `embedded-hal` SPI implementation to it, and with the `spidev` feature on Linux
//! [`open_spidev`] opens and configures `/dev/spidevX.Y` directly.
//!
//! Clock rate, word size and bus mode live in [`SpiConfig`](crate::config::SpiConfig);
//! they are handed to the opener and never interpreted by the capture path.

use std::fmt::Debug;

use embedded_hal::blocking::spi;
use thiserror::Error;

/// Errors raised by the bus transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error from the underlying device
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by an `embedded-hal` bus implementation
    #[error("bus error: {0}")]
    Bus(String),

    /// The bus returned fewer bytes than requested
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes requested
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// A recorded packet is longer than the transfer buffer
    #[error("packet size mismatch: transfer is {expected} bytes, packet has {actual}")]
    PacketSize {
        /// Bytes requested
        expected: usize,
        /// Bytes in the recorded packet
        actual: usize,
    },

    /// A finite packet source (replay) has no more packets
    #[error("packet source exhausted")]
    Exhausted,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One fixed-size full-duplex exchange with the sensor
///
/// `buf` is clocked out (the sensor ignores MOSI, so callers pass zeros) and is
/// overwritten with the received packet. Implementations must fill the whole buffer
/// or fail.
pub trait PacketTransport {
    /// Perform one transfer of `buf.len()` bytes
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the bus fails or cannot supply a full packet.
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()>;
}

impl<T: PacketTransport + ?Sized> PacketTransport for &mut T {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).transfer(buf)
    }
}

impl<T: PacketTransport + ?Sized> PacketTransport for Box<T> {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).transfer(buf)
    }
}

/// Adapter from an `embedded-hal` blocking SPI bus to [`PacketTransport`]
#[derive(Debug)]
pub struct SpiTransport<S> {
    bus: S,
    transfers: u64,
}

impl<S> SpiTransport<S>
where
    S: spi::Transfer<u8>,
    S::Error: Debug,
{
    /// Wrap an already configured SPI bus
    pub fn new(bus: S) -> Self {
        Self { bus, transfers: 0 }
    }

    /// Number of completed transfers
    pub fn transfer_count(&self) -> u64 {
        self.transfers
    }

    /// Release the underlying bus
    pub fn into_inner(self) -> S {
        self.bus
    }
}

impl<S> PacketTransport for SpiTransport<S>
where
    S: spi::Transfer<u8>,
    S::Error: Debug,
{
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let expected = buf.len();
        let buf_ptr = buf.as_ptr();

        let received = self
            .bus
            .transfer(buf)
            .map_err(|e| TransportError::Bus(format!("{:?}", e)))?;

        // Most implementations hand back `buf` itself; copy only if they didn't
        if received.len() != expected {
            return Err(TransportError::ShortRead {
                expected,
                actual: received.len(),
            });
        }
        if received.as_ptr() != buf_ptr {
            let copy = received.to_vec();
            buf.copy_from_slice(&copy);
        }

        self.transfers += 1;
        Ok(())
    }
}

/// Open and configure a Linux spidev node for VoSPI
///
/// # Errors
///
/// Returns `TransportError::Io` if the device cannot be opened or configured.
#[cfg(all(feature = "spidev", target_os = "linux"))]
pub fn open_spidev(
    config: &crate::config::SpiConfig,
) -> Result<SpiTransport<linux_embedded_hal::Spidev>> {
    use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};

    let mut spi = linux_embedded_hal::Spidev::open(&config.device)?;

    let mode = match config.mode {
        0 => SpiModeFlags::SPI_MODE_0,
        1 => SpiModeFlags::SPI_MODE_1,
        2 => SpiModeFlags::SPI_MODE_2,
        _ => SpiModeFlags::SPI_MODE_3,
    };
    let options = SpidevOptions::new()
        .bits_per_word(config.bits_per_word)
        .max_speed_hz(config.speed_hz)
        .mode(mode)
        .build();
    spi.0.configure(&options)?;

    log::info!(
        "SPI configured: {} mode={} bits={} speed={}MHz",
        config.device,
        config.mode,
        config.bits_per_word,
        config.speed_hz / 1_000_000
    );

    Ok(SpiTransport::new(spi))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal SPI bus that answers every transfer with a fixed pattern
    struct PatternBus {
        pattern: Vec<u8>,
        fail: bool,
    }

    impl spi::Transfer<u8> for PatternBus {
        type Error = &'static str;

        fn transfer<'w>(
            &mut self,
            words: &'w mut [u8],
        ) -> std::result::Result<&'w [u8], Self::Error> {
            if self.fail {
                return Err("bus fault");
            }
            for (word, &value) in words.iter_mut().zip(self.pattern.iter().cycle()) {
                *word = value;
            }
            Ok(words)
        }
    }

    #[test]
    fn test_spi_transport_fills_buffer() {
        let bus = PatternBus {
            pattern: vec![0xF0, 0x00, 0xAB],
            fail: false,
        };
        let mut transport = SpiTransport::new(bus);
        let mut buf = [0u8; 6];

        transport.transfer(&mut buf).unwrap();

        assert_eq!(buf, [0xF0, 0x00, 0xAB, 0xF0, 0x00, 0xAB]);
        assert_eq!(transport.transfer_count(), 1);
    }

    #[test]
    fn test_spi_transport_maps_bus_error() {
        let bus = PatternBus {
            pattern: vec![0],
            fail: true,
        };
        let mut transport = SpiTransport::new(bus);
        let mut buf = [0u8; 4];

        let result = transport.transfer(&mut buf);

        assert!(matches!(result, Err(TransportError::Bus(ref msg)) if msg.contains("bus fault")));
        assert_eq!(transport.transfer_count(), 0);
    }

    #[test]
    fn test_transport_through_mut_ref() {
        fn read_one<T: PacketTransport>(mut transport: T) -> [u8; 2] {
            let mut buf = [0u8; 2];
            transport.transfer(&mut buf).unwrap();
            buf
        }

        let mut transport = SpiTransport::new(PatternBus {
            pattern: vec![0x12, 0x34],
            fail: false,
        });
        assert_eq!(read_one(&mut transport), [0x12, 0x34]);
        assert_eq!(transport.transfer_count(), 1);
    }
}
