use core::fmt;

use adcstream_core::Transport;
use embedded_hal::serial;

/// Block transport over a UART.
///
/// Bytes are pushed until the transmit register is full, so a single write
/// never waits on the line.
pub struct SerialTransport<S> {
    serial: S,
}

impl<S> SerialTransport<S> {
    pub fn new(serial: S) -> Self {
        Self { serial }
    }
}

impl<S> Transport for SerialTransport<S>
where
    S: serial::Write<u8>,
    S::Error: fmt::Debug,
{
    type Error = S::Error;

    fn write(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error> {
        let mut written = 0;

        for &byte in bytes {
            match self.serial.write(byte) {
                Ok(()) => written += 1,
                // Whatever went out so far counts, the error shows up again
                // on the next call
                Err(_) if written > 0 => break,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.serial.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transmit register that takes `room` bytes before it is full.
    struct Uart {
        sent: std::vec::Vec<u8>,
        room: usize,
        broken: bool,
    }

    impl serial::Write<u8> for Uart {
        type Error = &'static str;

        fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
            if self.broken {
                return Err(nb::Error::Other("framing"));
            }
            if self.room == 0 {
                return Err(nb::Error::WouldBlock);
            }
            self.room -= 1;
            self.sent.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn writes_until_full() {
        let mut transport = SerialTransport::new(Uart {
            sent: std::vec::Vec::new(),
            room: 2,
            broken: false,
        });

        assert_eq!(transport.write(&[1, 2, 3]), Ok(2));
        assert_eq!(transport.write(&[3]), Err(nb::Error::WouldBlock));
        assert_eq!(transport.serial.sent, [1, 2]);
    }

    #[test]
    fn reports_line_errors() {
        let mut transport = SerialTransport::new(Uart {
            sent: std::vec::Vec::new(),
            room: 8,
            broken: true,
        });

        assert_eq!(transport.write(&[1]), Err(nb::Error::Other("framing")));
    }
}
