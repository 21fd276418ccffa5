use std::{
    io::{self, Write},
    time::Duration,
};

use adcstream_core::Transport;

use crate::config::Stall;

/// Byte stream into anything that implements [`io::Write`], with optional
/// injected failures and a one-off stall.
pub struct IoTransport<W> {
    inner: W,
    fail_every: Option<u32>,
    stall: Option<Stall>,
    writes: u32,
    flushes: u32,
}

impl<W: Write> IoTransport<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            fail_every: None,
            stall: None,
            writes: 0,
            flushes: 0,
        }
    }

    pub fn fail_every(mut self, writes: Option<u32>) -> Self {
        self.fail_every = writes.filter(|&n| n > 0);
        self
    }

    pub fn stall(mut self, stall: Option<Stall>) -> Self {
        self.stall = stall;
        self
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Transport for IoTransport<W> {
    type Error = io::Error;

    fn write(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error> {
        self.writes += 1;

        if let Some(n) = self.fail_every {
            if self.writes % n == 0 {
                return Err(nb::Error::Other(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected failure",
                )));
            }
        }

        match self.inner.write(bytes) {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.flushes += 1;

        // Every flush ends one block. The sleep blocks the writer task, so the
        // run deadline and Ctrl-C only take effect once it is over.
        if let Some(stall) = self.stall {
            if self.flushes == stall.after_blocks {
                log::info!("Stalling the writer for {} ms", stall.duration_ms);
                std::thread::sleep(Duration::from_millis(stall.duration_ms));
            }
        }

        self.inner.flush().map_err(nb::Error::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failures() {
        let mut transport = IoTransport::new(Vec::new()).fail_every(Some(2));

        assert_eq!(transport.write(&[1, 2]).unwrap(), 2);
        assert!(matches!(transport.write(&[3]), Err(nb::Error::Other(_))));
        assert_eq!(transport.write(&[3]).unwrap(), 1);
        transport.flush().unwrap();

        assert_eq!(transport.into_inner(), [1, 2, 3]);
    }

    #[test]
    fn stalls_on_the_configured_block() {
        let mut transport = IoTransport::new(Vec::new()).stall(Some(Stall {
            after_blocks: 2,
            duration_ms: 30,
        }));

        transport.flush().unwrap();
        let start = std::time::Instant::now();
        transport.flush().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(transport.flushes, 2);
    }
}
