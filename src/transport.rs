//! Blocking request/response exchange over a non-blocking serial port.
//!
//! The bootloader only ever has a single transaction in flight, so the link
//! offers plain blocking sends and reads. Reads poll the port, sleeping for
//! the poll period between attempts and charging it against the timeout.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::error::LinkError;
use crate::protocol::{self, Response};

/// Time the reset lines are held asserted
pub const RESET_HOLD_MS: u32 = 100;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

pub struct Link<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Link<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            _err: PhantomData,
        }
    }

    /// Pulse DTR and RTS to reset the device, then wait `settle_ms` for the
    /// bootloader to come up
    pub fn reset(&mut self, settle_ms: u32) -> Result<(), LinkError<E>> {
        self.port.set_dtr(true).map_err(LinkError::Serial)?;
        self.port.set_rts(true).map_err(LinkError::Serial)?;

        self.delay.delay_ms(RESET_HOLD_MS);

        self.port.set_dtr(false).map_err(LinkError::Serial)?;
        self.port.set_rts(false).map_err(LinkError::Serial)?;

        self.delay.delay_ms(settle_ms);

        Ok(())
    }

    /// Write every byte of a frame and flush the port
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError<E>> {
        trace!("tx {:02x?}", bytes);

        for b in bytes {
            block!(self.port.write(*b)).map_err(LinkError::Serial)?;
        }

        block!(self.port.flush()).map_err(LinkError::Serial)
    }

    /// Receive exactly `n` bytes within `timeout_ms`.
    ///
    /// Bytes received before a timeout are dropped.
    pub fn recv_exact(&mut self, n: usize, timeout_ms: u32) -> Result<Vec<u8>, LinkError<E>> {
        let mut data = Vec::with_capacity(n);
        let mut t = 0u32;

        while data.len() < n {
            match self.port.read() {
                Ok(v) => {
                    data.push(v);
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(LinkError::Serial(e)),
            }

            if t >= timeout_ms {
                debug!("Receive timeout ({} of {} bytes)", data.len(), n);
                return Err(LinkError::Timeout {
                    expected: n,
                    received: data.len(),
                });
            }

            self.delay.delay_ms(self.poll_delay_ms);
            t = t.saturating_add(self.poll_delay_ms);
        }

        trace!("rx {:02x?}", data);

        Ok(data)
    }

    /// Await a single acknowledge byte
    pub fn expect_ack(&mut self, timeout_ms: u32) -> Result<Response, LinkError<E>> {
        let v = self.recv_exact(1, timeout_ms)?[0];

        protocol::decode_ack(v).map_err(|_| {
            debug!("Received unexpected value: 0x{:x}", v);
            LinkError::Unexpected(v)
        })
    }

    /// Return the port and delay provider
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::{UART_ACK, UART_NACK};

    #[derive(Debug, PartialEq)]
    struct Closed;

    /// Port replaying queued bytes, empty reads would block
    #[derive(Default)]
    struct Stub {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        flushes: usize,
        lines: Vec<(&'static str, bool)>,
        closed: bool,
    }

    impl Read<u8> for Stub {
        type Error = Closed;

        fn read(&mut self) -> nb::Result<u8, Closed> {
            if self.closed {
                return Err(nb::Error::Other(Closed));
            }
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    impl Write<u8> for Stub {
        type Error = Closed;

        fn write(&mut self, word: u8) -> nb::Result<(), Closed> {
            if self.closed {
                return Err(nb::Error::Other(Closed));
            }
            self.tx.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Closed> {
            self.flushes += 1;
            Ok(())
        }
    }

    impl SerialPort<Closed> for Stub {
        fn set_rts(&mut self, level: bool) -> Result<(), Closed> {
            self.lines.push(("rts", level));
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> Result<(), Closed> {
            self.lines.push(("dtr", level));
            Ok(())
        }
    }

    /// Delay that only accumulates the requested time
    #[derive(Default)]
    struct Clock(u32);

    impl DelayMs<u32> for Clock {
        fn delay_ms(&mut self, ms: u32) {
            self.0 += ms;
        }
    }

    fn link(rx: &[u8]) -> Link<Stub, Clock, Closed> {
        let port = Stub {
            rx: rx.iter().copied().collect(),
            ..Stub::default()
        };
        Link::new(port, Clock::default(), 1)
    }

    #[test]
    fn send_writes_frame_and_flushes() {
        let mut l = link(&[]);
        l.send(&[0x02, 0xFD]).unwrap();

        let (port, _) = l.release();
        assert_eq!(port.tx, vec![0x02, 0xFD]);
        assert_eq!(port.flushes, 1);
    }

    #[test]
    fn recv_exact_returns_requested_bytes() {
        let mut l = link(&[0x01, 0x04, 0x16, 0x79]);
        assert_eq!(l.recv_exact(3, 10), Ok(vec![0x01, 0x04, 0x16]));
        assert_eq!(l.expect_ack(10), Ok(Response::Ack));
    }

    #[test]
    fn recv_exact_times_out_without_data() {
        let mut l = link(&[]);
        assert_eq!(
            l.recv_exact(1, 2000),
            Err(LinkError::Timeout {
                expected: 1,
                received: 0
            })
        );

        let (_, clock) = l.release();
        assert_eq!(clock.0, 2000);
    }

    #[test]
    fn partial_reads_are_discarded() {
        let mut l = link(&[0xAA, 0xBB]);
        assert_eq!(
            l.recv_exact(4, 5),
            Err(LinkError::Timeout {
                expected: 4,
                received: 2
            })
        );
    }

    #[test]
    fn ack_nack_and_garbage() {
        let mut l = link(&[UART_ACK, UART_NACK, 0x42]);
        assert_eq!(l.expect_ack(1), Ok(Response::Ack));
        assert_eq!(l.expect_ack(1), Ok(Response::Nack));
        assert_eq!(l.expect_ack(1), Err(LinkError::Unexpected(0x42)));
        assert!(matches!(l.expect_ack(1), Err(LinkError::Timeout { .. })));
    }

    #[test]
    fn closed_port_fails_reads_promptly() {
        let mut l = link(&[UART_ACK]);
        l.port.closed = true;

        assert_eq!(l.expect_ack(60_000), Err(LinkError::Serial(Closed)));
        assert_eq!(l.send(&[0x00]), Err(LinkError::Serial(Closed)));

        let (_, clock) = l.release();
        assert_eq!(clock.0, 0);
    }

    #[test]
    fn zero_poll_period_still_advances() {
        let port = Stub::default();
        let mut l = Link::new(port, Clock::default(), 0);
        assert!(l.recv_exact(1, 3).is_err());

        let (_, clock) = l.release();
        assert_eq!(clock.0, 3);
    }

    #[test]
    fn reset_pulses_lines() {
        let mut l = link(&[]);
        l.reset(50).unwrap();

        let (port, clock) = l.release();
        assert_eq!(
            port.lines,
            vec![("dtr", true), ("rts", true), ("dtr", false), ("rts", false)]
        );
        assert_eq!(clock.0, RESET_HOLD_MS + 50);
    }
}
