//! Adapter for serial ports opened through `linux-embedded-hal`.

use std::io::ErrorKind as IoErrorKind;

use linux_embedded_hal::serial_core::{
    self, BaudRate, CharSize, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

fn io_kind(e: serial_core::Error) -> IoErrorKind {
    match e.kind() {
        ErrorKind::Io(k) => k,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        ErrorKind::NoDevice => IoErrorKind::NotFound,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Apply the 8E1 framing the bootloader expects to an open port
pub fn configure(port: &mut Serial, baud: usize) -> Result<(), serial_core::Error> {
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityEven);

    port.0.write_settings(&settings)
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a programmer over an already opened linux serial port
    pub fn linux(mut port: Serial, baud: usize, options: Options) -> Result<Self, serial_core::Error> {
        configure(&mut port, baud)?;

        debug!("Configured port for {} baud 8E1", baud);

        Ok(Self::new(port, Delay {}, options))
    }
}
