//! Blocking esp-hal UART behind the `embedded-io` traits the drivers use.

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use esp_hal::uart::Uart;
use esp_hal::Blocking;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialError {
    Rx,
    Tx,
}

impl embedded_io::Error for SerialError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct SerialPort {
    uart: Uart<'static, Blocking>,
}

impl SerialPort {
    pub fn new(uart: Uart<'static, Blocking>) -> Self {
        Self { uart }
    }
}

impl ErrorType for SerialPort {
    type Error = SerialError;
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.uart.read(buf).map_err(|_| SerialError::Rx)
    }
}

impl ReadReady for SerialPort {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.uart.read_ready())
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.uart.write(buf).map_err(|_| SerialError::Tx)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart.flush().map_err(|_| SerialError::Tx)
    }
}
