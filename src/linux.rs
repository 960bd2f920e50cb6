use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{ControlLines, Options, Programmer};

/// Control lines on the serial adapter's modem outputs: DTR drives reset, RTS drives BOOT0.
///
/// Asserting a modem line pulls the adapter's TTL output low, so a physical high is a
/// deasserted line unless the corresponding `invert_*` flag is set.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ModemLines {
    pub invert_reset: bool,
    pub invert_boot0: bool,
}

fn map_serial_err(e: SerialError) -> IoErrorKind {
    error!("Modem line error: {}", e);
    std::io::Error::from(e).kind()
}

impl ControlLines<Serial, IoErrorKind> for ModemLines {
    fn set_boot0(&mut self, port: &mut Serial, high: bool) -> Result<(), IoErrorKind> {
        port.0
            .set_rts(high == self.invert_boot0)
            .map_err(map_serial_err)
    }

    fn set_reset(&mut self, port: &mut Serial, high: bool) -> Result<(), IoErrorKind> {
        port.0
            .set_dtr(high == self.invert_reset)
            .map_err(map_serial_err)
    }
}

/// Programmer using a Linux serial port and its modem lines
pub type LinuxProgrammer = Programmer<Serial, ModemLines, Delay, IoErrorKind>;

impl Programmer<Serial, ModemLines, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        lines: ModemLines,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, the bootloader requires 8E1
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Reads return WouldBlock after one poll period so deadlines are kept by the engine
        port.0
            .set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        debug!("Opened serial port at {} baud", baud);

        // Return instance
        Ok(Self::new(port, lines, Delay {}, options))
    }
}
