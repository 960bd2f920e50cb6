//! STM32 ROM bootloader flasher.
//!
//! Drives the factory UART bootloader (AN3155) to identify a target, erase its flash and
//! program new firmware, using two control lines to move the target between its bootloader
//! and the user application.
//!
//! - [`device`] resolves a detected device identifier into a [`DeviceDescriptor`]
//! - [`Bootloader`] speaks the wire protocol over an `embedded-hal` serial port
//! - [`Programmer`] sequences the control lines around each bootloader exchange

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod bootloader;
pub mod device;
pub mod programmer;
pub mod protocol;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod sim;

pub use bootloader::{Bootloader, CommandList, Version};
pub use device::{lookup, DeviceDescriptor, Family};
pub use programmer::{Programmer, State};
pub use protocol::{Command, EraseCommand};

/// Drives the mode-select (BOOT0) and reset lines of the target.
///
/// Levels are physical: `set_boot0(true)` selects the bootloader on the next reset and
/// `set_reset(false)` holds the target in reset. The serial port is passed in for
/// implementations that use the port's own modem lines.
pub trait ControlLines<P, E> {
    fn set_boot0(&mut self, port: &mut P, high: bool) -> Result<(), E>;
    fn set_reset(&mut self, port: &mut P, high: bool) -> Result<(), E>;
}

/// Control lines on a pair of GPIO outputs
pub struct PinLines<B, R> {
    pub boot0: B,
    pub reset: R,
}

impl<B, R> PinLines<B, R> {
    pub fn new(boot0: B, reset: R) -> Self {
        Self { boot0, reset }
    }
}

fn set_pin<O: OutputPin>(pin: &mut O, high: bool) -> Result<(), O::Error> {
    if high {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

impl<P, B, R, E> ControlLines<P, E> for PinLines<B, R>
where
    B: OutputPin,
    R: OutputPin,
    E: From<B::Error> + From<R::Error>,
{
    fn set_boot0(&mut self, _port: &mut P, high: bool) -> Result<(), E> {
        set_pin(&mut self.boot0, high).map_err(E::from)
    }

    fn set_reset(&mut self, _port: &mut P, high: bool) -> Result<(), E> {
        set_pin(&mut self.reset, high).map_err(E::from)
    }
}

/// Exchange stage at which a protocol fault occurred
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    Command,
    Address,
    Length,
    Data,
    EraseFrame,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Stage::Command => "command",
            Stage::Address => "address",
            Stage::Length => "length",
            Stage::Data => "data",
            Stage::EraseFrame => "erase frame",
        };
        f.write_str(s)
    }
}

/// How the target answered (or failed to answer) an exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fault {
    /// Target explicitly rejected the command or frame
    Nack,
    /// Nothing received before the deadline
    NoResponse,
    /// Received a byte that is neither ACK nor NACK
    Unexpected(u8),
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fault::Nack => f.write_str("NACK"),
            Fault::NoResponse => f.write_str("timeout/no ACK"),
            Fault::Unexpected(v) => write!(f, "unexpected response 0x{:02x}", v),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(E),

    #[error("control line error: {0:?}")]
    Control(E),

    #[error("SYNC failed")]
    SyncFailed,

    #[error("{cmd}: {fault} ({stage})")]
    Protocol { cmd: Command, stage: Stage, fault: Fault },

    #[error("{0}: missing final ACK")]
    MissingTrailingAck(Command),

    #[error("write error at 0x{addr:08x}: {fault} ({stage})")]
    Write { addr: u32, stage: Stage, fault: Fault },

    #[error("READ: len must be 1..256, got {0}")]
    InvalidLength(usize),

    #[error("chunk size must be 1..256, got {0}")]
    InvalidChunkSize(usize),

    #[error("GET: {count} commands exceed capacity of {capacity}")]
    TooManyCommands { count: usize, capacity: usize },

    #[error("unsupported erase command 0x{0:02x}")]
    UnsupportedEraseCommand(u8),

    #[error("RAM mismatch at index {index} (wrote 0x{expected:02x}, read 0x{actual:02x})")]
    VerifyMismatch { index: usize, expected: u8, actual: u8 },
}

impl<E: core::fmt::Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Serial(e)
    }
}

impl<E: core::fmt::Debug> Error<E> {
    /// Attach the chunk address to a WRITE protocol fault
    pub(crate) fn at(self, addr: u32) -> Self {
        match self {
            Error::Protocol {
                cmd: Command::WriteMemory,
                stage,
                fault,
            } => Error::Write { addr, stage, fault },
            e => e,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for the bootloader to answer the sync byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub sync_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the target in reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub reset_pulse_ms: u32,

    /// Period to wait after reset for the target to boot
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "120"))]
    pub boot_delay_ms: u32,

    /// Bytes per write frame (1..256)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "256"))]
    pub chunk_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 1000,
            poll_delay_ms: 1,
            reset_pulse_ms: 50,
            boot_delay_ms: 120,
            chunk_size: protocol::MAX_CHUNK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text() {
        let e: Error<()> = Error::Protocol {
            cmd: Command::GetId,
            stage: Stage::Command,
            fault: Fault::Nack,
        };
        assert_eq!(e.to_string(), "GET_ID: NACK (command)");

        let e: Error<()> = Error::MissingTrailingAck(Command::Get);
        assert_eq!(e.to_string(), "GET: missing final ACK");

        let e: Error<()> = Error::VerifyMismatch {
            index: 3,
            expected: 0x13,
            actual: 0x00,
        };
        assert!(e.to_string().starts_with("RAM mismatch at index 3"));
    }

    #[test]
    fn write_faults_carry_address() {
        let e: Error<()> = Error::Protocol {
            cmd: Command::WriteMemory,
            stage: Stage::Data,
            fault: Fault::NoResponse,
        };
        let e = e.at(0x0800_0100);
        assert_eq!(
            e,
            Error::Write {
                addr: 0x0800_0100,
                stage: Stage::Data,
                fault: Fault::NoResponse
            }
        );
        assert_eq!(e.to_string(), "write error at 0x08000100: timeout/no ACK (data)");

        let e: Error<()> = Error::SyncFailed;
        assert_eq!(e.at(0x0800_0000), Error::SyncFailed);
    }
}
