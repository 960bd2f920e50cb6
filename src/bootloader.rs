//! Protocol engine for the STM32 UART bootloader.
//!
//! Every exchange takes an explicit deadline, reads are polled with the configured delay
//! so a silent target always ends in a timeout rather than blocking.

use core::fmt;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::*;
use crate::{Error, Fault, Stage};

/// Capacity of the supported command list returned by GET
pub const MAX_COMMANDS: usize = 64;

/// Upper bound on bytes discarded when clearing the receive buffer
const RX_DRAIN_LIMIT: usize = 4096;

/// Response to GET_VERSION
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Version {
    pub version: u8,
    pub option1: u8,
    pub option2: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Protocol version = 0x{:02X}, Opt1 = 0x{:02X}, Opt2 = 0x{:02X}",
            self.version, self.option1, self.option2
        )
    }
}

/// Response to GET
#[derive(Clone, PartialEq, Debug)]
pub struct CommandList {
    pub protocol_version: u8,
    pub commands: heapless::Vec<u8, MAX_COMMANDS>,
}

impl CommandList {
    pub fn supports(&self, cmd: Command) -> bool {
        self.commands.contains(&(cmd as u8))
    }

    /// Preferred global erase command, if the bootloader offers one
    pub fn erase_command(&self) -> Option<EraseCommand> {
        EraseCommand::from_supported(&self.commands)
    }
}

impl fmt::Display for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol version = 0x{:x}, CMDs: ", self.protocol_version)?;

        for (i, c) in self.commands.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match Command::from_u8(*c) {
                Some(cmd) => write!(f, "0x{:x} ({})", c, cmd)?,
                None => write!(f, "0x{:x}", c)?,
            }
        }

        Ok(())
    }
}

pub struct Bootloader<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Bootloader<P, D, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new bootloader engine, polling the port every `poll_delay_ms` while waiting
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
            _err: PhantomData,
        }
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Release the port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Discard any buffered input
    pub fn clear_rx(&mut self) -> Result<(), Error<E>> {
        for _ in 0..RX_DRAIN_LIMIT {
            match self.port.read() {
                Ok(v) => trace!("Discarded 0x{:02x}", v),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        warn!("Receive buffer still not empty after {} bytes", RX_DRAIN_LIMIT);
        Ok(())
    }

    /// Send the sync byte and await the bootloader's ACK
    pub fn synchronize(&mut self, timeout_ms: u32) -> Result<(), Error<E>> {
        self.clear_rx()?;

        debug!("Sending sync byte");
        self.send(&[UART_SYNC])?;

        match self.await_ack(timeout_ms)? {
            Ok(()) => {
                debug!("Bootloader synchronised");
                Ok(())
            }
            Err(f) => {
                debug!("Sync failed: {}", f);
                Err(Error::SyncFailed)
            }
        }
    }

    /// Read the 12-bit-plus-revision device identifier
    pub fn identify(&mut self) -> Result<u16, Error<E>> {
        let cmd = Command::GetId;
        self.command(cmd)?;

        let n = self.expect_byte(cmd, Stage::Length)?;

        let mut id = 0u16;
        for i in 0..=n as usize {
            let b = self.expect_byte(cmd, Stage::Data)?;
            if i < 2 {
                id = (id << 8) | b as u16;
            }
        }

        self.trailing_ack(cmd)?;

        debug!("Device ID: 0x{:04x}", id);
        Ok(id)
    }

    pub fn get_version(&mut self) -> Result<Version, Error<E>> {
        let cmd = Command::GetVersion;
        self.command(cmd)?;

        let version = self.expect_byte(cmd, Stage::Data)?;
        let option1 = self.expect_byte(cmd, Stage::Data)?;
        let option2 = self.expect_byte(cmd, Stage::Data)?;

        self.trailing_ack(cmd)?;

        Ok(Version {
            version,
            option1,
            option2,
        })
    }

    /// Fetch the bootloader protocol version and the commands it supports
    pub fn get_supported_commands(&mut self) -> Result<CommandList, Error<E>> {
        let cmd = Command::Get;
        self.command(cmd)?;

        let n = self.expect_byte(cmd, Stage::Length)? as usize;
        if n > MAX_COMMANDS {
            return Err(Error::TooManyCommands {
                count: n,
                capacity: MAX_COMMANDS,
            });
        }

        let protocol_version = self.expect_byte(cmd, Stage::Data)?;

        let mut commands = heapless::Vec::new();
        for _ in 0..n {
            let c = self.expect_byte(cmd, Stage::Data)?;
            commands.push(c).map_err(|_| Error::TooManyCommands {
                count: n,
                capacity: MAX_COMMANDS,
            })?;
        }

        self.trailing_ack(cmd)?;

        let list = CommandList {
            protocol_version,
            commands,
        };
        debug!("{}", list);

        Ok(list)
    }

    /// Read `buf.len()` (1..=256) bytes starting at `addr`
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<E>> {
        if buf.is_empty() || buf.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(buf.len()));
        }

        let cmd = Command::ReadMemory;
        self.command(cmd)?;

        self.send(&address_frame(addr))?;
        self.ack(cmd, Stage::Address, COMMAND_TIMEOUT_MS)?;

        self.send(&read_length_frame(buf.len()))?;
        self.ack(cmd, Stage::Length, COMMAND_TIMEOUT_MS)?;

        for b in buf.iter_mut() {
            *b = self.expect_byte(cmd, Stage::Data)?;
        }

        trace!("Read 0x{:08x}: {:02x?}", addr, buf);
        Ok(())
    }

    /// Write `data` starting at `addr`, split into frames of at most `chunk_size` bytes.
    ///
    /// Each chunk is padded to a word boundary and the target address advances by the
    /// padded length.
    pub fn write_memory(
        &mut self,
        addr: u32,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<(), Error<E>> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK {
            return Err(Error::InvalidChunkSize(chunk_size));
        }

        let mut addr = addr;
        for chunk in data.chunks(chunk_size) {
            self.write_chunk(addr, chunk).map_err(|e| e.at(addr))?;
            addr = addr.wrapping_add(padded_len(chunk.len()) as u32);
        }

        Ok(())
    }

    fn write_chunk(&mut self, addr: u32, chunk: &[u8]) -> Result<(), Error<E>> {
        let frame = data_frame(chunk).ok_or(Error::InvalidLength(chunk.len()))?;

        let cmd = Command::WriteMemory;
        self.command(cmd)?;

        self.send(&address_frame(addr))?;
        self.ack(cmd, Stage::Address, COMMAND_TIMEOUT_MS)?;

        self.send(&frame)?;
        self.ack(cmd, Stage::Data, WRITE_TIMEOUT_MS)?;

        trace!("Wrote {} bytes at 0x{:08x}", chunk.len(), addr);
        Ok(())
    }

    /// Erase all flash with the given command, waiting up to `timeout_ms` for completion
    pub fn mass_erase(&mut self, erase: EraseCommand, timeout_ms: u32) -> Result<(), Error<E>> {
        let cmd = erase.command();
        self.command(cmd)?;

        debug!("Erasing with {} (timeout {} ms)", cmd, timeout_ms);
        self.send(erase.frame())?;
        self.ack(cmd, Stage::EraseFrame, timeout_ms)?;

        Ok(())
    }

    /// Erase using a raw command byte, only 0x43 and 0x44 are accepted
    pub fn mass_erase_raw(&mut self, erase_cmd: u8, timeout_ms: u32) -> Result<(), Error<E>> {
        use core::convert::TryFrom;

        let erase = EraseCommand::try_from(erase_cmd).map_err(Error::UnsupportedEraseCommand)?;
        self.mass_erase(erase, timeout_ms)
    }

    /// Send a command frame and await its ACK
    fn command(&mut self, cmd: Command) -> Result<(), Error<E>> {
        trace!("Sending command {}", cmd);
        self.send(&cmd.frame())?;
        self.ack(cmd, Stage::Command, COMMAND_TIMEOUT_MS)
    }

    fn ack(&mut self, cmd: Command, stage: Stage, timeout_ms: u32) -> Result<(), Error<E>> {
        self.await_ack(timeout_ms)?
            .map_err(|fault| Error::Protocol { cmd, stage, fault })
    }

    fn trailing_ack(&mut self, cmd: Command) -> Result<(), Error<E>> {
        match self.read_byte(COMMAND_TIMEOUT_MS)? {
            Some(UART_ACK) => Ok(()),
            _ => Err(Error::MissingTrailingAck(cmd)),
        }
    }

    fn expect_byte(&mut self, cmd: Command, stage: Stage) -> Result<u8, Error<E>> {
        self.read_byte(COMMAND_TIMEOUT_MS)?.ok_or(Error::Protocol {
            cmd,
            stage,
            fault: Fault::NoResponse,
        })
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Outer error is a port failure, inner is how the target responded
    fn await_ack(&mut self, timeout_ms: u32) -> Result<Result<(), Fault>, Error<E>> {
        let r = match self.read_byte(timeout_ms)? {
            Some(UART_ACK) => Ok(()),
            Some(UART_NACK) => {
                debug!("Received bootloader nack");
                Err(Fault::Nack)
            }
            Some(v) => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Fault::Unexpected(v))
            }
            None => {
                debug!("Receive timeout after {} ms", timeout_ms);
                Err(Fault::NoResponse)
            }
        };
        Ok(r)
    }

    /// Read one byte, returning `None` once at least `timeout_ms` has elapsed
    pub fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            if t >= timeout_ms {
                return Ok(None);
            }

            self.delay.delay_ms(self.poll_delay_ms);
            t = t.saturating_add(self.poll_delay_ms);
        }
    }
}
