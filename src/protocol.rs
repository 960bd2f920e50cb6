//! Wire protocol constants and frame encoding
//!
//! Based on AN3155 (USART protocol used in the STM32 bootloader).

use core::convert::TryFrom;
use core::fmt;

use heapless::Vec;

/// Synchronisation byte, sent after every bootloader entry to detect the baud rate
pub const UART_SYNC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single READ or WRITE exchange
pub const MAX_CHUNK: usize = 256;

/// Length byte, padded payload and checksum
pub const MAX_DATA_FRAME: usize = MAX_CHUNK + 2;

/// Filler used to pad write payloads to a 4-byte boundary
pub const PAD_BYTE: u8 = 0xFF;

/// Deadline for command, address and length acknowledgements, and for read data
pub const COMMAND_TIMEOUT_MS: u32 = 1000;

/// Deadline for the data acknowledgement of a write, flash programming happens before the ACK
pub const WRITE_TIMEOUT_MS: u32 = 10000;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by
    /// the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available
    /// only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Map a byte from a supported command list back to a known command
    pub fn from_u8(v: u8) -> Option<Self> {
        let c = match v {
            0x00 => Command::Get,
            0x01 => Command::GetVersion,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x43 => Command::Erase,
            0x44 => Command::ExtendedErase,
            0x63 => Command::WriteProtect,
            0x73 => Command::WriteUnprotect,
            0x82 => Command::ReadoutProtect,
            0x92 => Command::ReadoutUnprotect,
            _ => return None,
        };
        Some(c)
    }

    /// Command byte followed by its complement
    pub fn frame(self) -> [u8; 2] {
        let c = self as u8;
        [c, c ^ 0xFF]
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Get => "GET",
            Command::GetVersion => "GET_VER",
            Command::GetId => "GET_ID",
            Command::ReadMemory => "READ",
            Command::Go => "GO",
            Command::WriteMemory => "WRITE",
            Command::Erase => "ERASE",
            Command::ExtendedErase => "XERASE",
            Command::WriteProtect => "WRITE_PROTECT",
            Command::WriteUnprotect => "WRITE_UNPROTECT",
            Command::ReadoutProtect => "READOUT_PROTECT",
            Command::ReadoutUnprotect => "READOUT_UNPROTECT",
        };
        f.write_str(name)
    }
}

/// Global erase variants
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EraseCommand {
    /// `0x43` with the `{0xFF, 0x00}` global erase frame
    Standard,
    /// `0x44` with the `{0xFF, 0xFF, 0x00}` special erase frame
    Extended,
}

impl EraseCommand {
    pub fn command(self) -> Command {
        match self {
            EraseCommand::Standard => Command::Erase,
            EraseCommand::Extended => Command::ExtendedErase,
        }
    }

    /// Bytes sent after the command has been acknowledged
    pub fn frame(self) -> &'static [u8] {
        match self {
            EraseCommand::Standard => &[0xFF, 0x00],
            EraseCommand::Extended => &[0xFF, 0xFF, 0x00],
        }
    }

    /// Select the erase command from a supported command list, extended erase is preferred
    pub fn from_supported(cmds: &[u8]) -> Option<Self> {
        if cmds.contains(&(Command::ExtendedErase as u8)) {
            Some(EraseCommand::Extended)
        } else if cmds.contains(&(Command::Erase as u8)) {
            Some(EraseCommand::Standard)
        } else {
            None
        }
    }
}

impl TryFrom<u8> for EraseCommand {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x43 => Ok(EraseCommand::Standard),
            0x44 => Ok(EraseCommand::Extended),
            other => Err(other),
        }
    }
}

impl From<EraseCommand> for u8 {
    fn from(e: EraseCommand) -> u8 {
        e.command() as u8
    }
}

/// XOR of every byte in the frame
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, b| c ^ b)
}

/// Big-endian address followed by its checksum
pub fn address_frame(addr: u32) -> [u8; 5] {
    let a = addr.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Length frame for a READ of `len` bytes, `len` must be in 1..=256
pub fn read_length_frame(len: usize) -> [u8; 2] {
    let n = (len - 1) as u8;
    [n, n ^ 0xFF]
}

/// Length the target advances by when writing `len` bytes
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Build a WRITE data frame: N = padded length - 1, payload padded with 0xFF, then the checksum
/// over N and every payload byte including padding.
///
/// Returns `None` for an empty payload or one over [`MAX_CHUNK`].
pub fn data_frame(payload: &[u8]) -> Option<Vec<u8, MAX_DATA_FRAME>> {
    if payload.is_empty() || payload.len() > MAX_CHUNK {
        return None;
    }

    let padded = padded_len(payload.len());
    let mut frame = Vec::new();

    frame.push((padded - 1) as u8).ok()?;
    frame.extend_from_slice(payload).ok()?;
    for _ in payload.len()..padded {
        frame.push(PAD_BYTE).ok()?;
    }

    let c = checksum(&frame);
    frame.push(c).ok()?;

    Some(frame)
}
