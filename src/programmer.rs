//! Flash session controller.
//!
//! The target is not kept in the bootloader between calls: each operation resets into the
//! bootloader, synchronises, runs its exchanges and then resets back into the application.
//! `flash_buffer` and `read_flash_size_kb` only restore the application on failure, leaving
//! the target in the bootloader after success so the caller decides when to leave it.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::bootloader::{Bootloader, CommandList, Version};
use crate::device::{self, DeviceDescriptor};
use crate::protocol::{padded_len, EraseCommand, MAX_CHUNK};
use crate::{ControlLines, Error, Options};

/// Fixed pattern written and read back by [`Programmer::test_ram`]
pub const RAM_TEST_PATTERN: [u8; 16] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
];

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// No device detected yet, or disconnected
    Disconnected,
    /// A device descriptor has been detected and cached
    Connected,
}

/// When a bootloader session returns the target to its application
#[derive(Copy, Clone, PartialEq, Debug)]
enum Restore {
    Always,
    OnError,
}

pub struct Programmer<P, L, D, E> {
    state: State,
    options: Options,
    bootloader: Bootloader<P, D, E>,
    lines: L,
    device: DeviceDescriptor,
    /// Identifier as reported by GET_ID, including the revision bits
    raw_id: u16,
    description: String,
}

impl<P, L, D, E> Programmer<P, L, D, E>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    L: ControlLines<P, E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, lines: L, delay: D, options: Options) -> Self {
        let bootloader = Bootloader::new(port, delay, options.poll_delay_ms);

        Self {
            state: State::Disconnected,
            options,
            bootloader,
            lines,
            device: device::UNKNOWN,
            raw_id: 0,
            description: String::new(),
        }
    }

    /// Drive the control lines to their idle levels, leaving the application running
    pub fn begin(&mut self) -> Result<(), Error<E>> {
        self.set_boot0(false)?;
        self.set_reset(true)
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Release the underlying port, control lines and delay
    pub fn free(self) -> (P, L, D) {
        let (port, delay) = self.bootloader.free();
        (port, self.lines, delay)
    }

    /// Reset the target with BOOT0 asserted so it starts the ROM bootloader
    pub fn enter_bootloader(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting into bootloader");

        self.set_boot0(true)?;
        self.pulse_reset()?;

        self.bootloader.clear_rx()
    }

    /// Reset the target with BOOT0 released so it starts the user application
    pub fn exit_to_application(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting into application");

        self.set_boot0(false)?;
        self.pulse_reset()
    }

    fn pulse_reset(&mut self) -> Result<(), Error<E>> {
        self.set_reset(false)?;
        self.bootloader.delay_ms(self.options.reset_pulse_ms);
        self.set_reset(true)?;
        self.bootloader.delay_ms(self.options.boot_delay_ms);
        Ok(())
    }

    fn set_boot0(&mut self, high: bool) -> Result<(), Error<E>> {
        self.lines
            .set_boot0(self.bootloader.port(), high)
            .map_err(Error::Control)
    }

    fn set_reset(&mut self, high: bool) -> Result<(), Error<E>> {
        self.lines
            .set_reset(self.bootloader.port(), high)
            .map_err(Error::Control)
    }

    /// Run `f` inside a synchronised bootloader session.
    ///
    /// The application is restored on every failure path, and on success for `Restore::Always`.
    fn session<T, F>(&mut self, restore: Restore, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Bootloader<P, D, E>) -> Result<T, Error<E>>,
    {
        let sync_timeout_ms = self.options.sync_timeout_ms;

        let res = self.enter_bootloader().and_then(|_| {
            self.bootloader.synchronize(sync_timeout_ms)?;
            f(&mut self.bootloader)
        });

        match (res, restore) {
            (Ok(v), Restore::OnError) => Ok(v),
            (Ok(v), Restore::Always) => self.exit_to_application().map(|_| v),
            (Err(e), _) => {
                if let Err(restore_err) = self.exit_to_application() {
                    error!("Failed to restore application after '{}': {}", e, restore_err);
                }
                Err(e)
            }
        }
    }

    /// Identify the target and cache its descriptor.
    ///
    /// The erase command is taken from the bootloader's supported command list (extended
    /// erase preferred), falling back to the registry default if neither is listed.
    /// On success returns a description with the device name, identifier and flash size.
    pub fn detect(&mut self) -> Result<String, Error<E>> {
        self.state = State::Disconnected;

        let (id, commands) = self.session(Restore::Always, |bl| {
            let id = bl.identify()?;
            let commands = bl.get_supported_commands()?;
            Ok((id, commands))
        })?;

        let mut device = device::lookup(id);
        match commands.erase_command() {
            Some(erase) => device = device.with_erase_cmd(erase),
            None => warn!(
                "Bootloader lists no erase command, using {} default 0x{:02x}",
                device.family,
                u8::from(device.erase_cmd)
            ),
        }

        self.description = format!(
            "{} (ID: 0x{:x}, Flash: {}KB)",
            device.name, id, device.flash_kb
        );
        self.device = device;
        self.raw_id = id;
        self.state = State::Connected;

        info!("Detected {}", self.description);
        Ok(self.description.clone())
    }

    /// Erase all flash using the detected erase command and timeout
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        let erase = self.device.erase_cmd;
        let timeout_ms = self.device.erase_timeout_ms;

        info!("Mass erase ({}, timeout {} ms)", erase.command(), timeout_ms);
        self.session(Restore::Always, |bl| bl.mass_erase(erase, timeout_ms))
    }

    /// Write `data` at `addr`. The target stays in the bootloader on success.
    pub fn flash_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<E>> {
        let chunk_size = self.options.chunk_size;
        self.session(Restore::OnError, |bl| bl.write_memory(addr, data, chunk_size))
    }

    /// Write the 16 byte test pattern to RAM, read it back and compare
    pub fn test_ram(&mut self) -> Result<String, Error<E>> {
        let addr = self.device.ram_test_addr;

        self.session(Restore::Always, |bl| {
            bl.write_memory(addr, &RAM_TEST_PATTERN, MAX_CHUNK)?;

            let mut rx = [0u8; 16];
            bl.read_memory(addr, &mut rx)?;

            match RAM_TEST_PATTERN.iter().zip(rx.iter()).position(|(a, b)| a != b) {
                Some(index) => Err(Error::VerifyMismatch {
                    index,
                    expected: RAM_TEST_PATTERN[index],
                    actual: rx[index],
                }),
                None => Ok(format!("RAM Write/Read at 0x{:x} OK", addr)),
            }
        })
    }

    /// Read the flash size register (KB). The target stays in the bootloader on success.
    pub fn read_flash_size_kb(&mut self) -> Result<u16, Error<E>> {
        let addr = self.device.flash_size_addr;

        self.session(Restore::OnError, |bl| {
            let mut b = [0u8; 2];
            bl.read_memory(addr, &mut b)?;
            Ok(u16::from_le_bytes(b))
        })
    }

    /// Return the target to its application and forget the detected device
    pub fn disconnect(&mut self) -> Result<(), Error<E>> {
        self.state = State::Disconnected;
        self.device = device::UNKNOWN;
        self.raw_id = 0;
        self.description.clear();

        self.exit_to_application()
    }

    /// Raw device identifier as reported by GET_ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        self.session(Restore::Always, |bl| bl.identify())
    }

    pub fn version(&mut self) -> Result<Version, Error<E>> {
        self.session(Restore::Always, |bl| bl.get_version())
    }

    pub fn commands(&mut self) -> Result<CommandList, Error<E>> {
        self.session(Restore::Always, |bl| bl.get_supported_commands())
    }

    /// Read `buf.len()` bytes from `addr`, in reads of up to 256 bytes
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<E>> {
        self.session(Restore::Always, |bl| {
            let mut a = addr;
            for chunk in buf.chunks_mut(MAX_CHUNK) {
                bl.read_memory(a, chunk)?;
                a = a.wrapping_add(chunk.len() as u32);
            }
            Ok(())
        })
    }

    /// Program `image` at `addr`, optionally mass erasing first, then restart the application.
    ///
    /// `progress` is called with (bytes written, total) after each chunk.
    pub fn program<F>(
        &mut self,
        addr: u32,
        image: &[u8],
        erase: bool,
        mut progress: F,
    ) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let chunk_size = self.options.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK {
            return Err(Error::InvalidChunkSize(chunk_size));
        }

        if erase {
            self.mass_erase()?;
        }

        info!("Writing {} bytes at 0x{:08x}", image.len(), addr);

        self.session(Restore::Always, |bl| {
            let mut a = addr;
            let mut done = 0;

            for chunk in image.chunks(chunk_size) {
                bl.write_memory(a, chunk, chunk_size)?;

                a = a.wrapping_add(padded_len(chunk.len()) as u32);
                done += chunk.len();
                progress(done, image.len());
            }

            Ok(())
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Currently cached descriptor, [`device::UNKNOWN`] before detection
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Last identifier read by `detect`, before masking to 12 bits
    pub fn raw_device_id(&self) -> u16 {
        self.raw_id
    }

    /// 12-bit identifier used for the registry lookup
    pub fn device_id(&self) -> u16 {
        self.device.device_id
    }

    pub fn flash_kb(&self) -> u16 {
        self.device.flash_kb
    }

    pub fn erase_cmd(&self) -> EraseCommand {
        self.device.erase_cmd
    }

    pub fn erase_timeout_ms(&self) -> u32 {
        self.device.erase_timeout_ms
    }

    pub fn flash_start(&self) -> u32 {
        self.device.flash_start
    }

    pub fn ram_test_addr(&self) -> u32 {
        self.device.ram_test_addr
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}
