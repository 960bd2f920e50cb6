//! Simulated STM32 target for tests.
//!
//! Emulates the ROM bootloader behind a serial port, two control pins and a virtual clock.
//! Responses only become readable once the virtual clock reaches their ready time.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

use crate::protocol::*;
use crate::PinLines;

const FLASH_BASE: u32 = 0x0800_0000;
const FLASH_END: u32 = 0x0900_0000;

/// Behaviour of the emulated device
pub struct Target {
    pub device_id: u16,
    pub version: u8,
    pub commands: Vec<u8>,
    pub drop_trailing_ack: bool,
    /// Stop replying after this many bytes of a command's response
    pub truncate_after: Option<usize>,
    pub reject_writes_at: Option<u32>,
    pub corrupt_reads_at: Option<u32>,
    pub erase_duration_ms: u32,
    pub memory: BTreeMap<u32, u8>,
}

impl Target {
    /// STM32F103 medium density, bootloader v2.2 without extended erase
    pub fn f103_medium() -> Self {
        Self {
            device_id: 0x0410,
            version: 0x22,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92],
            drop_trailing_ack: false,
            truncate_after: None,
            reject_writes_at: None,
            corrupt_reads_at: None,
            erase_duration_ms: 20,
            memory: BTreeMap::new(),
        }
        .with_memory(0x1FFF_F7E0, &128u16.to_le_bytes())
    }

    /// STM32F407, bootloader v3.1 with extended erase only
    pub fn f407() -> Self {
        Self {
            device_id: 0x0413,
            version: 0x31,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
            drop_trailing_ack: false,
            truncate_after: None,
            reject_writes_at: None,
            corrupt_reads_at: None,
            erase_duration_ms: 200,
            memory: BTreeMap::new(),
        }
        .with_memory(0x1FFF_7A22, &1024u16.to_le_bytes())
    }

    pub fn with_memory(mut self, addr: u32, data: &[u8]) -> Self {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u32, *b);
        }
        self
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Mode {
    Reset,
    Application,
    Bootloader { synced: bool },
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Expect {
    Command,
    Address(Command),
    ReadLength(u32),
    WriteData(u32),
    EraseFrame(EraseCommand),
}

struct State {
    target: Target,
    now: u32,
    powered: bool,
    boot0: bool,
    reset: bool,
    mode: Mode,
    expect: Expect,
    pending: Vec<u8>,
    tx: VecDeque<(u32, u8)>,
    received: Vec<u8>,
    writes: Vec<(u32, Vec<u8>)>,
    erase_count: usize,
    boots: Vec<bool>,
    replied: usize,
}

impl State {
    fn reply(&mut self, b: u8) {
        self.reply_after(0, b);
    }

    fn reply_after(&mut self, delay_ms: u32, b: u8) {
        if let Some(n) = self.target.truncate_after {
            if self.replied >= n {
                return;
            }
        }
        self.replied += 1;

        let t = self.now + delay_ms;
        self.tx.push_back((t, b));
    }

    fn trailing_ack(&mut self) {
        if !self.target.drop_trailing_ack {
            self.reply(UART_ACK);
        }
    }

    fn set_reset(&mut self, high: bool) {
        if !high {
            self.mode = Mode::Reset;
            self.tx.clear();
        } else if self.mode == Mode::Reset {
            self.mode = if self.boot0 {
                Mode::Bootloader { synced: false }
            } else {
                Mode::Application
            };
            self.boots.push(self.boot0);
        }
        self.reset = high;
        self.pending.clear();
        self.expect = Expect::Command;
    }

    fn rx(&mut self, b: u8) {
        self.received.push(b);

        if !self.powered {
            return;
        }

        match self.mode {
            Mode::Bootloader { synced: false } => {
                if b == UART_SYNC {
                    self.mode = Mode::Bootloader { synced: true };
                    self.replied = 0;
                    self.reply(UART_ACK);
                }
            }
            Mode::Bootloader { synced: true } => {
                self.pending.push(b);
                self.process();
            }
            _ => (),
        }
    }

    fn process(&mut self) {
        let p = self.pending.clone();

        match self.expect {
            Expect::Command => {
                if p.len() < 2 {
                    return;
                }
                self.pending.clear();
                self.command(p[0], p[1]);
            }
            Expect::Address(cmd) => {
                if p.len() < 5 {
                    return;
                }
                self.pending.clear();

                if checksum(&p[..4]) != p[4] {
                    self.reply(UART_NACK);
                    self.expect = Expect::Command;
                    return;
                }

                let addr = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
                self.reply(UART_ACK);
                self.expect = match cmd {
                    Command::ReadMemory => Expect::ReadLength(addr),
                    _ => Expect::WriteData(addr),
                };
            }
            Expect::ReadLength(addr) => {
                if p.len() < 2 {
                    return;
                }
                self.pending.clear();
                self.expect = Expect::Command;

                if p[0] ^ 0xFF != p[1] {
                    self.reply(UART_NACK);
                    return;
                }

                self.reply(UART_ACK);
                for i in 0..=p[0] as u32 {
                    let a = addr + i;
                    let mut v = *self.target.memory.get(&a).unwrap_or(&0xFF);
                    if self.target.corrupt_reads_at == Some(a) {
                        v = !v;
                    }
                    self.reply(v);
                }
            }
            Expect::WriteData(addr) => {
                if p.is_empty() || p.len() < p[0] as usize + 3 {
                    return;
                }
                self.pending.clear();
                self.expect = Expect::Command;

                let n = p[0] as usize + 1;
                if checksum(&p[..n + 1]) != p[n + 1] || self.target.reject_writes_at == Some(addr) {
                    self.reply(UART_NACK);
                    return;
                }

                let payload = p[1..n + 1].to_vec();
                for (i, b) in payload.iter().enumerate() {
                    self.target.memory.insert(addr + i as u32, *b);
                }
                self.writes.push((addr, payload));
                self.reply(UART_ACK);
            }
            Expect::EraseFrame(erase) => {
                let frame = erase.frame();
                if p.len() < frame.len() {
                    return;
                }
                self.pending.clear();
                self.expect = Expect::Command;

                if &p[..] != frame {
                    self.reply(UART_NACK);
                    return;
                }

                let keys: Vec<u32> = self
                    .target
                    .memory
                    .range(FLASH_BASE..FLASH_END)
                    .map(|(k, _)| *k)
                    .collect();
                for k in keys {
                    self.target.memory.remove(&k);
                }
                self.erase_count += 1;
                let d = self.target.erase_duration_ms;
                self.reply_after(d, UART_ACK);
            }
        }
    }

    fn command(&mut self, c: u8, x: u8) {
        self.replied = 0;

        if c ^ 0xFF != x || !self.target.commands.contains(&c) {
            self.reply(UART_NACK);
            return;
        }

        self.reply(UART_ACK);

        match Command::from_u8(c) {
            Some(Command::Get) => {
                let n = self.target.commands.len() as u8;
                let mut out = vec![n, self.target.version];
                out.extend_from_slice(&self.target.commands);
                for b in out {
                    self.reply(b);
                }
                self.trailing_ack();
            }
            Some(Command::GetVersion) => {
                let v = self.target.version;
                for b in [v, 0x00, 0x00].iter() {
                    self.reply(*b);
                }
                self.trailing_ack();
            }
            Some(Command::GetId) => {
                let id = self.target.device_id.to_be_bytes();
                self.reply(0x01);
                self.reply(id[0]);
                self.reply(id[1]);
                self.trailing_ack();
            }
            Some(cmd @ Command::ReadMemory) | Some(cmd @ Command::WriteMemory) => {
                self.expect = Expect::Address(cmd);
            }
            Some(Command::Erase) => self.expect = Expect::EraseFrame(EraseCommand::Standard),
            Some(Command::ExtendedErase) => {
                self.expect = Expect::EraseFrame(EraseCommand::Extended)
            }
            _ => (),
        }
    }
}

/// Handle to the simulated target
#[derive(Clone)]
pub struct Sim {
    state: Rc<RefCell<State>>,
}

impl Sim {
    pub fn new(target: Target) -> Self {
        let state = State {
            target,
            now: 0,
            powered: true,
            boot0: false,
            reset: true,
            mode: Mode::Application,
            expect: Expect::Command,
            pending: Vec::new(),
            tx: VecDeque::new(),
            received: Vec::new(),
            writes: Vec::new(),
            erase_count: 0,
            boots: Vec::new(),
            replied: 0,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn port(&self) -> SimPort {
        SimPort(self.state.clone())
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay(self.state.clone())
    }

    pub fn lines(&self) -> PinLines<SimPin, SimPin> {
        PinLines::new(
            SimPin(self.state.clone(), Line::Boot0),
            SimPin(self.state.clone(), Line::Reset),
        )
    }

    /// Place the target directly in (unsynchronised) bootloader mode
    pub fn boot_into_bootloader(&self) {
        let mut s = self.state.borrow_mut();
        s.mode = Mode::Bootloader { synced: false };
    }

    pub fn power_off(&self) {
        let mut s = self.state.borrow_mut();
        s.powered = false;
        s.tx.clear();
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.state.borrow().now
    }

    /// Every byte the host has sent
    pub fn received(&self) -> Vec<u8> {
        self.state.borrow().received.clone()
    }

    /// Accepted WRITE frames as (address, padded payload)
    pub fn writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.borrow().writes.clone()
    }

    pub fn erase_count(&self) -> usize {
        self.state.borrow().erase_count
    }

    /// BOOT0 level at each release from reset
    pub fn boots(&self) -> Vec<bool> {
        self.state.borrow().boots.clone()
    }

    pub fn boot0(&self) -> bool {
        self.state.borrow().boot0
    }

    pub fn reset(&self) -> bool {
        self.state.borrow().reset
    }

    pub fn in_application(&self) -> bool {
        self.state.borrow().mode == Mode::Application
    }

    pub fn in_bootloader(&self) -> bool {
        matches!(self.state.borrow().mode, Mode::Bootloader { .. })
    }

    pub fn memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let s = self.state.borrow();
        (0..len as u32)
            .map(|i| *s.target.memory.get(&(addr + i)).unwrap_or(&0xFF))
            .collect()
    }

    pub fn set_memory(&self, addr: u32, data: &[u8]) {
        let mut s = self.state.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            s.target.memory.insert(addr + i as u32, *b);
        }
    }

    pub fn with_target<F: FnOnce(&mut Target)>(&self, f: F) {
        f(&mut self.state.borrow_mut().target)
    }
}

pub struct SimPort(Rc<RefCell<State>>);

impl Read<u8> for SimPort {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut s = self.0.borrow_mut();
        match s.tx.front() {
            Some(&(t, _)) if t <= s.now => (),
            _ => return Err(nb::Error::WouldBlock),
        }
        match s.tx.pop_front() {
            Some((_, b)) => Ok(b),
            None => Err(nb::Error::WouldBlock),
        }
    }
}

impl Write<u8> for SimPort {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.0.borrow_mut().rx(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

pub struct SimDelay(Rc<RefCell<State>>);

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        let mut s = self.0.borrow_mut();
        s.now = s.now.saturating_add(ms);
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Line {
    Boot0,
    Reset,
}

pub struct SimPin(Rc<RefCell<State>>, Line);

impl SimPin {
    fn set(&mut self, high: bool) {
        let mut s = self.0.borrow_mut();
        match self.1 {
            Line::Boot0 => s.boot0 = high,
            Line::Reset => s.set_reset(high),
        }
    }
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}
