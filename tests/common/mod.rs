//! An in-memory ISP bootloader, modelled on an LPC1114FN28/102
#![allow(dead_code)]

use std::{
    cell::{RefCell, RefMut},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use lpcflash::{error::Error, interface::Transport};

pub const PART_ID: u32 = 0x1A40_902B;
pub const FLASH_SIZE: usize = 0x8000;
pub const SECTOR_SIZE: usize = 0x1000;
pub const SECTORS: u32 = (FLASH_SIZE / SECTOR_SIZE) as u32;
pub const RAM_BASE: u32 = 0x1000_0000;
pub const RAM_SIZE: usize = 0x1000;

const LINE_LENGTH: usize = 45;
const BLOCK_SIZE: usize = LINE_LENGTH * 20;

const CMD_SUCCESS: u32 = 0;
const INVALID_COMMAND: u32 = 1;
const SRC_ADDR_ERROR: u32 = 2;
const DST_ADDR_ERROR: u32 = 3;
const COUNT_ERROR: u32 = 6;
const INVALID_SECTOR: u32 = 7;
const SECTOR_NOT_BLANK: u32 = 8;
const SECTOR_NOT_PREPARED: u32 = 9;
const COMPARE_ERROR: u32 = 10;
const ADDR_NOT_MAPPED: u32 = 14;
pub const BUSY: u32 = 11;
const CMD_LOCKED: u32 = 15;
const INVALID_CODE: u32 = 16;

#[derive(Debug)]
enum Phase {
    Unsynced,
    SyncReply,
    Crystal,
    Command,
    Receiving {
        address: u32,
        remaining: usize,
        block: Vec<u8>,
        lines: usize,
    },
    ReceivingRaw {
        address: u32,
        remaining: usize,
    },
    Sending {
        address: u32,
        remaining: usize,
    },
}

/// State of the simulated device, inspected and tweaked by the tests
#[derive(Debug)]
pub struct Device {
    pub part_id: u32,
    pub uid: [u32; 4],
    /// Sent minor first, as the bootloader does
    pub boot_version: (u32, u32),
    pub flash: Vec<u8>,
    pub ram: Vec<u8>,
    pub uuencode: bool,
    pub echo: bool,
    pub unlocked: bool,
    pub prepared: Option<(u32, u32)>,
    /// Never answers anything
    pub silent: bool,
    /// Number of upcoming read blocks sent with a wrong checksum
    pub corrupt_read_blocks: u32,
    /// Number of upcoming read blocks whose checksum line is not a number
    pub garbled_read_checksums: u32,
    /// Number of upcoming read blocks with a control character in their data
    pub undecodable_read_blocks: u32,
    /// Number of upcoming write blocks answered with `RESEND`
    pub corrupt_write_blocks: u32,
    /// Status answered to one exact command line instead of executing it
    pub forced_status: Option<(String, u32)>,
    pub resends_received: u32,
    pub resends_sent: u32,
    pub crystal_frequency: Option<u32>,
    pub jumped: Option<(u32, String)>,
    /// Every command line received, in order
    pub commands: Vec<String>,
    phase: Phase,
    line: Vec<u8>,
    output: VecDeque<u8>,
}

impl Default for Device {
    fn default() -> Self {
        Device {
            part_id: PART_ID,
            uid: [0x0001_0203, 0x0405_0607, 0x0809_0A0B, 0x0C0D_0E0F],
            boot_version: (1, 7),
            flash: vec![0xFF; FLASH_SIZE],
            ram: vec![0; RAM_SIZE],
            uuencode: true,
            echo: true,
            unlocked: false,
            prepared: None,
            silent: false,
            corrupt_read_blocks: 0,
            garbled_read_checksums: 0,
            undecodable_read_blocks: 0,
            corrupt_write_blocks: 0,
            forced_status: None,
            resends_received: 0,
            resends_sent: 0,
            crystal_frequency: None,
            jumped: None,
            commands: Vec::new(),
            phase: Phase::Unsynced,
            line: Vec::new(),
            output: VecDeque::new(),
        }
    }
}

impl Device {
    /// A device which completed the handshake in an earlier session
    pub fn synchronized() -> Self {
        Device {
            echo: false,
            phase: Phase::Command,
            ..Device::default()
        }
    }

    /// Commands received starting with `letter`
    pub fn commands_of(&self, letter: &str) -> Vec<&str> {
        self.commands
            .iter()
            .map(String::as_str)
            .filter(|line| line.split_whitespace().next() == Some(letter))
            .collect()
    }

    pub fn fill_sector(&mut self, sector: usize, value: u8) {
        self.flash[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].fill(value);
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Command)
    }

    fn send(&mut self, data: impl AsRef<[u8]>) {
        self.output.extend(data.as_ref());
    }

    fn status(&mut self, code: u32) {
        self.send(format!("{code}\r\n"));
    }

    fn receive(&mut self, byte: u8) {
        match &mut self.phase {
            Phase::Unsynced => {
                if byte == b'?' {
                    self.send("Synchronized\r\n");
                    self.phase = Phase::SyncReply;
                }
            }
            Phase::ReceivingRaw { address, remaining } => {
                let offset = (*address - RAM_BASE) as usize;
                self.ram[offset] = byte;
                *address += 1;
                *remaining -= 1;

                if *remaining == 0 {
                    self.phase = Phase::Command;
                }
            }
            _ => {
                self.line.push(byte);
                if byte == b'\n' {
                    let mut line = std::mem::take(&mut self.line);
                    while matches!(line.last(), Some(b'\r' | b'\n')) {
                        line.pop();
                    }
                    self.handle_line(String::from_utf8_lossy(&line).into_owned());
                }
            }
        }
    }

    fn echo_line(&mut self, line: &str) {
        if self.echo {
            self.send(format!("{line}\r\n"));
        }
    }

    fn handle_line(&mut self, line: String) {
        match std::mem::replace(&mut self.phase, Phase::Command) {
            Phase::SyncReply => {
                self.echo_line(&line);
                if line == "Synchronized" {
                    self.send("OK\r\n");
                    self.phase = Phase::Crystal;
                } else {
                    self.phase = Phase::Unsynced;
                }
            }
            Phase::Crystal => {
                self.echo_line(&line);
                match line.parse() {
                    Ok(frequency) => {
                        self.crystal_frequency = Some(frequency);
                        self.send("OK\r\n");
                    }
                    Err(_) => self.phase = Phase::Crystal,
                }
            }
            Phase::Receiving {
                address,
                remaining,
                block,
                lines,
            } => self.receive_block_line(&line, address, remaining, block, lines),
            Phase::Sending { address, remaining } => match line.as_str() {
                "OK" => {
                    let len = remaining.min(BLOCK_SIZE);
                    self.start_sending(address + len as u32, remaining - len);
                }
                _ => {
                    self.resends_received += 1;
                    self.start_sending(address, remaining);
                }
            },
            _ => {
                self.echo_line(&line);
                self.commands.push(line.clone());
                let forced = self
                    .forced_status
                    .as_ref()
                    .filter(|(forced, _)| *forced == line)
                    .map(|&(_, code)| code);
                match forced {
                    Some(code) => self.status(code),
                    None => self.execute(&line),
                }
            }
        }
    }

    fn receive_block_line(
        &mut self,
        line: &str,
        address: u32,
        remaining: usize,
        mut block: Vec<u8>,
        lines: usize,
    ) {
        let len = remaining.min(BLOCK_SIZE);

        if lines < len.div_ceil(LINE_LENGTH) {
            block.extend(uudecode_line(line.as_bytes()));
            self.phase = Phase::Receiving {
                address,
                remaining,
                block,
                lines: lines + 1,
            };
            return;
        }

        let valid = line.parse::<u32>().ok() == Some(sum(&block)) && block.len() == len;
        if valid && self.corrupt_write_blocks == 0 {
            let offset = (address - RAM_BASE) as usize;
            self.ram[offset..offset + len].copy_from_slice(&block);
            self.send("OK\r\n");

            if remaining > len {
                self.phase = Phase::Receiving {
                    address: address + len as u32,
                    remaining: remaining - len,
                    block: Vec::new(),
                    lines: 0,
                };
            }
        } else {
            self.corrupt_write_blocks = self.corrupt_write_blocks.saturating_sub(1);
            self.resends_sent += 1;
            self.send("RESEND\r\n");
            self.phase = Phase::Receiving {
                address,
                remaining,
                block: Vec::new(),
                lines: 0,
            };
        }
    }

    fn start_sending(&mut self, address: u32, remaining: usize) {
        if remaining == 0 {
            return;
        }

        let len = remaining.min(BLOCK_SIZE);
        let data = self.memory(address, len).unwrap_or_default();
        let mut checksum = sum(&data);
        if self.corrupt_read_blocks > 0 {
            self.corrupt_read_blocks -= 1;
            checksum = checksum.wrapping_add(1);
        }

        let undecodable = self.undecodable_read_blocks > 0;
        if undecodable {
            self.undecodable_read_blocks -= 1;
        }
        for (index, line) in data.chunks(LINE_LENGTH).enumerate() {
            let mut encoded = uuencode_line(line);
            if undecodable && index == 0 {
                encoded[1] = 0x01;
            }
            self.send(encoded);
            self.send("\r\n");
        }

        if self.garbled_read_checksums > 0 {
            self.garbled_read_checksums -= 1;
            self.send("xx\r\n");
        } else {
            self.send(format!("{checksum}\r\n"));
        }
        self.phase = Phase::Sending { address, remaining };
    }

    fn memory(&self, address: u32, len: usize) -> Option<Vec<u8>> {
        let address = address as usize;
        let ram_base = RAM_BASE as usize;

        if address + len <= FLASH_SIZE {
            Some(self.flash[address..address + len].to_vec())
        } else if address >= ram_base && address + len <= ram_base + RAM_SIZE {
            Some(self.ram[address - ram_base..address - ram_base + len].to_vec())
        } else {
            None
        }
    }

    fn sectors_ok(&self, first: u32, last: u32) -> bool {
        first <= last && last < SECTORS
    }

    fn is_prepared(&self, first: u32, last: u32) -> bool {
        matches!(self.prepared, Some((a, b)) if a <= first && last <= b)
    }

    fn execute(&mut self, line: &str) {
        let mut tokens = line.split_whitespace();
        let letter = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();
        let num = |index: usize| args.get(index).and_then(|arg| arg.parse::<u32>().ok());

        match (letter, args.len()) {
            ("U", 1) => {
                if args[0] == "23130" {
                    self.unlocked = true;
                    self.status(CMD_SUCCESS);
                } else {
                    self.status(INVALID_CODE);
                }
            }
            ("A", 1) => {
                self.echo = args[0] == "1";
                self.status(CMD_SUCCESS);
            }
            ("J", 0) => {
                self.status(CMD_SUCCESS);
                self.send(format!("{}\r\n", self.part_id));
            }
            ("K", 0) => {
                self.status(CMD_SUCCESS);
                let (minor, major) = self.boot_version;
                self.send(format!("{minor}\r\n{major}\r\n"));
            }
            ("N", 0) => {
                self.status(CMD_SUCCESS);
                for word in self.uid {
                    self.send(format!("{word}\r\n"));
                }
            }
            ("P", 2) => match (num(0), num(1)) {
                (Some(first), Some(last)) if self.sectors_ok(first, last) => {
                    self.prepared = Some((first, last));
                    self.status(CMD_SUCCESS);
                }
                _ => self.status(INVALID_SECTOR),
            },
            ("E", 2) => match (num(0), num(1)) {
                (Some(first), Some(last)) if self.sectors_ok(first, last) => {
                    if !self.unlocked {
                        self.status(CMD_LOCKED);
                    } else if !self.is_prepared(first, last) {
                        self.status(SECTOR_NOT_PREPARED);
                    } else {
                        for sector in first..=last {
                            self.fill_sector(sector as usize, 0xFF);
                        }
                        self.prepared = None;
                        self.status(CMD_SUCCESS);
                    }
                }
                _ => self.status(INVALID_SECTOR),
            },
            ("I", 2) => match (num(0), num(1)) {
                (Some(first), Some(last)) if self.sectors_ok(first, last) => {
                    let start = first as usize * SECTOR_SIZE;
                    let end = (last as usize + 1) * SECTOR_SIZE;
                    let dirty = self.flash[start..end]
                        .chunks(4)
                        .enumerate()
                        .find(|(_, word)| word.iter().any(|&b| b != 0xFF));

                    match dirty {
                        Some((index, word)) => {
                            let content = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                            self.status(SECTOR_NOT_BLANK);
                            self.send(format!("{}\r\n{content}\r\n", start + index * 4));
                        }
                        None => self.status(CMD_SUCCESS),
                    }
                }
                _ => self.status(INVALID_SECTOR),
            },
            ("C", 3) => match (num(0), num(1), num(2)) {
                (Some(dst), Some(src), Some(len)) => self.copy(dst, src, len),
                _ => self.status(INVALID_COMMAND),
            },
            ("G", 2) => match num(0) {
                Some(_) if !self.unlocked => self.status(CMD_LOCKED),
                Some(address) if args[1] == "T" || args[1] == "A" => {
                    self.jumped = Some((address, args[1].to_string()));
                    self.status(CMD_SUCCESS);
                }
                _ => self.status(INVALID_COMMAND),
            },
            ("M", 3) => match (num(0), num(1), num(2)) {
                (Some(a), Some(b), Some(len)) if (a | b | len) % 4 == 0 => {
                    match (self.memory(a, len as usize), self.memory(b, len as usize)) {
                        (Some(x), Some(y)) => match x.iter().zip(&y).position(|(p, q)| p != q) {
                            Some(offset) => {
                                self.status(COMPARE_ERROR);
                                self.send(format!("{offset}\r\n"));
                            }
                            None => self.status(CMD_SUCCESS),
                        },
                        _ => self.status(ADDR_NOT_MAPPED),
                    }
                }
                _ => self.status(COUNT_ERROR),
            },
            ("R", 2) => match (num(0), num(1)) {
                (Some(address), _) if address % 4 != 0 => self.status(SRC_ADDR_ERROR),
                (Some(address), Some(len)) if len % 4 == 0 => {
                    match self.memory(address, len as usize) {
                        Some(data) => {
                            self.status(CMD_SUCCESS);
                            if self.uuencode {
                                self.start_sending(address, len as usize);
                            } else {
                                self.send(data);
                            }
                        }
                        None => self.status(ADDR_NOT_MAPPED),
                    }
                }
                _ => self.status(COUNT_ERROR),
            },
            ("W", 2) => match (num(0), num(1)) {
                (Some(address), _) if address % 4 != 0 => self.status(DST_ADDR_ERROR),
                (Some(address), Some(len)) if len % 4 == 0 => {
                    let ram = RAM_BASE..RAM_BASE + RAM_SIZE as u32;
                    if !ram.contains(&address) || address + len > ram.end {
                        self.status(ADDR_NOT_MAPPED);
                        return;
                    }

                    self.status(CMD_SUCCESS);
                    if len == 0 {
                        return;
                    }
                    self.phase = if self.uuencode {
                        Phase::Receiving {
                            address,
                            remaining: len as usize,
                            block: Vec::new(),
                            lines: 0,
                        }
                    } else {
                        Phase::ReceivingRaw {
                            address,
                            remaining: len as usize,
                        }
                    };
                }
                _ => self.status(COUNT_ERROR),
            },
            _ => self.status(INVALID_COMMAND),
        }
    }

    fn copy(&mut self, dst: u32, src: u32, len: u32) {
        let first = dst / SECTOR_SIZE as u32;
        let last = (dst + len.max(1) - 1) / SECTOR_SIZE as u32;

        if !self.unlocked {
            self.status(CMD_LOCKED);
        } else if dst % 256 != 0 {
            self.status(DST_ADDR_ERROR);
        } else if src % 4 != 0 {
            self.status(SRC_ADDR_ERROR);
        } else if ![256, 512, 1024, 4096].contains(&len) {
            self.status(COUNT_ERROR);
        } else if dst as usize + len as usize > FLASH_SIZE {
            self.status(ADDR_NOT_MAPPED);
        } else if !self.is_prepared(first, last) {
            self.status(SECTOR_NOT_PREPARED);
        } else {
            match self.memory(src, len as usize) {
                Some(data) => {
                    // programming can only clear bits
                    for (cell, byte) in self.flash[dst as usize..].iter_mut().zip(data) {
                        *cell &= byte;
                    }
                    self.prepared = None;
                    self.status(CMD_SUCCESS);
                }
                None => self.status(ADDR_NOT_MAPPED),
            }
        }
    }
}

fn sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

fn uu_char(value: u8) -> u8 {
    if value == 0 {
        b'`'
    } else {
        value + b' '
    }
}

fn uuencode_line(data: &[u8]) -> Vec<u8> {
    let mut line = vec![uu_char(data.len() as u8)];

    for group in data.chunks(3) {
        let mut bytes = [0u8; 3];
        bytes[..group.len()].copy_from_slice(group);
        let word = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);

        for shift in [18, 12, 6, 0] {
            line.push(uu_char(((word >> shift) & 0x3F) as u8));
        }
    }

    line
}

fn uudecode_line(line: &[u8]) -> Vec<u8> {
    let Some((&len, rest)) = line.split_first() else {
        return Vec::new();
    };
    let len = usize::from(len.wrapping_sub(b' ') & 0x3F);
    let mut data = Vec::new();

    for group in rest.chunks(4) {
        let word = group
            .iter()
            .fold(0u32, |acc, &c| (acc << 6) | u32::from(c.wrapping_sub(b' ') & 0x3F));
        let word = word << (6 * (4 - group.len() as u32));
        data.extend_from_slice(&word.to_be_bytes()[1..]);
    }

    data.truncate(len);
    data
}

/// [Transport] feeding written bytes to a shared [Device]
#[derive(Clone, Default)]
pub struct SimulatedDevice(Rc<RefCell<Device>>);

impl SimulatedDevice {
    pub fn new(device: Device) -> Self {
        SimulatedDevice(Rc::new(RefCell::new(device)))
    }

    pub fn device(&self) -> RefMut<'_, Device> {
        self.0.borrow_mut()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

impl Transport for SimulatedDevice {
    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let mut device = self.device();

        if !device.silent {
            for &byte in data {
                device.receive(byte);
            }
        }

        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _min_read: usize, _timeout: Duration) -> Result<usize, Error> {
        let mut device = self.device();
        let count = buf.len().min(device.output.len());

        for (slot, byte) in buf.iter_mut().zip(device.output.drain(..count)) {
            *slot = byte;
        }

        Ok(count)
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.device().output.clear();
        Ok(())
    }
}
