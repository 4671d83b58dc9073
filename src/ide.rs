//! PIO-mode IDE/ATA driver: two controllers, two devices each, LBA28
//! addressing. Polls the status register for command completion instead of
//! waiting on the real IRQ-driven completion semaphore the original uses,
//! since there is no interrupt controller in this crate to deliver that IRQ
//! — see the module doc on [`Controller::io_done`] for how a real interrupt
//! handler plugs back in.
//!
//! Devices are discovered, not assumed: [`init_ide_devices`] probes both
//! controllers for presence, resets and re-selects each device, reads back
//! its ATA/PACKET signature, and sends IDENTIFY DEVICE to learn its
//! geometry, capacity, and model/serial/firmware strings.

use alloc::boxed::Box;

use crate::arch::{inb, inw, outb, outw};
use crate::blkdev::BlockOps;
use crate::error::{KError, KResult};
use crate::sync::Mutex as KMutex;
use crate::sync::Semaphore;

pub const NR_IDE_CONTROLLERS: usize = 2;
pub const NR_DEVICES_PER_CONTROLLER: usize = 2;
pub const BLOCK_SIZE: usize = 512;
pub const MAX_NBLOCKS: u32 = 256;
pub const IDE_BLKDEV_MAJOR: u32 = 3;

const IOBASE: [u16; NR_IDE_CONTROLLERS] = [0x1F0, 0x170];

const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_NSECTOR: u16 = 2;
const REG_SECTOR: u16 = 3;
const REG_LCYL: u16 = 4;
const REG_HCYL: u16 = 5;
const REG_DRV_HEAD: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;
/// Device control block register, wired alongside each controller's command
/// block at the legacy 0x3F6/0x376 port pair rather than as an offset from
/// `iobase`.
const REG_DEV_CTL: u16 = 0x206;

const CTL_SRST: u8 = 0x04;

const CMD_IDENTIFY: u8 = 0xEC;
const CMD_PACKET_IDENTIFY: u8 = 0xA1;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;

const ATA_TIMEOUT_SPINS: u32 = 30_000_000;
const RESET_ASSERT_SPINS: u32 = 1_000_000;
const RESET_SETTLE_SPINS: u32 = 2_000;

bitflags::bitflags! {
    /// Status register bits. See ATA/ATAPI-4 spec, section 7.15.6.
    struct Status: u8 {
        const BSY  = 0x80;
        const DRDY = 0x40;
        const DRQ  = 0x08;
        const ERR  = 0x01;
    }
}

#[derive(Clone, Copy)]
pub struct DeviceInfo {
    pub present: bool,
    pub atapi: bool,
    pub lba: bool,
    pub dma: bool,
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    pub capacity: u64,
    pub model: [u8; 40],
    pub serial: [u8; 20],
    pub firmware: [u8; 8],
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            present: false,
            atapi: false,
            lba: false,
            dma: false,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            capacity: 0,
            model: [0; 40],
            serial: [0; 20],
            firmware: [0; 8],
        }
    }
}

pub struct Controller {
    iobase: u16,
    mutex: KMutex,
    io_sema: Semaphore,
    devices: spin::Mutex<[DeviceInfo; NR_DEVICES_PER_CONTROLLER]>,
}

impl Controller {
    fn new(iobase: u16) -> Self {
        Self {
            iobase,
            mutex: KMutex::new(),
            io_sema: Semaphore::new(0),
            devices: spin::Mutex::new([DeviceInfo::default(); NR_DEVICES_PER_CONTROLLER]),
        }
    }

    fn reg(&self, offset: u16) -> u16 {
        self.iobase + offset
    }

    fn status(&self) -> Status {
        Status::from_bits_truncate(inb(self.reg(REG_STATUS)))
    }

    fn wait_until(&self, mask: Status, value: Status, spins: u32) -> KResult<()> {
        for _ in 0..spins {
            if self.status() & mask == value {
                return Ok(());
            }
        }
        Err(KError::Fail)
    }

    fn select_device(&self, position: u32, lba: bool, lba_high_bits: u8) {
        let drv_head = 0xA0 | ((position as u8) << 4) | if lba { 0x40 } else { 0 } | lba_high_bits;
        outb(self.reg(REG_DRV_HEAD), drv_head);
    }

    /// Called from the real IDE IRQ handler (IRQ14/15), which is wired up
    /// by the platform's interrupt controller setup and is out of scope
    /// here. Wakes exactly one task blocked in [`Self::read_blocks`] or
    /// [`Self::write_blocks`].
    pub fn io_done(&self) {
        self.io_sema.up();
    }

    /// Writes a sentinel to the sector-count register and reads it back:
    /// the standard way to check whether any controller is wired up at
    /// this base I/O port at all.
    fn probe_controller(&self) -> bool {
        outb(self.reg(REG_NSECTOR), 0xAB);
        inb(self.reg(REG_NSECTOR)) == 0xAB
    }

    /// Software-resets the controller (SRST in the device control
    /// register), as required to get a reliable device signature
    /// afterwards. See ATA/ATAPI-4 spec, section 9.3.
    fn reset(&self) -> bool {
        outb(self.reg(REG_DEV_CTL), CTL_SRST);
        for _ in 0..RESET_SETTLE_SPINS {
            core::hint::spin_loop();
        }
        if self
            .wait_until(Status::BSY, Status::BSY, RESET_ASSERT_SPINS)
            .is_err()
        {
            return false;
        }
        outb(self.reg(REG_DEV_CTL), 0);
        self.wait_until(Status::BSY, Status::empty(), ATA_TIMEOUT_SPINS).is_ok()
    }

    /// Device selection protocol used only during probing: BSY and DRQ must
    /// both be clear before and after selecting. See ATA/ATAPI-4 spec,
    /// section 9.6.
    fn probe_select(&self, position: u32) -> bool {
        if self.status().intersects(Status::BSY | Status::DRQ) {
            return false;
        }
        outb(self.reg(REG_DRV_HEAD), 0xA0 | ((position as u8) << 4));
        !self.status().intersects(Status::BSY | Status::DRQ)
    }

    /// Reads the device signature left in the cylinder registers right
    /// after a reset and selection, distinguishing a PACKET (ATAPI) device
    /// from a plain ATA one. `None` means neither signature was recognized.
    fn signature(&self) -> Option<bool> {
        if inb(self.reg(REG_NSECTOR)) != 0x01 || inb(self.reg(REG_SECTOR)) != 0x01 {
            return None;
        }
        let cl = inb(self.reg(REG_LCYL));
        let ch = inb(self.reg(REG_HCYL));
        let status = inb(self.reg(REG_STATUS));
        if cl == 0x14 && ch == 0xEB {
            return Some(true);
        }
        if cl == 0 && ch == 0 && status != 0 {
            return Some(false);
        }
        None
    }

    /// Probes, resets, selects, and identifies the device at `position`.
    /// Returns a default (not-present) [`DeviceInfo`] at the first failed
    /// step.
    fn identify(&self, position: u32) -> DeviceInfo {
        if !self.probe_controller() || !self.reset() || !self.probe_select(position) {
            return DeviceInfo::default();
        }

        let atapi = match self.signature() {
            Some(atapi) => atapi,
            None => return DeviceInfo::default(),
        };

        let cmd = if atapi { CMD_PACKET_IDENTIFY } else { CMD_IDENTIFY };
        outb(self.reg(REG_COMMAND), cmd);
        if self
            .wait_until(Status::BSY | Status::DRQ | Status::ERR, Status::DRQ, ATA_TIMEOUT_SPINS)
            .is_err()
        {
            return DeviceInfo::default();
        }

        let mut words = [0u16; 256];
        for w in words.iter_mut() {
            *w = inw(self.reg(REG_DATA));
        }

        parse_identify_words(atapi, &words)
    }

    /// Issues the command phase of a request and blocks up to
    /// [`ATA_TIMEOUT_SPINS`] waiting for BSY to clear. Caller holds
    /// `self.mutex` and still needs to perform the data phase and check
    /// [`Status::ERR`] afterwards.
    fn start_request(&self, position: u32, start_block: u64, nblocks: u32, command: u8) -> bool {
        let lba = start_block as u32;
        self.select_device(position, true, ((lba >> 24) & 0x0F) as u8);
        if self.wait_until(Status::BSY, Status::empty(), ATA_TIMEOUT_SPINS).is_err() {
            return false;
        }

        outb(self.reg(REG_NSECTOR), nblocks as u8);
        outb(self.reg(REG_SECTOR), (lba & 0xFF) as u8);
        outb(self.reg(REG_LCYL), ((lba >> 8) & 0xFF) as u8);
        outb(self.reg(REG_HCYL), ((lba >> 16) & 0xFF) as u8);
        outb(self.reg(REG_COMMAND), command);

        if self.wait_until(Status::BSY, Status::empty(), ATA_TIMEOUT_SPINS).is_err() {
            return false;
        }
        if self.status().contains(Status::ERR) {
            let _ = inb(self.reg(REG_ERROR));
            return false;
        }
        true
    }

    fn read_blocks(&self, position: u32, start_block: u64, buf: &mut [u8], nblocks: u32) -> u32 {
        let nblocks = nblocks.min(MAX_NBLOCKS);
        if nblocks == 0 {
            return 0;
        }
        let dev = self.devices.lock()[position as usize];
        if !dev.present || start_block + nblocks as u64 > dev.capacity {
            return 0;
        }

        self.mutex.lock();
        if !self.start_request(position, start_block, nblocks, CMD_READ_SECTORS) {
            self.mutex.unlock();
            return 0;
        }

        self.io_sema.down();
        let words_per_block = BLOCK_SIZE / 2;
        for block in 0..nblocks as usize {
            for w in 0..words_per_block {
                let word = inw(self.reg(REG_DATA));
                let off = block * BLOCK_SIZE + w * 2;
                buf[off] = (word & 0xFF) as u8;
                buf[off + 1] = (word >> 8) as u8;
            }
        }

        let failed = self.status().contains(Status::ERR);
        self.mutex.unlock();
        crate::console::println_trace!("trace_ide", "read {} block(s) at {}: {}", nblocks, start_block, if failed { "ERR" } else { "ok" });
        if failed { 0 } else { nblocks }
    }

    fn write_blocks(&self, position: u32, start_block: u64, buf: &[u8], nblocks: u32) -> u32 {
        let nblocks = nblocks.min(MAX_NBLOCKS);
        if nblocks == 0 {
            return 0;
        }
        let dev = self.devices.lock()[position as usize];
        if !dev.present || start_block + nblocks as u64 > dev.capacity {
            return 0;
        }

        self.mutex.lock();
        if !self.start_request(position, start_block, nblocks, CMD_WRITE_SECTORS) {
            self.mutex.unlock();
            return 0;
        }

        let words_per_block = BLOCK_SIZE / 2;
        for block in 0..nblocks as usize {
            for w in 0..words_per_block {
                let off = block * BLOCK_SIZE + w * 2;
                let word = u16::from_le_bytes([buf[off], buf[off + 1]]);
                outw(self.reg(REG_DATA), word);
            }
        }
        self.io_sema.down();

        let failed = self.status().contains(Status::ERR);
        self.mutex.unlock();
        crate::console::println_trace!("trace_ide", "write {} block(s) at {}: {}", nblocks, start_block, if failed { "ERR" } else { "ok" });
        if failed { 0 } else { nblocks }
    }
}

/// Copies the raw little-endian bytes of each IDENTIFY word into `out`, two
/// bytes per word, before [`fix_ide_string`] unscrambles them.
fn copy_words_to_bytes(words: &[u16], out: &mut [u8]) {
    for (i, w) in words.iter().enumerate() {
        let b = w.to_le_bytes();
        out[i * 2] = b[0];
        out[i * 2 + 1] = b[1];
    }
}

/// The characters in strings returned by IDENTIFY are byte-swapped within
/// each word (e.g. "eneGir c2143" for "Generic 2143"). Un-swaps them in
/// place, then wipes trailing non-printable bytes working backwards from
/// the end, stopping at the first printable character.
fn fix_ide_string(buf: &mut [u8]) {
    let len = buf.len() & !1;
    if len == 0 {
        return;
    }

    let mut i = 0;
    while i < len {
        buf.swap(i, i + 1);
        i += 2;
    }

    buf[len - 1] = 0;
    let mut p = len - 1;
    while p > 0 {
        p -= 1;
        let c = buf[p];
        if c > 32 && c < 127 {
            break;
        }
        buf[p] = 0;
    }
}

/// Parses a completed IDENTIFY DEVICE word buffer into a [`DeviceInfo`].
/// Pure and hardware-free so the string unswap/trim logic can be exercised
/// with a synthetic buffer. Capacity for an LBA device is read from a
/// single word here, the same simplification the original driver makes.
fn parse_identify_words(atapi: bool, words: &[u16; 256]) -> DeviceInfo {
    let mut info = DeviceInfo {
        present: true,
        atapi,
        ..DeviceInfo::default()
    };

    info.lba = (words[49] >> 9) & 1 != 0;
    info.dma = (words[49] >> 8) & 1 != 0;
    info.cylinders = words[1] as u32;
    info.heads = words[3] as u32;
    info.sectors = words[6] as u32;
    info.capacity = if info.lba {
        words[60] as u64
    } else {
        (info.heads * info.sectors * info.cylinders) as u64
    };

    copy_words_to_bytes(&words[27..47], &mut info.model);
    copy_words_to_bytes(&words[10..20], &mut info.serial);
    copy_words_to_bytes(&words[23..27], &mut info.firmware);
    fix_ide_string(&mut info.model);
    fix_ide_string(&mut info.serial);
    fix_ide_string(&mut info.firmware);

    info
}

lazy_static::lazy_static! {
    pub static ref CONTROLLERS: [Controller; NR_IDE_CONTROLLERS] =
        [Controller::new(IOBASE[0]), Controller::new(IOBASE[1])];
}

fn locate(minor: u32) -> (usize, u32) {
    ((minor / 2) as usize, minor % 2)
}

pub struct IdeBlockOps;

impl BlockOps for IdeBlockOps {
    fn read_blocks(&self, minor: u32, start_block: u64, buf: &mut [u8], nblocks: u32) -> u32 {
        let (ctrl, position) = locate(minor);
        CONTROLLERS[ctrl].read_blocks(position, start_block, buf, nblocks)
    }

    fn write_blocks(&self, minor: u32, start_block: u64, buf: &[u8], nblocks: u32) -> u32 {
        let (ctrl, position) = locate(minor);
        CONTROLLERS[ctrl].write_blocks(position, start_block, buf, nblocks)
    }
}

/// Probes both controllers' device slots, identifying whatever is present,
/// and registers non-ATAPI drives as block device instances under
/// [`IDE_BLKDEV_MAJOR`]. ATAPI devices are identified (so their presence
/// doesn't get mistaken for a probe failure) but never registered, since
/// the PACKET command set itself is out of scope.
pub fn init_ide_devices() -> KResult<()> {
    crate::blkdev::register_blkdev_class(IDE_BLKDEV_MAJOR, "ide", Box::new(IdeBlockOps))?;

    for ctrl in 0..NR_IDE_CONTROLLERS {
        for position in 0..NR_DEVICES_PER_CONTROLLER {
            let info = CONTROLLERS[ctrl].identify(position as u32);
            CONTROLLERS[ctrl].devices.lock()[position] = info;

            if !info.present || info.atapi {
                continue;
            }

            let minor = (ctrl * NR_DEVICES_PER_CONTROLLER + position) as u32;
            crate::blkdev::register_blkdev_instance(
                IDE_BLKDEV_MAJOR,
                minor,
                "ide disk",
                BLOCK_SIZE as u32,
                info.capacity,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_splits_minor_into_controller_and_position() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(1), (0, 1));
        assert_eq!(locate(2), (1, 0));
        assert_eq!(locate(3), (1, 1));
    }

    #[test]
    fn fix_ide_string_unswaps_adjacent_byte_pairs() {
        let expected = b"Generic 2143";
        let mut scrambled = *expected;
        let mut i = 0;
        while i < scrambled.len() {
            scrambled.swap(i, i + 1);
            i += 2;
        }

        fix_ide_string(&mut scrambled);
        assert_eq!(&scrambled, expected);
    }

    #[test]
    fn fix_ide_string_wipes_trailing_non_printable_bytes() {
        // Pre-swapped so that un-swapping produces "AB" then all-space
        // padding, which the trim pass must reduce to zero bytes.
        let mut buf = *b"BA  \x20\x20\x20\x20";
        fix_ide_string(&mut buf);

        assert_eq!(&buf[0..2], b"AB");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_identify_words_extracts_lba_capacity_and_trimmed_model() {
        let mut words = [0u16; 256];
        words[49] = 1 << 9; // LBA supported
        words[60] = 40_000; // low word of capacity

        let model = b"Generic Disk            ";
        let mut scrambled = alloc::vec::Vec::from(&model[..]);
        let mut i = 0;
        while i + 1 < scrambled.len() {
            scrambled.swap(i, i + 1);
            i += 2;
        }
        for (i, chunk) in scrambled.chunks(2).enumerate() {
            words[27 + i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }

        let info = parse_identify_words(false, &words);
        assert!(info.present);
        assert!(info.lba);
        assert_eq!(info.capacity, 40_000);

        let nul = info.model.iter().position(|&b| b == 0).unwrap_or(info.model.len());
        assert_eq!(&info.model[..nul], b"Generic Disk");
    }

    #[test]
    fn identify_is_not_present_when_the_controller_probe_fails() {
        // No real I/O port backs this in a host test, so the sentinel byte
        // written to the sector-count register never reads back and
        // identify bails out at the first step.
        let controller = Controller::new(0);
        let info = controller.identify(0);
        assert!(!info.present);
    }
}
