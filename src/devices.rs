// Device interface (spec.md §4.2) plus a handful of minimal stand-ins.
// Individual device *models* (UART, framebuffer, block device, SD host+card,
// SPI, GPIO, interrupt controller) are out of scope per spec.md §1 as state
// machines; what's in scope is the uniform contract every device implements
// and enough of a register-level shell per device to exercise the bus/IRQ
// path end to end (grounded in the register semantics summarised in
// spec.md §6 and `DevUart.h`/`DevXpsIntc.h` in `examples/original_source/`).
//
// Shaped after em68k's `Device` trait (devices.rs): `read8/16/32`,
// `write8/16/32`, plus `set_props`/`direct_map` from spec.md §4.1-4.2 and an
// `irq_level`/`tick` pair standing in for the bus's per-device IRQ polling
// and the platform's periodic callback.

use log::warn;

pub trait Device {
    /// Called once at bus-attach time with the device's assigned window.
    fn set_props(&mut self, base: u32, size: u32);
    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;
    fn write8(&mut self, addr: u32, val: u8);
    fn write16(&mut self, addr: u32, val: u16);
    fn write32(&mut self, addr: u32, val: u32);
    /// Devices backed by contiguous host memory (RAM/ROM) return `Some(())`
    /// to advertise direct-map eligibility; MMIO devices return `None`.
    fn direct_map(&self, _offset_in_device: u32) -> Option<()> {
        None
    }
    /// Non-blocking, expected to be bounded; called once per runloop
    /// iteration (spec.md §5).
    fn tick(&mut self, _instret: u64) {}
    /// `Some(level)` if this device currently asserts an interrupt request.
    fn irq_level(&self) -> Option<u32> {
        None
    }
}

/// Flat RAM/ROM backing store with central big-endian byte-swap, per
/// spec.md §6 ("RAM access from the CPU goes through load/store helpers
/// which perform the big-endian byte-swap centrally"). Grounded directly on
/// em68k's `RAM` device (memory.rs).
pub struct Ram {
    mem: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    writable: bool,
}

impl Ram {
    pub fn new(size: u32) -> Box<Self> {
        Box::new(Self { mem: std::sync::Arc::new(std::sync::Mutex::new(vec![0; size as usize])), writable: true })
    }
    /// A ROM behaves like RAM for reads but ignores writes (matches how the
    /// origin's boot-RAM/ROM windows are wired: writes are silently dropped
    /// rather than raising a fault).
    pub fn rom(image: Vec<u8>, size: u32) -> Box<Self> {
        let mut mem = image;
        mem.resize(size as usize, 0);
        Box::new(Self { mem: std::sync::Arc::new(std::sync::Mutex::new(mem)), writable: false })
    }
    pub fn load(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.mem.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
    }
    /// Shared handle to the backing store, for devices that DMA straight
    /// into RAM rather than going through the bus's routing scan
    /// (`BlockDevice`), the same sharing pattern `InterruptController`
    /// already uses for its pending-IRQ word.
    pub fn handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<u8>>> {
        self.mem.clone()
    }
}

impl Device for Ram {
    fn set_props(&mut self, _base: u32, _size: u32) {}
    fn read8(&mut self, addr: u32) -> u8 {
        let mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        mem[p]
    }
    fn read16(&mut self, addr: u32) -> u16 {
        let mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        u16::from_be_bytes([mem[p], mem[p + 1]])
    }
    fn read32(&mut self, addr: u32) -> u32 {
        let mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        u32::from_be_bytes([mem[p], mem[p + 1], mem[p + 2], mem[p + 3]])
    }
    fn write8(&mut self, addr: u32, val: u8) {
        if !self.writable {
            return;
        }
        let mut mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        mem[p] = val;
    }
    fn write16(&mut self, addr: u32, val: u16) {
        if !self.writable {
            return;
        }
        let mut mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        let bytes = val.to_be_bytes();
        mem[p] = bytes[0];
        mem[p + 1] = bytes[1];
    }
    fn write32(&mut self, addr: u32, val: u32) {
        if !self.writable {
            return;
        }
        let mut mem = self.mem.lock().unwrap();
        let p = addr as usize % mem.len();
        let bytes = val.to_be_bytes();
        mem[p..p + 4].copy_from_slice(&bytes);
    }
    fn direct_map(&self, _offset_in_device: u32) -> Option<()> {
        Some(())
    }
}

/// Minimal UART: THR/RBR at offset 0, status register at offset 4 (RX
/// non-empty bit 0, TX non-full bit 1, always set since transmit is
/// synchronous), IRQ-enable/IRQ-status (W1C) at offset 8. Host-serial
/// back-ends (pty/TCP threads) are out of scope (spec.md §1); this stand-in
/// only exercises the bus-facing register contract from spec.md §6.
pub struct Uart {
    rx_queue: std::collections::VecDeque<u8>,
    irq_enable: bool,
    irq_status: bool,
}

impl Uart {
    pub fn new() -> Box<Self> {
        Box::new(Self { rx_queue: Default::default(), irq_enable: false, irq_status: false })
    }
    /// Called by whatever feeds this UART bytes (a pty thread in production;
    /// direct injection in tests). Not part of the bus-facing contract.
    pub fn push_rx(&mut self, byte: u8) {
        self.rx_queue.push_back(byte);
        self.irq_status = true;
    }
}

impl Device for Uart {
    fn set_props(&mut self, _base: u32, _size: u32) {}
    fn read8(&mut self, addr: u32) -> u8 {
        match addr & 0xf {
            0x0 => self.rx_queue.pop_front().unwrap_or(0),
            0x4 => {
                let rx_ready = !self.rx_queue.is_empty();
                (rx_ready as u8) | 0b10
            }
            0x8 => ((self.irq_enable as u8) << 1) | (self.irq_status as u8),
            _ => {
                warn!(target: "mattrisc::devices", "UART read from unmapped register {addr:#x}");
                0
            }
        }
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.read8(addr) as u16
    }
    fn read32(&mut self, addr: u32) -> u32 {
        self.read8(addr) as u32
    }
    fn write8(&mut self, addr: u32, val: u8) {
        match addr & 0xf {
            0x0 => print!("{}", val as char),
            0x8 => {
                self.irq_enable = val & 0b10 != 0;
                if val & 0b1 != 0 {
                    self.irq_status = false; // W1C
                }
            }
            _ => warn!(target: "mattrisc::devices", "UART write to unmapped register {addr:#x}"),
        }
    }
    fn write16(&mut self, addr: u32, val: u16) {
        self.write8(addr, val as u8)
    }
    fn write32(&mut self, addr: u32, val: u32) {
        self.write8(addr, val as u8)
    }
    fn irq_level(&self) -> Option<u32> {
        (self.irq_enable && self.irq_status).then_some(0)
    }
}

/// Interrupt-controller stand-in: a single pending/ack register per source,
/// matching `DevXpsIntc.h`'s status/ack register pair. Aggregates other
/// devices' `irq_level()` results is the bus's job (`Bus::poll_irq`); this
/// device is the *architectural* IRQ source the bus wires to `MSR.EE`
/// delivery, i.e. the thing `triggerIRQ` (spec.md §3) calls into.
pub struct InterruptController {
    pending: std::sync::Arc<std::sync::Mutex<u32>>,
}

impl InterruptController {
    pub fn new() -> Box<Self> {
        Box::new(Self { pending: std::sync::Arc::new(std::sync::Mutex::new(0)) })
    }
    /// Handle cloned out to asynchronous sources (serial listener threads
    /// etc.), protected by the same mutex the CPU thread locks on register
    /// reads, per spec.md §5.
    pub fn handle(&self) -> std::sync::Arc<std::sync::Mutex<u32>> {
        self.pending.clone()
    }
    pub fn trigger_irq(&self, line: u32) {
        *self.pending.lock().unwrap() |= 1 << line;
    }
}

impl Device for InterruptController {
    fn set_props(&mut self, _base: u32, _size: u32) {}
    fn read8(&mut self, addr: u32) -> u8 {
        self.read32(addr) as u8
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.read32(addr) as u16
    }
    fn read32(&mut self, addr: u32) -> u32 {
        match addr & 0xf {
            0x0 => *self.pending.lock().unwrap(),
            _ => 0,
        }
    }
    fn write8(&mut self, addr: u32, val: u8) {
        self.write32(addr, val as u32)
    }
    fn write16(&mut self, addr: u32, val: u16) {
        self.write32(addr, val as u32)
    }
    fn write32(&mut self, addr: u32, val: u32) {
        if addr & 0xf == 0x0 {
            *self.pending.lock().unwrap() &= !val; // W1C acknowledge
        }
    }
    fn irq_level(&self) -> Option<u32> {
        let pending = *self.pending.lock().unwrap();
        (pending != 0).then(|| pending.trailing_zeros())
    }
}

/// Synchronous block device: command/block-start/length/PA/completion
/// registers per spec.md §6, backed by a raw image file and a shared
/// handle onto RAM to reach the transfer's target, standing in for
/// `DevSBD.cc`'s `getAddrDMA`/`bus->get_direct_map`. Command protocol
/// (offsets): 0x0 PA, 0x4 block-start, 0x8 length (bytes), 0xC command
/// (1=read,2=write), completion flag readable at 0xC. `pa` and
/// `block_start` are both byte offsets (into RAM and the image
/// respectively), matching this crate's single, base-0 RAM window.
pub struct BlockDevice {
    image: Vec<u8>,
    ram: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    pa: u32,
    block_start: u32,
    length: u32,
    complete: bool,
}

impl BlockDevice {
    pub fn new(image: Vec<u8>, ram: std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> Box<Self> {
        Box::new(Self { image, ram, pa: 0, block_start: 0, length: 0, complete: true })
    }

    /// Performs the DMA described by the current PA/block-start/length
    /// registers. `to_ram == true` is a read command (image -> RAM).
    fn transfer(&mut self, to_ram: bool) {
        let mut ram = self.ram.lock().unwrap();
        let pa = self.pa as usize;
        let start = self.block_start as usize;
        let len = self.length as usize;
        if pa.saturating_add(len) > ram.len() || start.saturating_add(len) > self.image.len() {
            warn!(
                target: "mattrisc::devices",
                "block device transfer out of range (pa={pa:#x} block_start={start:#x} len={len:#x})"
            );
            return;
        }
        if to_ram {
            ram[pa..pa + len].copy_from_slice(&self.image[start..start + len]);
        } else {
            self.image[start..start + len].copy_from_slice(&ram[pa..pa + len]);
        }
    }
}

impl Device for BlockDevice {
    fn set_props(&mut self, _base: u32, _size: u32) {}
    fn read8(&mut self, addr: u32) -> u8 {
        self.read32(addr) as u8
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.read32(addr) as u16
    }
    fn read32(&mut self, addr: u32) -> u32 {
        match addr & 0xf {
            0x0 => self.pa,
            0x4 => self.block_start,
            0x8 => self.length,
            0xC => self.complete as u32,
            _ => 0,
        }
    }
    fn write8(&mut self, addr: u32, val: u8) {
        self.write32(addr, val as u32)
    }
    fn write16(&mut self, addr: u32, val: u16) {
        self.write32(addr, val as u32)
    }
    fn write32(&mut self, addr: u32, val: u32) {
        match addr & 0xf {
            0x0 => self.pa = val,
            0x4 => self.block_start = val,
            0x8 => self.length = val,
            0xC => {
                // Command issue: the transfer and its completion both
                // happen synchronously within this call (spec.md §6,
                // "synchronous completion"), matching `DevSBD.cc`'s
                // doRead/doWrite being invoked directly from the CMD
                // register's write handler.
                match val {
                    1 => self.transfer(true),
                    2 => self.transfer(false),
                    _ => warn!(target: "mattrisc::devices", "block device issued unrecognised command {val:#x}"),
                }
                self.complete = true;
            }
            _ => warn!(target: "mattrisc::devices", "block device write to unmapped register {addr:#x}"),
        }
    }
}

/// A register window with no device behind it: reads return zero, writes
/// are dropped. Used to pad out unimplemented fixed-offset IO windows on
/// Platform 3 (SPI, I2S, SD host, GPIO, keyboard/mouse UART) so the memory
/// map matches spec.md §6 without modelling their internals (spec.md §1).
pub struct Dummy;

impl Device for Dummy {
    fn set_props(&mut self, _base: u32, _size: u32) {}
    fn read8(&mut self, _addr: u32) -> u8 {
        0
    }
    fn read16(&mut self, _addr: u32) -> u16 {
        0
    }
    fn read32(&mut self, _addr: u32) -> u32 {
        0
    }
    fn write8(&mut self, _addr: u32, _val: u8) {}
    fn write16(&mut self, _addr: u32, _val: u16) {}
    fn write32(&mut self, _addr: u32, _val: u32) {}
}
