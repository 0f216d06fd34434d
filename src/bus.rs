// The physical address bus: a flat, ordered routing table fanning out to
// devices, with a last-hit cache for locality (consecutive accesses to the
// same device are extremely common: RAM fetch/fetch/fetch, or a tight MMIO
// poll loop). Mirrors em68k's `Bus` (memory.rs), generalised from a single
// `Vec<(from, to, device)>` scan to the last-hit-cached lookup spec.md §4.1
// requires, and from `OpResult`-typed access to explicit 8/16/32-bit methods
// matching the MMU's `load8/16/32`/`store8/16/32` contract.

use crate::devices::Device;
use crate::error::BusError;
use std::cell::Cell;

/// Maximum number of routed ranges (spec.md §3, "Bus routing table").
pub const MAX_DEVICES: usize = 32;

struct Route {
    base: u32,
    size: u32,
    device: Box<dyn Device>,
}

impl Route {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

pub struct Bus {
    routes: Vec<Route>,
    last_hit: Cell<usize>,
}

impl Bus {
    pub fn new() -> Self {
        Bus { routes: Vec::with_capacity(MAX_DEVICES), last_hit: Cell::new(0) }
    }

    /// Attach `device` at `[base, base+size)`. Ranges must be disjoint; this
    /// is a wiring-time invariant enforced with a panic, as in em68k's
    /// `Bus::attach`, because an overlap is a platform-construction bug, not
    /// a runtime condition.
    pub fn attach(&mut self, device: Box<dyn Device>, base: u32, size: u32) {
        assert!(self.routes.len() < MAX_DEVICES, "bus routing table is full");
        for route in &self.routes {
            let end = base.checked_add(size).expect("device window overflows address space");
            assert!(
                end <= route.base || base >= route.base + route.size,
                "device window [{base:#010x}, {end:#010x}) overlaps an existing route"
            );
        }
        let mut device = device;
        device.set_props(base, size);
        self.routes.push(Route { base, size, device });
    }

    fn find(&self, addr: u32) -> Option<usize> {
        let hit = self.last_hit.get();
        if hit < self.routes.len() && self.routes[hit].contains(addr) {
            return Some(hit);
        }
        for (i, route) in self.routes.iter().enumerate() {
            if route.contains(addr) {
                self.last_hit.set(i);
                return Some(i);
            }
        }
        None
    }

    pub fn read8(&mut self, addr: u32) -> Result<u8, BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        Ok(self.routes[i].device.read8(addr))
    }
    pub fn read16(&mut self, addr: u32) -> Result<u16, BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        Ok(self.routes[i].device.read16(addr))
    }
    pub fn read32(&mut self, addr: u32) -> Result<u32, BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        Ok(self.routes[i].device.read32(addr))
    }
    pub fn write8(&mut self, addr: u32, val: u8) -> Result<(), BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        self.routes[i].device.write8(addr, val);
        Ok(())
    }
    pub fn write16(&mut self, addr: u32, val: u16) -> Result<(), BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        self.routes[i].device.write16(addr, val);
        Ok(())
    }
    pub fn write32(&mut self, addr: u32, val: u32) -> Result<(), BusError> {
        let i = self.find(addr).ok_or(BusError::Unmapped(addr))?;
        self.routes[i].device.write32(addr, val);
        Ok(())
    }

    /// Returns `(device_index, offset_within_device)` for ranges backed by
    /// contiguous host memory (RAM/ROM), so the MMU's micro-TLB can cache a
    /// direct dispatch path that skips the routing scan. MMIO devices return
    /// `None` from `Device::direct_map` and so never produce a hit here.
    pub fn get_direct_map(&self, addr: u32) -> Option<(usize, u32)> {
        let i = self.find(addr)?;
        let route = &self.routes[i];
        route.device.direct_map(addr - route.base)?;
        Some((i, addr - route.base))
    }

    /// Fast path for a micro-TLB hit cached as `TlbPayload::Direct`: dispatch
    /// straight to the device by index, bypassing the routing scan.
    pub fn read_direct8(&mut self, device_index: usize, offset: u32) -> u8 {
        self.routes[device_index].device.read8(self.routes[device_index].base + offset)
    }
    pub fn read_direct16(&mut self, device_index: usize, offset: u32) -> u16 {
        self.routes[device_index].device.read16(self.routes[device_index].base + offset)
    }
    pub fn read_direct32(&mut self, device_index: usize, offset: u32) -> u32 {
        self.routes[device_index].device.read32(self.routes[device_index].base + offset)
    }
    pub fn write_direct8(&mut self, device_index: usize, offset: u32, val: u8) {
        self.routes[device_index].device.write8(self.routes[device_index].base + offset, val);
    }
    pub fn write_direct16(&mut self, device_index: usize, offset: u32, val: u16) {
        self.routes[device_index].device.write16(self.routes[device_index].base + offset, val);
    }
    pub fn write_direct32(&mut self, device_index: usize, offset: u32, val: u32) {
        self.routes[device_index].device.write32(self.routes[device_index].base + offset, val);
    }

    /// Collects asserted IRQ lines from every attached device (interrupt
    /// controller included); called once per runloop tick per spec.md §5.
    pub fn poll_irq(&mut self) -> Option<u32> {
        for route in &mut self.routes {
            if let Some(level) = route.device.irq_level() {
                return Some(level);
            }
        }
        None
    }

    /// Non-blocking periodic callback for devices that need wallclock-ish
    /// updates (spec.md §2 item 8, "platform glue ... periodic tick").
    pub fn tick(&mut self, instret: u64) {
        for route in &mut self.routes {
            route.device.tick(instret);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
