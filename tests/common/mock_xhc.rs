//! Software model of an xHCI controller
//!
//! Implements enough of the register interface and ring protocol to walk
//! the driver through initialization, port reset, slot setup, control
//! transfers and interrupt reports. DMA memory is identity mapped, so the
//! model reads and writes the driver's rings through the bus addresses the
//! driver programs.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ptr::{read_volatile, write_volatile};
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use xhci_usbh::xhci::{RegisterBus, Trb};

use super::mock_hardware::MockDevice;

pub const CAPLENGTH: usize = 0x20;
pub const LEGACY_CAP: usize = 0x1000;
pub const RTSOFF: usize = 0x2000;
pub const DBOFF: usize = 0x3000;
const MMIO_SIZE: usize = 0x4000;

pub const USBCMD: usize = CAPLENGTH;
pub const USBSTS: usize = CAPLENGTH + 0x04;
const PAGESIZE: usize = CAPLENGTH + 0x08;
const CRCR: usize = CAPLENGTH + 0x18;
const DCBAAP: usize = CAPLENGTH + 0x30;
pub const CONFIG: usize = CAPLENGTH + 0x38;
const IMAN: usize = RTSOFF + 0x20;
pub const IMOD: usize = RTSOFF + 0x24;
pub const ERSTSZ: usize = RTSOFF + 0x28;
const ERSTBA: usize = RTSOFF + 0x30;
pub const ERDP: usize = RTSOFF + 0x38;

pub fn portsc(port: u8) -> usize {
    CAPLENGTH + 0x400 + 0x10 * (port as usize - 1)
}

// USBCMD / USBSTS
const RUN_STOP: u32 = 1 << 0;
const HC_RESET: u32 = 1 << 1;
pub const HC_HALTED: u32 = 1 << 0;
pub const HOST_SYSTEM_ERROR: u32 = 1 << 2;
const EVENT_INTERRUPT: u32 = 1 << 3;

// PORTSC
pub const CCS: u32 = 1 << 0;
pub const PED: u32 = 1 << 1;
pub const OCA: u32 = 1 << 3;
pub const PR: u32 = 1 << 4;
pub const PP: u32 = 1 << 9;
pub const CSC: u32 = 1 << 17;
pub const OCC: u32 = 1 << 20;
pub const PRC: u32 = 1 << 21;
const CHANGE_BITS: u32 = 0x7F << 17;
const PRESERVE_BITS: u32 = PP | (0b11 << 14) | (0b111 << 25);

// USB legacy support
const BIOS_OWNED: u32 = 1 << 16;
const OS_OWNED: u32 = 1 << 24;

// TRB types
pub const NORMAL: u8 = 1;
pub const SETUP_STAGE: u8 = 2;
pub const DATA_STAGE: u8 = 3;
pub const STATUS_STAGE: u8 = 4;
pub const LINK: u8 = 6;
pub const ENABLE_SLOT: u8 = 9;
pub const DISABLE_SLOT: u8 = 10;
pub const ADDRESS_DEVICE: u8 = 11;
pub const CONFIGURE_ENDPOINT: u8 = 12;
pub const TRANSFER_EVENT: u8 = 32;
pub const COMMAND_COMPLETION: u8 = 33;
pub const PORT_STATUS_CHANGE: u8 = 34;
pub const HOST_CONTROLLER_EVENT: u8 = 37;
pub const MFINDEX_WRAP_EVENT: u8 = 39;

// Completion codes
pub const SUCCESS: u8 = 1;
pub const USB_TRANSACTION_ERROR: u8 = 4;
pub const TRB_ERROR: u8 = 5;
pub const STALL_ERROR: u8 = 6;
pub const NO_SLOTS_AVAILABLE: u8 = 9;
pub const SHORT_PACKET: u8 = 13;

const IOC: u32 = 1 << 5;
const TOGGLE_CYCLE: u32 = 1 << 1;

/// Static controller parameters
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub ports: u8,
    pub max_slots: u8,
    pub context_64: bool,
    pub scratchpads: u8,
    /// Firmware owns the controller at power-on
    pub bios_owned: bool,
    /// Firmware lets go when the OS asks
    pub bios_releases: bool,
    /// HCRST clears itself
    pub reset_completes: bool,
    /// HCH clears after Run/Stop is set
    pub run_acknowledged: bool,
    /// Controller running when the driver first looks at it
    pub initially_running: bool,
    pub page_size_4k: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            ports: 4,
            max_slots: 8,
            context_64: false,
            scratchpads: 2,
            bios_owned: false,
            bios_releases: true,
            reset_completes: true,
            run_acknowledged: true,
            initially_running: false,
            page_size_4k: true,
        }
    }
}

/// Setup packet seen on a control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub slot_id: u8,
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    address: u64,
    cycle: bool,
}

#[derive(Debug, Clone, Copy)]
struct EventProducer {
    base: u64,
    len: usize,
    index: usize,
    cycle: bool,
}

#[derive(Debug, Default)]
struct MockSlot {
    port: u8,
    address: u8,
    endpoints: HashMap<u8, Cursor>,
    current_setup: Option<Request>,
    stalled: bool,
}

#[derive(Debug)]
pub struct XhcState {
    regs: Vec<u32>,
    opts: MockOptions,
    command_ring: Option<Cursor>,
    events: Option<EventProducer>,
    slots: HashMap<u8, MockSlot>,
    devices: HashMap<u8, MockDevice>,
    next_address: u8,
    reports: HashMap<u8, VecDeque<Vec<u8>>>,
    command_failures: Vec<(u8, u8)>,
    stalled_requests: Vec<u8>,
    report_failures: HashMap<u8, u8>,
    /// Commands processed, as (type, slot ID)
    pub commands: Vec<(u8, u8)>,
    /// Control requests seen, in order
    pub requests: Vec<Request>,
    /// Doorbell writes as (doorbell, target)
    pub doorbells: Vec<(u8, u32)>,
    pub hold_commands: bool,
    pub hold_resets: bool,
    pub reset_without_enable: bool,
}

impl XhcState {
    fn new(opts: MockOptions) -> Self {
        let mut state = Self {
            regs: vec![0; MMIO_SIZE / 4],
            opts,
            command_ring: None,
            events: None,
            slots: HashMap::new(),
            devices: HashMap::new(),
            next_address: 1,
            reports: HashMap::new(),
            command_failures: Vec::new(),
            stalled_requests: Vec::new(),
            report_failures: HashMap::new(),
            commands: Vec::new(),
            requests: Vec::new(),
            doorbells: Vec::new(),
            hold_commands: false,
            hold_resets: false,
            reset_without_enable: false,
        };
        state.power_on();
        state
    }

    fn power_on(&mut self) {
        let o = &self.opts;
        let mut regs = vec![0u32; MMIO_SIZE / 4];
        regs[0] = 0x0110_0000 | CAPLENGTH as u32;
        regs[1] = ((o.ports as u32) << 24) | (1 << 8) | o.max_slots as u32;
        regs[2] = ((o.scratchpads as u32 & 0x1F) << 27) | (((o.scratchpads as u32 >> 5) & 0x1F) << 21);
        let mut hcc = ((LEGACY_CAP / 4) as u32) << 16;
        if o.context_64 {
            hcc |= 1 << 2;
        }
        regs[0x10 / 4] = hcc;
        regs[0x14 / 4] = DBOFF as u32;
        regs[0x18 / 4] = RTSOFF as u32;
        regs[PAGESIZE / 4] = if o.page_size_4k { 1 } else { 2 };
        if o.initially_running {
            regs[USBCMD / 4] = RUN_STOP;
        } else {
            regs[USBSTS / 4] = HC_HALTED;
        }
        regs[LEGACY_CAP / 4] = 0x01 | if o.bios_owned { BIOS_OWNED } else { 0 };
        for port in 1..=o.ports {
            regs[portsc(port) / 4] = PP;
        }
        self.regs = regs;
    }

    fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    fn reg64(&self, offset: usize) -> u64 {
        self.reg(offset) as u64 | ((self.reg(offset + 4) as u64) << 32)
    }

    fn set(&mut self, offset: usize, value: u32) {
        self.regs[offset / 4] = value;
    }

    fn context_stride(&self) -> usize {
        if self.opts.context_64 {
            64
        } else {
            32
        }
    }

    fn port_count(&self) -> u8 {
        self.opts.ports
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            USBCMD => self.write_usbcmd(value),
            USBSTS => {
                let rw1c = value & (HOST_SYSTEM_ERROR | EVENT_INTERRUPT | (1 << 4));
                self.set(USBSTS, self.reg(USBSTS) & !rw1c);
            }
            PAGESIZE => {}
            o if o == CRCR + 4 => {
                self.set(o, value);
                let crcr = self.reg64(CRCR);
                self.command_ring = Some(Cursor {
                    address: crcr & !0x3F,
                    cycle: crcr & 1 != 0,
                });
            }
            IMAN => {
                let pending = self.reg(IMAN) & 1 & !(value & 1);
                self.set(IMAN, pending | (value & 2));
            }
            o if o == ERSTBA + 4 => {
                self.set(o, value);
                let erst = self.reg64(ERSTBA);
                // SAFETY: the driver points ERSTBA at its segment table
                let (base, size) = unsafe {
                    (
                        read_volatile(erst as *const u64),
                        read_volatile((erst + 8) as *const u32),
                    )
                };
                self.events = Some(EventProducer {
                    base,
                    len: size as usize,
                    index: 0,
                    cycle: true,
                });
            }
            LEGACY_CAP => {
                let mut header = (value & !BIOS_OWNED) | (self.reg(LEGACY_CAP) & BIOS_OWNED);
                if value & OS_OWNED != 0 && self.opts.bios_releases {
                    header &= !BIOS_OWNED;
                }
                self.set(LEGACY_CAP, header);
            }
            o if o >= portsc(1) && o < portsc(self.port_count() + 1) && (o - portsc(1)) % 0x10 == 0 => {
                let port = ((o - portsc(1)) / 0x10 + 1) as u8;
                self.write_portsc(port, value);
            }
            o if o >= DBOFF && o < DBOFF + 4 * 256 => {
                let doorbell = ((o - DBOFF) / 4) as u8;
                self.doorbells.push((doorbell, value));
                if doorbell == 0 {
                    self.process_commands();
                } else {
                    self.service_endpoint(doorbell, value as u8);
                }
            }
            o => self.set(o, value),
        }
    }

    fn write_usbcmd(&mut self, value: u32) {
        if value & HC_RESET != 0 {
            if self.opts.reset_completes {
                self.set(USBCMD, 0);
                self.set(USBSTS, HC_HALTED);
                self.command_ring = None;
                self.events = None;
                self.slots.clear();
            } else {
                self.set(USBCMD, value);
            }
            return;
        }
        self.set(USBCMD, value);
        let status = self.reg(USBSTS);
        if value & RUN_STOP != 0 {
            if self.opts.run_acknowledged {
                self.set(USBSTS, status & !HC_HALTED);
            }
        } else {
            self.set(USBSTS, status | HC_HALTED);
        }
    }

    fn write_portsc(&mut self, port: u8, value: u32) {
        let offset = portsc(port);
        let old = self.reg(offset);
        let mut new = old & !(value & CHANGE_BITS);
        new = (new & !PRESERVE_BITS) | (value & PRESERVE_BITS);
        if value & PR != 0 && old & CCS != 0 {
            if self.hold_resets {
                new |= PR;
            } else {
                new &= !PR;
                new |= PRC;
                if !self.reset_without_enable {
                    new |= PED;
                }
                self.set(offset, new);
                self.port_event(port);
                return;
            }
        }
        self.set(offset, new);
    }

    fn port_event(&mut self, port: u8) {
        self.push_event(
            (port as u64) << 24,
            (SUCCESS as u32) << 24,
            (PORT_STATUS_CHANGE as u32) << 10,
        );
    }

    pub fn push_event(&mut self, parameter: u64, status: u32, control: u32) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let cycle = if events.cycle { 1 } else { 0 };
        let trb = Trb::new(parameter, status, (control & !1) | cycle);
        let slot = (events.base + 16 * events.index as u64) as *mut Trb;
        // SAFETY: slot lies in the segment the driver registered
        unsafe { write_volatile(slot, trb) };
        events.index += 1;
        if events.index == events.len {
            events.index = 0;
            events.cycle = !events.cycle;
        }
        let status = self.reg(USBSTS) | EVENT_INTERRUPT;
        self.set(USBSTS, status);
        let iman = self.reg(IMAN) | 1;
        self.set(IMAN, iman);
    }

    fn complete_command(&mut self, trb: u64, code: u8, slot_id: u8) {
        self.push_event(
            trb,
            (code as u32) << 24,
            ((COMMAND_COMPLETION as u32) << 10) | ((slot_id as u32) << 24),
        );
    }

    fn transfer_event(&mut self, trb: u64, code: u8, residual: u32, slot_id: u8, dci: u8) {
        self.push_event(
            trb,
            ((code as u32) << 24) | (residual & 0x00FF_FFFF),
            ((TRANSFER_EVENT as u32) << 10) | ((dci as u32) << 16) | ((slot_id as u32) << 24),
        );
    }

    fn take_failure(&mut self, trb_type: u8) -> Option<u8> {
        let position = self.command_failures.iter().position(|(t, _)| *t == trb_type)?;
        Some(self.command_failures.remove(position).1)
    }

    fn process_commands(&mut self) {
        if self.hold_commands {
            return;
        }
        while let Some(mut cursor) = self.command_ring {
            let trb = read_trb(cursor.address);
            if trb.cycle() != cursor.cycle {
                break;
            }
            let trb_type = trb_type(&trb);
            if trb_type == LINK {
                cursor.address = trb.parameter & !0xF;
                if trb.control & TOGGLE_CYCLE != 0 {
                    cursor.cycle = !cursor.cycle;
                }
                self.command_ring = Some(cursor);
                continue;
            }
            let address = cursor.address;
            cursor.address += 16;
            self.command_ring = Some(cursor);

            let slot_id = (trb.control >> 24) as u8;
            self.commands.push((trb_type, slot_id));
            if let Some(code) = self.take_failure(trb_type) {
                self.complete_command(address, code, 0);
                continue;
            }
            match trb_type {
                ENABLE_SLOT => match (1..=self.opts.max_slots).find(|s| !self.slots.contains_key(s)) {
                    Some(slot) => {
                        self.slots.insert(slot, MockSlot::default());
                        self.complete_command(address, SUCCESS, slot);
                    }
                    None => self.complete_command(address, NO_SLOTS_AVAILABLE, 0),
                },
                DISABLE_SLOT => {
                    self.slots.remove(&slot_id);
                    self.reports.remove(&slot_id);
                    self.complete_command(address, SUCCESS, slot_id);
                }
                ADDRESS_DEVICE => {
                    let code = self.address_device(slot_id, trb.parameter);
                    self.complete_command(address, code, slot_id);
                }
                CONFIGURE_ENDPOINT => {
                    let code = self.configure_endpoint(slot_id, trb.parameter);
                    self.complete_command(address, code, slot_id);
                }
                _ => self.complete_command(address, TRB_ERROR, slot_id),
            }
        }
    }

    fn input_dword(&self, input: u64, entry: usize, dword: usize) -> u32 {
        let address = input + (entry * self.context_stride() + dword * 4) as u64;
        // SAFETY: the driver hands over a full input context
        unsafe { read_volatile(address as *const u32) }
    }

    fn endpoint_cursor(&self, input: u64, dci: u8) -> Cursor {
        let entry = dci as usize + 1;
        let lo = self.input_dword(input, entry, 2) as u64;
        let hi = self.input_dword(input, entry, 3) as u64;
        let dequeue = lo | (hi << 32);
        Cursor {
            address: dequeue & !0xF,
            cycle: dequeue & 1 != 0,
        }
    }

    fn write_output_slot(&self, slot_id: u8, dword3: u32) {
        let dcbaa = self.reg64(DCBAAP);
        // SAFETY: DCBAA and the device context it points at belong to the driver
        unsafe {
            let output = read_volatile((dcbaa + 8 * slot_id as u64) as *const u64);
            if output != 0 {
                write_volatile((output + 12) as *mut u32, dword3);
            }
        }
    }

    fn address_device(&mut self, slot_id: u8, input: u64) -> u8 {
        if !self.slots.contains_key(&slot_id) {
            return 11; // Slot Not Enabled
        }
        let port = ((self.input_dword(input, 1, 1) >> 16) & 0xFF) as u8;
        if !self.devices.contains_key(&port) {
            return USB_TRANSACTION_ERROR;
        }
        let ep0 = self.endpoint_cursor(input, 1);
        let address = self.next_address;
        self.next_address = self.next_address.wrapping_add(1).max(1);
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.port = port;
            slot.address = address;
            slot.endpoints.insert(1, ep0);
        }
        self.write_output_slot(slot_id, address as u32 | (2 << 27));
        SUCCESS
    }

    fn configure_endpoint(&mut self, slot_id: u8, input: u64) -> u8 {
        if !self.slots.contains_key(&slot_id) {
            return 11;
        }
        let add = self.input_dword(input, 0, 1);
        let cursors: Vec<(u8, Cursor)> = (2..32u8)
            .filter(|dci| add & (1 << dci) != 0)
            .map(|dci| (dci, self.endpoint_cursor(input, dci)))
            .collect();
        let address = match self.slots.get_mut(&slot_id) {
            Some(slot) => {
                slot.endpoints.extend(cursors);
                slot.address
            }
            None => 0,
        };
        self.write_output_slot(slot_id, address as u32 | (3 << 27));
        SUCCESS
    }

    fn respond(&self, slot_id: u8, request: &Request) -> Vec<u8> {
        let Some(device) = self
            .slots
            .get(&slot_id)
            .and_then(|s| self.devices.get(&s.port))
        else {
            return Vec::new();
        };
        if request.request != 6 {
            return Vec::new();
        }
        match request.value >> 8 {
            1 => device.device_descriptor.clone(),
            2 => device.config_descriptor.clone(),
            _ => Vec::new(),
        }
    }

    fn service_endpoint(&mut self, slot_id: u8, dci: u8) {
        loop {
            let Some(mut cursor) = self
                .slots
                .get(&slot_id)
                .and_then(|s| s.endpoints.get(&dci))
                .copied()
            else {
                return;
            };
            let trb = read_trb(cursor.address);
            if trb.cycle() != cursor.cycle {
                return;
            }
            let address = cursor.address;
            let trb_type = trb_type(&trb);
            if trb_type == LINK {
                cursor.address = trb.parameter & !0xF;
                if trb.control & TOGGLE_CYCLE != 0 {
                    cursor.cycle = !cursor.cycle;
                }
            } else if trb_type == NORMAL {
                if let Some(code) = self.report_failures.remove(&slot_id) {
                    cursor.address += 16;
                    self.set_cursor(slot_id, dci, cursor);
                    self.transfer_event(address, code, trb.status & 0x1_FFFF, slot_id, dci);
                    continue;
                }
                let Some(report) = self.reports.get_mut(&slot_id).and_then(VecDeque::pop_front) else {
                    return;
                };
                let length = trb.status & 0x1_FFFF;
                let copied = report.len().min(length as usize);
                // SAFETY: Normal TRB buffer is at least `length` bytes
                unsafe {
                    std::ptr::copy_nonoverlapping(report.as_ptr(), trb.parameter as *mut u8, copied)
                };
                let residual = length - copied as u32;
                let code = if residual > 0 { SHORT_PACKET } else { SUCCESS };
                cursor.address += 16;
                self.set_cursor(slot_id, dci, cursor);
                self.transfer_event(address, code, residual, slot_id, dci);
                continue;
            } else {
                cursor.address += 16;
                self.control_stage(slot_id, dci, address, &trb);
            }
            self.set_cursor(slot_id, dci, cursor);
        }
    }

    fn service_interrupt_endpoints(&mut self, slot_id: u8) {
        let endpoints: Vec<u8> = self
            .slots
            .get(&slot_id)
            .map(|slot| slot.endpoints.keys().copied().filter(|dci| *dci > 1).collect())
            .unwrap_or_default();
        for dci in endpoints {
            self.service_endpoint(slot_id, dci);
        }
    }

    fn set_cursor(&mut self, slot_id: u8, dci: u8, cursor: Cursor) {
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.endpoints.insert(dci, cursor);
        }
    }

    fn control_stage(&mut self, slot_id: u8, dci: u8, address: u64, trb: &Trb) {
        match trb_type(trb) {
            SETUP_STAGE => {
                let p = trb.parameter;
                let request = Request {
                    slot_id,
                    request_type: p as u8,
                    request: (p >> 8) as u8,
                    value: (p >> 16) as u16,
                    index: (p >> 32) as u16,
                    length: (p >> 48) as u16,
                };
                self.requests.push(request);
                let stalled = match self.stalled_requests.iter().position(|r| *r == request.request) {
                    Some(i) => {
                        self.stalled_requests.remove(i);
                        true
                    }
                    None => false,
                };
                if let Some(slot) = self.slots.get_mut(&slot_id) {
                    slot.current_setup = Some(request);
                    slot.stalled = stalled;
                }
            }
            DATA_STAGE => {
                let Some((request, stalled)) = self.slots.get(&slot_id).and_then(|s| Some((s.current_setup?, s.stalled))) else {
                    return;
                };
                let length = trb.status & 0x1_FFFF;
                if stalled {
                    self.transfer_event(address, STALL_ERROR, length, slot_id, dci);
                    return;
                }
                let data = self.respond(slot_id, &request);
                let copied = data.len().min(length as usize);
                // SAFETY: Data stage buffer is at least `length` bytes
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), trb.parameter as *mut u8, copied)
                };
                let residual = length - copied as u32;
                if trb.control & IOC != 0 {
                    let code = if residual > 0 { SHORT_PACKET } else { SUCCESS };
                    self.transfer_event(address, code, residual, slot_id, dci);
                }
            }
            STATUS_STAGE => {
                let stalled = self.slots.get(&slot_id).is_some_and(|s| s.stalled);
                if let Some(slot) = self.slots.get_mut(&slot_id) {
                    slot.current_setup = None;
                    slot.stalled = false;
                }
                if trb.control & IOC != 0 {
                    let code = if stalled { STALL_ERROR } else { SUCCESS };
                    self.transfer_event(address, code, 0, slot_id, dci);
                }
            }
            _ => {}
        }
    }
}

fn read_trb(address: u64) -> Trb {
    // SAFETY: ring addresses come from the driver's own segments
    unsafe { read_volatile(address as *const Trb) }
}

fn trb_type(trb: &Trb) -> u8 {
    ((trb.control >> 10) & 0x3F) as u8
}

/// Handle used by tests to drive and inspect the model
#[derive(Clone)]
pub struct MockXhc(Rc<RefCell<XhcState>>);

impl MockXhc {
    pub fn new(opts: MockOptions) -> Self {
        Self(Rc::new(RefCell::new(XhcState::new(opts))))
    }

    pub fn bus(&self) -> MockBus {
        MockBus(self.0.clone())
    }

    pub fn state(&self) -> std::cell::Ref<'_, XhcState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, XhcState> {
        self.0.borrow_mut()
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.0.borrow().reg(offset)
    }

    pub fn reg64(&self, offset: usize) -> u64 {
        self.0.borrow().reg64(offset)
    }

    /// Plug `device` into `port` and raise a port status change
    pub fn attach(&self, port: u8, device: MockDevice) {
        let mut s = self.0.borrow_mut();
        let value = PP | CCS | CSC | ((device.speed as u32) << 10);
        s.set(portsc(port), value);
        s.devices.insert(port, device);
        s.port_event(port);
    }

    /// Unplug whatever is on `port`
    pub fn detach(&self, port: u8) {
        let mut s = self.0.borrow_mut();
        s.set(portsc(port), PP | CSC);
        s.devices.remove(&port);
        s.port_event(port);
    }

    pub fn over_current(&self, port: u8) {
        let mut s = self.0.borrow_mut();
        let value = s.reg(portsc(port)) | OCA | OCC;
        s.set(portsc(port), value);
        s.port_event(port);
    }

    /// Complete the next command of `trb_type` with `code`
    pub fn fail_next_command(&self, trb_type: u8, code: u8) {
        self.0.borrow_mut().command_failures.push((trb_type, code));
    }

    /// Stall the next control transfer carrying `request`
    pub fn stall_next_request(&self, request: u8) {
        self.0.borrow_mut().stalled_requests.push(request);
    }

    pub fn hold_commands(&self, hold: bool) {
        let mut s = self.0.borrow_mut();
        s.hold_commands = hold;
        if !hold {
            s.process_commands();
        }
    }

    pub fn hold_resets(&self, hold: bool) {
        self.0.borrow_mut().hold_resets = hold;
    }

    pub fn reset_without_enable(&self, enabled: bool) {
        self.0.borrow_mut().reset_without_enable = enabled;
    }

    pub fn raise_host_system_error(&self) {
        let mut s = self.0.borrow_mut();
        let status = s.reg(USBSTS) | HOST_SYSTEM_ERROR | HC_HALTED;
        s.set(USBSTS, status);
    }

    pub fn push_event(&self, parameter: u64, status: u32, control: u32) {
        self.0.borrow_mut().push_event(parameter, status, control);
    }

    /// Complete the next interrupt IN transfer of `slot_id` with `code`
    pub fn fail_next_report(&self, slot_id: u8, code: u8) {
        let mut s = self.0.borrow_mut();
        s.report_failures.insert(slot_id, code);
        s.service_interrupt_endpoints(slot_id);
    }

    /// Queue an interrupt IN report for `slot_id` and deliver it if a
    /// transfer is waiting
    pub fn send_report(&self, slot_id: u8, report: &[u8]) {
        let mut s = self.0.borrow_mut();
        s.reports.entry(slot_id).or_default().push_back(report.to_vec());
        s.service_interrupt_endpoints(slot_id);
    }

    pub fn slot_enabled(&self, slot_id: u8) -> bool {
        self.0.borrow().slots.contains_key(&slot_id)
    }

    pub fn commands(&self) -> Vec<(u8, u8)> {
        self.0.borrow().commands.clone()
    }

    pub fn requests(&self, slot_id: u8) -> Vec<Request> {
        self.0
            .borrow()
            .requests
            .iter()
            .filter(|r| r.slot_id == slot_id)
            .copied()
            .collect()
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.0.borrow().doorbells.clone()
    }

    pub fn dcbaa_entry(&self, slot_id: u8) -> u64 {
        let dcbaa = self.reg64(DCBAAP);
        // SAFETY: DCBAA is in the driver's controller memory
        unsafe { read_volatile((dcbaa + 8 * slot_id as u64) as *const u64) }
    }

    pub fn dcbaap(&self) -> u64 {
        self.reg64(DCBAAP)
    }

    pub fn crcr(&self) -> u64 {
        self.reg64(CRCR)
    }

    pub fn erstba(&self) -> u64 {
        self.reg64(ERSTBA)
    }
}

/// Register bus backed by the model
pub struct MockBus(Rc<RefCell<XhcState>>);

impl RegisterBus for MockBus {
    fn read32(&self, offset: usize) -> u32 {
        self.0.borrow().reg(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.0.borrow_mut().write(offset, value);
    }
}

/// Delay that returns immediately and counts requested time
#[derive(Default)]
pub struct NoopDelay {
    pub elapsed_ns: u64,
}

impl DelayNs for NoopDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += ns as u64;
    }
}
