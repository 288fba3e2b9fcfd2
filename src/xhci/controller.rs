//! xHCI controller core
//!
//! Owns the register bus, the DMA memory map, the command and event rings,
//! the root ports and the device slots. The caller drives it by polling:
//!
//! ```ignore
//! controller.initialize()?;
//! controller.run()?;
//! controller.configure_ports();
//! loop {
//!     while controller.has_pending_event() {
//!         if let Err(e) = controller.process_event() {
//!             log::warn!("xhci event: {}", e);
//!         }
//!     }
//! }
//! ```
//!
//! Root ports are configured one at a time. A port that finds another port
//! between reset and configuration waits in `Connected` and is started as
//! soon as that port finishes, from the event path or the next scan.
//!
//! A connect status change on a port that is past `Connected` releases its
//! slot and starts the port over, since another device may be attached now.
//!
//! An interrupt IN transfer that completes with an error leaves the HID
//! endpoint halted. The port stays `Configured` but delivers no more reports
//! until the device is replugged or the controller is re-initialized.

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::{debug, error, info, trace, warn};

use crate::dma::{ControllerMemory, MemoryMap, SlotAllocator, CONTROL_BUFFER_SIZE, MAX_SLOTS, REPORT_BUFFER_SIZE, RING_SEGMENT_TRBS};
use crate::enumeration::{parse_configuration, DeviceDescriptor};
use crate::error::{Result, XhciError};
use crate::hid::{HidProtocolMode, HidRequest, KeyboardObserver, MouseObserver, Observers};
use crate::transfer::{descriptor_type, SetupPacket};

use super::context::ContextSize;
use super::device::{Device, SetupStep, CONTROL_DCI};
use super::port::{Port, PortState};
use super::register::{RegisterBus, RegisterTimeout};
use super::ring::{EventRing, EventRingSegmentTableEntry, Ring};
use super::trb::{CompletionCode, Trb, TrbType};
use super::{cap, ext_cap, op, runtime, timeouts, Crcr, Iman, PortId, PortSc, UsbCmd, UsbSts};

/// Root ports addressable through HCSPARAMS1.MaxPorts
pub const MAX_ROOT_PORTS: usize = 255;

/// Commands that may be outstanding at once
pub const MAX_PENDING_COMMANDS: usize = RING_SEGMENT_TRBS;

/// Controller tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// HCRST/CNR clear timeout
    pub reset_timeout_us: u32,
    /// HCH clear timeout after setting Run/Stop
    pub run_timeout_us: u32,
    /// HCH set timeout after clearing Run/Stop
    pub halt_timeout_us: u32,
    /// BIOS ownership handoff timeout
    pub ownership_timeout_us: u32,
    /// Delay between register polls
    pub poll_interval_us: u32,
    /// Interrupter moderation interval (250 ns units)
    pub interrupt_moderation: u16,
    /// Upper bound for MaxSlotsEn
    pub max_slots: u8,
    /// Scan passes an in-flight port may go without progress
    pub port_timeout_scans: u32,
}

impl ControllerConfig {
    /// Defaults used by [`Controller::new`]
    pub const DEFAULT: Self = Self {
        reset_timeout_us: timeouts::HC_RESET_TIMEOUT_US,
        run_timeout_us: timeouts::RUN_TIMEOUT_US,
        halt_timeout_us: timeouts::HALT_TIMEOUT_US,
        ownership_timeout_us: timeouts::OWNERSHIP_TIMEOUT_US,
        poll_interval_us: timeouts::POLL_INTERVAL_US,
        interrupt_moderation: 4000,
        max_slots: MAX_SLOTS as u8,
        port_timeout_scans: 8,
    };
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerState {
    /// Not initialized, or the last initialize failed
    Uninitialized,
    /// Rings programmed, controller halted
    Initialized,
    /// Run/Stop set and acknowledged
    Running,
    /// Host system error or run failure; re-initialize to recover
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    trb: u64,
    kind: CommandKind,
    /// `None` once the port no longer waits for it
    port: Option<PortId>,
    slot_id: u8,
}

/// Follow-up after an EP0 transfer completes
enum ControlStep {
    Request(SetupPacket),
    ConfigureEndpoint(u64),
    Done,
}

/// xHCI host controller
pub struct Controller<B: RegisterBus, D: DelayNs> {
    bus: B,
    delay: D,
    config: ControllerConfig,
    memory: MemoryMap,
    state: ControllerState,
    op_base: usize,
    rt_base: usize,
    db_base: usize,
    max_ports: u8,
    max_slots: u8,
    context_size: ContextSize,
    ports: Vec<Port, MAX_ROOT_PORTS>,
    devices: [Option<Device>; MAX_SLOTS],
    slots: SlotAllocator,
    command_ring: Ring,
    event_ring: EventRing,
    pending: Vec<PendingCommand, MAX_PENDING_COMMANDS>,
    addressing_port: Option<PortId>,
    observers: Observers,
}

// SAFETY: the raw pointers all point into the 'static ControllerMemory the
// controller took exclusive ownership of; nothing is shared between threads.
unsafe impl<B: RegisterBus + Send, D: DelayNs + Send> Send for Controller<B, D> {}

impl<B: RegisterBus, D: DelayNs> Controller<B, D> {
    /// Create a controller with the default configuration
    pub fn new(bus: B, delay: D, memory: &'static mut ControllerMemory) -> Self {
        Self::with_config(bus, delay, memory, ControllerConfig::DEFAULT)
    }

    /// Create a controller with `config`
    pub fn with_config(
        bus: B,
        delay: D,
        memory: &'static mut ControllerMemory,
        config: ControllerConfig,
    ) -> Self {
        let memory = MemoryMap::new(memory);
        let (command_base, command_len) = memory.command_ring();
        let (event_base, event_len) = memory.event_ring();
        // SAFETY: both segments live in the 'static region the map owns
        let (command_ring, event_ring) = unsafe {
            (
                Ring::new(command_base, command_len),
                EventRing::new(event_base, event_len),
            )
        };

        Self {
            bus,
            delay,
            config,
            memory,
            state: ControllerState::Uninitialized,
            op_base: 0,
            rt_base: 0,
            db_base: 0,
            max_ports: 0,
            max_slots: 0,
            context_size: ContextSize::Bytes32,
            ports: Vec::new(),
            devices: [const { None }; MAX_SLOTS],
            slots: SlotAllocator::new(),
            command_ring,
            event_ring,
            pending: Vec::new(),
            addressing_port: None,
            observers: Observers::new(),
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Active configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Root port count (0 until initialized)
    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }

    /// Slots enabled in CONFIG.MaxSlotsEn
    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    /// Root port `index` (1-based)
    ///
    /// # Panics
    ///
    /// If `index` is 0 or greater than [`max_ports`](Self::max_ports).
    pub fn port_at(&self, index: u8) -> &Port {
        assert!(
            index >= 1 && index <= self.max_ports,
            "port {} out of range 1..={}",
            index,
            self.max_ports
        );
        &self.ports[index as usize - 1]
    }

    /// All root ports in order
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    /// Device in `slot_id`, if one is set up
    pub fn device(&self, slot_id: u8) -> Option<&Device> {
        let index = (slot_id as usize).checked_sub(1)?;
        self.devices.get(index)?.as_ref()
    }

    /// Port currently holding the addressing turn
    pub fn addressing_port(&self) -> Option<PortId> {
        self.addressing_port
    }

    /// Primary event ring
    pub fn primary_event_ring(&self) -> &EventRing {
        &self.event_ring
    }

    /// Whether [`process_event`](Self::process_event) has something to consume
    pub fn has_pending_event(&self) -> bool {
        matches!(
            self.state,
            ControllerState::Initialized | ControllerState::Running
        ) && self.event_ring.has_front()
    }

    /// Replace the mouse observer
    pub fn register_mouse_observer(&mut self, observer: MouseObserver) {
        self.observers.register_mouse(observer);
    }

    /// Replace the keyboard observer
    pub fn register_keyboard_observer(&mut self, observer: KeyboardObserver) {
        self.observers.register_keyboard(observer);
    }

    /// Bring the controller from any state to halted, reset and programmed
    pub fn initialize(&mut self) -> Result<()> {
        self.state = ControllerState::Uninitialized;
        self.max_ports = 0;
        self.ports.clear();
        self.devices = [const { None }; MAX_SLOTS];
        self.slots.reset();
        self.pending.clear();
        self.addressing_port = None;

        match self.program() {
            Ok(()) => {
                self.state = ControllerState::Initialized;
                info!(
                    "xHCI initialized: {} ports, {} slots, {:?} contexts",
                    self.max_ports, self.max_slots, self.context_size
                );
                Ok(())
            }
            Err(e) => {
                error!("xHCI initialize failed: {}", e);
                self.max_ports = 0;
                self.ports.clear();
                Err(e)
            }
        }
    }

    /// Set Run/Stop and wait for the controller to leave the halted state
    pub fn run(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Running => return Ok(()),
            ControllerState::Initialized => {}
            ControllerState::Uninitialized | ControllerState::Faulted => {
                return Err(XhciError::NotInitialized)
            }
        }

        let usbcmd = op::USBCMD + self.op_base;
        self.bus.modify32(usbcmd, |v| v | UsbCmd::RUN_STOP.bits());

        let usbsts = self.op_base + op::USBSTS;
        let bus = &self.bus;
        let ack = RegisterTimeout::new_us(self.config.run_timeout_us)
            .with_poll_interval_us(self.config.poll_interval_us)
            .wait_for(&mut self.delay, || {
                !UsbSts::from_bits_retain(bus.read32(usbsts)).contains(UsbSts::HC_HALTED)
            });
        if ack.is_err() {
            error!("xHCI did not start");
            self.state = ControllerState::Faulted;
            return Err(XhciError::RunTimeout);
        }

        self.state = ControllerState::Running;
        info!("xHCI running");
        Ok(())
    }

    /// One scan pass over every root port
    ///
    /// Per-port failures are logged and do not stop the pass.
    pub fn configure_ports(&mut self) {
        if self.state != ControllerState::Running {
            debug!("port scan skipped: controller {:?}", self.state);
            return;
        }
        for port in 1..=self.max_ports {
            if let Err(e) = self.configure_port(port) {
                warn!("port {}: {}", port, e);
            }
        }
    }

    /// Advance the configuration of root port `index` (1-based)
    ///
    /// Starts configuration of a newly connected port when no other port is
    /// being addressed, and times out ports that stopped making progress.
    ///
    /// # Panics
    ///
    /// If `index` is out of range, as for [`port_at`](Self::port_at).
    pub fn configure_port(&mut self, index: u8) -> Result<()> {
        if self.state != ControllerState::Running {
            return Err(XhciError::NotInitialized);
        }
        let id = self.port_at(index).id();
        let limit = self.config.port_timeout_scans;
        let portsc = self.read_portsc(id);
        let port = self.port_mut(id);
        port.refresh(portsc);
        let connected = port.is_connected();

        match port.state() {
            PortState::Configured | PortState::Failed => Ok(()),
            PortState::Disconnected if !connected => Ok(()),
            PortState::Disconnected | PortState::Connected => {
                if !connected {
                    return port.transition(PortState::Disconnected);
                }
                if port.state() == PortState::Disconnected {
                    port.transition(PortState::Connected)?;
                }
                self.start_port(id, portsc)
            }
            PortState::Resetting | PortState::Addressing | PortState::DescriptorNegotiation => {
                if !connected {
                    self.handle_disconnect(id);
                    return Ok(());
                }
                if port.stall() > limit {
                    self.fail_port(id, XhciError::Timeout);
                    return Err(XhciError::Timeout);
                }
                Ok(())
            }
        }
    }

    /// Consume and dispatch one event, if any
    pub fn process_event(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Uninitialized => return Err(XhciError::NotInitialized),
            ControllerState::Faulted => return Err(XhciError::HostSystemError),
            ControllerState::Initialized | ControllerState::Running => {}
        }

        let status = UsbSts::from_bits_retain(self.bus.read32(self.op_base + op::USBSTS));
        if status.intersects(UsbSts::HOST_SYSTEM_ERROR | UsbSts::HC_ERROR) {
            error!("xHCI host system error (USBSTS {:#x})", status.bits());
            self.state = ControllerState::Faulted;
            return Err(XhciError::HostSystemError);
        }

        let Some(event) = self.event_ring.pop() else {
            return Ok(());
        };
        self.acknowledge_event();

        let result = match event.trb_type() {
            TrbType::PortStatusChangeEvent => self.on_port_status_change(&event),
            TrbType::CommandCompletionEvent => self.on_command_completion(&event),
            TrbType::TransferEvent => self.on_transfer_event(&event),
            TrbType::HostControllerEvent => {
                warn!("host controller event: {:?}", event.completion_code());
                Ok(())
            }
            other => {
                debug!("ignoring event {:?}", other);
                Ok(())
            }
        };

        if self.addressing_port.is_none() {
            self.start_waiting_port();
        }
        result
    }

    fn program(&mut self) -> Result<()> {
        let caplength = (self.bus.read32(cap::CAPLENGTH) & 0xFF) as usize;
        let hcsparams1 = self.bus.read32(cap::HCSPARAMS1);
        let hcsparams2 = self.bus.read32(cap::HCSPARAMS2);
        let hccparams1 = self.bus.read32(cap::HCCPARAMS1);
        self.op_base = caplength;
        self.db_base = (self.bus.read32(cap::DBOFF) & !0x3) as usize;
        self.rt_base = (self.bus.read32(cap::RTSOFF) & !0x1F) as usize;
        self.context_size = if cap::context_size_64(hccparams1) {
            ContextSize::Bytes64
        } else {
            ContextSize::Bytes32
        };

        self.take_ownership(cap::extended_capabilities(hccparams1))?;
        self.halt()?;
        self.reset()?;

        if self.bus.read32(self.op_base + op::PAGESIZE) & 0x1 == 0 {
            error!("xHCI does not support 4 KiB pages");
            return Err(XhciError::Unsupported);
        }

        self.max_slots = cap::max_slots(hcsparams1)
            .min(self.config.max_slots)
            .min(MAX_SLOTS as u8);
        let max_slots = self.max_slots as u32;
        self.bus
            .modify32(self.op_base + op::CONFIG, |v| (v & !0xFF) | max_slots);

        self.memory.clear_dcbaa();
        let scratchpads = cap::max_scratchpad_buffers(hcsparams2);
        if scratchpads > 0 {
            let array = self.memory.bind_scratchpad(scratchpads).inspect_err(|_| {
                error!("xHCI wants {} scratchpad pages", scratchpads);
            })?;
            self.memory.set_dcbaa_entry(0, array);
        }
        let dcbaa = self.memory.dcbaa_address();
        self.bus.write64(self.op_base + op::DCBAAP, dcbaa);

        self.command_ring.reset();
        let crcr = self.command_ring.base_address() | Crcr::RING_CYCLE_STATE.bits();
        self.bus.write64(self.op_base + op::CRCR, crcr);

        self.event_ring.reset();
        let erst = self
            .memory
            .write_erst(EventRingSegmentTableEntry::for_ring(&self.event_ring));
        self.bus.write32(self.rt_base + runtime::ERSTSZ, 1);
        self.bus
            .write64(self.rt_base + runtime::ERDP, self.event_ring.dequeue_pointer());
        // ERSTBA last: writing it enables the event ring
        self.bus.write64(self.rt_base + runtime::ERSTBA, erst);

        self.bus.write32(
            self.rt_base + runtime::IMOD,
            self.config.interrupt_moderation as u32,
        );
        self.bus.write32(
            self.rt_base + runtime::IMAN,
            (Iman::INTERRUPT_PENDING | Iman::INTERRUPT_ENABLE).bits(),
        );
        self.bus.modify32(self.op_base + op::USBCMD, |v| {
            v | UsbCmd::INTERRUPTER_ENABLE.bits()
        });

        self.max_ports = cap::max_ports(hcsparams1);
        for n in 1..=self.max_ports {
            if let Some(id) = PortId::new(n) {
                // Capacity is MAX_ROOT_PORTS, the largest MaxPorts value
                let _ = self.ports.push(Port::new(id));
            }
        }
        Ok(())
    }

    /// Claim the controller from firmware through USB Legacy Support
    fn take_ownership(&mut self, first: usize) -> Result<()> {
        if first == 0 {
            return Ok(());
        }
        let mut offset = first;
        // Bounded walk in case of a looping capability list
        for _ in 0..64 {
            let header = self.bus.read32(offset);
            if ext_cap::id(header) == ext_cap::LEGACY_SUPPORT {
                return self.legacy_handoff(offset, header);
            }
            let next = ext_cap::next(header);
            if next == 0 {
                break;
            }
            offset += next;
        }
        Ok(())
    }

    fn legacy_handoff(&mut self, offset: usize, header: u32) -> Result<()> {
        if header & ext_cap::BIOS_OWNED == 0 && header & ext_cap::OS_OWNED != 0 {
            return Ok(());
        }
        debug!("requesting xHCI ownership from firmware");
        self.bus.write32(offset, header | ext_cap::OS_OWNED);

        let bus = &self.bus;
        RegisterTimeout::new_us(self.config.ownership_timeout_us)
            .with_poll_interval_us(self.config.poll_interval_us)
            .wait_for(&mut self.delay, || {
                let v = bus.read32(offset);
                v & ext_cap::BIOS_OWNED == 0 && v & ext_cap::OS_OWNED != 0
            })
            .map_err(|_| XhciError::OwnershipTimeout)?;

        self.bus.modify32(offset + ext_cap::LEGCTLSTS, |v| {
            v & !ext_cap::LEGCTLSTS_SMI_ENABLES
        });
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        let usbsts = self.op_base + op::USBSTS;
        if UsbSts::from_bits_retain(self.bus.read32(usbsts)).contains(UsbSts::HC_HALTED) {
            return Ok(());
        }
        self.bus.modify32(self.op_base + op::USBCMD, |v| {
            v & !(UsbCmd::RUN_STOP | UsbCmd::INTERRUPTER_ENABLE).bits()
        });

        let bus = &self.bus;
        RegisterTimeout::new_us(self.config.halt_timeout_us)
            .with_poll_interval_us(self.config.poll_interval_us)
            .wait_for(&mut self.delay, || {
                UsbSts::from_bits_retain(bus.read32(usbsts)).contains(UsbSts::HC_HALTED)
            })
            .map_err(|_| XhciError::HostControllerNotHalted)
    }

    fn reset(&mut self) -> Result<()> {
        let usbcmd = self.op_base + op::USBCMD;
        let usbsts = self.op_base + op::USBSTS;
        self.bus.modify32(usbcmd, |v| v | UsbCmd::HC_RESET.bits());

        let bus = &self.bus;
        RegisterTimeout::new_us(self.config.reset_timeout_us)
            .with_poll_interval_us(self.config.poll_interval_us)
            .wait_for(&mut self.delay, || {
                let cmd = UsbCmd::from_bits_retain(bus.read32(usbcmd));
                let sts = UsbSts::from_bits_retain(bus.read32(usbsts));
                !cmd.contains(UsbCmd::HC_RESET) && !sts.contains(UsbSts::CONTROLLER_NOT_READY)
            })
            .map_err(|_| XhciError::ResetTimeout)
    }

    fn acknowledge_event(&mut self) {
        let erdp = self.event_ring.dequeue_pointer() | runtime::ERDP_EHB;
        self.bus.write64(self.rt_base + runtime::ERDP, erdp);
        self.bus
            .write32(self.op_base + op::USBSTS, UsbSts::EVENT_INTERRUPT.bits());
        self.bus.write32(
            self.rt_base + runtime::IMAN,
            (Iman::INTERRUPT_PENDING | Iman::INTERRUPT_ENABLE).bits(),
        );
    }

    fn read_portsc(&self, id: PortId) -> PortSc {
        PortSc::from_bits_retain(self.bus.read32(self.op_base + op::portsc(id.value())))
    }

    fn write_portsc(&mut self, id: PortId, value: PortSc) {
        self.bus
            .write32(self.op_base + op::portsc(id.value()), value.bits());
    }

    fn port_mut(&mut self, id: PortId) -> &mut Port {
        &mut self.ports[id.index()]
    }

    fn ring_doorbell(&mut self, slot_id: u8, target: u8) {
        trace!("doorbell {} target {}", slot_id, target);
        self.bus
            .write32(self.db_base + 4 * slot_id as usize, target as u32);
    }

    /// Take the addressing turn for a connected port and reset it
    fn start_port(&mut self, id: PortId, portsc: PortSc) -> Result<()> {
        if portsc.contains(PortSc::OVER_CURRENT_ACTIVE) {
            self.fail_port(id, XhciError::PortError);
            return Err(XhciError::PortError);
        }
        if let Some(active) = self.addressing_port {
            if active != id {
                trace!("port {} waits for port {}", id.value(), active.value());
            }
            return Ok(());
        }

        self.addressing_port = Some(id);
        self.port_mut(id).transition(PortState::Resetting)?;
        let write = portsc.write_base() | PortSc::PORT_RESET | PortSc::CONNECT_STATUS_CHANGE;
        self.write_portsc(id, write);
        debug!("port {}: reset issued", id.value());
        Ok(())
    }

    /// Start the first connected port that is waiting for its turn
    fn start_waiting_port(&mut self) {
        let waiting = self
            .ports
            .iter()
            .find(|p| p.state() == PortState::Connected && p.is_connected())
            .map(|p| p.id());
        if let Some(id) = waiting {
            let portsc = self.read_portsc(id);
            if let Err(e) = self.start_port(id, portsc) {
                warn!("port {}: {}", id.value(), e);
            }
        }
    }

    fn fail_port(&mut self, id: PortId, error: XhciError) {
        warn!("port {}: configuration failed: {}", id.value(), error);
        if let Some(slot_id) = self.ports[id.index()].slot_id() {
            self.release_slot(slot_id);
        }
        self.port_mut(id).fail(error);
        self.orphan_commands(id);
        if self.addressing_port == Some(id) {
            self.addressing_port = None;
        }
    }

    /// Stop routing outstanding command completions to `id`
    fn orphan_commands(&mut self, id: PortId) {
        for command in self.pending.iter_mut() {
            if command.port == Some(id) {
                command.port = None;
            }
        }
    }

    fn handle_disconnect(&mut self, id: PortId) {
        if let Some(slot_id) = self.ports[id.index()].slot_id() {
            self.release_slot(slot_id);
        }
        self.orphan_commands(id);
        if self.addressing_port == Some(id) {
            self.addressing_port = None;
        }
        // Every state may move to Disconnected
        let _ = self.port_mut(id).transition(PortState::Disconnected);
        info!("port {}: disconnected", id.value());
    }

    /// Drop the device in `slot_id` and hand the slot back to the controller
    fn release_slot(&mut self, slot_id: u8) {
        if let Some(entry) = self.devices.get_mut(slot_id as usize - 1) {
            *entry = None;
        }
        self.memory.set_dcbaa_entry(slot_id as usize, 0);
        let _ = self.slots.release(slot_id);
        if let Err(e) = self.disable_slot(slot_id) {
            warn!("slot {}: disable failed: {}", slot_id, e);
        }
    }

    fn disable_slot(&mut self, slot_id: u8) -> Result<()> {
        self.issue_command(
            Trb::disable_slot(slot_id),
            CommandKind::DisableSlot,
            None,
            slot_id,
        )
    }

    fn issue_command(
        &mut self,
        trb: Trb,
        kind: CommandKind,
        port: Option<PortId>,
        slot_id: u8,
    ) -> Result<()> {
        if self.pending.is_full() {
            return Err(XhciError::NoResources);
        }
        let address = self.command_ring.push(trb)?;
        self.pending
            .push(PendingCommand {
                trb: address,
                kind,
                port,
                slot_id,
            })
            .map_err(|_| XhciError::NoResources)?;
        trace!("command {:?} at {:#x}", kind, address);
        self.ring_doorbell(0, 0);
        Ok(())
    }

    fn device_mut(&mut self, slot_id: u8) -> Result<&mut Device> {
        let index = (slot_id as usize)
            .checked_sub(1)
            .ok_or(XhciError::InvalidSlotId)?;
        self.devices
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(XhciError::InvalidSlotId)
    }

    fn on_port_status_change(&mut self, event: &Trb) -> Result<()> {
        let id = match PortId::new(event.port_id()) {
            Some(id) if id.value() <= self.max_ports => id,
            _ => {
                warn!("status change for unknown port {}", event.port_id());
                return Err(XhciError::InvalidPhase);
            }
        };

        let portsc = self.read_portsc(id);
        let changes = portsc.intersection(PortSc::CHANGE_BITS);
        if !changes.is_empty() {
            self.write_portsc(id, portsc.write_base() | changes);
        }
        self.port_mut(id).refresh(portsc);

        let connected = portsc.contains(PortSc::CURRENT_CONNECT_STATUS);
        let state = self.ports[id.index()].state();
        trace!("port {}: PORTSC {:#x} in {:?}", id.value(), portsc.bits(), state);

        if !connected {
            if state != PortState::Disconnected {
                self.handle_disconnect(id);
            }
            return Ok(());
        }

        match state {
            PortState::Disconnected => {
                info!("port {}: connected ({:?})", id.value(), portsc.speed());
                self.port_mut(id).transition(PortState::Connected)
            }
            s if s != PortState::Connected && changes.contains(PortSc::CONNECT_STATUS_CHANGE) => {
                // A different device may sit on the port now
                self.handle_disconnect(id);
                info!("port {}: reconnected", id.value());
                self.port_mut(id).transition(PortState::Connected)
            }
            PortState::Resetting if changes.contains(PortSc::PORT_RESET_CHANGE) => {
                if !portsc.contains(PortSc::PORT_ENABLED) {
                    self.fail_port(id, XhciError::PortError);
                    return Err(XhciError::PortError);
                }
                self.port_mut(id).transition(PortState::Addressing)?;
                let result = self.issue_command(
                    Trb::enable_slot(),
                    CommandKind::EnableSlot,
                    Some(id),
                    0,
                );
                if let Err(e) = result {
                    self.fail_port(id, e);
                }
                result
            }
            s if !s.is_terminal() && portsc.contains(PortSc::OVER_CURRENT_ACTIVE) => {
                self.fail_port(id, XhciError::PortError);
                Err(XhciError::PortError)
            }
            _ => Ok(()),
        }
    }

    fn on_command_completion(&mut self, event: &Trb) -> Result<()> {
        let address = event.parameter;
        let Some(position) = self.pending.iter().position(|c| c.trb == address) else {
            warn!("completion for unknown command {:#x}", address);
            return Err(XhciError::NoWaiter);
        };
        let command = self.pending.swap_remove(position);
        self.command_ring.retire(address)?;

        let code = event.completion_code();
        trace!("command {:?} completed: {:?}", command.kind, code);

        let Some(port) = command.port else {
            if command.kind == CommandKind::EnableSlot && code == CompletionCode::Success {
                // Port went away while the slot was being enabled
                return self.disable_slot(event.slot_id());
            }
            if code != CompletionCode::Success {
                debug!("orphaned {:?} completed with {:?}", command.kind, code);
            }
            return Ok(());
        };

        if code != CompletionCode::Success {
            let error = XhciError::CommandFailed(code);
            self.fail_port(port, error);
            return Err(error);
        }

        let result = match command.kind {
            CommandKind::EnableSlot => self.on_slot_enabled(port, event.slot_id()),
            CommandKind::AddressDevice => self.on_device_addressed(port, command.slot_id),
            CommandKind::ConfigureEndpoint => self.on_endpoint_configured(port, command.slot_id),
            CommandKind::DisableSlot => Ok(()),
        };
        if let Err(e) = result {
            self.fail_port(port, e);
        }
        result
    }

    fn on_slot_enabled(&mut self, port: PortId, slot_id: u8) -> Result<()> {
        if slot_id == 0 {
            return Err(XhciError::InvalidSlotId);
        }
        let claimed = if slot_id > self.max_slots {
            Err(XhciError::InvalidSlotId)
        } else {
            self.slots.claim(slot_id)
        };
        if let Err(e) = claimed {
            // The controller enabled it; hand it straight back
            if let Err(disable) = self.disable_slot(slot_id) {
                warn!("slot {}: disable failed: {}", slot_id, disable);
            }
            return Err(e);
        }
        self.port_mut(port).set_slot(Some(slot_id));

        let buffers = self.memory.slot(slot_id)?;
        let speed = self.ports[port.index()].speed();
        // SAFETY: buffers belong to slot_id, which was just claimed
        let mut device =
            unsafe { Device::new(slot_id, port, speed, self.context_size, buffers) };
        self.memory
            .set_dcbaa_entry(slot_id as usize, device.device_context_address());
        let input = device.prepare_address_device();
        self.devices[slot_id as usize - 1] = Some(device);

        debug!("port {}: slot {} enabled", port.value(), slot_id);
        self.issue_command(
            Trb::address_device(input, slot_id),
            CommandKind::AddressDevice,
            Some(port),
            slot_id,
        )
    }

    fn on_device_addressed(&mut self, port: PortId, slot_id: u8) -> Result<()> {
        self.port_mut(port)
            .transition(PortState::DescriptorNegotiation)?;
        let device = self.device_mut(slot_id)?;
        debug!(
            "port {}: slot {} addressed as {}",
            port.value(),
            slot_id,
            device.usb_address()
        );
        device.set_step(SetupStep::DeviceDescriptor);
        device.queue_control(&SetupPacket::get_descriptor(
            descriptor_type::DEVICE,
            0,
            0,
            DeviceDescriptor::LENGTH as u16,
        ))?;
        self.ring_doorbell(slot_id, CONTROL_DCI);
        Ok(())
    }

    fn on_endpoint_configured(&mut self, port: PortId, slot_id: u8) -> Result<()> {
        let device = self.device_mut(slot_id)?;
        device.set_step(SetupStep::Running);
        let dci = device.queue_report()?;
        let driver = device.driver().name();
        self.ring_doorbell(slot_id, dci);

        self.port_mut(port).transition(PortState::Configured)?;
        self.addressing_port = None;
        info!("port {}: {} configured on slot {}", port.value(), driver, slot_id);
        Ok(())
    }

    fn on_transfer_event(&mut self, event: &Trb) -> Result<()> {
        let slot_id = event.slot_id();
        let dci = event.endpoint_id();
        let device = match self.device_mut(slot_id) {
            Ok(device) => device,
            Err(e) => {
                debug!("transfer event for empty slot {}", slot_id);
                return Err(e);
            }
        };
        let port = device.port();
        let interrupt_dci = device.interrupt_dci();

        if dci == CONTROL_DCI {
            let result = self.on_control_complete(port, slot_id, event);
            if let Err(e) = result {
                if self.ports[port.index()].state().is_terminal() {
                    warn!("slot {}: stray control completion: {}", slot_id, e);
                } else {
                    self.fail_port(port, e);
                }
            }
            return result;
        }
        if interrupt_dci == Some(dci) {
            return self.on_report(slot_id, event);
        }
        warn!("slot {}: event for endpoint {}", slot_id, dci);
        Err(XhciError::InvalidEndpoint)
    }

    fn on_control_complete(&mut self, port: PortId, slot_id: u8, event: &Trb) -> Result<()> {
        let device = self.device_mut(slot_id)?;
        let len = device.complete_control(event)?;

        let next = match device.step() {
            SetupStep::DeviceDescriptor => {
                let descriptor = DeviceDescriptor::from_bytes(device.control_data(len))?;
                let (vid, pid) = (descriptor.id_vendor, descriptor.id_product);
                info!("port {}: device {:04x}:{:04x}", port.value(), vid, pid);
                device.set_descriptor(descriptor);
                device.set_step(SetupStep::ConfigurationDescriptor);
                ControlStep::Request(SetupPacket::get_descriptor(
                    descriptor_type::CONFIGURATION,
                    0,
                    0,
                    CONTROL_BUFFER_SIZE as u16,
                ))
            }
            SetupStep::ConfigurationDescriptor => {
                let summary = parse_configuration(device.control_data(len))?;
                device.set_configuration(summary);
                device.set_step(SetupStep::SetConfiguration);
                ControlStep::Request(SetupPacket::set_configuration(summary.configuration_value))
            }
            SetupStep::SetConfiguration => {
                match device.configuration().and_then(|c| c.boot_interface) {
                    Some(boot) => {
                        device.set_step(SetupStep::SetProtocol);
                        ControlStep::Request(SetupPacket::class_interface_out(
                            HidRequest::SetProtocol as u8,
                            HidProtocolMode::Boot as u16,
                            boot.interface_number,
                        ))
                    }
                    None => {
                        device.set_step(SetupStep::Running);
                        ControlStep::Done
                    }
                }
            }
            SetupStep::SetProtocol => {
                let boot = device
                    .configuration()
                    .and_then(|c| c.boot_interface)
                    .ok_or(XhciError::InvalidPhase)?;
                device.set_step(SetupStep::ConfigureEndpoint);
                ControlStep::ConfigureEndpoint(device.prepare_configure_endpoint(&boot))
            }
            SetupStep::Addressing | SetupStep::ConfigureEndpoint | SetupStep::Running => {
                return Err(XhciError::InvalidPhase)
            }
        };

        match next {
            ControlStep::Request(setup) => {
                self.device_mut(slot_id)?.queue_control(&setup)?;
                self.ring_doorbell(slot_id, CONTROL_DCI);
                Ok(())
            }
            ControlStep::ConfigureEndpoint(input) => self.issue_command(
                Trb::configure_endpoint(input, slot_id),
                CommandKind::ConfigureEndpoint,
                Some(port),
                slot_id,
            ),
            ControlStep::Done => {
                self.port_mut(port).transition(PortState::Configured)?;
                self.addressing_port = None;
                info!("port {}: no supported interface, slot {}", port.value(), slot_id);
                Ok(())
            }
        }
    }

    fn on_report(&mut self, slot_id: u8, event: &Trb) -> Result<()> {
        let observers = self.observers;
        let device = self.device_mut(slot_id)?;
        let port = device.port();

        let mut report = [0u8; REPORT_BUFFER_SIZE];
        let len = match device.complete_report(event) {
            Ok(data) => {
                report[..data.len()].copy_from_slice(data);
                data.len()
            }
            Err(e) => {
                // Error completions halt the endpoint; no transfer is re-queued
                warn!(
                    "port {}: slot {} report transfer failed, endpoint idle: {}",
                    port.value(),
                    slot_id,
                    e
                );
                return Err(e);
            }
        };
        device.driver_mut().on_report(&report[..len], &observers);

        let dci = device.queue_report()?;
        self.ring_doorbell(slot_id, dci);
        Ok(())
    }
}

/// Builder pattern for controller configuration
pub struct ControllerBuilder<B: RegisterBus, D: DelayNs> {
    bus: B,
    delay: D,
    memory: &'static mut ControllerMemory,
    config: ControllerConfig,
}

impl<B: RegisterBus, D: DelayNs> ControllerBuilder<B, D> {
    /// Create new controller builder
    pub fn new(bus: B, delay: D, memory: &'static mut ControllerMemory) -> Self {
        Self {
            bus,
            delay,
            memory,
            config: ControllerConfig::DEFAULT,
        }
    }

    /// Set HCRST/CNR timeout
    pub fn reset_timeout_us(mut self, timeout_us: u32) -> Self {
        self.config.reset_timeout_us = timeout_us;
        self
    }

    /// Set run acknowledge timeout
    pub fn run_timeout_us(mut self, timeout_us: u32) -> Self {
        self.config.run_timeout_us = timeout_us;
        self
    }

    /// Set halt acknowledge timeout
    pub fn halt_timeout_us(mut self, timeout_us: u32) -> Self {
        self.config.halt_timeout_us = timeout_us;
        self
    }

    /// Set firmware handoff timeout
    pub fn ownership_timeout_us(mut self, timeout_us: u32) -> Self {
        self.config.ownership_timeout_us = timeout_us;
        self
    }

    /// Set register poll interval
    pub fn poll_interval_us(mut self, interval_us: u32) -> Self {
        self.config.poll_interval_us = interval_us;
        self
    }

    /// Set interrupter moderation (250 ns units)
    pub fn interrupt_moderation(mut self, interval: u16) -> Self {
        self.config.interrupt_moderation = interval;
        self
    }

    /// Cap the number of enabled device slots
    pub fn max_slots(mut self, slots: u8) -> Self {
        self.config.max_slots = slots;
        self
    }

    /// Scan passes before an in-flight port times out
    pub fn port_timeout_scans(mut self, scans: u32) -> Self {
        self.config.port_timeout_scans = scans;
        self
    }

    /// Build the controller
    pub fn build(self) -> Controller<B, D> {
        Controller::with_config(self.bus, self.delay, self.memory, self.config)
    }
}
