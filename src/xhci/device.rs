//! Device slots
//!
//! A [`Device`] is created when Enable Slot completes and owns everything
//! the controller needs to talk to the device in that slot: its contexts,
//! its control and interrupt transfer rings, the buffers those rings point
//! at, and the class driver bound at the end of negotiation.

use core::slice;

use crate::dma::{SlotBuffers, CONTROL_BUFFER_SIZE, REPORT_BUFFER_SIZE};
use crate::enumeration::{BootInterface, ConfigurationSummary, DeviceDescriptor};
use crate::error::{Result, XhciError};
use crate::hid::ClassDriver;
use crate::transfer::{Direction, SetupPacket};

use super::context::{
    add_flag, device_context_index, ContextSize, DeviceContext, EndpointContext, InputContext,
    SlotContext, SlotState,
};
use super::ring::Ring;
use super::trb::Trb;
use super::{PortId, PortSpeed};

/// DCI of the default control endpoint
pub const CONTROL_DCI: u8 = 1;

/// Step of slot setup that is waiting for a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupStep {
    /// Address Device command outstanding
    Addressing,
    /// GET_DESCRIPTOR(device)
    DeviceDescriptor,
    /// GET_DESCRIPTOR(configuration)
    ConfigurationDescriptor,
    /// SET_CONFIGURATION
    SetConfiguration,
    /// SET_PROTOCOL(boot)
    SetProtocol,
    /// Configure Endpoint command outstanding
    ConfigureEndpoint,
    /// Interrupt endpoint running (or nothing to run)
    Running,
}

#[derive(Debug, Clone, Copy)]
struct PendingControl {
    trb: u64,
    requested: u16,
}

/// Device in one slot
pub struct Device {
    slot_id: u8,
    port: PortId,
    speed: PortSpeed,
    step: SetupStep,
    context_size: ContextSize,
    input: InputContext,
    output: DeviceContext,
    control_ring: Ring,
    interrupt_ring: Ring,
    buffers: SlotBuffers,
    pending_control: Option<PendingControl>,
    pending_report: Option<u64>,
    descriptor: Option<DeviceDescriptor>,
    configuration: Option<ConfigurationSummary>,
    interrupt_dci: Option<u8>,
    report_length: u16,
    driver: ClassDriver,
}

impl Device {
    /// Set up slot memory for a device on `port`
    ///
    /// # Safety
    ///
    /// `buffers` must come from the controller's `MemoryMap` and belong to
    /// `slot_id`, with no other live `Device` using them.
    pub unsafe fn new(
        slot_id: u8,
        port: PortId,
        speed: PortSpeed,
        context_size: ContextSize,
        buffers: SlotBuffers,
    ) -> Self {
        let (control_base, control_len) = buffers.control_ring;
        let (interrupt_base, interrupt_len) = buffers.interrupt_ring;
        // SAFETY: forwarded from the caller's guarantee
        unsafe {
            let mut output = DeviceContext::new(buffers.device_context);
            output.clear();
            Self {
                slot_id,
                port,
                speed,
                step: SetupStep::Addressing,
                context_size,
                input: InputContext::new(buffers.input_context, context_size),
                output,
                control_ring: Ring::new(control_base, control_len),
                interrupt_ring: Ring::new(interrupt_base, interrupt_len),
                buffers,
                pending_control: None,
                pending_report: None,
                descriptor: None,
                configuration: None,
                interrupt_dci: None,
                report_length: 0,
                driver: ClassDriver::Unsupported,
            }
        }
    }

    /// Slot ID
    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    /// Root port the device is attached to
    pub fn port(&self) -> PortId {
        self.port
    }

    /// Device speed
    pub fn speed(&self) -> PortSpeed {
        self.speed
    }

    /// Setup step awaiting completion
    pub fn step(&self) -> SetupStep {
        self.step
    }

    pub(crate) fn set_step(&mut self, step: SetupStep) {
        self.step = step;
    }

    /// Context size the contexts are encoded with
    pub fn context_size(&self) -> ContextSize {
        self.context_size
    }

    /// Device descriptor, once read
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Parsed configuration, once read
    pub fn configuration(&self) -> Option<&ConfigurationSummary> {
        self.configuration.as_ref()
    }

    /// Bound class driver
    pub fn driver(&self) -> &ClassDriver {
        &self.driver
    }

    pub(crate) fn driver_mut(&mut self) -> &mut ClassDriver {
        &mut self.driver
    }

    /// DCI of the interrupt IN endpoint, once chosen
    pub fn interrupt_dci(&self) -> Option<u8> {
        self.interrupt_dci
    }

    /// Bus address of the output device context, for the DCBAA
    pub fn device_context_address(&self) -> u64 {
        self.output.address()
    }

    /// USB address the controller assigned
    pub fn usb_address(&self) -> u8 {
        self.output.usb_address()
    }

    /// Slot state the controller last wrote to the output context
    pub fn slot_state(&self) -> SlotState {
        self.output.slot_state()
    }

    /// Build the Address Device input context and return its address
    pub fn prepare_address_device(&mut self) -> u64 {
        self.control_ring.reset();
        self.input.clear();
        self.input.set_control(add_flag(0) | add_flag(CONTROL_DCI), 0);
        self.input.set_slot(&SlotContext {
            route_string: 0,
            speed: self.speed,
            context_entries: CONTROL_DCI,
            root_port: self.port.value(),
        });
        self.input.set_endpoint(
            CONTROL_DCI,
            &EndpointContext::control(
                self.speed.default_max_packet_size(),
                self.control_ring.base_address(),
            ),
        );
        self.input.address()
    }

    /// Record the device descriptor read over EP0
    pub fn set_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.descriptor = Some(descriptor);
    }

    /// Record the parsed configuration and bind the class driver
    pub fn set_configuration(&mut self, configuration: ConfigurationSummary) {
        self.driver = ClassDriver::for_interface(configuration.boot_interface.as_ref());
        self.configuration = Some(configuration);
    }

    /// Build the Configure Endpoint input context for `boot`'s interrupt IN
    /// endpoint and return its address
    pub fn prepare_configure_endpoint(&mut self, boot: &BootInterface) -> u64 {
        let dci = device_context_index(boot.endpoint_address);
        self.interrupt_ring.reset();
        self.interrupt_dci = Some(dci);
        self.report_length = boot.max_packet_size.clamp(1, REPORT_BUFFER_SIZE as u16);

        self.input.clear();
        self.input.set_control(add_flag(0) | add_flag(dci), 0);
        self.input.set_slot(&SlotContext {
            route_string: 0,
            speed: self.speed,
            context_entries: dci,
            root_port: self.port.value(),
        });
        self.input.set_endpoint(
            dci,
            &EndpointContext::interrupt_in(
                self.speed,
                boot.max_packet_size,
                boot.interval,
                self.interrupt_ring.base_address(),
            ),
        );
        self.input.address()
    }

    /// Queue a control transfer on EP0
    ///
    /// IN requests read into the slot's control buffer. The transfer event
    /// is raised by the data stage when there is one, else by the status
    /// stage. The doorbell is left to the caller.
    pub fn queue_control(&mut self, setup: &SetupPacket) -> Result<()> {
        if self.pending_control.is_some() {
            return Err(XhciError::InvalidPhase);
        }
        let requested = setup.length.min(CONTROL_BUFFER_SIZE as u16);
        let setup = SetupPacket {
            length: requested,
            ..*setup
        };

        self.control_ring.push(Trb::setup_stage(&setup))?;
        let trb = match setup.data_direction() {
            Some(Direction::In) => {
                let buffer = crate::dma::phys_addr(self.buffers.control_buffer.as_ptr());
                let data = self
                    .control_ring
                    .push(Trb::data_stage(buffer, requested as u32, true))?;
                self.control_ring.push(Trb::status_stage(false, false))?;
                data
            }
            // OUT data stages are never issued by the configuration sequence
            Some(Direction::Out) => return Err(XhciError::InvalidPhase),
            None => self.control_ring.push(Trb::status_stage(true, true))?,
        };
        self.pending_control = Some(PendingControl { trb, requested });
        Ok(())
    }

    /// Complete the outstanding control transfer from its transfer event
    ///
    /// Returns the number of data bytes received.
    pub fn complete_control(&mut self, event: &Trb) -> Result<usize> {
        let pending = self.pending_control.ok_or(XhciError::InvalidPhase)?;
        if event.parameter != pending.trb {
            return Err(XhciError::RingCorruption);
        }
        self.pending_control = None;
        self.control_ring.retire(event.parameter)?;

        let code = event.completion_code();
        if !code.is_success() {
            return Err(XhciError::TransferFailed(code));
        }
        let residual = event.residual_length().min(pending.requested as u32);
        Ok((pending.requested as u32 - residual) as usize)
    }

    /// Bytes received by the last control transfer
    pub fn control_data(&self, len: usize) -> &[u8] {
        let len = len.min(CONTROL_BUFFER_SIZE);
        // SAFETY: buffer is CONTROL_BUFFER_SIZE bytes of slot memory
        unsafe { slice::from_raw_parts(self.buffers.control_buffer.as_ptr(), len) }
    }

    /// Queue a Normal TRB for the next interrupt IN report
    pub fn queue_report(&mut self) -> Result<u8> {
        let dci = self.interrupt_dci.ok_or(XhciError::InvalidEndpoint)?;
        let buffer = crate::dma::phys_addr(self.buffers.report_buffer.as_ptr());
        let trb = self
            .interrupt_ring
            .push(Trb::normal(buffer, self.report_length as u32))?;
        self.pending_report = Some(trb);
        Ok(dci)
    }

    /// Complete the outstanding report transfer; returns the report bytes
    pub fn complete_report(&mut self, event: &Trb) -> Result<&[u8]> {
        let pending = self.pending_report.ok_or(XhciError::InvalidPhase)?;
        if event.parameter != pending {
            return Err(XhciError::RingCorruption);
        }
        self.pending_report = None;
        self.interrupt_ring.retire(event.parameter)?;

        let code = event.completion_code();
        if !code.is_success() {
            return Err(XhciError::TransferFailed(code));
        }
        let requested = self.report_length as u32;
        let len = (requested - event.residual_length().min(requested)) as usize;
        // SAFETY: buffer is REPORT_BUFFER_SIZE bytes of slot memory, len <= report_length
        Ok(unsafe { slice::from_raw_parts(self.buffers.report_buffer.as_ptr(), len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{ControllerMemory, MemoryMap};
    use crate::hid::HidProtocol;
    use crate::xhci::trb::{CompletionCode, TrbType};

    fn device(speed: PortSpeed) -> (MemoryMap, Device) {
        let map = MemoryMap::new(Box::leak(Box::new(ControllerMemory::new())));
        let buffers = map.slot(1).unwrap();
        let device = unsafe {
            Device::new(1, PortId::new(2).unwrap(), speed, ContextSize::Bytes32, buffers)
        };
        (map, device)
    }

    fn transfer_event(trb: u64, code: CompletionCode, residual: u32) -> Trb {
        Trb::new(
            trb,
            ((code.raw() as u32) << 24) | residual,
            ((TrbType::TransferEvent.raw() as u32) << 10) | (1 << 24) | (1 << 16) | 1,
        )
    }

    fn ring_entry(address: u64) -> Trb {
        unsafe { core::ptr::read_volatile(address as usize as *const Trb) }
    }

    #[test]
    fn test_control_in_queues_three_stages() {
        let (_map, mut dev) = device(PortSpeed::HighSpeed);
        dev.prepare_address_device();
        dev.queue_control(&SetupPacket::get_descriptor(1, 0, 0, 18)).unwrap();
        let pending = dev.pending_control.unwrap();

        let data = ring_entry(pending.trb);
        assert_eq!(data.trb_type(), TrbType::DataStage);
        let setup = ring_entry(pending.trb - 16);
        assert_eq!(setup.trb_type(), TrbType::SetupStage);
        let status = ring_entry(pending.trb + 16);
        assert_eq!(status.trb_type(), TrbType::StatusStage);

        // Second request while one is outstanding
        assert_eq!(
            dev.queue_control(&SetupPacket::set_configuration(1)),
            Err(XhciError::InvalidPhase)
        );

        let len = dev
            .complete_control(&transfer_event(pending.trb, CompletionCode::ShortPacket, 6))
            .unwrap();
        assert_eq!(len, 12);
    }

    #[test]
    fn test_control_failure_reports_code() {
        let (_map, mut dev) = device(PortSpeed::FullSpeed);
        dev.queue_control(&SetupPacket::set_configuration(1)).unwrap();
        let trb = dev.pending_control.unwrap().trb;
        assert_eq!(
            dev.complete_control(&transfer_event(trb, CompletionCode::StallError, 0)),
            Err(XhciError::TransferFailed(CompletionCode::StallError))
        );
        assert!(dev.pending_control.is_none());
    }

    #[test]
    fn test_unexpected_transfer_event_is_rejected() {
        let (_map, mut dev) = device(PortSpeed::FullSpeed);
        let event = transfer_event(0x1000, CompletionCode::Success, 0);
        assert_eq!(dev.complete_control(&event), Err(XhciError::InvalidPhase));
        assert_eq!(dev.queue_report(), Err(XhciError::InvalidEndpoint));
    }

    #[test]
    fn test_interrupt_endpoint_setup_and_report() {
        let (_map, mut dev) = device(PortSpeed::FullSpeed);
        let boot = BootInterface {
            interface_number: 0,
            protocol: HidProtocol::Mouse,
            endpoint_address: 0x81,
            max_packet_size: 4,
            interval: 10,
        };
        dev.set_configuration(ConfigurationSummary {
            configuration_value: 1,
            boot_interface: Some(boot),
        });
        assert_eq!(*dev.driver(), ClassDriver::Mouse);

        dev.prepare_configure_endpoint(&boot);
        assert_eq!(dev.interrupt_dci(), Some(3));
        assert_eq!(dev.queue_report(), Ok(3));

        let trb = dev.pending_report.unwrap();
        let normal = ring_entry(trb);
        assert_eq!(normal.trb_type(), TrbType::Normal);
        assert_eq!(normal.status & 0x1_FFFF, 4);

        // Fill the report buffer the way the controller would
        unsafe {
            let buf = normal.parameter as usize as *mut u8;
            buf.copy_from_nonoverlapping([0u8, 0xFB, 0x03].as_ptr(), 3);
        }
        let report = dev
            .complete_report(&transfer_event(trb, CompletionCode::ShortPacket, 1))
            .unwrap();
        assert_eq!(report, &[0, 0xFB, 0x03]);
    }
}
