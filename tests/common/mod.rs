//! Common test utilities
//!
//! A software xHCI controller plus the device profiles it can attach.

#![allow(dead_code)]

pub mod mock_hardware;
pub mod mock_xhc;

pub use mock_hardware::*;
pub use mock_xhc::*;

use xhci_usbh::{Controller, ControllerBuilder, ControllerMemory, Result};

pub type TestController = Controller<MockBus, NoopDelay>;

/// Scan passes an in-flight port survives in these tests
pub const PORT_TIMEOUT_SCANS: u32 = 3;

/// Controller over `mock` with short timeouts and fresh memory
pub fn controller(mock: &MockXhc) -> TestController {
    let memory = Box::leak(Box::new(ControllerMemory::new()));
    ControllerBuilder::new(mock.bus(), NoopDelay::default(), memory)
        .reset_timeout_us(1_000)
        .halt_timeout_us(1_000)
        .run_timeout_us(1_000)
        .ownership_timeout_us(1_000)
        .port_timeout_scans(PORT_TIMEOUT_SCANS)
        .build()
}

/// Initialized and running controller over a default mock
pub fn running() -> (MockXhc, TestController) {
    running_with(MockOptions::default())
}

pub fn running_with(opts: MockOptions) -> (MockXhc, TestController) {
    let mock = MockXhc::new(opts);
    let mut xhc = controller(&mock);
    xhc.initialize().expect("initialize");
    xhc.run().expect("run");
    (mock, xhc)
}

/// Process events until the ring is empty; returns every result
pub fn drain(xhc: &mut TestController) -> Vec<Result<()>> {
    let mut results = Vec::new();
    for _ in 0..1000 {
        if !xhc.has_pending_event() {
            break;
        }
        results.push(xhc.process_event());
    }
    results
}

/// Errors among `results`
pub fn errors(results: &[Result<()>]) -> Vec<xhci_usbh::XhciError> {
    results.iter().filter_map(|r| r.err()).collect()
}
