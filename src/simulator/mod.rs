//! Simulated printer firmware and serial bus, used by tests, the CLI's `--simulate` mode
//! and the simulation harness.

pub mod firmware;
pub mod port;

pub use firmware::{FaultAction, FaultPlan, FaultTrigger, FirmwareSnapshot, SimulatedFirmware};
pub use port::{SimulatedDevice, SimulatedPorts, SimulatedTransport};
