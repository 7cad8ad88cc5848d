//! Client side of a lease: the control wrapper and the status monitor.

pub mod control;
pub mod status_monitor;

pub use control::ExporterClient;
pub use status_monitor::{StatusMonitor, StatusMonitorConfig};
