pub mod auth;
pub mod client;
pub mod config;
pub mod exporter;
pub mod logging;
pub mod rpc;
pub mod signal;
pub mod status;
pub mod streams;
pub mod transport;

pub use router_stream::{ByteStream, StreamError, StreamResult};
pub use status::{ExporterStatus, StatusSnapshot};
