// Device layer: the vendor transport seam, the polling adapter that
// owns the device session, and a synthetic transport for development.

pub mod adapter;
pub mod sim;
pub mod transport;

#[cfg(test)]
pub mod testutil;

pub use adapter::DeviceAdapter;
pub use transport::{ScanParams, ScanTransport, TransportFactory};
