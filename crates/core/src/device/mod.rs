//! Devices and the transport used to manage them.

mod directory;
mod http;
mod reachability;
mod transport;
mod types;

pub use directory::{DeviceDirectory, StaticDeviceDirectory};
pub use http::HttpTransport;
pub use reachability::{reconnect_until, wait_until_reachable, Backoff};
pub use transport::DeviceTransport;
pub use types::{
    CommitHandle, Device, DeviceFacts, DeviceSession, ImageTransfer, StorageInfo, TransportError,
};
