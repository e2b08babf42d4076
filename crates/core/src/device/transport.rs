//! The device transport seam.

use std::time::Duration;

use async_trait::async_trait;

use super::types::{
    CommitHandle, Device, DeviceFacts, DeviceSession, ImageTransfer, StorageInfo, TransportError,
};

/// Management access to a device.
///
/// The engine never interprets device commands; it only moves them through
/// this trait. Implementations must be safe to share across workers.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Cheap reachability probe that does not open a session.
    async fn reachable(&self, device: &Device) -> bool;

    async fn connect(&self, device: &Device) -> Result<DeviceSession, TransportError>;

    /// Close a session. Best effort; errors are only worth logging.
    async fn disconnect(&self, session: &DeviceSession) -> Result<(), TransportError>;

    /// Syntax-check commands without touching the candidate configuration.
    async fn validate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError>;

    /// Load commands into the candidate configuration.
    async fn push_candidate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError>;

    /// Commit the candidate with a device-side auto-revert after `timeout`.
    async fn commit_confirmed(
        &self,
        session: &DeviceSession,
        timeout: Duration,
        comment: &str,
    ) -> Result<CommitHandle, TransportError>;

    /// Make a provisional commit permanent.
    async fn confirm(&self, handle: &CommitHandle) -> Result<(), TransportError>;

    async fn get_facts(&self, session: &DeviceSession) -> Result<DeviceFacts, TransportError>;

    /// Full running configuration as text.
    async fn fetch_config(&self, session: &DeviceSession) -> Result<String, TransportError>;

    async fn get_storage(&self, session: &DeviceSession) -> Result<StorageInfo, TransportError>;

    /// Copy an image to the device. Returns the remote path.
    async fn transfer_image(
        &self,
        session: &DeviceSession,
        image: &ImageTransfer,
    ) -> Result<String, TransportError>;

    /// SHA-256 (lowercase hex) of a file on the device.
    async fn remote_checksum(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<String, TransportError>;

    async fn install_package(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<(), TransportError>;

    /// Request a reboot. The session is gone afterwards.
    async fn reboot(&self, session: &DeviceSession) -> Result<(), TransportError>;
}
