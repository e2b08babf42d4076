//! Test doubles and fixtures.
//!
//! [`FakeTransport`] stands in for the device gateway so every engine can be
//! driven end to end in-process, including with a paused tokio clock.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetguard_core::testing::{fixtures, FakeTransport};
//!
//! let transport = FakeTransport::new().with_device("42", fixtures::BASE_CONFIG);
//! transport.corrupt_transfers("42");
//! ```

mod fake_transport;

pub use fake_transport::FakeTransport;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::change::ConfirmRegistry;
    use crate::device::Device;
    use crate::ledger::{Job, JobLedger};
    use crate::upgrade::FirmwareVersion;

    /// Running configuration every fake device starts from.
    pub const BASE_CONFIG: &str = "\
set system host-name srx-42
set system ntp server 10.0.0.1
set interfaces ge-0/0/0 unit 0 family inet address 192.0.2.42/24
set security zones security-zone trust interfaces ge-0/0/0.0
";

    /// A device in emea/ams with a documentation-range address.
    pub fn device(id: &str) -> Device {
        Device::new(id, format!("srx-{}", id), format!("192.0.2.{}", id))
            .with_location("emea", "ams")
    }

    /// Write a small firmware image for `version` under `root/<major>.x/`.
    pub fn stage_firmware(root: &Path, version: &str) -> PathBuf {
        let major_dir = FirmwareVersion::parse(version)
            .map(|v| v.major_dir())
            .unwrap_or_else(|| "unknown.x".to_string());
        let dir = root.join(major_dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("junos-srxsme-{}.tgz", version));
        fs::write(&path, format!("firmware image {}", version)).unwrap();
        path
    }

    /// Yield until the confirm window for `job_id` is open.
    pub async fn wait_for_window(registry: &ConfirmRegistry, job_id: &str) {
        while !registry.is_open(job_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll the ledger until the job reaches a terminal state.
    pub async fn wait_for_terminal(ledger: &dyn JobLedger, job_id: &str) -> Job {
        loop {
            if let Some(job) = ledger.get(job_id).unwrap() {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
