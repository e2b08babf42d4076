//! In-process device simulator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::device::{
    CommitHandle, Device, DeviceFacts, DeviceSession, DeviceTransport, ImageTransfer, StorageInfo,
    TransportError,
};
use crate::snapshot::sha256_hex;
use crate::upgrade::version_from_file_name;

const DEFAULT_VERSION: &str = "20.4R3";
const DEFAULT_MODEL: &str = "srx345";
const DEFAULT_UPTIME_SECS: u64 = 30 * 86_400;
const GIB: u64 = 1024 * 1024 * 1024;

struct PendingCommit {
    id: String,
    previous: Vec<String>,
    timer: JoinHandle<()>,
}

struct FakeDevice {
    config: Vec<String>,
    candidate: Option<Vec<String>>,
    pending: Option<PendingCommit>,
    model: String,
    version: String,
    uptime_base_secs: u64,
    booted_at: Instant,
    storage: StorageInfo,
    /// Remote path to checksum of the transferred bytes.
    files: HashMap<String, String>,
    staged_version: Option<String>,
    down_until: Option<Instant>,
    reboots: u32,

    // Scripted behavior
    syntax_error: Option<String>,
    dark_after_commit: Option<Duration>,
    corrupt_transfers: bool,
    fail_install: bool,
    fail_storage_reads: bool,
    boot_version: Option<String>,
}

impl FakeDevice {
    fn new(config: &str) -> Self {
        Self {
            config: config.lines().map(String::from).collect(),
            candidate: None,
            pending: None,
            model: DEFAULT_MODEL.to_string(),
            version: DEFAULT_VERSION.to_string(),
            uptime_base_secs: DEFAULT_UPTIME_SECS,
            booted_at: Instant::now(),
            storage: StorageInfo {
                total_bytes: 8 * GIB,
                available_bytes: 4 * GIB,
            },
            files: HashMap::new(),
            staged_version: None,
            down_until: None,
            reboots: 0,
            syntax_error: None,
            dark_after_commit: None,
            corrupt_transfers: false,
            fail_install: false,
            fail_storage_reads: false,
            boot_version: None,
        }
    }

    fn is_up(&self) -> bool {
        self.down_until.map_or(true, |until| Instant::now() >= until)
    }

    fn running_config(&self) -> String {
        let mut text = self.config.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    fn facts(&self, hostname: &str) -> DeviceFacts {
        DeviceFacts {
            model: self.model.clone(),
            version: self.version.clone(),
            uptime_secs: self.uptime_base_secs
                + Instant::now().saturating_duration_since(self.booted_at).as_secs(),
            hostname: Some(hostname.to_string()),
            serial: None,
        }
    }
}

/// Apply `set`/`delete` lines to a configuration.
fn apply_commands(config: &[String], commands: &[String]) -> Vec<String> {
    let mut next = config.to_vec();
    for command in commands {
        let command = command.trim();
        if let Some(path) = command.strip_prefix("delete ") {
            let target = format!("set {}", path);
            next.retain(|line| !line.starts_with(&target));
        } else if !next.iter().any(|line| line == command) {
            next.push(command.to_string());
        }
    }
    next
}

#[derive(Default)]
struct FakeState {
    devices: HashMap<String, FakeDevice>,
    /// Session id to device id.
    sessions: HashMap<String, String>,
    /// Pending commit id to device id.
    commits: HashMap<String, String>,
    calls: Vec<String>,
    next_id: u64,
    reboot_downtime: Option<Duration>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn drop_sessions(&mut self, device_id: &str) {
        self.sessions.retain(|_, owner| owner != device_id);
    }

    fn session_device(&self, session: &DeviceSession) -> Result<String, TransportError> {
        let device_id = self
            .sessions
            .get(&session.id)
            .cloned()
            .ok_or_else(|| TransportError::SessionClosed(session.id.clone()))?;
        match self.devices.get(&device_id) {
            Some(device) if device.is_up() => Ok(device_id),
            Some(_) => Err(TransportError::Unreachable(device_id)),
            None => Err(TransportError::Protocol(format!("unknown device {}", device_id))),
        }
    }

    fn revert(&mut self, device_id: &str, commit_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            if device.pending.as_ref().is_some_and(|p| p.id == commit_id) {
                if let Some(pending) = device.pending.take() {
                    device.config = pending.previous;
                }
            }
        }
        self.commits.remove(commit_id);
    }
}

/// Deterministic `DeviceTransport` for tests.
///
/// Each registered device keeps a running configuration made of `set` lines,
/// honours commit-confirm with its own auto-revert timer (tokio time, so
/// paused-clock tests work), and can be scripted to go dark, reject syntax,
/// corrupt image transfers, fail installs or boot the wrong version.
///
/// # Example
///
/// ```rust,ignore
/// let transport = FakeTransport::new().with_device("42", "set system host-name srx-42\n");
/// transport.dark_after_commit("42", Duration::from_secs(90));
/// ```
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device_id: &str, config: &str) -> Self {
        self.add_device(device_id, config);
        self
    }

    pub fn add_device(&self, device_id: &str, config: &str) {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(device_id.to_string(), FakeDevice::new(config));
    }

    fn update(&self, device_id: &str, f: impl FnOnce(&mut FakeDevice)) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(device_id) {
            f(device);
        }
    }

    fn inspect<T>(&self, device_id: &str, f: impl FnOnce(&FakeDevice) -> T) -> Option<T> {
        self.state.lock().unwrap().devices.get(device_id).map(f)
    }

    pub fn set_version(&self, device_id: &str, version: &str) {
        self.update(device_id, |d| d.version = version.to_string());
    }

    pub fn set_model(&self, device_id: &str, model: &str) {
        self.update(device_id, |d| d.model = model.to_string());
    }

    pub fn set_storage(&self, device_id: &str, total_bytes: u64, available_bytes: u64) {
        self.update(device_id, |d| {
            d.storage = StorageInfo {
                total_bytes,
                available_bytes,
            }
        });
    }

    /// Take a device off the network (or bring it back). Open sessions drop.
    pub fn set_reachable(&self, device_id: &str, reachable: bool) {
        self.go_dark(device_id, (!reachable).then(|| Duration::from_secs(100 * 365 * 86_400)));
    }

    /// Take a device off the network for `duration`.
    pub fn go_dark_for(&self, device_id: &str, duration: Duration) {
        self.go_dark(device_id, Some(duration));
    }

    fn go_dark(&self, device_id: &str, duration: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(device_id) {
            device.down_until = duration.map(|d| Instant::now() + d);
        }
        if duration.is_some() {
            state.drop_sessions(device_id);
        }
    }

    /// Make `validate` reject every command set with `message`.
    pub fn set_syntax_error(&self, device_id: &str, message: Option<&str>) {
        self.update(device_id, |d| d.syntax_error = message.map(String::from));
    }

    /// Drop off the network for `duration` right after the next commit.
    pub fn dark_after_commit(&self, device_id: &str, duration: Duration) {
        self.update(device_id, |d| d.dark_after_commit = Some(duration));
    }

    /// Report a checksum that does not match the transferred bytes.
    pub fn corrupt_transfers(&self, device_id: &str) {
        self.update(device_id, |d| d.corrupt_transfers = true);
    }

    pub fn fail_install(&self, device_id: &str) {
        self.update(device_id, |d| d.fail_install = true);
    }

    /// Answer `get_storage` with an RPC error while everything else works.
    pub fn fail_storage_reads(&self, device_id: &str) {
        self.update(device_id, |d| d.fail_storage_reads = true);
    }

    /// Come back from the next reboot running `version` instead of the
    /// installed package.
    pub fn set_boot_version(&self, device_id: &str, version: &str) {
        self.update(device_id, |d| d.boot_version = Some(version.to_string()));
    }

    /// How long a device stays down after `reboot` (default 90s).
    pub fn set_reboot_downtime(&self, downtime: Duration) {
        self.state.lock().unwrap().reboot_downtime = Some(downtime);
    }

    pub fn running_config(&self, device_id: &str) -> String {
        self.inspect(device_id, FakeDevice::running_config)
            .unwrap_or_default()
    }

    pub fn version(&self, device_id: &str) -> Option<String> {
        self.inspect(device_id, |d| d.version.clone())
    }

    pub fn has_pending_commit(&self, device_id: &str) -> bool {
        self.inspect(device_id, |d| d.pending.is_some())
            .unwrap_or(false)
    }

    pub fn reboot_count(&self, device_id: &str) -> u32 {
        self.inspect(device_id, |d| d.reboots).unwrap_or(0)
    }

    /// Recorded calls as `operation:device_id`, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls for `operation` across all devices.
    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(state: &mut FakeState, operation: &str, device_id: &str) {
        state.calls.push(format!("{}:{}", operation, device_id));
    }

    /// Run `f` against the device behind `session`.
    fn with_session<T>(
        &self,
        operation: &str,
        session: &DeviceSession,
        f: impl FnOnce(&mut FakeDevice) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, operation, &session.device_id);
        let device_id = state.session_device(session)?;
        match state.devices.get_mut(&device_id) {
            Some(device) => f(device),
            None => Err(TransportError::Protocol(format!("unknown device {}", device_id))),
        }
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn reachable(&self, device: &Device) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "reachable", &device.id);
        state.devices.get(&device.id).is_some_and(FakeDevice::is_up)
    }

    async fn connect(&self, device: &Device) -> Result<DeviceSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "connect", &device.id);
        match state.devices.get(&device.id) {
            Some(d) if d.is_up() => {}
            Some(_) => return Err(TransportError::Unreachable(device.address.clone())),
            None => {
                return Err(TransportError::Unreachable(format!(
                    "no such device {}",
                    device.id
                )))
            }
        }
        let id = state.next_id("session");
        state.sessions.insert(id.clone(), device.id.clone());
        Ok(DeviceSession {
            id,
            device_id: device.id.clone(),
            address: device.address.clone(),
        })
    }

    async fn disconnect(&self, session: &DeviceSession) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "disconnect", &session.device_id);
        state.sessions.remove(&session.id);
        Ok(())
    }

    async fn validate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError> {
        self.with_session("validate", session, |device| {
            if let Some(message) = &device.syntax_error {
                return Err(TransportError::Syntax(message.clone()));
            }
            match commands.iter().position(|c| c.trim().is_empty()) {
                Some(line) => Err(TransportError::Syntax(format!(
                    "empty command at line {}",
                    line + 1
                ))),
                None => Ok(()),
            }
        })
    }

    async fn push_candidate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError> {
        self.with_session("push_candidate", session, |device| {
            device.candidate = Some(apply_commands(&device.config, commands));
            Ok(())
        })
    }

    async fn commit_confirmed(
        &self,
        session: &DeviceSession,
        timeout: Duration,
        _comment: &str,
    ) -> Result<CommitHandle, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "commit", &session.device_id);
        let device_id = state.session_device(session)?;
        let commit_id = state.next_id("commit");

        let timer = {
            let shared = Arc::clone(&self.state);
            let device_id = device_id.clone();
            let commit_id = commit_id.clone();
            tokio::spawn(async move {
                sleep(timeout).await;
                shared.lock().unwrap().revert(&device_id, &commit_id);
            })
        };

        let device = state
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| TransportError::Protocol(format!("unknown device {}", device_id)))?;
        let Some(candidate) = device.candidate.take() else {
            timer.abort();
            return Err(TransportError::CommitFailed(
                "no candidate configuration loaded".to_string(),
            ));
        };
        let previous = std::mem::replace(&mut device.config, candidate);
        if let Some(old) = device.pending.replace(PendingCommit {
            id: commit_id.clone(),
            previous,
            timer,
        }) {
            // A newer commit supersedes the older window but keeps its baseline.
            old.timer.abort();
            if let Some(pending) = device.pending.as_mut() {
                pending.previous = old.previous;
            }
        }
        let dark = device.dark_after_commit.take();
        if let Some(duration) = dark {
            device.down_until = Some(Instant::now() + duration);
            state.drop_sessions(&device_id);
        }
        state.commits.insert(commit_id.clone(), device_id.clone());

        Ok(CommitHandle {
            commit_id,
            session_id: session.id.clone(),
            device_id,
            address: session.address.clone(),
            timeout,
            issued_at: Utc::now(),
        })
    }

    async fn confirm(&self, handle: &CommitHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "confirm", &handle.device_id);
        let device_id = state
            .commits
            .get(&handle.commit_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownCommit(handle.commit_id.clone()))?;
        let device = state
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| TransportError::UnknownCommit(handle.commit_id.clone()))?;
        if !device.is_up() {
            return Err(TransportError::Unreachable(handle.address.clone()));
        }
        match device.pending.take() {
            Some(pending) if pending.id == handle.commit_id => {
                pending.timer.abort();
            }
            other => {
                device.pending = other;
                return Err(TransportError::UnknownCommit(handle.commit_id.clone()));
            }
        }
        state.commits.remove(&handle.commit_id);
        Ok(())
    }

    async fn get_facts(&self, session: &DeviceSession) -> Result<DeviceFacts, TransportError> {
        let hostname = format!("fake-{}", session.device_id);
        self.with_session("get_facts", session, |device| Ok(device.facts(&hostname)))
    }

    async fn fetch_config(&self, session: &DeviceSession) -> Result<String, TransportError> {
        self.with_session("fetch_config", session, |device| Ok(device.running_config()))
    }

    async fn get_storage(&self, session: &DeviceSession) -> Result<StorageInfo, TransportError> {
        self.with_session("get_storage", session, |device| {
            if device.fail_storage_reads {
                return Err(TransportError::Protocol(
                    "show system storage: rpc error".to_string(),
                ));
            }
            Ok(device.storage)
        })
    }

    async fn transfer_image(
        &self,
        session: &DeviceSession,
        image: &ImageTransfer,
    ) -> Result<String, TransportError> {
        let bytes = tokio::fs::read(&image.local_path)
            .await
            .map_err(|e| TransportError::Protocol(format!("cannot read image: {}", e)))?;

        self.with_session("transfer", session, |device| {
            let size = bytes.len() as u64;
            if size > device.storage.available_bytes {
                return Err(TransportError::Protocol("no space left on device".to_string()));
            }
            let checksum = if device.corrupt_transfers {
                sha256_hex(&[bytes.as_slice(), &b"\0truncated"[..]].concat())
            } else {
                sha256_hex(&bytes)
            };
            let remote_path = format!("/var/tmp/{}", image.file_name);
            device.storage.available_bytes -= size;
            device.files.insert(remote_path.clone(), checksum);
            Ok(remote_path)
        })
    }

    async fn remote_checksum(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<String, TransportError> {
        self.with_session("checksum", session, |device| {
            device
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| TransportError::Protocol(format!("no such file {}", remote_path)))
        })
    }

    async fn install_package(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        self.with_session("install", session, |device| {
            if device.fail_install {
                return Err(TransportError::Protocol(format!(
                    "package installation failed: {}",
                    remote_path
                )));
            }
            if !device.files.contains_key(remote_path) {
                return Err(TransportError::Protocol(format!("no such file {}", remote_path)));
            }
            let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
            let version = version_from_file_name(file_name).ok_or_else(|| {
                TransportError::Protocol(format!("not a firmware package: {}", file_name))
            })?;
            device.staged_version = Some(version);
            Ok(())
        })
    }

    async fn reboot(&self, session: &DeviceSession) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "reboot", &session.device_id);
        let device_id = state.session_device(session)?;
        let downtime = state.reboot_downtime.unwrap_or(Duration::from_secs(90));

        if let Some(device) = state.devices.get_mut(&device_id) {
            let back_at = Instant::now() + downtime;
            device.reboots += 1;
            device.down_until = Some(back_at);
            device.booted_at = back_at;
            device.uptime_base_secs = 0;
            device.candidate = None;
            if let Some(version) = device.boot_version.take().or(device.staged_version.take()) {
                device.version = version;
            }
        }
        state.drop_sessions(&device_id);
        Ok(())
    }
}
