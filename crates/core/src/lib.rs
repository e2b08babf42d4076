pub mod audit;
pub mod change;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod ledger;
pub mod metrics;
pub mod snapshot;
pub mod testing;
pub mod upgrade;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditEventEnvelope, AuditFilter, AuditHandle,
    AuditRecord, AuditStore, AuditWriter, SqliteAuditStore,
};
pub use change::{
    ChangeError, ChangePhase, ChangeReport, ChangeRequest, CommitConfirmConfig,
    CommitConfirmEngine, ConfirmationSource, ReconcilePolicy,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DatabaseConfig,
    SanitizedConfig, ServerConfig, SnapshotConfig, TransportConfig,
};
pub use device::{
    Device, DeviceDirectory, DeviceFacts, DeviceSession, DeviceTransport, HttpTransport,
    StaticDeviceDirectory, StorageInfo, TransportError,
};
pub use dispatcher::{
    DispatchError, DispatcherConfig, DispatcherStatus, FleetBackupEntry, ScheduledBackupConfig,
    TaskDispatcher,
};
pub use ledger::{
    CreateJobRequest, DeviceLock, FailureKind, Job, JobFilter, JobKind, JobLedger, JobOutcome,
    JobStats, JobStatus, LedgerError, SqliteJobLedger,
};
pub use snapshot::{
    unified_diff, Snapshot, SnapshotError, SnapshotRequest, SnapshotStore, SnapshotTrigger,
    SqliteSnapshotStore,
};
pub use upgrade::{
    FirmwareCatalog, FirmwareImage, ReadinessReport, RiskLevel, UpgradeConfig, UpgradeError,
    UpgradeOrchestrator, UpgradePlan, UpgradeReport,
};
