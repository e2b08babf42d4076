//! Common test utilities for API testing against the fake transport.
//!
//! This module provides a test fixture that builds the router in-process
//! with the device gateway replaced by `FakeTransport`, so full job
//! lifecycles run without any network or devices.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use fleetguard_core::{
    create_audit_system, AuditStore, Config, DatabaseConfig, JobLedger, ServerConfig,
    SnapshotConfig, SnapshotStore, SqliteAuditStore, SqliteJobLedger, SqliteSnapshotStore,
    StaticDeviceDirectory, TaskDispatcher, TransportConfig, UpgradeConfig,
    testing::FakeTransport,
};

/// Re-export fixtures for test convenience
pub use fleetguard_core::testing::fixtures;

/// Firmware staged in every fixture's catalog.
pub const STAGED_FIRMWARE: &str = "21.4R3";

/// Test fixture with an in-process router and a fake device fleet.
///
/// Devices "42" and "43" exist and are enabled; "44" is disabled.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_backup() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.post("/api/v1/devices/42/backup", json!({})).await;
///     assert_eq!(response.status, 202);
/// }
/// ```
pub struct TestFixture {
    pub router: Router,
    pub dispatcher: Arc<TaskDispatcher>,
    /// Fake device gateway - script failures and inspect device state
    pub transport: Arc<FakeTransport>,
    pub audit_store: Arc<SqliteAuditStore>,
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

impl TestFixture {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        let repo_path = temp_dir.path().join("snapshots");
        let firmware_dir = temp_dir.path().join("firmware");
        fixtures::stage_firmware(&firmware_dir, STAGED_FIRMWARE);

        let mut disabled = fixtures::device("44");
        disabled.enabled = false;
        let devices = vec![fixtures::device("42"), fixtures::device("43"), disabled];

        let config = Config {
            transport: TransportConfig {
                gateway_url: "http://gateway.invalid".to_string(),
                api_token: Some("test-token".to_string()),
                timeout_secs: 5,
                transfer_timeout_secs: 60,
            },
            server: ServerConfig {
                host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: 0, // Not used for in-process testing
            },
            database: DatabaseConfig {
                path: db_path.clone(),
            },
            snapshots: SnapshotConfig {
                repository_path: repo_path.clone(),
            },
            commit_confirm: Default::default(),
            upgrade: UpgradeConfig {
                firmware_dir,
                ..Default::default()
            },
            dispatcher: Default::default(),
            devices: devices.clone(),
        };

        let transport = Arc::new(FakeTransport::new());
        for device in &devices {
            transport.add_device(&device.id, fixtures::BASE_CONFIG);
        }

        let audit_store =
            Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to create audit store"));
        let ledger: Arc<dyn JobLedger> =
            Arc::new(SqliteJobLedger::new(&db_path).expect("Failed to create ledger"));
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(
            SqliteSnapshotStore::new(&db_path, repo_path).expect("Failed to create snapshot store"),
        );

        let (audit_handle, audit_writer) =
            create_audit_system(Arc::clone(&audit_store) as Arc<dyn AuditStore>, 100);
        tokio::spawn(audit_writer.run());

        let dispatcher = Arc::new(TaskDispatcher::new(
            config.dispatcher.clone(),
            ledger,
            snapshots,
            Arc::new(StaticDeviceDirectory::new(devices)),
            transport.clone(),
            config.commit_confirm.clone(),
            config.upgrade.clone(),
            Some(audit_handle),
        ));

        let state = Arc::new(fleetguard_server::state::AppState::new(
            config,
            Arc::clone(&dispatcher),
            Arc::clone(&audit_store) as Arc<dyn AuditStore>,
        ));
        let router = fleetguard_server::api::create_router(state);

        Self {
            router,
            dispatcher,
            transport,
            audit_store,
            temp_dir,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    /// Poll a job over the API until it reaches a terminal status.
    pub async fn wait_for_job(&self, job_id: &str) -> Value {
        loop {
            let response = self.get(&format!("/api/v1/jobs/{}", job_id)).await;
            let status = response.body["status"].as_str().unwrap_or_default().to_string();
            if matches!(status.as_str(), "success" | "failed" | "cancelled") {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until the confirm window of `job_id` is open.
    pub async fn wait_for_window(&self, job_id: &str) {
        fixtures::wait_for_window(self.dispatcher.change_engine().registry(), job_id).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).into_owned();
        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body, text }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status, $response.status, $response.text
        );
    };
}
