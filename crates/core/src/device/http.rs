//! Device transport backed by an HTTP device-management gateway.
//!
//! The gateway terminates SSH/NETCONF sessions and exposes them as JSON
//! resources under `/devices/{address}/...`. This adapter only maps the
//! [`DeviceTransport`] calls onto those resources and classifies failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TransportConfig;

use super::{
    CommitHandle, Device, DeviceFacts, DeviceSession, DeviceTransport, ImageTransfer, StorageInfo,
    TransportError,
};

#[derive(Debug, Serialize)]
struct OpenSessionRequest<'a> {
    port: u16,
    credential_ref: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct CommandsRequest<'a> {
    commands: &'a [String],
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    confirm_timeout_secs: u64,
    comment: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit_id: String,
}

#[derive(Debug, Deserialize)]
struct ReachabilityResponse {
    reachable: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    config: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    remote_path: String,
}

#[derive(Debug, Deserialize)]
struct ChecksumResponse {
    sha256: String,
}

#[derive(Debug, Serialize)]
struct PackageRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    error: String,
}

/// HTTP gateway transport.
pub struct HttpTransport {
    client: Client,
    base: Url,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let base = Url::parse(config.gateway_url.trim_end_matches('/'))
            .map_err(|e| TransportError::Protocol(format!("invalid gateway url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::Protocol(format!(
                "gateway url cannot be a base: {}",
                config.gateway_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| TransportError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// `{gateway}/devices/{address}/{segments...}` with each segment escaped.
    fn device_url(&self, address: &str, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("devices").push(address);
            path.extend(segments);
        }
        url
    }

    fn session_url(&self, session: &DeviceSession, segments: &[&str]) -> Url {
        let mut all = vec!["sessions", session.id.as_str()];
        all.extend_from_slice(segments);
        self.device_url(&session.address, &all)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.api_token.as_deref() {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GatewayError>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| body.chars().take(200).collect());
        Err(classify_status(status.as_u16(), message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| TransportError::Protocol(format!("failed to parse gateway response: {}", e)))
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Unreachable(e.to_string())
    } else {
        TransportError::Protocol(e.to_string())
    }
}

/// Map a gateway error status onto the transport taxonomy.
fn classify_status(status: u16, message: String) -> TransportError {
    match status {
        401 | 403 => TransportError::Authentication(message),
        409 => TransportError::CommitFailed(message),
        410 => TransportError::SessionClosed(message),
        422 => TransportError::Syntax(message),
        502 | 503 => TransportError::Unreachable(message),
        504 => TransportError::Timeout(message),
        _ => TransportError::Protocol(format!("gateway returned {}: {}", status, message)),
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    fn name(&self) -> &str {
        "http-gateway"
    }

    async fn reachable(&self, device: &Device) -> bool {
        let url = self.device_url(&device.address, &["reachability"]);
        let request = self
            .client
            .get(url)
            .query(&[("port", device.port.to_string())]);
        match self.send_json::<ReachabilityResponse>(request).await {
            Ok(r) => r.reachable,
            Err(e) => {
                debug!(device_id = %device.id, error = %e, "Reachability probe failed");
                false
            }
        }
    }

    async fn connect(&self, device: &Device) -> Result<DeviceSession, TransportError> {
        let url = self.device_url(&device.address, &["sessions"]);
        let request = self.client.post(url).json(&OpenSessionRequest {
            port: device.port,
            credential_ref: device.credential_ref.as_deref(),
        });
        let opened: OpenSessionResponse = self.send_json(request).await?;

        debug!(device_id = %device.id, session_id = %opened.session_id, "Opened gateway session");
        Ok(DeviceSession {
            id: opened.session_id,
            device_id: device.id.clone(),
            address: device.address.clone(),
        })
    }

    async fn disconnect(&self, session: &DeviceSession) -> Result<(), TransportError> {
        let url = self.session_url(session, &[]);
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    async fn validate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError> {
        let url = self.session_url(session, &["validate"]);
        self.send(self.client.post(url).json(&CommandsRequest { commands }))
            .await
            .map(|_| ())
    }

    async fn push_candidate(
        &self,
        session: &DeviceSession,
        commands: &[String],
    ) -> Result<(), TransportError> {
        let url = self.session_url(session, &["candidate"]);
        self.send(self.client.post(url).json(&CommandsRequest { commands }))
            .await
            .map(|_| ())
    }

    async fn commit_confirmed(
        &self,
        session: &DeviceSession,
        timeout: Duration,
        comment: &str,
    ) -> Result<CommitHandle, TransportError> {
        let url = self.session_url(session, &["commit"]);
        // Sub-second windows still commit with a one second revert.
        let request = self.client.post(url).json(&CommitRequest {
            confirm_timeout_secs: timeout.as_secs().max(1),
            comment,
        });
        let committed: CommitResponse = self.send_json(request).await?;

        Ok(CommitHandle {
            commit_id: committed.commit_id,
            session_id: session.id.clone(),
            device_id: session.device_id.clone(),
            address: session.address.clone(),
            timeout,
            issued_at: Utc::now(),
        })
    }

    async fn confirm(&self, handle: &CommitHandle) -> Result<(), TransportError> {
        let url = self.device_url(&handle.address, &["commits", handle.commit_id.as_str(), "confirm"]);
        match self.send(self.client.post(url)).await {
            Ok(_) => Ok(()),
            Err(TransportError::Protocol(msg)) if msg.starts_with("gateway returned 404") => {
                warn!(commit_id = %handle.commit_id, "Gateway no longer knows the pending commit");
                Err(TransportError::UnknownCommit(handle.commit_id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_facts(&self, session: &DeviceSession) -> Result<DeviceFacts, TransportError> {
        let url = self.session_url(session, &["facts"]);
        self.send_json(self.client.get(url)).await
    }

    async fn fetch_config(&self, session: &DeviceSession) -> Result<String, TransportError> {
        let url = self.session_url(session, &["config"]);
        let response: ConfigResponse = self.send_json(self.client.get(url)).await?;
        Ok(response.config)
    }

    async fn get_storage(&self, session: &DeviceSession) -> Result<StorageInfo, TransportError> {
        let url = self.session_url(session, &["storage"]);
        self.send_json(self.client.get(url)).await
    }

    async fn transfer_image(
        &self,
        session: &DeviceSession,
        image: &ImageTransfer,
    ) -> Result<String, TransportError> {
        // TODO: stream the upload instead of buffering once reqwest's `stream` feature is enabled.
        let bytes = tokio::fs::read(&image.local_path).await.map_err(|e| {
            TransportError::Protocol(format!(
                "failed to read image {}: {}",
                image.local_path.display(),
                e
            ))
        })?;

        let url = self.session_url(session, &["files", image.file_name.as_str()]);
        let request = self
            .client
            .put(url)
            .timeout(Duration::from_secs(self.config.transfer_timeout_secs as u64))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let uploaded: UploadResponse = self.send_json(request).await?;
        Ok(uploaded.remote_path)
    }

    async fn remote_checksum(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<String, TransportError> {
        let url = self.session_url(session, &["checksum"]);
        let request = self.client.get(url).query(&[("path", remote_path)]);
        let response: ChecksumResponse = self.send_json(request).await?;
        Ok(response.sha256.to_lowercase())
    }

    async fn install_package(
        &self,
        session: &DeviceSession,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let url = self.session_url(session, &["packages"]);
        let request = self
            .client
            .post(url)
            .timeout(Duration::from_secs(self.config.transfer_timeout_secs as u64))
            .json(&PackageRequest { path: remote_path });
        self.send(request).await.map(|_| ())
    }

    async fn reboot(&self, session: &DeviceSession) -> Result<(), TransportError> {
        let url = self.session_url(session, &["reboot"]);
        self.send(self.client.post(url)).await.map(|_| ())
    }
}
