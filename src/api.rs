//! Device API client.
//!
//! Thin policy layer over an [`HttpTransport`]:
//!
//! - URL templating: `{project}` and `{device}` in API paths are replaced,
//!   a leading `/` is dropped, the base URL always ends in `/`.
//! - Header merge: built-in defaults (`Accept`, `Content-Type`,
//!   `Authorization: <device token>`), then client-wide defaults, then
//!   per-request headers.  Empty values suppress the header entirely.
//! - Tokens: the device token and the provisioning secret persist on NVS.
//!   Any `403 Forbidden` clears the device token so the next cycle
//!   re-provisions.
//! - Conditional requests built from a [`FreshnessToken`].

use core::fmt;
use core::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{
    HttpRequest, HttpResponse, HttpTransport, Method, StorageError, TransportError,
};
use crate::persistent::Storage;
use crate::remote_config::FreshnessToken;

pub const TOKEN_NAMESPACE: &str = "iot";
pub const DEVICE_TOKEN_KEY: &str = "deviceToken";
pub const PROVISIONING_TOKEN_KEY: &str = "provToken";

pub const PROVISIONING_PATH: &str = "provision";
pub const LOG_PATH: &str = "log/{project}/{device}";
pub const TELEMETRY_PATH: &str = "telemetry/{project}/{device}/{kind}";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningRequest<'a> {
    project_name: &'a str,
    device_name: &'a str,
    provisioning_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningResponse {
    access_token: String,
    token_type: String,
}

pub struct ApiClient {
    base_url: String,
    project: String,
    device: String,
    default_headers: Vec<(String, String)>,
    device_token: String,
    provisioning_token: String,
    timeout: Duration,
    transport: Box<dyn HttpTransport>,
}

impl ApiClient {
    pub fn new(base_url: &str, project: &str, transport: Box<dyn HttpTransport>) -> Self {
        let mut client = Self {
            base_url: String::new(),
            project: project.to_owned(),
            device: String::new(),
            default_headers: Vec::new(),
            device_token: String::new(),
            provisioning_token: String::new(),
            timeout: DEFAULT_TIMEOUT,
            transport,
        };
        client.set_base_url(base_url);
        client
    }

    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.to_owned();
        if !self.base_url.ends_with('/') {
            self.base_url.push('/');
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn set_project(&mut self, project: &str) {
        self.project = project.to_owned();
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn set_device_name(&mut self, device: &str) {
        self.device = device.to_owned();
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Header sent with every request unless overridden per request.
    pub fn set_default_header(&mut self, name: &str, value: &str) {
        merge_header(&mut self.default_headers, name, value);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Load persisted tokens.
    pub fn begin(&mut self, storage: &Storage) {
        self.device_token = storage.flash_string(TOKEN_NAMESPACE, DEVICE_TOKEN_KEY);
        self.provisioning_token = storage.flash_string(TOKEN_NAMESPACE, PROVISIONING_TOKEN_KEY);
        debug!(
            "ApiClient: base={} project={} device={} provisioned={}",
            self.base_url,
            self.project,
            self.device,
            self.is_provisioned()
        );
    }

    // ── Tokens ────────────────────────────────────────────────

    pub fn device_token(&self) -> &str {
        &self.device_token
    }

    pub fn is_provisioned(&self) -> bool {
        !self.device_token.is_empty()
    }

    pub fn set_device_token(
        &mut self,
        storage: &mut Storage,
        token: &str,
    ) -> Result<(), StorageError> {
        if self.device_token == token {
            return Ok(());
        }
        storage.put_flash_string(TOKEN_NAMESPACE, DEVICE_TOKEN_KEY, token)?;
        self.device_token = token.to_owned();
        Ok(())
    }

    pub fn clear_device_token(&mut self, storage: &mut Storage) -> Result<(), StorageError> {
        self.set_device_token(storage, "")
    }

    pub fn provisioning_token(&self) -> &str {
        &self.provisioning_token
    }

    pub fn set_provisioning_token(
        &mut self,
        storage: &mut Storage,
        token: &str,
    ) -> Result<(), StorageError> {
        if self.provisioning_token == token {
            return Ok(());
        }
        storage.put_flash_string(TOKEN_NAMESPACE, PROVISIONING_TOKEN_KEY, token)?;
        self.provisioning_token = token.to_owned();
        Ok(())
    }

    /// Store a factory provisioning secret without overwriting one that
    /// was set earlier.  Returns whether it was stored.
    pub fn set_provisioning_token_if_empty(
        &mut self,
        storage: &mut Storage,
        token: &str,
    ) -> Result<bool, StorageError> {
        if !self.provisioning_token.is_empty() {
            return Ok(false);
        }
        self.set_provisioning_token(storage, token)?;
        Ok(true)
    }

    pub fn clear_provisioning_token(&mut self, storage: &mut Storage) -> Result<(), StorageError> {
        self.set_provisioning_token(storage, "")
    }

    // ── Requests ──────────────────────────────────────────────

    fn replace_vars(&self, s: &str) -> String {
        s.replace("{device}", &self.device).replace("{project}", &self.project)
    }

    /// Absolute URL for an API path template.
    pub fn url_for_path(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        self.replace_vars(&format!("{}{}", self.base_url, path))
    }

    /// Resolve URL and final headers without sending.
    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> HttpRequest {
        let mut merged: Vec<(String, String)> = vec![
            ("Accept".into(), "application/json".into()),
            ("Content-Type".into(), "application/json".into()),
            ("Authorization".into(), self.device_token.clone()),
        ];
        for (k, v) in &self.default_headers {
            merge_header(&mut merged, k, v);
        }
        for (k, v) in headers {
            merge_header(&mut merged, k, v);
        }
        merged.retain(|(_, v)| !v.is_empty());

        HttpRequest {
            method,
            url: self.url_for_path(path),
            headers: merged,
            body: body.to_vec(),
            timeout: self.timeout,
        }
    }

    /// Send a request.  Every HTTP status is `Ok`; the caller decides
    /// what counts as success.  A 403 clears the device token.
    pub fn request(
        &mut self,
        storage: &mut Storage,
        method: Method,
        path: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, ApiError> {
        let request = self.build_request(method, path, body, headers);
        info!("HTTP {} url={}", method, request.url);

        let response = self.transport.send(&request).map_err(|e| {
            error!("HTTP {} url={} -> error {}", method, request.url, e);
            ApiError::Transport(e)
        })?;

        match response.status {
            403 => {
                error!(
                    "HTTP {} url={} -> 403 FORBIDDEN, clearing device token to force provisioning",
                    method, request.url
                );
                if let Err(e) = self.clear_device_token(storage) {
                    warn!("ApiClient: clearing device token failed: {}", e);
                }
            }
            s if !(200..400).contains(&s) => {
                error!("HTTP {} url={} -> status={}", method, request.url, s);
            }
            s => info!("HTTP {} url={} -> status={}", method, request.url, s),
        }
        Ok(response)
    }

    pub fn get(&mut self, storage: &mut Storage, path: &str) -> Result<HttpResponse, ApiError> {
        self.request(storage, Method::Get, path, &[], &[])
    }

    pub fn head(&mut self, storage: &mut Storage, path: &str) -> Result<HttpResponse, ApiError> {
        self.request(storage, Method::Head, path, &[], &[])
    }

    pub fn post(
        &mut self,
        storage: &mut Storage,
        path: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, ApiError> {
        self.request(storage, Method::Post, path, body, headers)
    }

    /// GET with `If-None-Match` / `If-Modified-Since` from `token`.
    pub fn conditional_get(
        &mut self,
        storage: &mut Storage,
        path: &str,
        token: &FreshnessToken,
    ) -> Result<HttpResponse, ApiError> {
        self.request(storage, Method::Get, path, &[], &conditional_headers(token))
    }

    /// Conditional HEAD; `true` means the resource changed (2xx).
    pub fn check_for_update(
        &mut self,
        storage: &mut Storage,
        path: &str,
        token: &FreshnessToken,
    ) -> Result<bool, ApiError> {
        let response = self.request(storage, Method::Head, path, &[], &conditional_headers(token))?;
        Ok(response.is_success())
    }

    /// Request for a download that another component (OTA) executes.
    pub fn download_request(&self, path: &str) -> HttpRequest {
        let accept = [("Accept", "application/octet-stream")];
        let mut request = self.build_request(Method::Get, path, &[], &accept);
        request.timeout = self.timeout.max(Duration::from_secs(30));
        request
    }

    /// Exchange the provisioning secret for a device token.
    ///
    /// Returns `Ok(false)` when already provisioned or when no secret is
    /// configured.
    pub fn update_provisioning(
        &mut self,
        storage: &mut Storage,
        path: &str,
    ) -> Result<bool, ApiError> {
        if self.is_provisioned() {
            info!("ApiClient: already provisioned");
            return Ok(false);
        }
        if self.provisioning_token.is_empty() {
            warn!("ApiClient: no provisioning token configured");
            return Ok(false);
        }

        let body = serde_json::to_vec(&ProvisioningRequest {
            project_name: &self.project,
            device_name: &self.device,
            provisioning_token: &self.provisioning_token,
        })
        .map_err(|_| ApiError::Malformed)?;

        let response = self.post(storage, path, &body, &[("Authorization", "")])?;
        if !(200..400).contains(&response.status) || response.body.is_empty() {
            info!("ApiClient: provisioning status={} or empty response", response.status);
            return Err(ApiError::Status(response.status));
        }

        let parsed: ProvisioningResponse = serde_json::from_slice(&response.body).map_err(|e| {
            info!("ApiClient: provisioning response rejected: {}", e);
            ApiError::Malformed
        })?;
        let token = format!("{} {}", parsed.token_type, parsed.access_token);
        self.set_device_token(storage, &token)?;
        info!("ApiClient: new device token for api access");
        Ok(true)
    }

    /// Forward a log line as `text/plain`.
    pub fn post_log(&mut self, storage: &mut Storage, line: &str) -> Result<u16, ApiError> {
        let plain = [("Content-Type", "text/plain")];
        let response = self.post(storage, LOG_PATH, line.as_bytes(), &plain)?;
        Ok(response.status)
    }

    pub fn post_telemetry(
        &mut self,
        storage: &mut Storage,
        kind: &str,
        json: &str,
    ) -> Result<u16, ApiError> {
        let path = TELEMETRY_PATH.replace("{kind}", kind);
        let response = self.post(storage, &path, json.as_bytes(), &[])?;
        Ok(response.status)
    }
}

fn conditional_headers(token: &FreshnessToken) -> [(&str, &str); 2] {
    [
        ("If-None-Match", token.etag.as_str()),
        ("If-Modified-Since", token.last_modified.as_str()),
    ]
}

fn merge_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => value.clone_into(&mut entry.1),
        None => headers.push((name.to_owned(), value.to_owned())),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    Transport(TransportError),
    /// Server answered with a status the operation cannot use.
    Status(u16),
    /// Response body did not decode.
    Malformed,
    Storage(StorageError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Status(s) => write!(f, "unexpected HTTP status {s}"),
            Self::Malformed => write!(f, "malformed response body"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
