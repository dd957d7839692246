use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::models::{
    CommandResponse, CommandsResponse, HeartbeatRequest, MediaStatusResponse, RegisterRequest,
};
use crate::session::AuthProvider;
use crate::settings::Settings;
use crate::utils::{self, unix_timestamp};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status and body of a completed request
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Map an unsuccessful status to the matching error.
    pub fn error_for_status(self) -> Result<Self, SyncError> {
        match classify_status(self.status, &self.text()) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Map an HTTP status (and the body that came with it) to an error.
/// Returns `None` for success codes.
pub fn classify_status(status: StatusCode, body: &str) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }
    match status.as_u16() {
        401 => Some(SyncError::TokenExpired),
        403 | 404 if utils::is_device_not_found(body) => Some(SyncError::DeviceNotFound),
        400..=499 if utils::is_invalid_token(body) => Some(SyncError::TokenExpired),
        code => Some(SyncError::HttpStatus {
            status: code,
            body: body.chars().take(512).collect(),
        }),
    }
}

/// Authenticated HTTP access to the control server. Every request carries
/// `Authorization: Bearer <token>`; without a token nothing is sent.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
    app_id: String,
    device_id: String,
    device_model: String,
    os: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl ApiClient {
    pub fn new(settings: &Settings, auth: Arc<dyn AuthProvider>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout.min(MAX_CONNECT_TIMEOUT))
            .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .build()?;
        Ok(Self::with_client(client, settings, auth))
    }

    /// Use a preconfigured reqwest client (shared pools, proxies, custom TLS).
    pub fn with_client(client: Client, settings: &Settings, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            client,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            auth,
            app_id: settings.app_id.clone(),
            device_id: settings.device_id.clone(),
            device_model: settings.device_model.clone(),
            os: settings.os.clone(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Absolute URLs pass through; `/path` resolves against the server
    /// origin and bare relative paths against the API base.
    pub fn resolve_media_url(&self, url: &str) -> Result<String, SyncError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        let base = Url::parse(&format!("{}/", self.base_url))
            .map_err(|e| SyncError::InvalidResponse(format!("Invalid server url: {}", e)))?;
        let joined = base
            .join(url)
            .map_err(|e| SyncError::InvalidResponse(format!("Invalid media url {}: {}", url, e)))?;
        Ok(joined.to_string())
    }

    fn bearer(&self) -> Result<String, SyncError> {
        self.auth.token().ok_or(SyncError::AuthRequired)
    }

    async fn send(&self, request: RequestBuilder) -> Result<ApiResponse, SyncError> {
        let token = self.bearer()?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        trace!(%status, len = body.len(), "Response received");
        Ok(ApiResponse { status, body })
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, SyncError> {
        self.send(self.client.get(self.url(path))).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, SyncError> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    /// Open a media download, optionally restricted to the inclusive byte
    /// range `start..=end`. The body is left unread for streaming. For ranged
    /// requests a 416 is returned as a response, not an error, so the caller
    /// can read the complete length from `Content-Range`.
    pub async fn open_media(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Response, SyncError> {
        let token = self.bearer()?;
        let mut request = self.client.get(url).bearer_auth(token);
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || (range.is_some() && status == StatusCode::RANGE_NOT_SATISFIABLE) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body).unwrap_or(SyncError::HttpStatus {
            status: status.as_u16(),
            body,
        }))
    }

    // --- Device endpoints ---

    pub async fn register_device(&self) -> Result<(), SyncError> {
        let request = RegisterRequest {
            app_id: self.app_id.clone(),
            device_model: self.device_model.clone(),
            os: self.os.clone(),
            timestamp: unix_timestamp(),
        };
        debug!(app_id = %self.app_id, "Registering device");
        self.post_json("device/register", &request)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn fetch_commands(&self, last_id: i64) -> Result<CommandsResponse, SyncError> {
        let query = serde_urlencoded::to_string([("lastId", last_id)])?;
        let path = format!("device/{}/commands?{}", self.app_id, query);
        let response = self.get(&path).await?.error_for_status()?;
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(CommandsResponse::default());
        }
        response.json()
    }

    pub async fn post_command_response(&self, response: &CommandResponse) -> Result<(), SyncError> {
        self.post_json("device/response", response)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<(), SyncError> {
        let request = HeartbeatRequest {
            app_id: self.app_id.clone(),
            timestamp: unix_timestamp(),
        };
        self.post_json("device/heartbeat", &request)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn fetch_media_status(&self) -> Result<MediaStatusResponse, SyncError> {
        let path = format!("device/{}/media", self.device_id);
        let response = self.get(&path).await?.error_for_status()?;
        response.json().map_err(|e| {
            warn!(error = %e, "Unparseable media status payload");
            e
        })
    }
}
