//! Earth Engine REST client for image exports.

use crate::config::Endpoints;
use crate::core::export::{ExportBackend, ExportRequest, JobHandle, RemoteStatus};
use crate::core::graph::Expression;
use crate::io::auth::CredentialProvider;
use crate::types::{TrendError, TrendResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Long-running operation returned by `image:export`
#[derive(Debug, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Option<OperationMetadata>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Operation {
    /// Map the operation onto the backend-neutral status
    pub fn status(&self) -> RemoteStatus {
        let state = self
            .metadata
            .as_ref()
            .and_then(|m| m.state.as_deref())
            .unwrap_or("");
        let error_message = || {
            self.error
                .as_ref()
                .and_then(|e| e.message.clone())
        };
        match state {
            "SUCCEEDED" => RemoteStatus::Succeeded,
            "FAILED" => RemoteStatus::Failed(error_message()),
            "CANCELLING" | "CANCELLED" => RemoteStatus::Cancelled,
            "RUNNING" => RemoteStatus::Running,
            "PENDING" => RemoteStatus::Pending,
            _ if self.done && self.error.is_some() => RemoteStatus::Failed(error_message()),
            _ if self.done => RemoteStatus::Succeeded,
            _ => RemoteStatus::Pending,
        }
    }
}

/// Blocking Earth Engine client
pub struct EarthEngineClient {
    client: reqwest::blocking::Client,
    base_url: String,
    project: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl EarthEngineClient {
    pub fn new(
        endpoints: &Endpoints,
        project: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> TrendResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(endpoints.request_timeout_secs))
            .user_agent(concat!("harmonic-trend/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: endpoints.earth_engine.trim_end_matches('/').to_string(),
            project: project.to_string(),
            credentials,
        })
    }

    /// JSON body of an `image:export` call
    pub fn export_body(request: &ExportRequest) -> Value {
        let image = request
            .image
            .clip_to_bounds_and_scale(&request.region, request.scale);
        let expression = Expression::encode(&image.0);
        json!({
            "expression": expression.to_json(),
            "description": request.description,
            "fileExportOptions": {
                "fileFormat": request.file_format.api_name(),
                "driveDestination": {
                    "folder": request.folder,
                    "filenamePrefix": request.file_name_prefix,
                },
            },
            "grid": { "crsCode": request.crs },
            "maxPixels": request.max_pixels.to_string(),
        })
    }

    fn send(&self, builder: reqwest::blocking::RequestBuilder) -> TrendResult<Operation> {
        let token = self.credentials.access_token()?;
        let response = builder
            .bearer_auth(token)
            .header("x-goog-user-project", &self.project)
            .send()
            .map_err(|e| {
                log::error!("Earth Engine request failed: {}", e);
                TrendError::Http(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            log::error!("Earth Engine returned {}: {}", status, message);
            return Err(TrendError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json()?)
    }
}

impl ExportBackend for EarthEngineClient {
    fn start_export(&self, request: &ExportRequest) -> TrendResult<JobHandle> {
        let url = format!("{}/projects/{}/image:export", self.base_url, self.project);
        log::debug!("POST {}", url);
        let operation = self.send(self.client.post(&url).json(&Self::export_body(request)))?;
        Ok(JobHandle { id: operation.name })
    }

    fn job_status(&self, handle: &JobHandle) -> TrendResult<RemoteStatus> {
        let url = format!("{}/{}", self.base_url, handle.id);
        log::debug!("GET {}", url);
        let operation = self.send(self.client.get(&url))?;
        Ok(operation.status())
    }
}
