//! Build service client
//!
//! Data model for build submission plus the REST client that talks to the
//! build service. The client sits behind the [`BuildService`] trait so the
//! wait loop and submission flow can run against an in-process mock.
//!
//! Endpoints:
//! - `POST {base}/builds`: submit a [`BuildRequest`]
//! - `GET {base}/builds`: list builds
//! - `GET {base}/builds/{name}`: fetch one [`BuildStatus`]
//! - `POST {base}/builds/{name}/files`: multipart upload of referenced files
//! - `GET {base}/builds/{name}/logs?follow=`: raw log byte stream

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::manifest::FileReference;

/// Per-call timeout for status and submission requests. Independent of the
/// overall wait deadline; log streaming uses no timeout at all.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A build submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub name: String,
    pub manifest: String,
    pub manifest_file_name: String,
    pub distro: String,
    pub target: String,
    pub architecture: String,
    pub export_format: String,
    pub mode: String,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub builder_args: Vec<String>,
    #[serde(default)]
    pub serve_artifact: bool,
    #[serde(default)]
    pub expose_route: bool,
}

/// Lifecycle phase reported by the service. Any unrecognized wire value
/// maps to `Unknown`, which is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    Accepted,
    Building,
    Completed,
    Failed,
    #[default]
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Accepted => "Accepted",
            Phase::Building => "Building",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        }
    }

    /// Completed and Failed end the wait loop; everything else keeps polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl From<&str> for Phase {
    fn from(value: &str) -> Self {
        match value {
            "Accepted" => Phase::Accepted,
            "Building" => Phase::Building,
            "Completed" => Phase::Completed,
            "Failed" => Phase::Failed,
            _ => Phase::Unknown,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PhaseVisitor;
        impl de::Visitor<'_> for PhaseVisitor {
            type Value = Phase;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a build phase string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Phase, E> {
                Ok(Phase::from(v))
            }
        }
        deserializer.deserialize_str(PhaseVisitor)
    }
}

/// Status of one build, owned and mutated by the service; read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub name: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Build service client errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("build logs not available yet")]
    LogsUnavailable,

    #[error("local file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("invalid build request: {0}")]
    InvalidRequest(String),
}

/// Abstract build service, implemented by [`HttpBuildService`] and the
/// test mock.
pub trait BuildService: Send + Sync {
    /// Submit a build; returns the accepted build's initial status.
    fn create_build(&self, request: &BuildRequest) -> Result<BuildStatus, ApiError>;

    /// Fetch the current status of one build.
    fn get_build(&self, name: &str) -> Result<BuildStatus, ApiError>;

    /// List all builds known to the service.
    fn list_builds(&self) -> Result<Vec<BuildStatus>, ApiError>;

    /// Upload all referenced local files as one multipart batch.
    ///
    /// Local existence is verified before any network traffic; a single
    /// unreadable file fails the whole batch.
    fn upload_files(&self, name: &str, files: &[FileReference]) -> Result<(), ApiError>;

    /// Open the build's log stream. A 503 from the service maps to
    /// [`ApiError::LogsUnavailable`].
    fn stream_logs(&self, name: &str, follow: bool) -> Result<Box<dyn Read + Send>, ApiError>;
}

/// Submit a build: validate, verify referenced files, create, upload.
///
/// Validation and local file checks run before any network call, so a bad
/// manifest reference never produces a half-submitted build.
pub fn submit(
    service: &dyn BuildService,
    request: &BuildRequest,
    files: &[FileReference],
) -> Result<BuildStatus, ApiError> {
    if request.name.is_empty() {
        return Err(ApiError::InvalidRequest("build name is empty".to_string()));
    }
    if request.manifest.is_empty() {
        return Err(ApiError::InvalidRequest("manifest is empty".to_string()));
    }
    for file in files {
        if !file.source_path.exists() {
            return Err(ApiError::MissingFile(file.source_path.clone()));
        }
    }

    let status = service.create_build(request)?;
    if !files.is_empty() {
        service.upload_files(&request.name, files)?;
    }
    Ok(status)
}

/// REST client over `reqwest::blocking`.
pub struct HttpBuildService {
    base_url: String,
    client: reqwest::blocking::Client,
    /// Separate client without a request timeout; log streams are long-lived.
    stream_client: reqwest::blocking::Client,
}

impl HttpBuildService {
    pub fn new(server_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let stream_client = reqwest::blocking::Client::builder().timeout(None).build()?;
        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Convert a non-success response into [`ApiError::Status`] with its body.
fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

impl BuildService for HttpBuildService {
    fn create_build(&self, request: &BuildRequest) -> Result<BuildStatus, ApiError> {
        let response = self
            .client
            .post(self.url("builds"))
            .json(request)
            .send()?;
        Ok(check_status(response)?.json()?)
    }

    fn get_build(&self, name: &str) -> Result<BuildStatus, ApiError> {
        let response = self.client.get(self.url(&format!("builds/{name}"))).send()?;
        Ok(check_status(response)?.json()?)
    }

    fn list_builds(&self) -> Result<Vec<BuildStatus>, ApiError> {
        let response = self.client.get(self.url("builds")).send()?;
        Ok(check_status(response)?.json()?)
    }

    fn upload_files(&self, name: &str, files: &[FileReference]) -> Result<(), ApiError> {
        for file in files {
            if !file.source_path.exists() {
                return Err(ApiError::MissingFile(file.source_path.clone()));
            }
        }

        // One part per file; the part name is the destination path inside
        // the build context.
        let mut form = reqwest::blocking::multipart::Form::new();
        for file in files {
            form = form.file(file.path.clone(), &file.source_path)?;
        }

        let response = self
            .stream_client
            .post(self.url(&format!("builds/{name}/files")))
            .multipart(form)
            .send()?;
        check_status(response)?;
        Ok(())
    }

    fn stream_logs(&self, name: &str, follow: bool) -> Result<Box<dyn Read + Send>, ApiError> {
        let response = self
            .stream_client
            .get(self.url(&format!("builds/{name}/logs")))
            .query(&[("follow", follow)])
            .send()?;
        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(ApiError::LogsUnavailable);
        }
        let response = check_status(response)?;
        Ok(Box::new(response))
    }
}
