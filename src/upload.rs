use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::{Snapshot, SnapshotId};
use crate::wire::{self, Created};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("unexpected answer from {url}: {source}")]
    Response { url: String, source: reqwest::Error },
}

/// Ships collected snapshots to a remote netsnap server.
#[derive(Clone)]
pub struct Uploader {
    client: Client,
    endpoint: String,
}

impl Uploader {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(concat!("netsnap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(UploadError::Client)?;
        Ok(Self {
            client,
            endpoint: snapshots_endpoint(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, snapshot), fields(url = %self.endpoint, devices = snapshot.devices.len()))]
    pub async fn upload(&self, snapshot: &Snapshot) -> Result<SnapshotId, UploadError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&wire::encode(snapshot))
            .send()
            .await
            .map_err(|source| UploadError::Request {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                url: self.endpoint.clone(),
                status,
                body,
            });
        }

        let created: Created = response
            .json()
            .await
            .map_err(|source| UploadError::Response {
                url: self.endpoint.clone(),
                source,
            })?;
        debug!(id = created.id, "snapshot accepted by server");
        Ok(created.id)
    }
}

fn snapshots_endpoint(base_url: &str) -> String {
    format!("{}/api/snapshots", base_url.trim_end_matches('/'))
}
