//! Job execution
//!
//! [`JobRunner`] is the seam between the executor and the network; the HTTP
//! implementation dispatches each [`JobSpec`] variant to the drive API.
//! Cancellation is cooperative: aborting drops the in-flight request, which
//! closes its socket, and the job reports `OperationCanceled`.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pairdrive_core::domain::{ExitCause, ExitCode, NodeId};

use crate::client::DriveClient;
use crate::spec::{FileListPage, JobOutcome, JobPayload, JobSpec, RemoteItem};

/// Executes jobs against the remote replica
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, spec: JobSpec, cancel: &CancellationToken) -> JobOutcome;
}

/// HTTP implementation over [`DriveClient`]
pub struct HttpJobRunner {
    client: DriveClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_url: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    changed: bool,
}

impl HttpJobRunner {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }

    async fn execute(&self, spec: JobSpec) -> JobOutcome {
        debug!(job = spec.label(), "Running job");
        match spec {
            JobSpec::CreateDir { parent_id, name } => self.create_dir(&parent_id, &name).await,
            JobSpec::Upload {
                parent_id,
                name,
                local_path,
                size,
            } => self.upload(&parent_id, &name, &local_path, size).await,
            JobSpec::UploadSessionStart {
                parent_id,
                name,
                total_size,
            } => self.session_start(&parent_id, &name, total_size).await,
            JobSpec::UploadSessionChunk {
                session_url,
                offset,
                total_size,
                data,
            } => self.session_chunk(&session_url, offset, total_size, data).await,
            JobSpec::UploadSessionFinish { session_url } => self.session_finish(&session_url).await,
            JobSpec::UploadSessionCancel { session_url } => self.session_cancel(&session_url).await,
            JobSpec::Download { remote_id, to } => self.download(&remote_id, &to).await,
            JobSpec::Move {
                remote_id,
                new_parent_id,
                new_name,
            } => {
                self.patch_item(&remote_id, Some(&new_parent_id), &new_name)
                    .await
            }
            JobSpec::Rename {
                remote_id,
                new_name,
            } => self.patch_item(&remote_id, None, &new_name).await,
            JobSpec::Delete { remote_id } => self.delete(&remote_id).await,
            JobSpec::GetFileInfo { remote_id } => self.file_info(&remote_id).await,
            JobSpec::GetFileList { cursor } => self.file_list(cursor.as_deref()).await,
            JobSpec::LongPoll { cursor } => self.long_poll(&cursor).await,
        }
    }

    async fn create_dir(&self, parent_id: &NodeId, name: &str) -> JobOutcome {
        let path = format!("items/{}/children", parent_id);
        let builder = match self.client.request(Method::POST, &path) {
            Ok(b) => b.json(&serde_json::json!({ "name": name, "type": "directory" })),
            Err(_) => return bad_request_outcome(),
        };
        self.expect_item(builder).await
    }

    async fn upload(
        &self,
        parent_id: &NodeId,
        name: &str,
        local_path: &Path,
        size: u64,
    ) -> JobOutcome {
        let data = match tokio::fs::read(local_path).await {
            Ok(data) => data,
            Err(err) => {
                debug!(path = %local_path.display(), error = %err, "Upload source unreadable");
                return JobOutcome::failed(ExitCode::SystemError, ExitCause::FileAccessError);
            }
        };
        if data.len() as u64 != size {
            // the file changed under us between snapshot and upload
            return JobOutcome::failed(ExitCode::NeedRestart, ExitCause::UnexpectedFileSystemEvent);
        }

        let path = format!("items/{}/children/{}/content", parent_id, name);
        let builder = match self.client.request(Method::PUT, &path) {
            Ok(b) => b
                .header("Content-Type", "application/octet-stream")
                .body(data),
            Err(_) => return bad_request_outcome(),
        };
        self.expect_item(builder).await
    }

    async fn session_start(&self, parent_id: &NodeId, name: &str, total_size: u64) -> JobOutcome {
        let path = format!("items/{}/children/{}/upload_session", parent_id, name);
        let builder = match self.client.request(Method::POST, &path) {
            Ok(b) => b.json(&serde_json::json!({ "totalSize": total_size })),
            Err(_) => return bad_request_outcome(),
        };

        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        match response.json::<SessionResponse>().await {
            Ok(session) => JobOutcome::ok(JobPayload::SessionUrl(session.session_url)),
            Err(_) => JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr),
        }
    }

    async fn session_chunk(
        &self,
        session_url: &str,
        offset: u64,
        total_size: u64,
        data: Vec<u8>,
    ) -> JobOutcome {
        let range_end = offset + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", offset, range_end, total_size);
        let builder = self
            .client
            .request_absolute(Method::PUT, session_url)
            .header("Content-Length", data.len().to_string())
            .header("Content-Range", content_range)
            .body(data);

        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        JobOutcome::ok(JobPayload::None)
    }

    async fn session_finish(&self, session_url: &str) -> JobOutcome {
        let url = format!("{}/finish", session_url);
        let builder = self.client.request_absolute(Method::POST, &url);
        self.expect_item(builder).await
    }

    async fn session_cancel(&self, session_url: &str) -> JobOutcome {
        let builder = self.client.request_absolute(Method::DELETE, session_url);
        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        JobOutcome::ok(JobPayload::None)
    }

    async fn download(&self, remote_id: &NodeId, to: &Path) -> JobOutcome {
        let path = format!("items/{}/content", remote_id);
        let builder = match self.client.request(Method::GET, &path) {
            Ok(b) => b,
            Err(_) => return bad_request_outcome(),
        };

        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return JobOutcome::failed(ExitCode::NetworkError, ExitCause::Unknown),
        };

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());
        let size = bytes.len() as u64;

        if let Err(err) = tokio::fs::write(to, &bytes).await {
            debug!(path = %to.display(), error = %err, "Failed to write download");
            return JobOutcome::failed(ExitCode::SystemError, ExitCause::FileAccessError);
        }

        JobOutcome::ok(JobPayload::Downloaded {
            path: to.to_path_buf(),
            size,
            hash,
        })
    }

    async fn patch_item(
        &self,
        remote_id: &NodeId,
        new_parent_id: Option<&NodeId>,
        new_name: &str,
    ) -> JobOutcome {
        let path = format!("items/{}", remote_id);
        let body = match new_parent_id {
            Some(parent) => {
                serde_json::json!({ "parentId": parent.as_str(), "name": new_name })
            }
            None => serde_json::json!({ "name": new_name }),
        };
        let builder = match self.client.request(Method::PATCH, &path) {
            Ok(b) => b.json(&body),
            Err(_) => return bad_request_outcome(),
        };
        self.expect_item(builder).await
    }

    async fn delete(&self, remote_id: &NodeId) -> JobOutcome {
        let path = format!("items/{}", remote_id);
        let builder = match self.client.request(Method::DELETE, &path) {
            Ok(b) => b,
            Err(_) => return bad_request_outcome(),
        };
        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        JobOutcome::ok(JobPayload::None)
    }

    async fn file_info(&self, remote_id: &NodeId) -> JobOutcome {
        let path = format!("items/{}", remote_id);
        let builder = match self.client.request(Method::GET, &path) {
            Ok(b) => b,
            Err(_) => return bad_request_outcome(),
        };
        self.expect_item(builder).await
    }

    async fn file_list(&self, cursor: Option<&str>) -> JobOutcome {
        let path = match cursor {
            Some(cursor) => format!("changes?cursor={}", cursor),
            None => "changes".to_string(),
        };
        let builder = match self.client.request(Method::GET, &path) {
            Ok(b) => b,
            Err(_) => return bad_request_outcome(),
        };
        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        match response.json::<FileListPage>().await {
            Ok(page) => JobOutcome::ok(JobPayload::List(page)),
            Err(_) => JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr),
        }
    }

    async fn long_poll(&self, cursor: &str) -> JobOutcome {
        let path = format!("changes/poll?cursor={}", cursor);
        let builder = match self.client.request(Method::GET, &path) {
            Ok(b) => b,
            Err(_) => return bad_request_outcome(),
        };
        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        match response.json::<PollResponse>().await {
            Ok(poll) => JobOutcome::ok(JobPayload::Changed(poll.changed)),
            Err(_) => JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr),
        }
    }

    /// Sends a request whose success body is a [`RemoteItem`].
    async fn expect_item(&self, builder: reqwest::RequestBuilder) -> JobOutcome {
        let response = match self.client.send(builder).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if !response.status().is_success() {
            return self.client.outcome_from_status(&response).await;
        }
        match response.json::<RemoteItem>().await {
            Ok(item) => JobOutcome::ok(JobPayload::Item(item)),
            Err(_) => JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr),
        }
    }
}

fn bad_request_outcome() -> JobOutcome {
    JobOutcome::failed(ExitCode::SystemError, ExitCause::Unknown)
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn run(&self, spec: JobSpec, cancel: &CancellationToken) -> JobOutcome {
        let label = spec.label();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job = label, "Job aborted");
                JobOutcome::failed(ExitCode::OperationCanceled, ExitCause::Unknown)
            }
            outcome = self.execute(spec) => outcome,
        }
    }
}
