//! Job specifications and outcomes
//!
//! A [`JobSpec`] is one request against the remote replica; the variants form
//! a closed set with a common result protocol (spec'd as a tagged union, not
//! an inheritance tree). The outcome carries the stage-level `(code, cause)`
//! pair plus a typed payload.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use pairdrive_core::domain::{ExitCause, ExitCode, NodeId};

/// One remote item as reported by the drive API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub can_write: Option<bool>,
}

/// One page of the remote change feed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListPage {
    pub items: Vec<RemoteItem>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Requests the job layer can execute
#[derive(Debug, Clone)]
pub enum JobSpec {
    CreateDir {
        parent_id: NodeId,
        name: String,
    },
    /// Single-request upload for small files.
    Upload {
        parent_id: NodeId,
        name: String,
        local_path: PathBuf,
        size: u64,
    },
    UploadSessionStart {
        parent_id: NodeId,
        name: String,
        total_size: u64,
    },
    UploadSessionChunk {
        session_url: String,
        offset: u64,
        total_size: u64,
        data: Vec<u8>,
    },
    UploadSessionFinish {
        session_url: String,
    },
    UploadSessionCancel {
        session_url: String,
    },
    /// Download remote content to a caller-chosen temporary path.
    Download {
        remote_id: NodeId,
        to: PathBuf,
    },
    Move {
        remote_id: NodeId,
        new_parent_id: NodeId,
        new_name: String,
    },
    Rename {
        remote_id: NodeId,
        new_name: String,
    },
    Delete {
        remote_id: NodeId,
    },
    GetFileInfo {
        remote_id: NodeId,
    },
    GetFileList {
        cursor: Option<String>,
    },
    LongPoll {
        cursor: String,
    },
}

impl JobSpec {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobSpec::CreateDir { .. } => "create_dir",
            JobSpec::Upload { .. } => "upload",
            JobSpec::UploadSessionStart { .. } => "upload_session_start",
            JobSpec::UploadSessionChunk { .. } => "upload_session_chunk",
            JobSpec::UploadSessionFinish { .. } => "upload_session_finish",
            JobSpec::UploadSessionCancel { .. } => "upload_session_cancel",
            JobSpec::Download { .. } => "download",
            JobSpec::Move { .. } => "move",
            JobSpec::Rename { .. } => "rename",
            JobSpec::Delete { .. } => "delete",
            JobSpec::GetFileInfo { .. } => "get_file_info",
            JobSpec::GetFileList { .. } => "get_file_list",
            JobSpec::LongPoll { .. } => "long_poll",
        }
    }
}

/// Typed result data of a completed job
#[derive(Debug, Clone, Default)]
pub enum JobPayload {
    #[default]
    None,
    Item(RemoteItem),
    List(FileListPage),
    SessionUrl(String),
    Downloaded {
        path: PathBuf,
        size: u64,
        hash: String,
    },
    /// LongPoll: whether the feed has new entries.
    Changed(bool),
}

/// Result of one job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub code: ExitCode,
    pub cause: ExitCause,
    pub payload: JobPayload,
    /// Server-requested delay before the next attempt (429 Retry-After).
    pub retry_after: Option<Duration>,
}

impl JobOutcome {
    pub fn ok(payload: JobPayload) -> Self {
        Self {
            code: ExitCode::Ok,
            cause: ExitCause::Unknown,
            payload,
            retry_after: None,
        }
    }

    pub fn failed(code: ExitCode, cause: ExitCause) -> Self {
        Self {
            code,
            cause,
            payload: JobPayload::None,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn item(&self) -> Option<&RemoteItem> {
        match &self.payload {
            JobPayload::Item(item) => Some(item),
            _ => None,
        }
    }
}
