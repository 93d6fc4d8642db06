//! Chunked upload session state machine
//!
//! A chunked upload is `start → chunk × N → finish | cancel`. The session is
//! an explicit state-machine value rather than nested async scopes so abort
//! and retry semantics stay exact: a failed chunk retries without touching
//! the state, and cancel is valid from any started state.
//!
//! The session lifecycle is guarded by a mutex where it is shared, because
//! abort can come from a different task than the worker driving the chunks.

use pairdrive_core::domain::NodeId;

use crate::spec::{JobSpec, RemoteItem};

/// Lifecycle of one upload session
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Created, no start request sent yet.
    Pending,
    /// Start acknowledged; chunks are being sent.
    Started { session_url: String, offset: u64 },
    /// Finish acknowledged; the remote item is final.
    Finished(Box<RemoteItem>),
    Cancelled,
}

/// One chunked upload
#[derive(Debug, Clone)]
pub struct UploadSession {
    parent_id: NodeId,
    name: String,
    total_size: u64,
    chunk_size: u64,
    state: SessionState,
}

/// Invalid lifecycle transitions are programming errors surfaced as values,
/// not panics, because the executor drives the machine from retry loops.
#[derive(Debug, thiserror::Error)]
#[error("invalid upload session transition: {0}")]
pub struct SessionError(&'static str);

impl UploadSession {
    pub fn new(parent_id: NodeId, name: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            parent_id,
            name: name.into(),
            total_size,
            chunk_size: chunk_size.max(1),
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// The start request. Valid only while pending.
    pub fn start_spec(&self) -> Result<JobSpec, SessionError> {
        match self.state {
            SessionState::Pending => Ok(JobSpec::UploadSessionStart {
                parent_id: self.parent_id.clone(),
                name: self.name.clone(),
                total_size: self.total_size,
            }),
            _ => Err(SessionError("start after start")),
        }
    }

    /// Records the session URL returned by the start request.
    pub fn mark_started(&mut self, session_url: String) -> Result<(), SessionError> {
        match self.state {
            SessionState::Pending => {
                self.state = SessionState::Started {
                    session_url,
                    offset: 0,
                };
                Ok(())
            }
            _ => Err(SessionError("started twice")),
        }
    }

    /// Byte range of the next chunk, or `None` when all bytes are sent.
    pub fn next_chunk_range(&self) -> Option<(u64, u64)> {
        match &self.state {
            SessionState::Started { offset, .. } if *offset < self.total_size => {
                let len = self.chunk_size.min(self.total_size - offset);
                Some((*offset, len))
            }
            _ => None,
        }
    }

    /// The request for the next chunk, given its bytes.
    ///
    /// The state does not advance until [`mark_chunk_done`](Self::mark_chunk_done);
    /// a failed chunk request is simply rebuilt and retried.
    pub fn chunk_spec(&self, data: Vec<u8>) -> Result<JobSpec, SessionError> {
        match &self.state {
            SessionState::Started {
                session_url,
                offset,
            } => Ok(JobSpec::UploadSessionChunk {
                session_url: session_url.clone(),
                offset: *offset,
                total_size: self.total_size,
                data,
            }),
            _ => Err(SessionError("chunk outside started session")),
        }
    }

    pub fn mark_chunk_done(&mut self, bytes: u64) -> Result<(), SessionError> {
        match &mut self.state {
            SessionState::Started { offset, .. } => {
                *offset += bytes;
                if *offset > self.total_size {
                    return Err(SessionError("chunk overrun"));
                }
                Ok(())
            }
            _ => Err(SessionError("chunk outside started session")),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(&self.state, SessionState::Started { offset, .. } if *offset == self.total_size)
    }

    pub fn finish_spec(&self) -> Result<JobSpec, SessionError> {
        match &self.state {
            SessionState::Started { session_url, .. } if self.is_complete() => {
                Ok(JobSpec::UploadSessionFinish {
                    session_url: session_url.clone(),
                })
            }
            SessionState::Started { .. } => Err(SessionError("finish before last chunk")),
            _ => Err(SessionError("finish outside started session")),
        }
    }

    pub fn mark_finished(&mut self, item: RemoteItem) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Started { .. } => {
                self.state = SessionState::Finished(Box::new(item));
                Ok(())
            }
            _ => Err(SessionError("finished outside started session")),
        }
    }

    /// Cancel is valid from any state after start; a pending session has
    /// nothing to cancel remotely.
    pub fn cancel_spec(&self) -> Option<JobSpec> {
        match &self.state {
            SessionState::Started { session_url, .. } => Some(JobSpec::UploadSessionCancel {
                session_url: session_url.clone(),
            }),
            _ => None,
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.state = SessionState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UploadSession {
        UploadSession::new(NodeId::new("parent"), "big.bin", 25, 10)
    }

    fn remote_item() -> RemoteItem {
        serde_json::from_str(r#"{"id": "new", "name": "big.bin", "size": 25}"#).unwrap()
    }

    #[test]
    fn test_happy_path_three_chunks() {
        let mut session = session();
        assert!(matches!(session.state(), SessionState::Pending));

        session.start_spec().unwrap();
        session.mark_started("http://upload/session-1".to_string()).unwrap();

        let mut chunks = Vec::new();
        while let Some((offset, len)) = session.next_chunk_range() {
            chunks.push((offset, len));
            session.chunk_spec(vec![0u8; len as usize]).unwrap();
            session.mark_chunk_done(len).unwrap();
        }
        assert_eq!(chunks, vec![(0, 10), (10, 10), (20, 5)]);
        assert!(session.is_complete());

        session.finish_spec().unwrap();
        session.mark_finished(remote_item()).unwrap();
        assert!(matches!(session.state(), SessionState::Finished(_)));
    }

    #[test]
    fn test_failed_chunk_retries_at_same_offset() {
        let mut session = session();
        session.mark_started("http://upload/s".to_string()).unwrap();

        let (offset, len) = session.next_chunk_range().unwrap();
        assert_eq!(offset, 0);
        // chunk request failed: state untouched, the range is handed out again
        let (offset2, len2) = session.next_chunk_range().unwrap();
        assert_eq!((offset, len), (offset2, len2));

        session.mark_chunk_done(len).unwrap();
        assert_eq!(session.next_chunk_range().unwrap().0, 10);
    }

    #[test]
    fn test_finish_before_last_chunk_rejected() {
        let mut session = session();
        session.mark_started("http://upload/s".to_string()).unwrap();
        session.mark_chunk_done(10).unwrap();
        assert!(session.finish_spec().is_err());
    }

    #[test]
    fn test_cancel_only_after_start() {
        let mut session = session();
        assert!(session.cancel_spec().is_none());

        session.mark_started("http://upload/s".to_string()).unwrap();
        assert!(session.cancel_spec().is_some());

        session.mark_cancelled();
        assert!(matches!(session.state(), SessionState::Cancelled));
        assert!(session.cancel_spec().is_none());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut session = session();
        session.mark_started("a".to_string()).unwrap();
        assert!(session.mark_started("b".to_string()).is_err());
        assert!(session.start_spec().is_err());
    }

    #[test]
    fn test_chunk_overrun_rejected() {
        let mut session = session();
        session.mark_started("a".to_string()).unwrap();
        assert!(session.mark_chunk_done(30).is_err());
    }
}
