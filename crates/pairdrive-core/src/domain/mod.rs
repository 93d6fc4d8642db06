//! Domain model shared by every pipeline stage

pub mod exit;
pub mod fsop;
pub mod ids;
pub mod name;
pub mod snapshot;

pub use exit::{ExitCause, ExitCode, StepError, StepResult};
pub use fsop::{ChangeEvents, FsOpType, FsOperation, FsOperationSet};
pub use ids::{DbNodeId, NodeId, NodeType, ReplicaSide};
pub use name::{ConflictSuffix, SuffixKind};
pub use snapshot::{Snapshot, SnapshotItem};
