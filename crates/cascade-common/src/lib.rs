// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod timeout_list;

pub use timeout_list::TimeoutList;

/// Status taxonomy shared by every fallible operation in the core.
///
/// ```
/// use cascade_common::Status;
///
/// let status = Status::TimedOut;
/// assert_eq!(status.to_string(), "operation timed out");
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Status {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("merge in progress")]
    MergeInProgress,
    #[error("incomplete")]
    Incomplete,
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[error("operation timed out")]
    TimedOut,
    #[error("aborted")]
    Aborted,
    #[error("busy")]
    Busy,
    #[error("expired")]
    Expired,
    #[error("not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, Status>;

/// Tenant identifier carried on every wire message.
pub type TenantId = u16;

/// Tenant reserved for unauthenticated or test traffic.
pub const GUEST_TENANT: TenantId = 1;
/// Tenant value that no valid message may carry.
pub const INVALID_TENANT: TenantId = 0;

/// Position within a single log. Monotonic per log, not per topic.
pub type SequenceNumber = u64;

/// Identifies a log in the storage substrate.
pub type LogId = u64;

/// Identifies a stream within a single physical connection. Streams are a
/// pair of unidirectional ordered channels; messages flowing in opposite
/// directions have no ordering guarantees. IDs do not need to be unique
/// system-wide.
pub type StreamId = u64;

/// Client-chosen subscription identifier, unique per stream. Zero is
/// reserved and never represents a valid subscription.
pub type SubscriptionId = u64;

/// Reserved subscription ID that doesn't represent any valid subscription.
pub const RESERVED_SUBSCRIPTION_ID: SubscriptionId = 0;

/// Compact subscriber handle interned by a control-tower room.
pub type HostNumber = u32;

pub type NamespaceId = String;
pub type Topic = String;

/// Classifies a hole in a log reported by the storage substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind {
    /// No records were lost; seqnos were consumed by internal bookkeeping.
    Benign,
    /// Records were aged out by the retention policy.
    Retention,
    /// Records were lost and cannot be recovered.
    DataLoss,
}

/// Identity of a physical endpoint, used to derive stable client IDs.
///
/// ```
/// use cascade_common::HostId;
///
/// let host = HostId::new("tower.example", 58499);
/// assert_eq!(host.to_string(), "tower.example:58499");
/// assert_eq!(host.client_id(2), "tower.example:58499c");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId {
    pub hostname: String,
    pub port: u16,
}

impl HostId {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Derives a per-worker client ID. The trailing byte distinguishes
    /// workers sharing one host and port.
    pub fn client_id(&self, worker_index: u8) -> String {
        debug_assert!(worker_index < 26);
        format!("{}:{}{}", self.hostname, self.port, (b'a' + worker_index) as char)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}
