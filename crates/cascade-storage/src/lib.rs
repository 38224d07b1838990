// Contract between the core and the durable log storage substrate.
//
// The substrate is pluggable; the core only relies on append, async tail
// reads with gap notifications, and time-to-seqno lookup. Callbacks may
// refuse a delivery to signal back-pressure, in which case the substrate
// retries the same record or gap later.
use bytes::Bytes;
use cascade_common::{GapKind, LogId, SequenceNumber};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub mod memory;

pub use memory::MemoryLogStorage;

pub type Result<T> = cascade_common::Result<T>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Instant sentinel for `find_time` meaning "the tail of the log".
pub const FIND_TIME_TAIL: u64 = u64::MAX;

/// One record read back from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub log_id: LogId,
    pub seqno: SequenceNumber,
    pub payload: Bytes,
}

/// A hole in a log: the range `[from, to]` holds no readable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
    pub log_id: LogId,
    pub kind: GapKind,
    pub from: SequenceNumber,
    pub to: SequenceNumber,
}

/// Invoked by the substrate for each record a reader reaches. Returning
/// `Err(record)` hands the record back for a later retry.
pub type RecordCallback = Box<dyn FnMut(LogRecord) -> std::result::Result<(), LogRecord> + Send>;

/// Invoked for each gap a reader reaches. Returning `false` asks the
/// substrate to redeliver the gap later.
pub type GapCallback = Box<dyn FnMut(GapRecord) -> bool + Send>;

/// A long-lived storage cursor that can tail multiple logs over its
/// lifetime. Opening an already-open log repositions the cursor.
pub trait AsyncLogReader: Send {
    fn open(&mut self, log_id: LogId, seqno: SequenceNumber) -> Result<()>;
    fn close(&mut self, log_id: LogId) -> Result<()>;
}

pub trait LogStorage: Send + Sync {
    /// Appends a payload, returning the sequence number it was assigned.
    fn append(&self, log_id: LogId, payload: Bytes) -> BoxFuture<'_, Result<SequenceNumber>>;

    /// Creates one async reader delivering through the given callbacks.
    /// The tailer calls this once per reader slot.
    fn create_reader(
        &self,
        on_record: RecordCallback,
        on_gap: GapCallback,
    ) -> Result<Box<dyn AsyncLogReader>>;

    /// Resolves the sequence number active at `instant_ms` (milliseconds
    /// since the epoch). The sentinel [`FIND_TIME_TAIL`] skips the search
    /// and returns the next sequence number to be assigned. Fails with
    /// `Status::TimedOut` when the deadline expires first.
    fn find_time(
        &self,
        log_id: LogId,
        instant_ms: u64,
        deadline: Duration,
    ) -> BoxFuture<'_, Result<SequenceNumber>>;
}
