// In-memory log storage used by tests and local development.
//
// Sequence numbers start at 1 and are dense per log except where gaps are
// injected. Readers honor the back-pressure contract: a refused delivery
// is retried until the callback accepts it.
use bytes::Bytes;
use cascade_common::{GapKind, LogId, SequenceNumber, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

use crate::{
    AsyncLogReader, BoxFuture, FIND_TIME_TAIL, GapCallback, GapRecord, LogRecord, LogStorage,
    RecordCallback, Result,
};

const RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
enum LogEntry {
    Record {
        seqno: SequenceNumber,
        timestamp_ms: u64,
        payload: Bytes,
    },
    Gap {
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
    },
}

impl LogEntry {
    fn first(&self) -> SequenceNumber {
        match self {
            LogEntry::Record { seqno, .. } => *seqno,
            LogEntry::Gap { from, .. } => *from,
        }
    }

    fn last(&self) -> SequenceNumber {
        match self {
            LogEntry::Record { seqno, .. } => *seqno,
            LogEntry::Gap { to, .. } => *to,
        }
    }
}

#[derive(Debug)]
struct LogState {
    entries: Vec<LogEntry>,
    next_seqno: SequenceNumber,
}

impl LogState {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seqno: 1,
        }
    }

    fn entry_covering(&self, seqno: SequenceNumber) -> Option<&LogEntry> {
        let index = self.entries.partition_point(|entry| entry.last() < seqno);
        let entry = self.entries.get(index)?;
        (entry.first() <= seqno).then_some(entry)
    }
}

#[derive(Debug)]
struct Shared {
    logs: Mutex<HashMap<LogId, LogState>>,
    append_version: watch::Sender<u64>,
}

/// In-memory implementation of the storage-substrate contract.
///
/// ```
/// use cascade_storage::{LogStorage, MemoryLogStorage};
/// use bytes::Bytes;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let storage = MemoryLogStorage::new();
///     let seqno = storage.append(1, Bytes::from_static(b"x")).await.expect("append");
///     assert_eq!(seqno, 1);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct MemoryLogStorage {
    shared: Arc<Shared>,
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        let (append_version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                logs: Mutex::new(HashMap::new()),
                append_version,
            }),
        }
    }

    /// Consumes `width` sequence numbers as a gap of the given kind.
    /// Returns the covered range.
    pub fn inject_gap(
        &self,
        log_id: LogId,
        kind: GapKind,
        width: u64,
    ) -> (SequenceNumber, SequenceNumber) {
        assert!(width > 0);
        let mut logs = self.shared.logs.lock().expect("storage lock");
        let log = logs.entry(log_id).or_insert_with(LogState::new);
        let from = log.next_seqno;
        let to = from + width - 1;
        log.entries.push(LogEntry::Gap { kind, from, to });
        log.next_seqno = to + 1;
        drop(logs);
        self.shared.append_version.send_modify(|v| *v += 1);
        (from, to)
    }

    /// Next sequence number that `append` would assign for this log.
    pub fn next_seqno(&self, log_id: LogId) -> SequenceNumber {
        let logs = self.shared.logs.lock().expect("storage lock");
        logs.get(&log_id).map_or(1, |log| log.next_seqno)
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&self, log_id: LogId, payload: Bytes) -> BoxFuture<'_, Result<SequenceNumber>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let seqno = {
                let mut logs = shared.logs.lock().expect("storage lock");
                let log = logs.entry(log_id).or_insert_with(LogState::new);
                let seqno = log.next_seqno;
                log.entries.push(LogEntry::Record {
                    seqno,
                    timestamp_ms: now_ms(),
                    payload,
                });
                log.next_seqno = seqno + 1;
                seqno
            };
            shared.append_version.send_modify(|v| *v += 1);
            Ok(seqno)
        })
    }

    fn create_reader(
        &self,
        on_record: RecordCallback,
        on_gap: GapCallback,
    ) -> Result<Box<dyn AsyncLogReader>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = ReaderTask {
            shared: Arc::clone(&self.shared),
            positions: HashMap::new(),
            on_record,
            on_gap,
        };
        tokio::spawn(task.run(cmd_rx, self.shared.append_version.subscribe()));
        Ok(Box::new(MemoryLogReader { cmd_tx }))
    }

    fn find_time(
        &self,
        log_id: LogId,
        instant_ms: u64,
        deadline: Duration,
    ) -> BoxFuture<'_, Result<SequenceNumber>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if deadline.is_zero() {
                return Err(Status::TimedOut);
            }
            let logs = shared.logs.lock().expect("storage lock");
            let Some(log) = logs.get(&log_id) else {
                // Empty log: the tail is the first seqno ever assigned.
                return Ok(1);
            };
            if instant_ms == FIND_TIME_TAIL {
                return Ok(log.next_seqno);
            }
            for entry in &log.entries {
                if let LogEntry::Record {
                    seqno, timestamp_ms, ..
                } = entry
                {
                    if *timestamp_ms >= instant_ms {
                        return Ok(*seqno);
                    }
                }
            }
            Ok(log.next_seqno)
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
enum ReaderCommand {
    Open {
        log_id: LogId,
        seqno: SequenceNumber,
    },
    Close {
        log_id: LogId,
    },
}

struct MemoryLogReader {
    cmd_tx: mpsc::UnboundedSender<ReaderCommand>,
}

impl AsyncLogReader for MemoryLogReader {
    fn open(&mut self, log_id: LogId, seqno: SequenceNumber) -> Result<()> {
        self.cmd_tx
            .send(ReaderCommand::Open { log_id, seqno })
            .map_err(|_| Status::ShutdownInProgress)
    }

    fn close(&mut self, log_id: LogId) -> Result<()> {
        self.cmd_tx
            .send(ReaderCommand::Close { log_id })
            .map_err(|_| Status::ShutdownInProgress)
    }
}

enum Delivery {
    Delivered,
    Refused,
    Idle,
}

struct ReaderTask {
    shared: Arc<Shared>,
    positions: HashMap<LogId, SequenceNumber>,
    on_record: RecordCallback,
    on_gap: GapCallback,
}

impl ReaderTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ReaderCommand>,
        mut version_rx: watch::Receiver<u64>,
    ) {
        loop {
            while let Ok(cmd) = cmd_rx.try_recv() {
                self.apply(cmd);
            }
            // Mark the current append version seen before scanning so a
            // concurrent append is picked up by the next changed() await.
            version_rx.borrow_and_update();
            match self.deliver_once() {
                Delivery::Delivered => continue,
                Delivery::Refused => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(cmd) => self.apply(cmd),
                            None => return,
                        },
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
                Delivery::Idle => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(cmd) => self.apply(cmd),
                            None => return,
                        },
                        _ = version_rx.changed() => {}
                    }
                }
            }
        }
    }

    fn apply(&mut self, cmd: ReaderCommand) {
        match cmd {
            ReaderCommand::Open { log_id, seqno } => {
                tracing::debug!(log_id, seqno, "reader opened log");
                self.positions.insert(log_id, seqno);
            }
            ReaderCommand::Close { log_id } => {
                tracing::debug!(log_id, "reader closed log");
                self.positions.remove(&log_id);
            }
        }
    }

    fn deliver_once(&mut self) -> Delivery {
        // Snapshot one deliverable item, then run the callback with the
        // storage lock released.
        let mut pending: Option<(LogId, SequenceNumber, LogEntry)> = None;
        {
            let logs = self.shared.logs.lock().expect("storage lock");
            for (&log_id, &next) in &self.positions {
                let Some(log) = logs.get(&log_id) else {
                    continue;
                };
                if let Some(entry) = log.entry_covering(next) {
                    pending = Some((log_id, next, entry.clone()));
                    break;
                }
            }
        }
        let Some((log_id, next, entry)) = pending else {
            return Delivery::Idle;
        };
        match entry {
            LogEntry::Record { seqno, payload, .. } => {
                let record = LogRecord {
                    log_id,
                    seqno,
                    payload,
                };
                match (self.on_record)(record) {
                    Ok(()) => {
                        self.positions.insert(log_id, seqno + 1);
                        Delivery::Delivered
                    }
                    Err(_refused) => Delivery::Refused,
                }
            }
            LogEntry::Gap { kind, to, .. } => {
                // Clamp the start to the reader position so a cursor opened
                // mid-gap reports only the unread part.
                let gap = GapRecord {
                    log_id,
                    kind,
                    from: next,
                    to,
                };
                if (self.on_gap)(gap) {
                    self.positions.insert(log_id, to + 1);
                    Delivery::Delivered
                } else {
                    Delivery::Refused
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting_reader(
        storage: &MemoryLogStorage,
    ) -> (
        Box<dyn AsyncLogReader>,
        mpsc::UnboundedReceiver<LogRecord>,
        mpsc::UnboundedReceiver<GapRecord>,
    ) {
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (gap_tx, gap_rx) = mpsc::unbounded_channel();
        let reader = storage
            .create_reader(
                Box::new(move |record| {
                    record_tx.send(record).expect("record channel");
                    Ok(())
                }),
                Box::new(move |gap| {
                    gap_tx.send(gap).expect("gap channel");
                    true
                }),
            )
            .expect("reader");
        (reader, record_rx, gap_rx)
    }

    #[tokio::test]
    async fn append_assigns_sequential_seqnos() {
        let storage = MemoryLogStorage::new();
        assert_eq!(storage.append(1, Bytes::from_static(b"a")).await.unwrap(), 1);
        assert_eq!(storage.append(1, Bytes::from_static(b"b")).await.unwrap(), 2);
        assert_eq!(storage.append(2, Bytes::from_static(b"c")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reader_delivers_records_in_order() {
        let storage = MemoryLogStorage::new();
        let (mut reader, mut records, _gaps) = collecting_reader(&storage);
        reader.open(1, 1).expect("open");
        storage.append(1, Bytes::from_static(b"a")).await.unwrap();
        storage.append(1, Bytes::from_static(b"b")).await.unwrap();
        let first = records.recv().await.expect("first");
        let second = records.recv().await.expect("second");
        assert_eq!((first.seqno, first.payload.as_ref()), (1, b"a".as_ref()));
        assert_eq!((second.seqno, second.payload.as_ref()), (2, b"b".as_ref()));
    }

    #[tokio::test]
    async fn reader_opened_at_later_seqno_skips_backlog() {
        let storage = MemoryLogStorage::new();
        storage.append(1, Bytes::from_static(b"old")).await.unwrap();
        storage.append(1, Bytes::from_static(b"new")).await.unwrap();
        let (mut reader, mut records, _gaps) = collecting_reader(&storage);
        reader.open(1, 2).expect("open");
        let record = records.recv().await.expect("record");
        assert_eq!(record.seqno, 2);
        assert_eq!(record.payload.as_ref(), b"new");
    }

    #[tokio::test]
    async fn refused_records_are_redelivered() {
        let storage = MemoryLogStorage::new();
        let refusals = Arc::new(AtomicUsize::new(2));
        let (record_tx, mut records) = mpsc::unbounded_channel();
        let refusals_cb = Arc::clone(&refusals);
        let mut reader = storage
            .create_reader(
                Box::new(move |record| {
                    if refusals_cb.load(Ordering::SeqCst) > 0 {
                        refusals_cb.fetch_sub(1, Ordering::SeqCst);
                        return Err(record);
                    }
                    record_tx.send(record).expect("record channel");
                    Ok(())
                }),
                Box::new(|_| true),
            )
            .expect("reader");
        reader.open(1, 1).expect("open");
        storage.append(1, Bytes::from_static(b"x")).await.unwrap();
        let record = records.recv().await.expect("record");
        assert_eq!(record.seqno, 1);
        assert_eq!(refusals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gaps_are_delivered_and_skipped() {
        let storage = MemoryLogStorage::new();
        let (mut reader, mut records, mut gaps) = collecting_reader(&storage);
        reader.open(1, 1).expect("open");
        storage.append(1, Bytes::from_static(b"a")).await.unwrap();
        let (from, to) = storage.inject_gap(1, GapKind::Retention, 3);
        storage.append(1, Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(records.recv().await.expect("record").seqno, 1);
        let gap = gaps.recv().await.expect("gap");
        assert_eq!((gap.from, gap.to), (from, to));
        assert_eq!(gap.kind, GapKind::Retention);
        assert_eq!(records.recv().await.expect("record").seqno, to + 1);
    }

    #[tokio::test]
    async fn closed_log_stops_delivering() {
        let storage = MemoryLogStorage::new();
        let (mut reader, mut records, _gaps) = collecting_reader(&storage);
        reader.open(1, 1).expect("open");
        storage.append(1, Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(records.recv().await.expect("record").seqno, 1);
        reader.close(1).expect("close");
        storage.append(1, Bytes::from_static(b"b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(records.try_recv().is_err());
    }

    #[tokio::test]
    async fn find_time_tail_sentinel_returns_next_seqno() {
        let storage = MemoryLogStorage::new();
        assert_eq!(
            storage
                .find_time(1, FIND_TIME_TAIL, Duration::from_secs(1))
                .await
                .unwrap(),
            1
        );
        storage.append(1, Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(
            storage
                .find_time(1, FIND_TIME_TAIL, Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn find_time_zero_deadline_times_out() {
        let storage = MemoryLogStorage::new();
        let err = storage
            .find_time(1, FIND_TIME_TAIL, Duration::ZERO)
            .await
            .expect_err("deadline");
        assert_eq!(err, Status::TimedOut);
    }
}
