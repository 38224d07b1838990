// Log tailer: a fixed pool of storage reader slots shared across logs.
//
// Storage callbacks run on the substrate's threads; they decode the
// record and forward it onto the tailer task over a bounded queue. A full
// queue is reported back to the substrate as back-pressure so it retries.
// The tailer task verifies ordering against each reader's expected
// position, then routes records to the owning room.
use cascade_common::{GapKind, LogId, SequenceNumber, Status};
use cascade_router::room_for_topic;
use cascade_storage::{AsyncLogReader, GapRecord, LogStorage, RecordCallback};
use cascade_wire::DataMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::room::RoomCommand;

#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// Bound on the storage-to-room queue.
    pub queue_size: usize,
    /// Test-only knob: probability that forwarding a record into the
    /// tailer queue is forced to fail, exercising the substrate's retry
    /// path. Never set by production configuration.
    pub fault_forward_failure_rate: f64,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            fault_forward_failure_rate: 0.0,
        }
    }
}

pub(crate) enum TailerCommand {
    StartReading {
        log_id: LogId,
        start: SequenceNumber,
        /// True for a new subscription (takes a reference on the log),
        /// false when an existing subscription is merely repositioned.
        acquire: bool,
    },
    StopReading {
        log_id: LogId,
    },
    Record {
        reader: usize,
        log_id: LogId,
        seqno: SequenceNumber,
        data: DataMessage,
    },
    Gap {
        reader: usize,
        gap: GapRecord,
    },
}

struct OpenLog {
    expected: SequenceNumber,
    refcount: usize,
}

struct ReaderSlot {
    handle: Box<dyn AsyncLogReader>,
    open_logs: HashMap<LogId, OpenLog>,
}

pub(crate) struct LogTailer {
    readers: Vec<ReaderSlot>,
    /// Which reader slot serves each open log.
    assignments: HashMap<LogId, usize>,
    rooms: Vec<mpsc::Sender<RoomCommand>>,
    num_rooms: usize,
}

impl LogTailer {
    /// Creates the reader slots and returns the tailer plus both sides of
    /// its queue. The sender is shared by rooms (start/stop commands) and
    /// the storage callbacks (records and gaps); the caller spawns
    /// [`LogTailer::run`] with the receiver.
    pub fn new(
        storage: &Arc<dyn LogStorage>,
        options: &TailerOptions,
        num_readers: usize,
        rooms: Vec<mpsc::Sender<RoomCommand>>,
    ) -> cascade_common::Result<(
        Self,
        mpsc::Sender<TailerCommand>,
        mpsc::Receiver<TailerCommand>,
    )> {
        if num_readers == 0 {
            return Err(Status::InvalidArgument("num_readers must be positive".into()));
        }
        let (tx, rx) = mpsc::channel(options.queue_size);
        let mut readers = Vec::with_capacity(num_readers);
        for reader_index in 0..num_readers {
            let record_cb = make_record_callback(
                reader_index,
                tx.clone(),
                options.fault_forward_failure_rate,
            );
            let gap_tx = tx.clone();
            let gap_cb = Box::new(move |gap: GapRecord| {
                match gap_tx.try_send(TailerCommand::Gap {
                    reader: reader_index,
                    gap,
                }) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => false,
                    Err(mpsc::error::TrySendError::Closed(_)) => true,
                }
            });
            let handle = storage.create_reader(record_cb, gap_cb)?;
            readers.push(ReaderSlot {
                handle,
                open_logs: HashMap::new(),
            });
        }
        let num_rooms = rooms.len();
        let tailer = Self {
            readers,
            assignments: HashMap::new(),
            rooms,
            num_rooms,
        };
        Ok((tailer, tx, rx))
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<TailerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                TailerCommand::StartReading {
                    log_id,
                    start,
                    acquire,
                } => self.start_reading(log_id, start, acquire),
                TailerCommand::StopReading { log_id } => self.stop_reading(log_id),
                TailerCommand::Record {
                    reader,
                    log_id,
                    seqno,
                    data,
                } => self.on_record(reader, log_id, seqno, data).await,
                TailerCommand::Gap { reader, gap } => self.on_gap(reader, gap).await,
            }
        }
    }

    /// Opens the log on a reader slot, or repositions the slot serving it
    /// when the new subscriber needs earlier records. Overlapping ranges
    /// share one reader position held at the minimum requested start;
    /// per-subscription filtering happens at fan-out in the rooms.
    fn start_reading(&mut self, log_id: LogId, start: SequenceNumber, acquire: bool) {
        if let Some(&reader_index) = self.assignments.get(&log_id) {
            let slot = &mut self.readers[reader_index];
            let open = slot.open_logs.get_mut(&log_id).expect("assigned log open");
            if acquire {
                open.refcount += 1;
            }
            if start < open.expected {
                if let Err(err) = slot.handle.open(log_id, start) {
                    tracing::error!(log_id, start, error = %err, "reader reposition failed");
                    return;
                }
                tracing::info!(log_id, start, reader = reader_index, "reader repositioned");
                metrics::counter!("tower_readers_restarted").increment(1);
                open.expected = start;
            }
            return;
        }
        // First subscriber on this log: allocate the least-loaded reader.
        let reader_index = self
            .readers
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.open_logs.len())
            .map(|(index, _)| index)
            .expect("at least one reader");
        let slot = &mut self.readers[reader_index];
        if let Err(err) = slot.handle.open(log_id, start) {
            tracing::error!(log_id, start, error = %err, "reader open failed");
            return;
        }
        tracing::info!(log_id, start, reader = reader_index, "reader started");
        metrics::counter!("tower_readers_started").increment(1);
        slot.open_logs.insert(
            log_id,
            OpenLog {
                expected: start,
                refcount: 1,
            },
        );
        self.assignments.insert(log_id, reader_index);
    }

    fn stop_reading(&mut self, log_id: LogId) {
        let Some(&reader_index) = self.assignments.get(&log_id) else {
            return;
        };
        let slot = &mut self.readers[reader_index];
        let Some(open) = slot.open_logs.get_mut(&log_id) else {
            return;
        };
        open.refcount = open.refcount.saturating_sub(1);
        if open.refcount > 0 {
            return;
        }
        slot.open_logs.remove(&log_id);
        self.assignments.remove(&log_id);
        metrics::counter!("tower_readers_stopped").increment(1);
        if let Err(err) = slot.handle.close(log_id) {
            tracing::error!(log_id, error = %err, "reader close failed");
        } else {
            tracing::info!(log_id, reader = reader_index, "reader stopped");
        }
    }

    async fn on_record(&mut self, reader: usize, log_id: LogId, seqno: SequenceNumber, data: DataMessage) {
        let slot = &mut self.readers[reader];
        let Some(open) = slot.open_logs.get_mut(&log_id) else {
            // Log not open; can happen due to asynchrony around close.
            metrics::counter!("tower_log_records_out_of_order").increment(1);
            tracing::debug!(reader, log_id, seqno, "record on unopened log");
            return;
        };
        if open.expected != seqno {
            metrics::counter!("tower_log_records_out_of_order").increment(1);
            tracing::debug!(
                reader,
                log_id,
                expected = open.expected,
                received = seqno,
                "record out of order"
            );
            return;
        }
        open.expected = seqno + 1;
        let room = room_for_topic(&data.namespace, &data.topic, self.num_rooms);
        // Awaiting here applies back-pressure all the way to the storage
        // layer: the tailer queue fills and callbacks start refusing.
        let _ = self.rooms[room].send(RoomCommand::Record { log_id, data }).await;
    }

    async fn on_gap(&mut self, reader: usize, gap: GapRecord) {
        let slot = &mut self.readers[reader];
        let Some(open) = slot.open_logs.get_mut(&gap.log_id) else {
            metrics::counter!("tower_gap_records_out_of_order").increment(1);
            tracing::debug!(reader, log_id = gap.log_id, "gap on unopened log");
            return;
        };
        if open.expected != gap.from {
            metrics::counter!("tower_gap_records_out_of_order").increment(1);
            tracing::debug!(
                reader,
                log_id = gap.log_id,
                expected = open.expected,
                from = gap.from,
                "gap out of order"
            );
            return;
        }
        open.expected = gap.to + 1;
        match gap.kind {
            GapKind::DataLoss => {
                tracing::warn!(log_id = gap.log_id, from = gap.from, to = gap.to, "data loss")
            }
            GapKind::Retention => {
                tracing::warn!(log_id = gap.log_id, from = gap.from, to = gap.to, "retention gap")
            }
            GapKind::Benign => {
                tracing::info!(log_id = gap.log_id, from = gap.from, to = gap.to, "benign gap")
            }
        }
        // Every room may hold topics routed to this log.
        for room in &self.rooms {
            let _ = room
                .send(RoomCommand::Gap {
                    log_id: gap.log_id,
                    kind: gap.kind,
                    from: gap.from,
                    to: gap.to,
                })
                .await;
        }
    }
}

fn make_record_callback(
    reader: usize,
    tx: mpsc::Sender<TailerCommand>,
    fault_rate: f64,
) -> RecordCallback {
    Box::new(move |record| {
        if fault_rate > 0.0 && rand::random::<f64>() < fault_rate {
            tracing::debug!(reader, "forcing forward failure");
            return Err(record);
        }
        let mut payload = record.payload.clone();
        let seqno = record.seqno;
        let log_id = record.log_id;
        match DataMessage::decode_storage(&mut payload, seqno.saturating_sub(1), seqno) {
            Ok(data) => match tx.try_send(TailerCommand::Record {
                reader,
                log_id,
                seqno,
                data,
            }) {
                Ok(()) => Ok(()),
                // Re-yield the record so the storage layer retries.
                Err(mpsc::error::TrySendError::Full(_)) => Err(record),
                Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            },
            Err(err) => {
                // Corrupt payloads surface as data loss at that seqno.
                tracing::error!(log_id, seqno, error = %err, "failed to deserialize record");
                match tx.try_send(TailerCommand::Gap {
                    reader,
                    gap: GapRecord {
                        log_id,
                        kind: GapKind::DataLoss,
                        from: seqno,
                        to: seqno,
                    },
                }) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => Err(record),
                    Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
                }
            }
        }
    })
}
