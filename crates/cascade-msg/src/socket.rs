// One TCP connection carrying many logical streams.
//
// The worker task owns all socket state; the reader and writer halves run
// as separate tasks that communicate with the worker only through its
// event queue. The send queue keeps an unbounded overflow behind a bounded
// writer channel: writes are never dropped, but crossing the high
// watermark reports "full" so producers stop, and draining to the low
// watermark signals writable again.
use bytes::Bytes;
use cascade_common::{StreamId, TimeoutList};
use cascade_wire::{decode_payload, Message, FRAME_HEADER_LEN};
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event_loop::Event;
use crate::SocketId;

/// Stream ID reserved for socket-scoped messages (heartbeats) that are not
/// bound to any particular stream. Allocators never hand out zero.
pub const SOCKET_SCOPE_STREAM: StreamId = 0;

/// Capacity of the channel feeding the writer task. Everything beyond it
/// waits in the worker-owned overflow queue.
const WRITER_CHANNEL_CAPACITY: usize = 64;

pub(crate) struct SocketState {
    pub id: SocketId,
    pub dest: Option<SocketAddr>,
    pub is_inbound: bool,
    /// Present once the connection is established.
    writer_tx: Option<mpsc::Sender<Bytes>>,
    /// Overflow behind the writer channel, also buffers frames written
    /// while an outbound connection is still being established.
    pending: VecDeque<Bytes>,
    pub writable: bool,
    /// Wire IDs of streams currently multiplexed on this socket.
    pub streams: BTreeSet<StreamId>,
    read_enabled: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    high_watermark: usize,
    low_watermark: usize,

    last_heartbeat_flush: Instant,
    /// Healthy set included in the last flushed heartbeat; `None` until
    /// the first full heartbeat has been sent.
    sent_heartbeats: Option<Vec<StreamId>>,
    /// Healthy set as reported by the peer.
    healthy_remote: BTreeSet<StreamId>,
    heartbeat_arrivals: TimeoutList<StreamId>,
}

impl SocketState {
    pub fn new(id: SocketId, dest: Option<SocketAddr>, is_inbound: bool, send_queue_size: usize) -> Self {
        Self {
            id,
            dest,
            is_inbound,
            writer_tx: None,
            pending: VecDeque::new(),
            writable: true,
            streams: BTreeSet::new(),
            read_enabled: None,
            tasks: Vec::new(),
            high_watermark: send_queue_size.max(2),
            low_watermark: (send_queue_size.max(2)) / 2,
            last_heartbeat_flush: Instant::now(),
            sent_heartbeats: None,
            healthy_remote: BTreeSet::new(),
            heartbeat_arrivals: TimeoutList::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer_tx.is_some()
    }

    /// Wires an established connection up to reader and writer tasks and
    /// flushes any frames queued while connecting.
    pub fn attach(&mut self, tcp: TcpStream, event_tx: mpsc::Sender<Event>, max_frame_bytes: usize) {
        let _ = tcp.set_nodelay(true);
        let (read_half, write_half) = tcp.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (read_enabled_tx, read_enabled_rx) = watch::channel(true);
        let socket_id = self.id;
        self.tasks.push(tokio::spawn(run_reader(
            socket_id,
            read_half,
            event_tx.clone(),
            read_enabled_rx,
            max_frame_bytes,
        )));
        self.tasks
            .push(tokio::spawn(run_writer(socket_id, write_half, writer_rx, event_tx)));
        self.writer_tx = Some(writer_tx);
        self.read_enabled = Some(read_enabled_tx);
        self.flush_pending();
    }

    /// Enqueues a frame. The frame is always accepted; the return value is
    /// `false` once the queue crosses its high watermark, telling the
    /// producer to stop until writable fires.
    pub fn enqueue_frame(&mut self, frame: Bytes) -> bool {
        metrics::counter!("msg_socket_writes").increment(1);
        self.pending.push_back(frame);
        self.flush_pending();
        if self.queued_frames() >= self.high_watermark {
            self.writable = false;
        }
        self.writable
    }

    pub fn flush_pending(&mut self) {
        let Some(writer_tx) = &self.writer_tx else {
            return;
        };
        while let Some(frame) = self.pending.pop_front() {
            match writer_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    self.pending.push_front(frame);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(frame)) => {
                    self.pending.push_front(frame);
                    break;
                }
            }
        }
    }

    pub fn queued_frames(&self) -> usize {
        let in_channel = self
            .writer_tx
            .as_ref()
            .map_or(0, |tx| WRITER_CHANNEL_CAPACITY - tx.capacity());
        self.pending.len() + in_channel
    }

    /// Re-evaluates the writable flag; returns `true` when the socket just
    /// drained below the low watermark.
    pub fn poll_writable(&mut self) -> bool {
        self.flush_pending();
        if !self.writable && self.is_connected() && self.queued_frames() <= self.low_watermark {
            self.writable = true;
            return true;
        }
        false
    }

    pub fn set_read_enabled(&mut self, enabled: bool) {
        if let Some(read_enabled) = &self.read_enabled {
            let _ = read_enabled.send(enabled);
        }
    }

    pub fn register_stream(&mut self, wire_id: StreamId) {
        self.streams.insert(wire_id);
    }

    /// Removes a stream; returns `true` when this was the last one.
    pub fn remove_stream(&mut self, wire_id: StreamId) -> bool {
        self.streams.remove(&wire_id);
        self.healthy_remote.remove(&wire_id);
        self.heartbeat_arrivals.remove(&wire_id);
        self.streams.is_empty()
    }

    /// Builds the aggregated heartbeat due on this tick, if any. The first
    /// flush is a full heartbeat; later flushes are deltas against the
    /// previously sent set (both halves in ascending order).
    pub fn heartbeat_due(&mut self, interval: Duration, tenant: cascade_common::TenantId) -> Option<Message> {
        if !self.is_connected() || self.last_heartbeat_flush.elapsed() < interval {
            return None;
        }
        self.last_heartbeat_flush = Instant::now();
        let current: Vec<StreamId> = self.streams.iter().copied().collect();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        match &self.sent_heartbeats {
            None => {
                self.sent_heartbeats = Some(current.clone());
                Some(Message::Heartbeat {
                    tenant,
                    timestamp_ms,
                    healthy_streams: current,
                })
            }
            Some(previous) => {
                let added: Vec<StreamId> = current
                    .iter()
                    .copied()
                    .filter(|id| previous.binary_search(id).is_err())
                    .collect();
                let removed: Vec<StreamId> = previous
                    .iter()
                    .copied()
                    .filter(|id| current.binary_search(id).is_err())
                    .collect();
                self.sent_heartbeats = Some(current);
                Some(Message::HeartbeatDelta {
                    tenant,
                    timestamp_ms,
                    added,
                    removed,
                })
            }
        }
    }

    /// Applies a received heartbeat or delta to the remote-healthy set and
    /// refreshes arrival times for every healthy stream.
    pub fn apply_heartbeat(&mut self, message: &Message) {
        match message {
            Message::Heartbeat {
                healthy_streams, ..
            } => {
                self.healthy_remote = healthy_streams.iter().copied().collect();
            }
            Message::HeartbeatDelta { added, removed, .. } => {
                for id in added {
                    self.healthy_remote.insert(*id);
                }
                for id in removed {
                    self.healthy_remote.remove(id);
                }
            }
            _ => return,
        }
        for id in self.healthy_remote.clone() {
            self.heartbeat_arrivals.touch(id);
        }
    }

    /// Streams that have not seen a heartbeat within the timeout. The
    /// socket stays open; upper layers decide what an unhealthy stream
    /// means for them.
    pub fn expired_streams(&mut self, timeout: Duration) -> Vec<StreamId> {
        let expired = self.heartbeat_arrivals.expire_older_than(timeout);
        if !expired.is_empty() {
            metrics::counter!("msg_heartbeat_timeouts").increment(expired.len() as u64);
        }
        for id in &expired {
            self.healthy_remote.remove(id);
        }
        expired
    }

    #[cfg(test)]
    pub fn healthy_remote(&self) -> &BTreeSet<StreamId> {
        &self.healthy_remote
    }

    /// Tears the socket down: the writer channel is dropped (discarding
    /// queued frames) and both IO tasks are aborted.
    pub fn abort(&mut self) {
        self.writer_tx = None;
        self.pending.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SocketState {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Reads frames off the socket in a strict header/body state machine and
/// forwards decoded messages to the owning worker. Any parse error is
/// fatal to the socket.
async fn run_reader(
    socket: SocketId,
    mut read_half: OwnedReadHalf,
    event_tx: mpsc::Sender<Event>,
    mut read_enabled: watch::Receiver<bool>,
    max_frame_bytes: usize,
) {
    let mut header = [0u8; FRAME_HEADER_LEN];
    loop {
        // Honor back-pressure: reads stay disabled until the implicated
        // sink drains.
        while !*read_enabled.borrow() {
            if read_enabled.changed().await.is_err() {
                return;
            }
        }
        match read_half.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) => {
                let graceful = err.kind() == std::io::ErrorKind::UnexpectedEof;
                let _ = event_tx
                    .send(Event::SocketClosed {
                        socket,
                        error: (!graceful).then(|| err.to_string()),
                    })
                    .await;
                return;
            }
        }
        let length = match cascade_wire::decode_frame_header(&header, max_frame_bytes) {
            Ok(length) => length,
            Err(err) => {
                let _ = event_tx
                    .send(Event::SocketClosed {
                        socket,
                        error: Some(err.to_string()),
                    })
                    .await;
                return;
            }
        };
        let mut payload = vec![0u8; length];
        if let Err(err) = read_half.read_exact(&mut payload).await {
            let _ = event_tx
                .send(Event::SocketClosed {
                    socket,
                    error: Some(err.to_string()),
                })
                .await;
            return;
        }
        match decode_payload(Bytes::from(payload)) {
            Ok((stream, message)) => {
                metrics::counter!("msg_frames_in").increment(1);
                if event_tx
                    .send(Event::Inbound {
                        socket,
                        stream,
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                let _ = event_tx
                    .send(Event::SocketClosed {
                        socket,
                        error: Some(err.to_string()),
                    })
                    .await;
                return;
            }
        }
    }
}

async fn run_writer(
    socket: SocketId,
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<Event>,
) {
    while let Some(frame) = writer_rx.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            let _ = event_tx
                .send(Event::SocketClosed {
                    socket,
                    error: Some(err.to_string()),
                })
                .await;
            return;
        }
        metrics::counter!("msg_frames_out").increment(1);
    }
    // Channel closed: the worker dropped the socket; flush and finish.
    let _ = write_half.shutdown().await;
}

/// Establishes an outbound connection within the deadline and reports the
/// outcome to the owning worker.
pub(crate) async fn run_connect(
    socket: SocketId,
    dest: SocketAddr,
    timeout: Duration,
    event_tx: mpsc::Sender<Event>,
) {
    let result = tokio::time::timeout(timeout, TcpStream::connect(dest)).await;
    let event = match result {
        Ok(Ok(tcp)) => Event::Connected { socket, tcp },
        Ok(Err(err)) => Event::ConnectFailed {
            socket,
            error: err.to_string(),
        },
        Err(_) => Event::ConnectFailed {
            socket,
            error: "connect deadline expired".to_string(),
        },
    };
    let _ = event_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket() -> SocketState {
        SocketState::new(1, None, true, 8)
    }

    #[test]
    fn first_heartbeat_is_full_then_deltas() {
        let mut socket = test_socket();
        // Pretend the socket is connected so heartbeats flush.
        let (tx, _rx) = mpsc::channel(1);
        socket.writer_tx = Some(tx);
        socket.register_stream(1);
        socket.register_stream(2);
        socket.register_stream(3);
        socket.last_heartbeat_flush = Instant::now() - Duration::from_secs(10);

        let first = socket.heartbeat_due(Duration::from_secs(1), 1).expect("first");
        match first {
            Message::Heartbeat {
                healthy_streams, ..
            } => assert_eq!(healthy_streams, vec![1, 2, 3]),
            other => panic!("expected full heartbeat, got {other:?}"),
        }

        // {1,2,3} -> {1,3,4}: delta must be added=[4], removed=[2].
        socket.remove_stream(2);
        socket.register_stream(4);
        socket.last_heartbeat_flush = Instant::now() - Duration::from_secs(10);
        let second = socket.heartbeat_due(Duration::from_secs(1), 1).expect("second");
        match second {
            Message::HeartbeatDelta { added, removed, .. } => {
                assert_eq!(added, vec![4]);
                assert_eq!(removed, vec![2]);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn applying_heartbeats_reconstructs_healthy_set() {
        let mut socket = test_socket();
        socket.apply_heartbeat(&Message::Heartbeat {
            tenant: 1,
            timestamp_ms: 0,
            healthy_streams: vec![1, 2, 3],
        });
        socket.apply_heartbeat(&Message::HeartbeatDelta {
            tenant: 1,
            timestamp_ms: 0,
            added: vec![4],
            removed: vec![2],
        });
        let healthy: Vec<StreamId> = socket.healthy_remote().iter().copied().collect();
        assert_eq!(healthy, vec![1, 3, 4]);
    }

    #[test]
    fn expired_streams_leave_the_healthy_set() {
        let mut socket = test_socket();
        socket.apply_heartbeat(&Message::Heartbeat {
            tenant: 1,
            timestamp_ms: 0,
            healthy_streams: vec![7],
        });
        std::thread::sleep(Duration::from_millis(2));
        let expired = socket.expired_streams(Duration::from_millis(1));
        assert_eq!(expired, vec![7]);
        assert!(socket.healthy_remote().is_empty());
    }

    #[test]
    fn watermarks_gate_writability() {
        let mut socket = SocketState::new(1, None, true, 4);
        // Not connected: everything lands in the overflow queue.
        assert!(socket.enqueue_frame(Bytes::from_static(b"a")));
        assert!(socket.enqueue_frame(Bytes::from_static(b"b")));
        assert!(socket.enqueue_frame(Bytes::from_static(b"c")));
        // Fourth frame reaches the high watermark.
        assert!(!socket.enqueue_frame(Bytes::from_static(b"d")));
        assert!(!socket.writable);
        // Draining is observed through poll_writable once connected.
        assert_eq!(socket.queued_frames(), 4);
    }

    #[test]
    fn removing_last_stream_reports_empty() {
        let mut socket = test_socket();
        socket.register_stream(5);
        socket.register_stream(6);
        assert!(!socket.remove_stream(5));
        assert!(socket.remove_stream(6));
    }
}
