// Control tower: tails storage logs and dispatches records to
// subscribers.
//
// The front-end workers route subscription metadata to rooms (one task
// per room, each owning its share of topics); the log tailer drives a
// fixed pool of storage readers and feeds records into the rooms.
use cascade_common::{LogId, Status, INVALID_TENANT};
use cascade_msg::{MsgLoop, MsgLoopHandle, MsgLoopOptions};
use cascade_router::{room_for_topic, LogRouter};
use cascade_storage::{LogStorage, FIND_TIME_TAIL};
use cascade_wire::{Message, MessageType, UnsubscribeReason};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod room;
mod tailer;
mod topic;

pub use tailer::TailerOptions;
pub use topic::{TopicManager, TopicSubscription};

use room::{ControlRoom, RoomCommand, SubscriberHandle};
use tailer::LogTailer;

pub type Result<T> = cascade_common::Result<T>;

#[derive(Debug, Clone)]
pub struct ControlTowerOptions {
    pub msg_loop: MsgLoopOptions,
    /// Topics are sharded across this many rooms.
    pub num_rooms: usize,
    /// Fixed pool of storage reader slots, independent of log count.
    pub num_readers: usize,
    /// Bound on each room's command queue.
    pub room_queue_size: usize,
    pub tailer: TailerOptions,
    /// Range of log IDs topics are routed onto.
    pub first_log: LogId,
    pub num_logs: u64,
    pub find_time_deadline: Duration,
}

impl Default for ControlTowerOptions {
    fn default() -> Self {
        Self {
            msg_loop: MsgLoopOptions::default(),
            num_rooms: 16,
            num_readers: 8,
            room_queue_size: 1024,
            tailer: TailerOptions::default(),
            first_log: 1,
            num_logs: 100_000,
            find_time_deadline: Duration::from_secs(5),
        }
    }
}

pub struct ControlTower {
    handle: MsgLoopHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlTower {
    pub async fn start(
        options: ControlTowerOptions,
        storage: Arc<dyn LogStorage>,
    ) -> Result<ControlTower> {
        if options.num_rooms == 0 {
            return Err(Status::InvalidArgument("num_rooms must be positive".into()));
        }
        let router = Arc::new(LogRouter::new(options.first_log, options.num_logs)?);

        let mut room_txs = Vec::with_capacity(options.num_rooms);
        let mut room_rxs = Vec::with_capacity(options.num_rooms);
        for _ in 0..options.num_rooms {
            let (tx, rx) = mpsc::channel(options.room_queue_size);
            room_txs.push(tx);
            room_rxs.push(rx);
        }

        let mut msg_loop = MsgLoop::new(options.msg_loop.clone());
        register_frontend(&mut msg_loop, &options, &router, &room_txs, &storage)?;
        let handle = msg_loop.start().await?;

        let (log_tailer, tailer_tx, tailer_rx) = LogTailer::new(
            &storage,
            &options.tailer,
            options.num_readers,
            room_txs.clone(),
        )?;

        let mut tasks = Vec::with_capacity(options.num_rooms + 1);
        tasks.push(tokio::spawn(log_tailer.run(tailer_rx)));
        for (room_number, rx) in room_rxs.into_iter().enumerate() {
            let room = ControlRoom::new(
                room_number,
                handle.clone(),
                Arc::clone(&storage),
                Arc::clone(&router),
                tailer_tx.clone(),
                options.find_time_deadline,
            );
            tasks.push(tokio::spawn(room.run(rx)));
        }
        tracing::info!(
            rooms = options.num_rooms,
            readers = options.num_readers,
            addr = ?handle.local_addr(),
            "control tower started"
        );
        Ok(ControlTower { handle, tasks })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    pub fn handle(&self) -> &MsgLoopHandle {
        &self.handle
    }

    pub async fn stop(self) {
        self.handle.stop().await;
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

fn register_frontend(
    msg_loop: &mut MsgLoop,
    options: &ControlTowerOptions,
    router: &Arc<LogRouter>,
    room_txs: &[mpsc::Sender<RoomCommand>],
    storage: &Arc<dyn LogStorage>,
) -> Result<()> {
    let num_rooms = options.num_rooms;

    {
        let router = Arc::clone(router);
        let rooms = room_txs.to_vec();
        msg_loop.register_callback(
            MessageType::Subscribe,
            Arc::new(move |ctx, flow, origin, message| {
                let Message::Subscribe {
                    tenant,
                    namespace,
                    topic,
                    start_seqno,
                    sub_id,
                    cursors,
                } = message
                else {
                    return;
                };
                // Newer senders put the start position in the cursor list.
                let start_seqno = cursors.first().map(|cursor| cursor.seqno).unwrap_or(start_seqno);
                if tenant == INVALID_TENANT || namespace.is_empty() || topic.is_empty() {
                    ctx.write_stream(
                        flow,
                        origin,
                        &Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::Invalid,
                            namespace,
                            topic,
                        },
                    );
                    return;
                }
                let Ok(log_id) = router.route(&namespace, &topic) else {
                    ctx.write_stream(
                        flow,
                        origin,
                        &Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::Invalid,
                            namespace,
                            topic,
                        },
                    );
                    return;
                };
                let room = room_for_topic(&namespace, &topic, num_rooms);
                let command = RoomCommand::Subscribe {
                    subscriber: SubscriberHandle {
                        worker: ctx.worker_index(),
                        key: origin,
                    },
                    tenant,
                    namespace: namespace.clone(),
                    topic: topic.clone(),
                    start_seqno,
                    sub_id,
                    log_id,
                };
                if rooms[room].try_send(command).is_err() {
                    // Room is saturated; ask the subscriber to come back.
                    metrics::counter!("tower_subscribes_shed").increment(1);
                    ctx.write_stream(
                        flow,
                        origin,
                        &Message::Unsubscribe {
                            tenant,
                            sub_id,
                            reason: UnsubscribeReason::BackOff,
                            namespace,
                            topic,
                        },
                    );
                }
            }),
        )?;
    }

    {
        let rooms = room_txs.to_vec();
        msg_loop.register_callback(
            MessageType::Unsubscribe,
            Arc::new(move |ctx, _flow, origin, message| {
                let Message::Unsubscribe {
                    tenant,
                    sub_id,
                    namespace,
                    topic,
                    ..
                } = message
                else {
                    return;
                };
                let subscriber = SubscriberHandle {
                    worker: ctx.worker_index(),
                    key: origin,
                };
                if namespace.is_empty() && topic.is_empty() {
                    // Older senders omit the topic; every room checks.
                    for room in &rooms {
                        let _ = room.try_send(RoomCommand::Unsubscribe {
                            subscriber,
                            tenant,
                            sub_id,
                            namespace: namespace.clone(),
                            topic: topic.clone(),
                        });
                    }
                    return;
                }
                let room = room_for_topic(&namespace, &topic, num_rooms);
                let _ = rooms[room].try_send(RoomCommand::Unsubscribe {
                    subscriber,
                    tenant,
                    sub_id,
                    namespace,
                    topic,
                });
            }),
        )?;
    }

    {
        let rooms = room_txs.to_vec();
        msg_loop.register_callback(
            MessageType::Goodbye,
            Arc::new(move |ctx, _flow, origin, _message| {
                // The stream is gone; drop every subscription it held.
                let subscriber = SubscriberHandle {
                    worker: ctx.worker_index(),
                    key: origin,
                };
                for room in &rooms {
                    let _ = room.try_send(RoomCommand::RemoveHost { subscriber });
                }
            }),
        )?;
    }

    {
        let router = Arc::clone(router);
        let storage = Arc::clone(storage);
        let deadline = options.find_time_deadline;
        msg_loop.register_callback(
            MessageType::FindTailSeqno,
            Arc::new(move |ctx, _flow, origin, message| {
                let Message::FindTailSeqno {
                    tenant,
                    namespace,
                    topic,
                } = message
                else {
                    return;
                };
                let Ok(log_id) = router.route(&namespace, &topic) else {
                    return;
                };
                let handle = ctx.handle();
                let worker = ctx.worker_index();
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    match storage.find_time(log_id, FIND_TIME_TAIL, deadline).await {
                        Ok(seqno) => {
                            let _ = handle
                                .send_to_stream(
                                    worker,
                                    origin,
                                    Message::TailSeqno {
                                        tenant,
                                        namespace,
                                        topic,
                                        seqno,
                                    },
                                )
                                .await;
                        }
                        Err(err) => {
                            tracing::warn!(log_id, error = %err, "tail seqno lookup failed");
                        }
                    }
                });
            }),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use cascade_storage::MemoryLogStorage;
    use cascade_wire::{Cursor, DataMessage};
    use uuid::Uuid;

    fn test_options() -> ControlTowerOptions {
        ControlTowerOptions {
            msg_loop: MsgLoopOptions {
                listen_addr: Some("127.0.0.1:0".parse().expect("addr")),
                ..Default::default()
            },
            num_rooms: 4,
            num_readers: 2,
            ..Default::default()
        }
    }

    async fn append_record(
        storage: &MemoryLogStorage,
        router: &LogRouter,
        namespace: &str,
        topic: &str,
        payload: &'static [u8],
    ) -> u64 {
        let data = DataMessage {
            tenant: 102,
            namespace: namespace.into(),
            topic: topic.into(),
            message_id: Uuid::new_v4(),
            payload: Bytes::from_static(payload),
            seqno_prev: 0,
            seqno: 0,
        };
        let mut encoded = BytesMut::new();
        data.encode_storage(&mut encoded);
        let log_id = router.route(namespace, topic).expect("route");
        storage
            .append(log_id, encoded.freeze())
            .await
            .expect("append")
    }

    #[tokio::test]
    async fn subscribe_then_record_is_delivered() {
        let storage = MemoryLogStorage::new();
        let options = test_options();
        let router = LogRouter::new(options.first_log, options.num_logs).expect("router");
        let tower = ControlTower::start(options, Arc::new(storage.clone()))
            .await
            .expect("tower");
        let addr = tower.local_addr().expect("addr");

        let (event_tx, mut event_rx) = mpsc::channel::<Message>(16);
        let mut client = MsgLoop::new(MsgLoopOptions::default());
        for mtype in [MessageType::SubAck, MessageType::DeliverData, MessageType::DeliverGap] {
            let event_tx = event_tx.clone();
            client
                .register_callback(
                    mtype,
                    Arc::new(move |_ctx, _flow, _origin, message| {
                        let _ = event_tx.try_send(message);
                    }),
                )
                .expect("register");
        }
        let client = client.start().await.expect("client");
        client
            .send_command(
                0,
                Box::new(move |ctx, flow| {
                    let key = ctx.open_stream(addr, 102);
                    ctx.write_stream(
                        flow,
                        key,
                        &Message::Subscribe {
                            tenant: 102,
                            namespace: "102".into(),
                            topic: "test_topic".into(),
                            start_seqno: 1,
                            sub_id: 7,
                            cursors: vec![Cursor {
                                source: String::new(),
                                seqno: 1,
                            }],
                        },
                    );
                }),
            )
            .await
            .expect("send");

        let ack = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("timely ack")
            .expect("ack");
        match ack {
            Message::SubAck { sub_id, cursors, .. } => {
                assert_eq!(sub_id, 7);
                assert_eq!(cursors[0].seqno, 1);
            }
            other => panic!("expected sub ack, got {other:?}"),
        }

        let seqno = append_record(&storage, &router, "102", "test_topic", b"test_message").await;
        assert_eq!(seqno, 1);
        let delivered = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("timely delivery")
            .expect("delivery");
        match delivered {
            Message::DeliverData(data) => {
                assert_eq!(data.sub_id, 7);
                assert_eq!(data.seqno, 1);
                assert_eq!(data.payload, Bytes::from_static(b"test_message"));
                assert_eq!(data.topic, "test_topic");
            }
            other => panic!("expected delivery, got {other:?}"),
        }

        client.stop().await;
        tower.stop().await;
    }

    #[tokio::test]
    async fn find_tail_seqno_reports_next_position() {
        let storage = MemoryLogStorage::new();
        let options = test_options();
        let router = LogRouter::new(options.first_log, options.num_logs).expect("router");
        let tower = ControlTower::start(options, Arc::new(storage.clone()))
            .await
            .expect("tower");
        let addr = tower.local_addr().expect("addr");

        append_record(&storage, &router, "102", "tailed", b"x").await;
        append_record(&storage, &router, "102", "tailed", b"y").await;

        let (event_tx, mut event_rx) = mpsc::channel::<Message>(1);
        let mut client = MsgLoop::new(MsgLoopOptions::default());
        client
            .register_callback(
                MessageType::TailSeqno,
                Arc::new(move |_ctx, _flow, _origin, message| {
                    let _ = event_tx.try_send(message);
                }),
            )
            .expect("register");
        let client = client.start().await.expect("client");
        client
            .send_command(
                0,
                Box::new(move |ctx, flow| {
                    let key = ctx.open_stream(addr, 102);
                    ctx.write_stream(
                        flow,
                        key,
                        &Message::FindTailSeqno {
                            tenant: 102,
                            namespace: "102".into(),
                            topic: "tailed".into(),
                        },
                    );
                }),
            )
            .await
            .expect("send");

        let reply = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("timely reply")
            .expect("reply");
        match reply {
            Message::TailSeqno { topic, seqno, .. } => {
                assert_eq!(topic, "tailed");
                assert_eq!(seqno, 3);
            }
            other => panic!("expected tail seqno, got {other:?}"),
        }

        client.stop().await;
        tower.stop().await;
    }

    #[tokio::test]
    async fn invalid_subscribe_is_rejected_synchronously() {
        let storage = MemoryLogStorage::new();
        let tower = ControlTower::start(test_options(), Arc::new(storage))
            .await
            .expect("tower");
        let addr = tower.local_addr().expect("addr");

        let (event_tx, mut event_rx) = mpsc::channel::<Message>(1);
        let mut client = MsgLoop::new(MsgLoopOptions::default());
        client
            .register_callback(
                MessageType::Unsubscribe,
                Arc::new(move |_ctx, _flow, _origin, message| {
                    let _ = event_tx.try_send(message);
                }),
            )
            .expect("register");
        let client = client.start().await.expect("client");
        client
            .send_command(
                0,
                Box::new(move |ctx, flow| {
                    let key = ctx.open_stream(addr, 102);
                    // Empty topic name cannot be routed.
                    ctx.write_stream(
                        flow,
                        key,
                        &Message::Subscribe {
                            tenant: 102,
                            namespace: "102".into(),
                            topic: String::new(),
                            start_seqno: 1,
                            sub_id: 9,
                            cursors: Vec::new(),
                        },
                    );
                }),
            )
            .await
            .expect("send");

        let reply = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("timely reply")
            .expect("reply");
        match reply {
            Message::Unsubscribe { sub_id, reason, .. } => {
                assert_eq!(sub_id, 9);
                assert_eq!(reason, UnsubscribeReason::Invalid);
            }
            other => panic!("expected unsubscribe, got {other:?}"),
        }

        client.stop().await;
        tower.stop().await;
    }
}
