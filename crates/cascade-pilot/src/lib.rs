// Pilot: accepts publishes and writes them to storage logs.
//
// Each publish is routed to its log, appended in the storage encoding the
// tailer decodes on the way back out, and acknowledged with the assigned
// sequence number on the same stream.
use bytes::BytesMut;
use cascade_common::INVALID_TENANT;
use cascade_msg::{MsgLoop, MsgLoopHandle, MsgLoopOptions};
use cascade_router::LogRouter;
use cascade_storage::LogStorage;
use cascade_wire::{Ack, AckStatus, Message, MessageType};
use std::net::SocketAddr;
use std::sync::Arc;

pub type Result<T> = cascade_common::Result<T>;

#[derive(Debug, Clone)]
pub struct PilotOptions {
    pub msg_loop: MsgLoopOptions,
    /// Range of log IDs topics are routed onto. Must match the towers
    /// tailing the same storage.
    pub first_log: cascade_common::LogId,
    pub num_logs: u64,
}

impl Default for PilotOptions {
    fn default() -> Self {
        Self {
            msg_loop: MsgLoopOptions::default(),
            first_log: 1,
            num_logs: 100_000,
        }
    }
}

pub struct Pilot {
    handle: MsgLoopHandle,
}

impl Pilot {
    pub async fn start(options: PilotOptions, storage: Arc<dyn LogStorage>) -> Result<Pilot> {
        let router = Arc::new(LogRouter::new(options.first_log, options.num_logs)?);
        let mut msg_loop = MsgLoop::new(options.msg_loop.clone());
        {
            let router = Arc::clone(&router);
            msg_loop.register_callback(
                MessageType::Publish,
                Arc::new(move |ctx, _flow, origin, message| {
                    let Message::Publish(data) = message else {
                        return;
                    };
                    if data.tenant == INVALID_TENANT || data.topic.is_empty() {
                        let nack = Message::DataAck {
                            tenant: data.tenant,
                            acks: vec![Ack {
                                status: AckStatus::Failure,
                                message_id: data.message_id,
                                seqno: 0,
                            }],
                        };
                        let handle = ctx.handle();
                        let worker = ctx.worker_index();
                        tokio::spawn(async move {
                            let _ = handle.send_to_stream(worker, origin, nack).await;
                        });
                        return;
                    }
                    let log_id = match router.route(&data.namespace, &data.topic) {
                        Ok(log_id) => log_id,
                        Err(err) => {
                            tracing::warn!(error = %err, "unroutable publish");
                            return;
                        }
                    };
                    let mut encoded = BytesMut::new();
                    data.encode_storage(&mut encoded);
                    let handle = ctx.handle();
                    let worker = ctx.worker_index();
                    let storage = Arc::clone(&storage);
                    let tenant = data.tenant;
                    let message_id = data.message_id;
                    tokio::spawn(async move {
                        let ack = match storage.append(log_id, encoded.freeze()).await {
                            Ok(seqno) => {
                                metrics::counter!("pilot_appends").increment(1);
                                Ack {
                                    status: AckStatus::Success,
                                    message_id,
                                    seqno,
                                }
                            }
                            Err(err) => {
                                tracing::warn!(log_id, error = %err, "append failed");
                                metrics::counter!("pilot_append_failures").increment(1);
                                Ack {
                                    status: AckStatus::Failure,
                                    message_id,
                                    seqno: 0,
                                }
                            }
                        };
                        let _ = handle
                            .send_to_stream(
                                worker,
                                origin,
                                Message::DataAck {
                                    tenant,
                                    acks: vec![ack],
                                },
                            )
                            .await;
                    });
                }),
            )?;
        }
        let handle = msg_loop.start().await?;
        tracing::info!(addr = ?handle.local_addr(), "pilot started");
        Ok(Pilot { handle })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cascade_storage::MemoryLogStorage;
    use cascade_wire::DataMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_is_appended_and_acked() {
        let storage = MemoryLogStorage::new();
        let options = PilotOptions {
            msg_loop: MsgLoopOptions {
                listen_addr: Some("127.0.0.1:0".parse().expect("addr")),
                ..Default::default()
            },
            ..Default::default()
        };
        let router = LogRouter::new(options.first_log, options.num_logs).expect("router");
        let pilot = Pilot::start(options, Arc::new(storage.clone()))
            .await
            .expect("pilot");
        let addr = pilot.local_addr().expect("addr");

        let (ack_tx, mut ack_rx) = mpsc::channel::<Message>(1);
        let mut client = MsgLoop::new(MsgLoopOptions::default());
        client
            .register_callback(
                MessageType::DataAck,
                Arc::new(move |_ctx, _flow, _origin, message| {
                    let _ = ack_tx.try_send(message);
                }),
            )
            .expect("register");
        let client = client.start().await.expect("client");

        let message_id = Uuid::new_v4();
        client
            .send_command(
                0,
                Box::new(move |ctx, flow| {
                    let key = ctx.open_stream(addr, 102);
                    ctx.write_stream(
                        flow,
                        key,
                        &Message::Publish(DataMessage {
                            tenant: 102,
                            namespace: "102".into(),
                            topic: "orders".into(),
                            message_id,
                            payload: Bytes::from_static(b"hello"),
                            seqno_prev: 0,
                            seqno: 0,
                        }),
                    );
                }),
            )
            .await
            .expect("send");

        let ack = tokio::time::timeout(Duration::from_secs(5), ack_rx.recv())
            .await
            .expect("timely ack")
            .expect("ack");
        match ack {
            Message::DataAck { acks, .. } => {
                assert_eq!(acks.len(), 1);
                assert_eq!(acks[0].status, AckStatus::Success);
                assert_eq!(acks[0].message_id, message_id);
                assert_eq!(acks[0].seqno, 1);
            }
            other => panic!("expected ack, got {other:?}"),
        }

        // The record must be decodable back out of the log.
        let log_id = router.route("102", "orders").expect("route");
        assert_eq!(storage.next_seqno(log_id), 2);

        client.stop().await;
        pilot.stop().await;
    }
}
