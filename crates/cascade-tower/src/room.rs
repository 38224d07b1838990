// One room: authoritative subscription state for its share of topics.
//
// Subscribe/unsubscribe metadata for a topic is routed by the tower
// front-end to exactly one room. Records and gaps arrive from the tailer;
// the room fans them out to every subscriber whose expected position the
// record satisfies and advances that position.
use cascade_common::{
    GapKind, HostNumber, LogId, NamespaceId, SequenceNumber, SubscriptionId, TenantId, Topic,
};
use cascade_msg::{MsgLoopHandle, StreamKey};
use cascade_router::LogRouter;
use cascade_storage::{LogStorage, FIND_TIME_TAIL};
use cascade_wire::{Cursor, DataMessage, Message, MessageDeliverData, UnsubscribeReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::tailer::TailerCommand;
use crate::topic::TopicManager;

/// Identity of a subscriber as the tower sees it: the worker that owns
/// the stream plus the stream itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriberHandle {
    pub worker: usize,
    pub key: StreamKey,
}

pub(crate) enum RoomCommand {
    Subscribe {
        subscriber: SubscriberHandle,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        start_seqno: SequenceNumber,
        sub_id: SubscriptionId,
        log_id: LogId,
    },
    Unsubscribe {
        subscriber: SubscriberHandle,
        tenant: TenantId,
        sub_id: SubscriptionId,
        namespace: NamespaceId,
        topic: Topic,
    },
    Record {
        log_id: LogId,
        data: DataMessage,
    },
    Gap {
        log_id: LogId,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
    },
    RemoveHost {
        subscriber: SubscriberHandle,
    },
}

pub(crate) struct ControlRoom {
    room_number: usize,
    handle: MsgLoopHandle,
    storage: Arc<dyn LogStorage>,
    router: Arc<LogRouter>,
    topic_map: TopicManager,
    /// Compact subscriber identities; host numbers index into `hosts`.
    host_numbers: HashMap<SubscriberHandle, HostNumber>,
    hosts: Vec<SubscriberHandle>,
    tailer_tx: mpsc::Sender<TailerCommand>,
    find_time_deadline: Duration,
}

impl ControlRoom {
    pub fn new(
        room_number: usize,
        handle: MsgLoopHandle,
        storage: Arc<dyn LogStorage>,
        router: Arc<LogRouter>,
        tailer_tx: mpsc::Sender<TailerCommand>,
        find_time_deadline: Duration,
    ) -> Self {
        Self {
            room_number,
            handle,
            storage,
            router,
            topic_map: TopicManager::new(),
            host_numbers: HashMap::new(),
            hosts: Vec::new(),
            tailer_tx,
            find_time_deadline,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        tracing::info!(room = self.room_number, "control room running");
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Subscribe {
                    subscriber,
                    tenant,
                    namespace,
                    topic,
                    start_seqno,
                    sub_id,
                    log_id,
                } => {
                    self.on_subscribe(subscriber, tenant, namespace, topic, start_seqno, sub_id, log_id)
                        .await
                }
                RoomCommand::Unsubscribe {
                    subscriber,
                    tenant,
                    sub_id,
                    namespace,
                    topic,
                } => self.on_unsubscribe(subscriber, tenant, sub_id, namespace, topic).await,
                RoomCommand::Record { log_id, data } => self.on_record(log_id, data).await,
                RoomCommand::Gap {
                    log_id,
                    kind,
                    from,
                    to,
                } => self.on_gap(log_id, kind, from, to).await,
                RoomCommand::RemoveHost { subscriber } => self.on_remove_host(subscriber).await,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_subscribe(
        &mut self,
        subscriber: SubscriberHandle,
        tenant: TenantId,
        namespace: NamespaceId,
        topic: Topic,
        start_seqno: SequenceNumber,
        sub_id: SubscriptionId,
        log_id: LogId,
    ) {
        // Sanity check: the topic must route to the log the front-end
        // used, otherwise records would never reach this subscription.
        match self.router.route(&namespace, &topic) {
            Ok(expected) if expected == log_id => {}
            _ => {
                tracing::warn!(
                    room = self.room_number,
                    namespace,
                    topic,
                    log_id,
                    "subscribe with mismatched log routing"
                );
                self.send_unsubscribe(subscriber, tenant, sub_id, &namespace, &topic)
                    .await;
                return;
            }
        }
        // Start seqno zero means "start at the tail".
        let resolved = if start_seqno == 0 {
            match self
                .storage
                .find_time(log_id, FIND_TIME_TAIL, self.find_time_deadline)
                .await
            {
                Ok(seqno) => seqno,
                Err(err) => {
                    tracing::warn!(
                        room = self.room_number,
                        log_id,
                        error = %err,
                        "tail lookup failed"
                    );
                    self.send_unsubscribe(subscriber, tenant, sub_id, &namespace, &topic)
                        .await;
                    return;
                }
            }
        } else {
            start_seqno
        };

        let host = self.intern_host(subscriber);
        let new_subscription =
            self.topic_map
                .add_subscriber(&namespace, &topic, log_id, resolved, host, sub_id);
        let _ = self
            .tailer_tx
            .send(TailerCommand::StartReading {
                log_id,
                start: resolved,
                acquire: new_subscription,
            })
            .await;
        tracing::debug!(
            room = self.room_number,
            namespace,
            topic,
            seqno = resolved,
            host,
            "subscription added"
        );
        metrics::counter!("tower_subscribes").increment(1);
        self.send_to(
            subscriber,
            Message::SubAck {
                tenant,
                namespace,
                topic,
                sub_id,
                cursors: vec![Cursor {
                    source: String::new(),
                    seqno: resolved,
                }],
            },
        )
        .await;
    }

    async fn on_unsubscribe(
        &mut self,
        subscriber: SubscriberHandle,
        tenant: TenantId,
        sub_id: SubscriptionId,
        mut namespace: NamespaceId,
        mut topic: Topic,
    ) {
        if let Some(&host) = self.host_numbers.get(&subscriber) {
            if namespace.is_empty() && topic.is_empty() {
                // Older senders omit the topic; find it by subscription.
                if let Some((found_namespace, found_topic)) =
                    self.topic_map.find_topic_of_subscription(host, sub_id)
                {
                    namespace = found_namespace;
                    topic = found_topic;
                }
            }
            let log_id = self.router.route(&namespace, &topic).ok();
            let outcome = self.topic_map.remove_subscriber(&namespace, &topic, host);
            if outcome.removed {
                metrics::counter!("tower_unsubscribes").increment(1);
                if let Some(log_id) = log_id {
                    let _ = self.tailer_tx.send(TailerCommand::StopReading { log_id }).await;
                }
            }
        }
        // Ack on the same stream regardless, so the client can settle.
        self.send_unsubscribe_ack(subscriber, tenant, sub_id, &namespace, &topic)
            .await;
    }

    async fn on_record(&mut self, log_id: LogId, data: DataMessage) {
        let mut deliveries: Vec<(HostNumber, SubscriptionId)> = Vec::new();
        let seqno = data.seqno;
        self.topic_map
            .visit_subscribers(&data.namespace, &data.topic, |subscription| {
                if subscription.next_seqno() <= seqno {
                    deliveries.push((subscription.host(), subscription.sub_id()));
                    subscription.set_next_seqno(seqno + 1);
                }
            });
        if deliveries.is_empty() {
            return;
        }
        metrics::histogram!("tower_record_fanout").record(deliveries.len() as f64);
        for (host, sub_id) in deliveries {
            let subscriber = self.hosts[host as usize];
            let deliver = MessageDeliverData {
                tenant: data.tenant,
                sub_id,
                seqno_prev: data.seqno_prev,
                seqno: data.seqno,
                message_id: data.message_id,
                payload: data.payload.clone(),
                namespace: data.namespace.clone(),
                topic: data.topic.clone(),
            };
            self.send_to(subscriber, Message::DeliverData(deliver)).await;
        }
        tracing::debug!(
            room = self.room_number,
            log_id,
            seqno,
            topic = data.topic,
            "record fanned out"
        );
    }

    async fn on_gap(&mut self, log_id: LogId, kind: GapKind, from: SequenceNumber, to: SequenceNumber) {
        let mut deliveries: Vec<(HostNumber, SubscriptionId, NamespaceId, Topic)> = Vec::new();
        self.topic_map
            .visit_log_subscribers(log_id, |namespace, topic, subscription| {
                if subscription.next_seqno() <= to {
                    deliveries.push((
                        subscription.host(),
                        subscription.sub_id(),
                        namespace.clone(),
                        topic.clone(),
                    ));
                    subscription.set_next_seqno(to + 1);
                }
            });
        for (host, sub_id, namespace, topic) in deliveries {
            let subscriber = self.hosts[host as usize];
            self.send_to(
                subscriber,
                Message::DeliverGap {
                    tenant: cascade_common::GUEST_TENANT,
                    sub_id,
                    seqno_prev: from.saturating_sub(1),
                    seqno: to,
                    kind,
                    namespace,
                    topic,
                },
            )
            .await;
        }
    }

    async fn on_remove_host(&mut self, subscriber: SubscriberHandle) {
        let Some(&host) = self.host_numbers.get(&subscriber) else {
            return;
        };
        for log_id in self.topic_map.remove_host(host) {
            let _ = self.tailer_tx.send(TailerCommand::StopReading { log_id }).await;
        }
    }

    fn intern_host(&mut self, subscriber: SubscriberHandle) -> HostNumber {
        if let Some(&host) = self.host_numbers.get(&subscriber) {
            return host;
        }
        let host = self.hosts.len() as HostNumber;
        self.hosts.push(subscriber);
        self.host_numbers.insert(subscriber, host);
        host
    }

    async fn send_unsubscribe(
        &self,
        subscriber: SubscriberHandle,
        tenant: TenantId,
        sub_id: SubscriptionId,
        namespace: &str,
        topic: &str,
    ) {
        self.send_to(
            subscriber,
            Message::Unsubscribe {
                tenant,
                sub_id,
                reason: UnsubscribeReason::Invalid,
                namespace: namespace.to_string(),
                topic: topic.to_string(),
            },
        )
        .await;
    }

    async fn send_unsubscribe_ack(
        &self,
        subscriber: SubscriberHandle,
        tenant: TenantId,
        sub_id: SubscriptionId,
        namespace: &str,
        topic: &str,
    ) {
        self.send_to(
            subscriber,
            Message::Unsubscribe {
                tenant,
                sub_id,
                reason: UnsubscribeReason::RequestedByUser,
                namespace: namespace.to_string(),
                topic: topic.to_string(),
            },
        )
        .await;
    }

    async fn send_to(&self, subscriber: SubscriberHandle, message: Message) {
        if let Err(err) = self
            .handle
            .send_to_stream(subscriber.worker, subscriber.key, message)
            .await
        {
            tracing::debug!(
                room = self.room_number,
                worker = subscriber.worker,
                error = %err,
                "failed to reach subscriber"
            );
        }
    }
}
