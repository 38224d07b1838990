// Client for the cascade pub/sub system.
//
// Subscriptions are sharded across workers; each worker runs a
// single-threaded subscription state machine fed by the message loop.
// The facade posts commands onto the owning worker and never touches
// shard state directly.
use anyhow::Context;
use bytes::Bytes;
use cascade_common::{NamespaceId, SequenceNumber, TenantId, Topic, GUEST_TENANT};
use cascade_msg::{MsgLoop, MsgLoopHandle, MsgLoopOptions, WorkerCtx};
use cascade_wire::{DataMessage, Message, MessageType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

mod collapsing;
pub mod observer;
mod publisher;
mod state;
mod subscriber;
mod topic_map;

pub use observer::{DataLossInfo, MessageReceived, Observer};
pub use subscriber::{SubscriptionParameters, SubscriptionStart};

use collapsing::TailCollapsingSubscriber;
use publisher::PublisherState;
use subscriber::{ShardSubscriber, Subscriber};

/// Opaque handle identifying a subscription. The owning worker is
/// derivable from the handle, so any facade call routes correctly.
pub type SubscriptionHandle = u64;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub msg_loop: MsgLoopOptions,
    /// Control tower serving subscriptions.
    pub tower_addr: SocketAddr,
    /// Pilot accepting publishes; `None` for subscribe-only clients.
    pub pilot_addr: Option<SocketAddr>,
    pub tenant: TenantId,
    /// Serve several downstream subscriptions on one topic from a single
    /// upstream subscription.
    pub collapse_tail_subscriptions: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub recent_terminations_ttl: Duration,
    /// Cap on subscribe messages sent per worker tick.
    pub subscription_rate_limit: usize,
    pub publish_timeout: Duration,
}

impl ClientOptions {
    pub fn new(tower_addr: SocketAddr) -> Self {
        Self {
            msg_loop: MsgLoopOptions::default(),
            tower_addr,
            pilot_addr: None,
            tenant: GUEST_TENANT,
            collapse_tail_subscriptions: false,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            recent_terminations_ttl: Duration::from_secs(5),
            subscription_rate_limit: 128,
            publish_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) struct ClientWorkerState {
    shard: Box<dyn ShardSubscriber>,
    publisher: PublisherState,
}

/// Runs a handler against the worker's client state. The state is taken
/// out for the duration so the handler can also write through the
/// context.
fn with_state(ctx: &mut WorkerCtx, f: impl FnOnce(&mut WorkerCtx, &mut ClientWorkerState)) {
    let Some(any) = ctx.take_state() else {
        return;
    };
    match any.downcast::<ClientWorkerState>() {
        Ok(mut state) => {
            f(ctx, &mut state);
            ctx.put_state(state);
        }
        Err(any) => ctx.put_state(any),
    }
}

pub struct Client {
    handle: MsgLoopHandle,
    options: Arc<ClientOptions>,
    next_sub_seed: AtomicU64,
    next_publish_worker: AtomicUsize,
}

impl Client {
    pub async fn start(options: ClientOptions) -> anyhow::Result<Client> {
        let options = Arc::new(options);
        let mut msg_loop = MsgLoop::new(options.msg_loop.clone());

        let factory_options = Arc::clone(&options);
        msg_loop.set_worker_state_factory(Arc::new(move |_worker| {
            let subscriber = Subscriber::new(Arc::clone(&factory_options));
            let shard: Box<dyn ShardSubscriber> = if factory_options.collapse_tail_subscriptions {
                Box::new(TailCollapsingSubscriber::new(subscriber))
            } else {
                Box::new(subscriber)
            };
            Box::new(ClientWorkerState {
                shard,
                publisher: PublisherState::new(Arc::clone(&factory_options)),
            })
        }));

        for message_type in [
            MessageType::SubAck,
            MessageType::DeliverData,
            MessageType::DeliverBatch,
            MessageType::DeliverGap,
            MessageType::Unsubscribe,
        ] {
            msg_loop
                .register_callback(
                    message_type,
                    Arc::new(|ctx, flow, origin, message| {
                        with_state(ctx, |ctx, state| {
                            state.shard.handle_message(ctx, flow, origin, message)
                        });
                    }),
                )
                .map_err(anyhow::Error::new)?;
        }
        msg_loop
            .register_callback(
                MessageType::DataAck,
                Arc::new(|ctx, _flow, _origin, message| {
                    if let Message::DataAck { acks, .. } = message {
                        with_state(ctx, |_ctx, state| state.publisher.on_data_ack(acks));
                    }
                }),
            )
            .map_err(anyhow::Error::new)?;
        msg_loop
            .register_callback(
                MessageType::Goodbye,
                Arc::new(|ctx, flow, origin, message| {
                    with_state(ctx, |ctx, state| {
                        state.publisher.on_stream_down(origin);
                        state.shard.handle_message(ctx, flow, origin, message);
                    });
                }),
            )
            .map_err(anyhow::Error::new)?;
        msg_loop.set_tick_handler(Arc::new(|ctx, flow| {
            with_state(ctx, |ctx, state| state.shard.tick(ctx, flow));
        }));
        msg_loop.set_unhealthy_handler(Arc::new(|ctx, key| {
            with_state(ctx, |_ctx, state| state.shard.on_stream_unhealthy(key));
        }));

        let handle = msg_loop.start().await.context("start client loop")?;
        Ok(Client {
            handle,
            options,
            next_sub_seed: AtomicU64::new(0),
            next_publish_worker: AtomicUsize::new(0),
        })
    }

    /// Establishes a subscription. The observer is notified about
    /// records, gaps and termination on the subscription's worker.
    pub async fn subscribe(
        &self,
        params: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) -> anyhow::Result<SubscriptionHandle> {
        let seed = self.next_sub_seed.fetch_add(1, Ordering::Relaxed);
        let sub_id = seed + 1;
        let worker = self.worker_of(sub_id);
        self.handle
            .send_command(
                worker,
                Box::new(move |ctx, flow| {
                    with_state(ctx, |ctx, state| {
                        state.shard.start_subscription(ctx, flow, sub_id, params, observer)
                    });
                }),
            )
            .await
            .context("enqueue subscribe")?;
        Ok(sub_id)
    }

    /// Marks a record as consumed. Resubscription after a reconnect
    /// resumes from the next sequence number.
    pub async fn acknowledge(
        &self,
        handle: SubscriptionHandle,
        seqno: SequenceNumber,
    ) -> anyhow::Result<()> {
        self.handle
            .send_command(
                self.worker_of(handle),
                Box::new(move |ctx, _flow| {
                    with_state(ctx, |_ctx, state| state.shard.acknowledge(handle, seqno));
                }),
            )
            .await
            .context("enqueue acknowledge")
    }

    /// Terminates a subscription. In-flight records are dropped.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()> {
        self.handle
            .send_command(
                self.worker_of(handle),
                Box::new(move |ctx, flow| {
                    with_state(ctx, |ctx, state| {
                        state.shard.terminate_subscription(ctx, flow, handle)
                    });
                }),
            )
            .await
            .context("enqueue unsubscribe")
    }

    /// Publishes a payload to a topic, returning the assigned sequence
    /// number once the pilot acknowledges the append.
    pub async fn publish(
        &self,
        namespace: impl Into<NamespaceId>,
        topic: impl Into<Topic>,
        payload: Bytes,
    ) -> anyhow::Result<SequenceNumber> {
        let data = DataMessage {
            tenant: self.options.tenant,
            namespace: namespace.into(),
            topic: topic.into(),
            message_id: Uuid::new_v4(),
            payload,
            seqno_prev: 0,
            seqno: 0,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let worker = self.next_publish_worker.fetch_add(1, Ordering::Relaxed) % self.handle.num_workers();
        self.handle
            .send_command(
                worker,
                Box::new(move |ctx, flow| {
                    with_state(ctx, |ctx, state| {
                        state.publisher.publish(ctx, flow, data, reply_tx)
                    });
                }),
            )
            .await
            .context("enqueue publish")?;
        let result = tokio::time::timeout(self.options.publish_timeout, reply_rx)
            .await
            .context("publish timed out")?
            .context("publish reply dropped")?;
        result.map_err(anyhow::Error::new)
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }

    fn worker_of(&self, handle: SubscriptionHandle) -> usize {
        (handle.saturating_sub(1) % self.handle.num_workers() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_derivation_is_stable() {
        // Handles are seed+1; worker is derivable without extra state.
        let workers = 4u64;
        for seed in 0..32u64 {
            let handle = seed + 1;
            assert_eq!((handle - 1) % workers, seed % workers);
        }
    }

    #[test]
    fn options_defaults_are_sane() {
        let options = ClientOptions::new("127.0.0.1:9000".parse().expect("addr"));
        assert!(options.backoff_initial < options.backoff_max);
        assert!(options.subscription_rate_limit > 0);
        assert!(!options.collapse_tail_subscriptions);
        assert!(options.pilot_addr.is_none());
    }
}
