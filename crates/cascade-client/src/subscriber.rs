// Per-shard subscription state machine.
//
// One subscriber instance lives on each client worker. It owns every
// subscription bound to that worker, keeps them in order, and silently
// resubscribes over a fresh stream when the transport fails.
use cascade_common::{
    GapKind, NamespaceId, SequenceNumber, SubscriptionId, TenantId, TimeoutList, Topic,
    INVALID_TENANT,
};
use cascade_msg::{Flow, StreamKey, WorkerCtx};
use cascade_wire::{Cursor, Message, MessageDeliverData, UnsubscribeReason};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::observer::{DataLossInfo, MessageReceived, Observer};
use crate::state::{ObserverSlot, SubscriptionState, SubscriptionStatus};
use crate::ClientOptions;

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStart {
    /// Only records published after the subscription is established.
    Tail,
    /// A specific sequence number. `At(0)` is equivalent to `Tail`.
    At(SequenceNumber),
}

impl SubscriptionStart {
    pub(crate) fn wire_seqno(self) -> SequenceNumber {
        match self {
            SubscriptionStart::Tail => 0,
            SubscriptionStart::At(seqno) => seqno,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionParameters {
    pub tenant: TenantId,
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub start: SubscriptionStart,
}

/// One shard's worth of client subscription handling. Implemented by the
/// plain subscriber and by the tail-collapsing adaptor.
pub(crate) trait ShardSubscriber: Send {
    fn start_subscription(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        sub_id: SubscriptionId,
        params: SubscriptionParameters,
        observer: Box<dyn Observer>,
    );

    fn acknowledge(&mut self, sub_id: SubscriptionId, seqno: SequenceNumber);

    fn terminate_subscription(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow, sub_id: SubscriptionId);

    fn handle_message(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        message: Message,
    );

    fn on_stream_unhealthy(&mut self, key: StreamKey);

    fn tick(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow);
}

pub(crate) struct Subscriber {
    options: Arc<ClientOptions>,
    subscriptions: HashMap<SubscriptionId, SubscriptionState>,
    /// Sequence number of the last record each subscription acknowledged.
    /// Resubscription resumes from the next one.
    last_acks: HashMap<SubscriptionId, SequenceNumber>,
    /// Subscriptions whose subscribe message still has to go out.
    pending_subscriptions: BTreeSet<SubscriptionId>,
    /// Recently terminated subscriptions, kept briefly to suppress
    /// duplicate unsubscribes when a burst straddles the terminate.
    recent_terminations: TimeoutList<SubscriptionId>,
    server_stream: Option<StreamKey>,
    backoff_until: Option<Instant>,
    consecutive_goodbyes: usize,
    rng: StdRng,
}

impl Subscriber {
    pub fn new(options: Arc<ClientOptions>) -> Self {
        Self {
            options,
            subscriptions: HashMap::new(),
            last_acks: HashMap::new(),
            pending_subscriptions: BTreeSet::new(),
            recent_terminations: TimeoutList::new(),
            server_stream: None,
            backoff_until: None,
            consecutive_goodbyes: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Registers a subscription with an explicit observer slot. Invalid
    /// parameters complete synchronously with an `Invalid` termination.
    pub fn start_with_slot(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        sub_id: SubscriptionId,
        params: SubscriptionParameters,
        mut slot: ObserverSlot,
    ) {
        if params.tenant == INVALID_TENANT || params.namespace.is_empty() || params.topic.is_empty()
        {
            slot.on_ended(UnsubscribeReason::Invalid);
            return;
        }
        let start = params.start.wire_seqno();
        self.subscriptions.insert(
            sub_id,
            SubscriptionState {
                tenant: params.tenant,
                namespace: params.namespace,
                topic: params.topic,
                start_seqno: start,
                expected_seqno: start,
                status: SubscriptionStatus::PendingSubscribe,
                observer: slot,
            },
        );
        self.pending_subscriptions.insert(sub_id);
        self.connect_if_needed(ctx);
        self.flush_pending(ctx, flow);
    }

    /// Removes a subscription locally and tells the server. Returns the
    /// topic it was on. The observer is not notified; the application
    /// asked for this.
    pub fn terminate(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        sub_id: SubscriptionId,
    ) -> Option<(NamespaceId, Topic)> {
        let state = self.subscriptions.remove(&sub_id)?;
        self.pending_subscriptions.remove(&sub_id);
        self.last_acks.remove(&sub_id);
        self.recent_terminations.touch(sub_id);
        if let Some(stream) = self.server_stream {
            ctx.write_stream(
                flow,
                stream,
                &Message::Unsubscribe {
                    tenant: state.tenant,
                    sub_id,
                    reason: UnsubscribeReason::RequestedByUser,
                    namespace: state.namespace.clone(),
                    topic: state.topic.clone(),
                },
            );
        }
        Some((state.namespace, state.topic))
    }

    pub fn acknowledge_inner(&mut self, sub_id: SubscriptionId, seqno: SequenceNumber) {
        if self.subscriptions.contains_key(&sub_id) {
            let floor = self.last_acks.entry(sub_id).or_insert(seqno);
            *floor = (*floor).max(seqno);
        }
    }

    /// Processes one inbound message. Returns subscriptions the server
    /// terminated, so wrapping layers can clean their own maps.
    pub fn handle_message_inner(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        message: Message,
    ) -> Vec<(SubscriptionId, NamespaceId, Topic)> {
        let mut terminated = Vec::new();
        match message {
            Message::SubAck { sub_id, cursors, .. } => self.on_sub_ack(sub_id, &cursors),
            Message::DeliverData(data) => self.on_deliver_data(ctx, flow, origin, data),
            Message::DeliverBatch { messages, .. } => {
                for data in messages {
                    self.on_deliver_data(ctx, flow, origin, data);
                }
            }
            Message::DeliverGap {
                tenant,
                sub_id,
                seqno_prev,
                seqno,
                kind,
                ..
            } => self.on_deliver_gap(ctx, flow, origin, tenant, sub_id, seqno_prev, seqno, kind),
            Message::Unsubscribe { sub_id, reason, .. } => match reason {
                // The ack of an unsubscribe we sent; nothing to do.
                UnsubscribeReason::RequestedByUser => {}
                UnsubscribeReason::Invalid => {
                    if let Some(mut state) = self.subscriptions.remove(&sub_id) {
                        self.pending_subscriptions.remove(&sub_id);
                        self.last_acks.remove(&sub_id);
                        self.recent_terminations.touch(sub_id);
                        state.observer.on_ended(reason);
                        terminated.push((sub_id, state.namespace, state.topic));
                    }
                }
                UnsubscribeReason::BackOff => {
                    if let Some(state) = self.subscriptions.get_mut(&sub_id) {
                        state.status = SubscriptionStatus::PendingSubscribe;
                        self.pending_subscriptions.insert(sub_id);
                        self.schedule_backoff();
                    }
                }
            },
            Message::Goodbye { .. } => {
                if self.server_stream == Some(origin) {
                    self.on_stream_down();
                }
            }
            _ => {}
        }
        terminated
    }

    pub fn on_unhealthy_stream(&mut self, key: StreamKey) {
        if self.server_stream == Some(key) {
            tracing::warn!("server stream unhealthy, resubscribing");
            self.on_stream_down();
        }
    }

    pub fn tick_inner(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow) {
        self.recent_terminations
            .expire_older_than(self.options.recent_terminations_ttl);
        if !self.subscriptions.is_empty() {
            self.connect_if_needed(ctx);
        }
        self.flush_pending(ctx, flow);
    }

    pub fn fanout_mut(&mut self, sub_id: SubscriptionId) -> Option<&mut crate::state::FanoutObserver> {
        match &mut self.subscriptions.get_mut(&sub_id)?.observer {
            ObserverSlot::Fanout(fanout) => Some(fanout),
            ObserverSlot::Direct(_) => None,
        }
    }

    pub fn subscription_topic(&self, sub_id: SubscriptionId) -> Option<(NamespaceId, Topic)> {
        let state = self.subscriptions.get(&sub_id)?;
        Some((state.namespace.clone(), state.topic.clone()))
    }

    fn on_sub_ack(&mut self, sub_id: SubscriptionId, cursors: &[Cursor]) {
        let Some(state) = self.subscriptions.get_mut(&sub_id) else {
            return;
        };
        if state.status == SubscriptionStatus::Active {
            // Duplicate ack within the same stream epoch.
            return;
        }
        state.status = SubscriptionStatus::Active;
        // A tail subscription learns its actual start position here.
        if let Some(cursor) = cursors.first() {
            if cursor.seqno > state.expected_seqno {
                state.expected_seqno = cursor.seqno;
            }
        }
        state.observer.on_established(state.expected_seqno);
        // A successful round-trip resets the reconnect backoff.
        self.consecutive_goodbyes = 0;
        self.backoff_until = None;
    }

    fn on_deliver_data(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        data: MessageDeliverData,
    ) {
        let Some(state) = self.subscriptions.get_mut(&data.sub_id) else {
            self.suppress_unknown(ctx, flow, origin, data.tenant, data.sub_id);
            return;
        };
        if !state.accept_delivery(data.seqno) {
            return;
        }
        let message = MessageReceived {
            namespace: state.namespace.clone(),
            topic: state.topic.clone(),
            seqno: data.seqno,
            payload: data.payload,
        };
        state.observer.on_message(&message);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_deliver_gap(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        tenant: TenantId,
        sub_id: SubscriptionId,
        seqno_prev: SequenceNumber,
        seqno: SequenceNumber,
        kind: GapKind,
    ) {
        let Some(state) = self.subscriptions.get_mut(&sub_id) else {
            self.suppress_unknown(ctx, flow, origin, tenant, sub_id);
            return;
        };
        if !state.accept_delivery(seqno) {
            return;
        }
        // Benign gaps advance the position without bothering the
        // application.
        if matches!(kind, GapKind::DataLoss | GapKind::Retention) {
            let loss = DataLossInfo {
                kind,
                from: seqno_prev + 1,
                to: seqno,
            };
            state.observer.on_data_loss(&loss, seqno);
        }
    }

    /// Something arrived for a subscription this worker does not hold.
    /// Tell the server once; bursts straddling a local terminate are
    /// deduplicated through `recent_terminations`.
    fn suppress_unknown(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        tenant: TenantId,
        sub_id: SubscriptionId,
    ) {
        if self.recent_terminations.contains(&sub_id) {
            return;
        }
        metrics::counter!("client_unknown_subscription_messages").increment(1);
        self.recent_terminations.touch(sub_id);
        ctx.write_stream(
            flow,
            origin,
            &Message::Unsubscribe {
                tenant,
                sub_id,
                reason: UnsubscribeReason::RequestedByUser,
                namespace: String::new(),
                topic: String::new(),
            },
        );
    }

    fn on_stream_down(&mut self) {
        metrics::counter!("client_stream_down").increment(1);
        self.server_stream = None;
        self.consecutive_goodbyes += 1;
        for (&sub_id, state) in self.subscriptions.iter_mut() {
            state.status = SubscriptionStatus::PendingSubscribe;
            self.pending_subscriptions.insert(sub_id);
        }
        self.schedule_backoff();
    }

    fn schedule_backoff(&mut self) {
        let exponent = self.consecutive_goodbyes.saturating_sub(1).min(16) as u32;
        let base = self
            .options
            .backoff_initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.options.backoff_max);
        let jitter = self.rng.gen_range(0.5..1.5);
        let delay = base.mul_f64(jitter).min(self.options.backoff_max);
        self.backoff_until = Some(Instant::now() + delay);
    }

    fn connect_if_needed(&mut self, ctx: &mut WorkerCtx) {
        if self.server_stream.is_some() {
            return;
        }
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return;
            }
        }
        let key = ctx.open_stream(self.options.tower_addr, self.options.tenant);
        tracing::debug!(?key, "opened server stream");
        self.server_stream = Some(key);
        for (&sub_id, state) in self.subscriptions.iter_mut() {
            state.status = SubscriptionStatus::PendingSubscribe;
            self.pending_subscriptions.insert(sub_id);
        }
    }

    fn flush_pending(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow) {
        let Some(stream) = self.server_stream else {
            return;
        };
        let mut sent = 0usize;
        let pending: Vec<SubscriptionId> = self.pending_subscriptions.iter().copied().collect();
        for sub_id in pending {
            if sent >= self.options.subscription_rate_limit {
                break;
            }
            let Some(state) = self.subscriptions.get(&sub_id) else {
                self.pending_subscriptions.remove(&sub_id);
                continue;
            };
            // Resume from the last acknowledged record, or the original
            // start if nothing was ever acknowledged.
            let start = self
                .last_acks
                .get(&sub_id)
                .map(|ack| ack + 1)
                .unwrap_or(state.start_seqno);
            let subscribe = Message::Subscribe {
                tenant: state.tenant,
                namespace: state.namespace.clone(),
                topic: state.topic.clone(),
                start_seqno: start,
                sub_id,
                cursors: vec![Cursor {
                    source: String::new(),
                    seqno: start,
                }],
            };
            let has_room = ctx.write_stream(flow, stream, &subscribe);
            self.pending_subscriptions.remove(&sub_id);
            sent += 1;
            if !has_room {
                // Socket over its watermark: the rest waits for a tick.
                break;
            }
        }
    }
}

impl ShardSubscriber for Subscriber {
    fn start_subscription(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        sub_id: SubscriptionId,
        params: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) {
        self.start_with_slot(ctx, flow, sub_id, params, ObserverSlot::Direct(observer));
    }

    fn acknowledge(&mut self, sub_id: SubscriptionId, seqno: SequenceNumber) {
        self.acknowledge_inner(sub_id, seqno);
    }

    fn terminate_subscription(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow, sub_id: SubscriptionId) {
        self.terminate(ctx, flow, sub_id);
    }

    fn handle_message(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        message: Message,
    ) {
        self.handle_message_inner(ctx, flow, origin, message);
    }

    fn on_stream_unhealthy(&mut self, key: StreamKey) {
        self.on_unhealthy_stream(key);
    }

    fn tick(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow) {
        self.tick_inner(ctx, flow);
    }
}

// Subscriber behavior that needs a live worker context is exercised by
// the integration suite in test-harness; the pure pieces are tested in
// state.rs and topic_map.rs.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_start_wire_encoding() {
        assert_eq!(SubscriptionStart::Tail.wire_seqno(), 0);
        assert_eq!(SubscriptionStart::At(0), SubscriptionStart::At(0));
        assert_eq!(SubscriptionStart::At(42).wire_seqno(), 42);
    }
}
