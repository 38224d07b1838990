// Tail-collapsing adaptor: serves many downstream subscriptions on one
// topic from a single upstream subscription.
//
// The first downstream on a topic becomes the upstream (reusing its
// subscription ID on the wire); later downstreams attach to the fan-out
// behind it. The upstream is torn down when the last downstream leaves.
use cascade_common::{SequenceNumber, SubscriptionId};
use cascade_msg::{Flow, StreamKey, WorkerCtx};
use cascade_wire::Message;
use std::collections::HashMap;

use crate::observer::Observer;
use crate::state::{FanoutObserver, ObserverSlot};
use crate::subscriber::{ShardSubscriber, Subscriber, SubscriptionParameters};
use crate::topic_map::TopicToSubscriptionMap;

pub(crate) struct TailCollapsingSubscriber {
    inner: Subscriber,
    /// Downstream subscription -> the upstream serving it.
    downstream_to_upstream: HashMap<SubscriptionId, SubscriptionId>,
    /// Topic -> upstream subscription, for joining later downstreams.
    upstream_map: TopicToSubscriptionMap,
}

impl TailCollapsingSubscriber {
    pub fn new(inner: Subscriber) -> Self {
        Self {
            inner,
            downstream_to_upstream: HashMap::new(),
            upstream_map: TopicToSubscriptionMap::new(),
        }
    }

    fn drop_upstream_entries(&mut self, upstream: SubscriptionId, namespace: &str, topic: &str) {
        self.downstream_to_upstream
            .retain(|_, serving| *serving != upstream);
        let resolver = resolver(&self.inner);
        self.upstream_map.remove(namespace, topic, upstream, &resolver);
    }
}

/// Recovers topic identities for the probing map from the subscriptions
/// the inner subscriber still holds.
fn resolver(inner: &Subscriber) -> impl crate::topic_map::Resolver + '_ {
    |sub_id: SubscriptionId| inner.subscription_topic(sub_id)
}

impl ShardSubscriber for TailCollapsingSubscriber {
    fn start_subscription(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        sub_id: SubscriptionId,
        params: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) {
        let start: SequenceNumber = params.start.wire_seqno();
        let existing = {
            let resolver = resolver(&self.inner);
            self.upstream_map
                .find(&params.namespace, &params.topic, &resolver)
        };
        match existing {
            Some(upstream) => {
                // Join the existing upstream. Records earlier than the
                // upstream's own start cannot be replayed for this
                // downstream; it sees the shared tail.
                let Some(fanout) = self.inner.fanout_mut(upstream) else {
                    return;
                };
                let mut observer = observer;
                observer.on_subscription_established(start);
                fanout.add(sub_id, start, observer);
                self.downstream_to_upstream.insert(sub_id, upstream);
                metrics::counter!("client_collapsed_subscriptions").increment(1);
            }
            None => {
                let mut fanout = FanoutObserver::new();
                fanout.add(sub_id, start, observer);
                let namespace = params.namespace.clone();
                let topic = params.topic.clone();
                self.inner
                    .start_with_slot(ctx, flow, sub_id, params, ObserverSlot::Fanout(fanout));
                // Only index the upstream if it survived validation.
                if self.inner.subscription_topic(sub_id).is_some() {
                    self.downstream_to_upstream.insert(sub_id, sub_id);
                    let resolver = resolver(&self.inner);
                    self.upstream_map.insert(&namespace, &topic, sub_id, &resolver);
                }
            }
        }
    }

    fn acknowledge(&mut self, sub_id: SubscriptionId, seqno: SequenceNumber) {
        if let Some(&upstream) = self.downstream_to_upstream.get(&sub_id) {
            self.inner.acknowledge_inner(upstream, seqno);
        }
    }

    fn terminate_subscription(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow, sub_id: SubscriptionId) {
        let Some(upstream) = self.downstream_to_upstream.remove(&sub_id) else {
            return;
        };
        let Some(fanout) = self.inner.fanout_mut(upstream) else {
            return;
        };
        fanout.remove(sub_id);
        if !fanout.is_empty() {
            return;
        }
        // Last downstream left: tear the upstream down.
        if let Some((namespace, topic)) = self.inner.terminate(ctx, flow, upstream) {
            let resolver = resolver(&self.inner);
            self.upstream_map.remove(&namespace, &topic, upstream, &resolver);
        }
    }

    fn handle_message(
        &mut self,
        ctx: &mut WorkerCtx,
        flow: &mut Flow,
        origin: StreamKey,
        message: Message,
    ) {
        let terminated = self.inner.handle_message_inner(ctx, flow, origin, message);
        for (upstream, namespace, topic) in terminated {
            self.drop_upstream_entries(upstream, &namespace, &topic);
        }
    }

    fn on_stream_unhealthy(&mut self, key: StreamKey) {
        self.inner.on_unhealthy_stream(key);
    }

    fn tick(&mut self, ctx: &mut WorkerCtx, flow: &mut Flow) {
        self.inner.tick_inner(ctx, flow);
    }
}
