// Topic -> subscriber index held by each room.
//
// The vast majority of topics have a single subscriber; in the worst case
// the list length is the number of downstream multiplexers, on the order
// of hundreds. Linear scans over the list are fine at that size and keep
// memory compact.
use cascade_common::{HostNumber, LogId, NamespaceId, SequenceNumber, SubscriptionId, Topic};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct TopicSubscription {
    host: HostNumber,
    sub_id: SubscriptionId,
    /// Next sequence number this subscriber has not yet seen.
    next_seqno: SequenceNumber,
}

impl TopicSubscription {
    pub fn host(&self) -> HostNumber {
        self.host
    }

    pub fn sub_id(&self) -> SubscriptionId {
        self.sub_id
    }

    pub fn next_seqno(&self) -> SequenceNumber {
        self.next_seqno
    }

    pub fn set_next_seqno(&mut self, seqno: SequenceNumber) {
        self.next_seqno = seqno;
    }
}

#[derive(Debug)]
pub struct TopicEntry {
    pub log_id: LogId,
    subscribers: Vec<TopicSubscription>,
}

/// Maintains the mapping between topics and their subscribers for one
/// room. A topic holds at most one entry per host.
#[derive(Debug, Default)]
pub struct TopicManager {
    topics: HashMap<(NamespaceId, Topic), TopicEntry>,
}

pub struct RemoveOutcome {
    pub removed: bool,
    /// The topic has no subscribers left.
    pub topic_empty: bool,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes a subscriber on a topic. An existing entry for
    /// the same host is repositioned rather than duplicated.
    ///
    /// Returns `true` iff this host was not already subscribed.
    pub fn add_subscriber(
        &mut self,
        namespace: &str,
        topic: &str,
        log_id: LogId,
        start: SequenceNumber,
        host: HostNumber,
        sub_id: SubscriptionId,
    ) -> bool {
        let entry = self
            .topics
            .entry((namespace.to_string(), topic.to_string()))
            .or_insert_with(|| TopicEntry {
                log_id,
                subscribers: Vec::with_capacity(1),
            });
        if let Some(existing) = entry
            .subscribers
            .iter_mut()
            .find(|subscription| subscription.host == host)
        {
            existing.sub_id = sub_id;
            existing.next_seqno = start;
            return false;
        }
        entry.subscribers.push(TopicSubscription {
            host,
            sub_id,
            next_seqno: start,
        });
        true
    }

    /// Removes a host's subscription from a topic.
    pub fn remove_subscriber(&mut self, namespace: &str, topic: &str, host: HostNumber) -> RemoveOutcome {
        let key = (namespace.to_string(), topic.to_string());
        let Some(entry) = self.topics.get_mut(&key) else {
            return RemoveOutcome {
                removed: false,
                topic_empty: false,
            };
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|subscription| subscription.host != host);
        let removed = entry.subscribers.len() < before;
        let topic_empty = entry.subscribers.is_empty();
        if topic_empty {
            self.topics.remove(&key);
        }
        RemoveOutcome {
            removed,
            topic_empty,
        }
    }

    /// Visits every subscriber of a topic. Mutation is allowed; the
    /// visitation order is unspecified.
    pub fn visit_subscribers(
        &mut self,
        namespace: &str,
        topic: &str,
        mut visitor: impl FnMut(&mut TopicSubscription),
    ) -> Option<LogId> {
        let entry = self
            .topics
            .get_mut(&(namespace.to_string(), topic.to_string()))?;
        for subscription in &mut entry.subscribers {
            visitor(subscription);
        }
        Some(entry.log_id)
    }

    /// Visits every subscriber of every topic routed to `log_id`.
    pub fn visit_log_subscribers(
        &mut self,
        log_id: LogId,
        mut visitor: impl FnMut(&NamespaceId, &Topic, &mut TopicSubscription),
    ) {
        for ((namespace, topic), entry) in &mut self.topics {
            if entry.log_id != log_id {
                continue;
            }
            for subscription in &mut entry.subscribers {
                visitor(namespace, topic, subscription);
            }
        }
    }

    /// Removes every subscription of `host` across all topics, reporting
    /// the affected logs (once per removed subscription).
    pub fn remove_host(&mut self, host: HostNumber) -> Vec<LogId> {
        let mut affected = Vec::new();
        self.topics.retain(|_, entry| {
            let before = entry.subscribers.len();
            entry.subscribers.retain(|subscription| subscription.host != host);
            for _ in entry.subscribers.len()..before {
                affected.push(entry.log_id);
            }
            !entry.subscribers.is_empty()
        });
        affected
    }

    /// Finds the topic a host's subscription lives on. Used for
    /// unsubscribes from older senders that omit the topic identity.
    pub fn find_topic_of_subscription(
        &self,
        host: HostNumber,
        sub_id: SubscriptionId,
    ) -> Option<(NamespaceId, Topic)> {
        self.topics.iter().find_map(|((namespace, topic), entry)| {
            entry
                .subscribers
                .iter()
                .any(|subscription| subscription.host == host && subscription.sub_id == sub_id)
                .then(|| (namespace.clone(), topic.clone()))
        })
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, namespace: &str, topic: &str) -> usize {
        self.topics
            .get(&(namespace.to_string(), topic.to_string()))
            .map_or(0, |entry| entry.subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_reported_as_new() {
        let mut manager = TopicManager::new();
        assert!(manager.add_subscriber("ns", "t", 7, 1, 0, 10));
        assert!(!manager.add_subscriber("ns", "t", 7, 5, 0, 11));
        assert!(manager.add_subscriber("ns", "t", 7, 1, 1, 12));
        assert_eq!(manager.subscriber_count("ns", "t"), 2);
    }

    #[test]
    fn duplicate_host_is_repositioned_not_duplicated() {
        // At steady state a room holds exactly one entry per host.
        let mut manager = TopicManager::new();
        manager.add_subscriber("ns", "t", 7, 1, 3, 10);
        manager.add_subscriber("ns", "t", 7, 9, 3, 11);
        assert_eq!(manager.subscriber_count("ns", "t"), 1);
        manager.visit_subscribers("ns", "t", |subscription| {
            assert_eq!(subscription.next_seqno(), 9);
            assert_eq!(subscription.sub_id(), 11);
        });
    }

    #[test]
    fn remove_reports_when_topic_empties() {
        let mut manager = TopicManager::new();
        manager.add_subscriber("ns", "t", 7, 1, 0, 10);
        manager.add_subscriber("ns", "t", 7, 1, 1, 11);
        let outcome = manager.remove_subscriber("ns", "t", 0);
        assert!(outcome.removed);
        assert!(!outcome.topic_empty);
        let outcome = manager.remove_subscriber("ns", "t", 1);
        assert!(outcome.removed);
        assert!(outcome.topic_empty);
        assert_eq!(manager.topic_count(), 0);
    }

    #[test]
    fn remove_missing_subscriber_is_harmless() {
        let mut manager = TopicManager::new();
        let outcome = manager.remove_subscriber("ns", "t", 0);
        assert!(!outcome.removed);
        assert!(!outcome.topic_empty);
    }

    #[test]
    fn remove_host_touches_every_topic() {
        let mut manager = TopicManager::new();
        manager.add_subscriber("ns", "a", 1, 1, 0, 10);
        manager.add_subscriber("ns", "b", 2, 1, 0, 11);
        manager.add_subscriber("ns", "b", 2, 1, 1, 12);
        let mut affected = manager.remove_host(0);
        affected.sort_unstable();
        assert_eq!(affected, vec![1, 2]);
        assert_eq!(manager.topic_count(), 1);
        assert_eq!(manager.subscriber_count("ns", "b"), 1);
    }

    #[test]
    fn log_visitation_filters_by_log() {
        let mut manager = TopicManager::new();
        manager.add_subscriber("ns", "a", 1, 1, 0, 10);
        manager.add_subscriber("ns", "b", 2, 1, 0, 11);
        let mut seen = Vec::new();
        manager.visit_log_subscribers(2, |_, topic, _| seen.push(topic.clone()));
        assert_eq!(seen, vec!["b".to_string()]);
    }
}
