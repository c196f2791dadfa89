//! Ad-hoc subscriptions, grouped by application and replayed on reconnect

use crate::client::CloudSubscriberListener;
use crate::topic::TopicCodec;
use crate::transport::Qos;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct SubscriptionRecord {
    /// Wire topic filter, namespace included
    pub full_topic: String,
    pub qos: Qos,
    pub subscriber: Arc<dyn CloudSubscriberListener>,
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("full_topic", &self.full_topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    records: Mutex<HashMap<String, Vec<SubscriptionRecord>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, application_id: &str, record: SubscriptionRecord) {
        self.records
            .lock()
            .entry(application_id.to_string())
            .or_default()
            .push(record);
    }

    /// Removes every record owned by `subscriber`
    pub fn remove_subscriber(
        &self,
        subscriber: &Arc<dyn CloudSubscriberListener>,
    ) -> Vec<SubscriptionRecord> {
        let mut records = self.records.lock();
        let mut removed = Vec::new();
        for list in records.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = list
                .drain(..)
                .partition(|record| Arc::ptr_eq(&record.subscriber, subscriber));
            *list = kept;
            removed.extend(gone);
        }
        records.retain(|_, list| !list.is_empty());
        removed
    }

    /// Whether any remaining record still uses `full_topic`
    pub fn is_topic_in_use(&self, full_topic: &str) -> bool {
        self.records
            .lock()
            .values()
            .flatten()
            .any(|record| record.full_topic == full_topic)
    }

    pub fn snapshot(&self) -> Vec<SubscriptionRecord> {
        self.records.lock().values().flatten().cloned().collect()
    }

    /// Subscribers whose filter matches the inbound wire topic
    pub fn matching(
        &self,
        topics: &TopicCodec,
        wire_topic: &str,
    ) -> Vec<Arc<dyn CloudSubscriberListener>> {
        self.records
            .lock()
            .values()
            .flatten()
            .filter(|record| topics.topic_matches(&record.full_topic, wire_topic))
            .map(|record| record.subscriber.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::topic::ApplicationTopic;

    struct Noop;

    impl CloudSubscriberListener for Noop {
        fn on_message_arrived(&self, _topic: &ApplicationTopic, _payload: &Payload) {}
    }

    fn record(topic: &str, subscriber: &Arc<dyn CloudSubscriberListener>) -> SubscriptionRecord {
        SubscriptionRecord {
            full_topic: topic.to_string(),
            qos: Qos::AtLeastOnce,
            subscriber: subscriber.clone(),
        }
    }

    #[test]
    fn matches_and_removes_by_subscriber() {
        let codec = TopicCodec::new("$EDC", "ACC", "/");
        let registry = SubscriptionRegistry::new();
        let a: Arc<dyn CloudSubscriberListener> = Arc::new(Noop);
        let b: Arc<dyn CloudSubscriberListener> = Arc::new(Noop);
        registry.add("APP", record("ACC/+/APP/#", &a));
        registry.add("APP", record("ACC/D1/APP/alerts", &b));
        registry.add("OTHER", record("ACC/D1/OTHER/#", &a));

        assert_eq!(registry.matching(&codec, "ACC/D1/APP/alerts").len(), 2);
        assert_eq!(registry.matching(&codec, "ACC/D7/APP/data").len(), 1);

        let removed = registry.remove_subscriber(&a);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_topic_in_use("ACC/+/APP/#"));
        assert!(registry.is_topic_in_use("ACC/D1/APP/alerts"));
    }
}
