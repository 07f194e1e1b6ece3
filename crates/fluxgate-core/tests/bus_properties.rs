//! Property-based tests for the event bus delivery contract.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use fluxgate_core::{BusEvent, Envelope, EventBus};
use proptest::prelude::*;

fn message() -> BusEvent {
    BusEvent::Message(Arc::new(Envelope::new()))
}

proptest! {
    /// Every subscriber on a matching topic is invoked exactly once per
    /// publish, regardless of how many other subscribers fail.
    #[test]
    fn exactly_once_delivery_with_failing_peers(
        topic in "[A-Z][A-Z_]{0,14}",
        healthy in 1usize..6,
        failing in 0usize..4,
        publishes in 1usize..5,
    ) {
        let bus = EventBus::new();
        let mut counters = Vec::new();

        for _ in 0..healthy {
            let counter = Arc::new(AtomicUsize::new(0));
            let counter2 = Arc::clone(&counter);
            bus.subscribe(&topic, move |_, _, _| {
                counter2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            counters.push(counter);
        }
        for _ in 0..failing {
            bus.subscribe(&topic, |_, _, _| Err("always fails".into()));
        }

        for _ in 0..publishes {
            let invoked = bus.publish(&topic, &message(), None);
            prop_assert_eq!(invoked, healthy + failing);
        }

        for counter in &counters {
            prop_assert_eq!(counter.load(Ordering::SeqCst), publishes);
        }
    }

    /// Wildcard subscriptions receive exactly the topics their pattern
    /// covers; exact subscriptions never leak across topics.
    #[test]
    fn wildcard_and_exact_subscriptions_partition_topics(
        suffixes in prop::collection::vec("[A-Z]{1,6}", 1..5),
        other in "[0-9]{1,6}",
    ) {
        let bus = EventBus::new();

        let wildcard_hits = Arc::new(Mutex::new(Vec::new()));
        let hits2 = Arc::clone(&wildcard_hits);
        bus.subscribe("SENSOR_*", move |_, topic, _| {
            hits2.lock().expect("lock").push(topic.to_string());
            Ok(())
        });

        let exact_hits = Arc::new(AtomicUsize::new(0));
        let exact2 = Arc::clone(&exact_hits);
        bus.subscribe("OTHER", move |_, _, _| {
            exact2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for suffix in &suffixes {
            prop_assert_eq!(bus.publish(&format!("sensor_{suffix}"), &message(), None), 1);
        }
        prop_assert_eq!(bus.publish(&format!("UNRELATED_{other}"), &message(), None), 0);

        let seen = wildcard_hits.lock().expect("lock").clone();
        prop_assert_eq!(seen.len(), suffixes.len());
        prop_assert!(seen.iter().all(|t| t.starts_with("SENSOR_")));
        prop_assert_eq!(exact_hits.load(Ordering::SeqCst), 0);
    }

    /// A callback that republishes on another topic terminates without
    /// deadlock, for arbitrary chain depth.
    #[test]
    fn reentrant_publish_chain_terminates(depth in 1usize..8) {
        let bus = Arc::new(EventBus::new());
        let reached = Arc::new(AtomicUsize::new(0));

        for level in 0..depth {
            let bus2 = Arc::clone(&bus);
            let reached2 = Arc::clone(&reached);
            bus.subscribe(&format!("LEVEL_{level}"), move |event, _, _| {
                reached2.fetch_add(1, Ordering::SeqCst);
                bus2.publish(&format!("LEVEL_{}", level + 1), event, None);
                Ok(())
            });
        }

        prop_assert_eq!(bus.publish("LEVEL_0", &message(), None), 1);
        prop_assert_eq!(reached.load(Ordering::SeqCst), depth);
    }
}
